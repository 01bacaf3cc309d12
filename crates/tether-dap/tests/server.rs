mod harness;

use std::{sync::Arc, time::Duration};

use harness::{DapClient, SOURCE_FILE};
use tether_dap::DapServer;
use tokio::net::TcpStream;

async fn connect(server: &DapServer) -> DapClient<tokio::net::tcp::OwnedReadHalf, tokio::net::tcp::OwnedWriteHalf> {
    let stream = TcpStream::connect(server.local_addr()).await.unwrap();
    let (reader, writer) = stream.into_split();
    DapClient::new(reader, writer)
}

#[tokio::test]
async fn each_connection_gets_its_own_session() {
    let ctx = harness::context();
    let server = Arc::new(DapServer::bind("127.0.0.1:0", ctx.clone()).await.unwrap());
    let serve = tokio::spawn({
        let server = server.clone();
        async move { server.serve().await }
    });

    let mut first = connect(&server).await;
    let mut second = connect(&server).await;
    first.initialize().await;
    second.initialize().await;
    assert_eq!(server.active_connections(), 2);

    first.set_breakpoints(SOURCE_FILE, &[10]).await;
    second.set_breakpoints(SOURCE_FILE, &[20, 30]).await;
    assert_eq!(ctx.catalog().len(), 3);

    // Closing one client ends only its session.
    drop(first);
    tokio::time::timeout(Duration::from_secs(5), async {
        while server.active_connections() != 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(ctx.catalog().len(), 2);

    second.request_ok("threads", serde_json::json!({})).await;

    server.shutdown().await;
    serve.await.unwrap().unwrap();
}

#[tokio::test]
async fn shutdown_closes_live_connections() {
    let server = Arc::new(DapServer::bind("127.0.0.1:0", harness::context()).await.unwrap());
    let serve = tokio::spawn({
        let server = server.clone();
        async move { server.serve().await }
    });

    let mut client = connect(&server).await;
    client.initialize().await;
    assert_eq!(server.active_connections(), 1);

    tokio::time::timeout(Duration::from_secs(5), server.shutdown())
        .await
        .unwrap();
    assert_eq!(server.active_connections(), 0);
    serve.await.unwrap().unwrap();

    // The adapter closed its end, so the client sees end of stream.
    client.drain().await;
    assert!(TcpStream::connect(server.local_addr()).await.is_err());
}
