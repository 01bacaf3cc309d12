//! TCP listener serving one DAP session per accepted connection.

use std::{io, net::SocketAddr};

use parking_lot::Mutex;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::context::AdapterContext;
use crate::wire_server;

pub struct DapServer {
    ctx: AdapterContext,
    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    shutdown: CancellationToken,
    connections: TaskTracker,
}

impl DapServer {
    pub async fn bind(addr: impl ToSocketAddrs, ctx: AdapterContext) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            ctx,
            local_addr,
            listener: Mutex::new(Some(listener)),
            shutdown: CancellationToken::new(),
            connections: TaskTracker::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of connections currently being served.
    pub fn active_connections(&self) -> usize {
        self.connections.len()
    }

    /// Accept connections until [`Self::shutdown`] is called.
    ///
    /// Only the first call serves; the listener is closed when it returns.
    pub async fn serve(&self) -> io::Result<()> {
        let Some(listener) = self.listener.lock().take() else {
            return Ok(());
        };
        tracing::info!(addr = %self.local_addr, "DAP server listening");

        loop {
            let (stream, peer) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accept = listener.accept() => match accept {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        tracing::warn!(error = %err, "failed to accept DAP connection");
                        continue;
                    }
                },
            };
            let _ = stream.set_nodelay(true);
            tracing::debug!(%peer, "accepted DAP connection");

            let ctx = self.ctx.clone();
            let cancel = self.shutdown.child_token();
            self.connections.spawn(async move {
                let (reader, writer) = stream.into_split();
                if let Err(err) = wire_server::run(reader, writer, ctx, cancel).await {
                    tracing::warn!(%peer, error = %err, "DAP connection ended with error");
                }
                tracing::debug!(%peer, "DAP connection closed");
            });
        }

        drop(listener);
        Ok(())
    }

    /// Stop accepting, cancel every live connection and wait for them to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        // Closes the listener when `serve` was never started.
        drop(self.listener.lock().take());
        self.connections.close();
        self.connections.wait().await;
        tracing::info!(addr = %self.local_addr, "DAP server stopped");
    }
}
