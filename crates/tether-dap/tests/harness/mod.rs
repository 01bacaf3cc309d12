#![allow(dead_code)]

use std::{net::SocketAddr, sync::Arc, time::Duration};

use serde_json::{json, Value};
use tether_dap::{
    dap_tokio::{DapReader, DapWriter},
    wire_server, AdapterContext, BreakpointCatalog, WireServerError,
};
use tether_native::{mock::MOCK_GENERATED_FILE, NativeDebuggerConfig};
use tether_srcmap::{LineMapping, PositionMap, PositionMapStore};
use tokio::{
    io::{AsyncRead, AsyncWrite, DuplexStream, ReadHalf, WriteHalf},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

pub const SOURCE_FILE: &str = "/work/src/app.tt";
pub const UNMAPPED_FILE: &str = "/work/src/other.tt";

const MESSAGE_TIMEOUT: Duration = Duration::from_secs(10);

/// `app.tt` lines 10, 20 and 30 compile to lines 15, 30 and 45 of the mock's main file.
pub fn position_maps() -> Arc<PositionMapStore> {
    let store = PositionMapStore::new();
    store.register(PositionMap::new(SOURCE_FILE, MOCK_GENERATED_FILE).with_mappings([
        LineMapping::new(10, 1, 15, 1),
        LineMapping::new(20, 1, 30, 1),
        LineMapping::new(30, 1, 45, 1),
    ]));
    Arc::new(store)
}

pub fn context() -> AdapterContext {
    context_with(NativeDebuggerConfig {
        run_control_timeout: Duration::from_millis(300),
        ..NativeDebuggerConfig::default()
    })
}

pub fn context_with(debugger: NativeDebuggerConfig) -> AdapterContext {
    AdapterContext::new(position_maps(), Arc::new(BreakpointCatalog::new()), debugger)
}

pub type DuplexClient = DapClient<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

/// Serve one session over an in-memory stream.
pub fn spawn_session(ctx: AdapterContext) -> (DuplexClient, JoinHandle<Result<(), WireServerError>>) {
    let (client, server) = tokio::io::duplex(1 << 20);
    let (server_read, server_write) = tokio::io::split(server);
    let task = tokio::spawn(wire_server::run(
        server_read,
        server_write,
        ctx,
        CancellationToken::new(),
    ));
    let (client_read, client_write) = tokio::io::split(client);
    (DapClient::new(client_read, client_write), task)
}

pub struct DapClient<R, W> {
    reader: DapReader<R>,
    writer: DapWriter<W>,
    next_seq: i64,
    /// Messages read while waiting for something else.
    backlog: Vec<Value>,
}

impl<R, W> DapClient<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: DapReader::new(reader),
            writer: DapWriter::new(writer),
            next_seq: 1,
            backlog: Vec::new(),
        }
    }

    pub async fn send(&mut self, command: &str, arguments: Value) -> i64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.writer
            .write_value(&json!({
                "seq": seq,
                "type": "request",
                "command": command,
                "arguments": arguments,
            }))
            .await
            .expect("write request");
        seq
    }

    pub async fn request(&mut self, command: &str, arguments: Value) -> Value {
        let seq = self.send(command, arguments).await;
        self.response(seq).await
    }

    pub async fn request_ok(&mut self, command: &str, arguments: Value) -> Value {
        let response = self.request(command, arguments).await;
        assert_eq!(response["success"], true, "{command} failed: {response}");
        response
    }

    async fn read(&mut self) -> Option<Value> {
        tokio::time::timeout(MESSAGE_TIMEOUT, self.reader.read_value())
            .await
            .expect("timed out waiting for a DAP message")
            .expect("read DAP message")
    }

    async fn wait_for(&mut self, matches: impl Fn(&Value) -> bool) -> Value {
        if let Some(pos) = self.backlog.iter().position(&matches) {
            return self.backlog.remove(pos);
        }
        loop {
            let message = self.read().await.expect("DAP stream closed");
            if matches(&message) {
                return message;
            }
            self.backlog.push(message);
        }
    }

    pub async fn response(&mut self, seq: i64) -> Value {
        self.wait_for(|m| m["type"] == "response" && m["request_seq"] == seq)
            .await
    }

    pub async fn event(&mut self, name: &str) -> Value {
        self.wait_for(|m| m["type"] == "event" && m["event"] == name)
            .await
    }

    /// Remove and return every already received event called `name`.
    pub fn take_events(&mut self, name: &str) -> Vec<Value> {
        let (taken, kept) = std::mem::take(&mut self.backlog)
            .into_iter()
            .partition(|m| m["type"] == "event" && m["event"] == name);
        self.backlog = kept;
        taken
    }

    pub fn has_response(&self, seq: i64) -> bool {
        self.backlog
            .iter()
            .any(|m| m["type"] == "response" && m["request_seq"] == seq)
    }

    /// Read until the adapter closes the stream, returning what was still in flight.
    pub async fn drain(&mut self) -> Vec<Value> {
        let mut rest = std::mem::take(&mut self.backlog);
        while let Some(message) = self.read().await {
            rest.push(message);
        }
        rest
    }

    pub async fn initialize(&mut self) -> Value {
        let response = self
            .request_ok("initialize", json!({ "adapterID": "tether", "linesStartAt1": true }))
            .await;
        self.event("initialized").await;
        response
    }

    pub async fn attach(&mut self, addr: SocketAddr) {
        self.request_ok(
            "attach",
            json!({ "host": addr.ip().to_string(), "port": addr.port() }),
        )
        .await;
    }

    pub async fn set_breakpoints(&mut self, path: &str, lines: &[u32]) -> Vec<Value> {
        let breakpoints: Vec<Value> = lines.iter().map(|line| json!({ "line": line })).collect();
        self.set_breakpoints_raw(path, breakpoints).await
    }

    pub async fn set_breakpoints_raw(&mut self, path: &str, breakpoints: Vec<Value>) -> Vec<Value> {
        let response = self
            .request_ok(
                "setBreakpoints",
                json!({ "source": { "path": path }, "breakpoints": breakpoints }),
            )
            .await;
        response["body"]["breakpoints"]
            .as_array()
            .cloned()
            .unwrap_or_default()
    }
}
