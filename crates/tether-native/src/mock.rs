//! A small in-process stand-in for the native debugger's headless JSON-RPC server.
//!
//! It implements just enough of the API for the client and debug-adapter tests to run
//! without a real native debugger installed.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
};

use serde_json::{json, Value};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{tcp::OwnedWriteHalf, TcpListener, TcpStream},
    sync::Mutex,
};
use tokio_util::sync::CancellationToken;

use crate::types::{DebuggerState, Function, NativeBreakpoint, NativeFrame, NativeThread, NativeVariable};

/// Outcome of the next run-control command received by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockStop {
    /// Stop the current thread at `file:line`, reporting any breakpoint placed there.
    At { file: String, line: i64 },
    /// The debuggee exits with the given status.
    Exit(i64),
    /// Never answer; only a subsequent `halt` produces a reply.
    Hang,
}

#[derive(Debug, Clone)]
pub struct MockNativeServerConfig {
    /// Lines that accept breakpoints, keyed by generated file. Files without an entry
    /// accept every line.
    pub valid_lines: HashMap<String, Vec<i64>>,
    pub threads: Vec<NativeThread>,
    /// Stack returned for every goroutine, innermost first.
    pub frames: Vec<NativeFrame>,
    pub locals: Vec<NativeVariable>,
    /// Consumed in order by run-control commands. Once empty the debuggee exits with 0.
    pub stops: Vec<MockStop>,
    /// Directory relative breakpoint paths are resolved against, the way a native debugger
    /// expands them to absolute paths. `None` keeps paths as requested.
    pub work_dir: Option<String>,
}

pub const MOCK_GENERATED_FILE: &str = "/work/gen/main.go";

impl Default for MockNativeServerConfig {
    fn default() -> Self {
        let main = Function {
            name: "main.main".to_string(),
        };
        Self {
            valid_lines: HashMap::new(),
            threads: vec![NativeThread {
                id: 1,
                file: MOCK_GENERATED_FILE.to_string(),
                line: 15,
                function: Some(main.clone()),
                goroutine_id: 1,
                ..NativeThread::default()
            }],
            frames: vec![
                NativeFrame {
                    pc: 0x4a_1000,
                    file: MOCK_GENERATED_FILE.to_string(),
                    line: 15,
                    function: Some(main),
                },
                NativeFrame {
                    pc: 0x43_2000,
                    file: "/usr/lib/go/src/runtime/proc.go".to_string(),
                    line: 250,
                    function: Some(Function {
                        name: "runtime.main".to_string(),
                    }),
                },
            ],
            locals: vec![
                NativeVariable {
                    name: "count".to_string(),
                    type_name: "int".to_string(),
                    value: "42".to_string(),
                    ..NativeVariable::default()
                },
                NativeVariable {
                    name: "user".to_string(),
                    type_name: "main.User".to_string(),
                    len: 2,
                    children: vec![
                        NativeVariable {
                            name: "Name".to_string(),
                            type_name: "string".to_string(),
                            value: "\"ada\"".to_string(),
                            ..NativeVariable::default()
                        },
                        NativeVariable {
                            name: "Age".to_string(),
                            type_name: "int".to_string(),
                            value: "36".to_string(),
                            ..NativeVariable::default()
                        },
                    ],
                    ..NativeVariable::default()
                },
            ],
            stops: Vec::new(),
            work_dir: None,
        }
    }
}

pub struct MockNativeServer {
    addr: SocketAddr,
    shutdown: CancellationToken,
    state: Arc<State>,
}

struct State {
    config: MockNativeServerConfig,
    runtime: Mutex<Runtime>,
    calls: Mutex<Vec<String>>,
    halt_calls: AtomicU32,
    detached: AtomicBool,
}

struct Runtime {
    next_breakpoint_id: i64,
    breakpoints: BTreeMap<i64, NativeBreakpoint>,
    stops: VecDeque<MockStop>,
}

impl MockNativeServer {
    pub async fn spawn() -> std::io::Result<Self> {
        Self::spawn_with_config(MockNativeServerConfig::default()).await
    }

    pub async fn spawn_with_config(config: MockNativeServerConfig) -> std::io::Result<Self> {
        let listener = TcpListener::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)).await?;
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();

        let state = Arc::new(State {
            runtime: Mutex::new(Runtime {
                next_breakpoint_id: 1,
                breakpoints: BTreeMap::new(),
                stops: config.stops.iter().cloned().collect(),
            }),
            config,
            calls: Mutex::new(Vec::new()),
            halt_calls: AtomicU32::new(0),
            detached: AtomicBool::new(false),
        });

        tokio::spawn(accept_loop(listener, state.clone(), shutdown.clone()));

        Ok(Self {
            addr,
            shutdown,
            state,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Every RPC method received so far, in arrival order.
    pub async fn calls(&self) -> Vec<String> {
        self.state.calls.lock().await.clone()
    }

    pub async fn breakpoints(&self) -> Vec<NativeBreakpoint> {
        self.state.runtime.lock().await.breakpoints.values().cloned().collect()
    }

    pub fn halt_calls(&self) -> u32 {
        self.state.halt_calls.load(Ordering::Relaxed)
    }

    pub fn was_detached(&self) -> bool {
        self.state.detached.load(Ordering::Relaxed)
    }
}

impl Drop for MockNativeServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn accept_loop(listener: TcpListener, state: Arc<State>, shutdown: CancellationToken) {
    loop {
        let socket = tokio::select! {
            _ = shutdown.cancelled() => return,
            accept = listener.accept() => match accept {
                Ok((socket, _)) => socket,
                Err(_) => return,
            },
        };
        tokio::spawn(serve_connection(socket, state.clone(), shutdown.clone()));
    }
}

async fn serve_connection(socket: TcpStream, state: Arc<State>, shutdown: CancellationToken) -> std::io::Result<()> {
    let (reader, mut writer) = socket.into_split();
    let mut lines = BufReader::new(reader).lines();
    // Request id of a run-control command that was left unanswered.
    let mut hung: Option<Value> = None;

    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            return Ok(());
        };
        let request: Value = serde_json::from_str(&line)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
        let id = request.get("id").cloned().unwrap_or(Value::Null);
        let method = request
            .get("method")
            .and_then(|m| m.as_str())
            .unwrap_or_default()
            .to_string();
        let params = request
            .get("params")
            .and_then(|p| p.get(0))
            .cloned()
            .unwrap_or(Value::Null);
        state.calls.lock().await.push(method.clone());

        match method.as_str() {
            "RPCServer.Command" => {
                let name = params.get("name").and_then(|n| n.as_str()).unwrap_or_default();
                if name == "halt" {
                    state.halt_calls.fetch_add(1, Ordering::Relaxed);
                    let body = json!({ "State": state.halted_state() });
                    if let Some(pending) = hung.take() {
                        write_reply(&mut writer, pending, Ok(body.clone())).await?;
                    }
                    write_reply(&mut writer, id, Ok(body)).await?;
                    continue;
                }

                let stop = state.runtime.lock().await.stops.pop_front();
                match stop {
                    Some(MockStop::Hang) => hung = Some(id),
                    Some(MockStop::At { file, line }) => {
                        let body = json!({ "State": state.stopped_state(&file, line).await });
                        write_reply(&mut writer, id, Ok(body)).await?;
                    }
                    Some(MockStop::Exit(status)) => {
                        write_reply(&mut writer, id, Ok(json!({ "State": exited_state(status) }))).await?;
                    }
                    None => {
                        write_reply(&mut writer, id, Ok(json!({ "State": exited_state(0) }))).await?;
                    }
                }
            }
            "RPCServer.Detach" => {
                state.detached.store(true, Ordering::Relaxed);
                write_reply(&mut writer, id, Ok(json!({}))).await?;
                return Ok(());
            }
            _ => {
                let reply = state.handle(&method, &params).await;
                write_reply(&mut writer, id, reply).await?;
            }
        }
    }
}

fn exited_state(status: i64) -> DebuggerState {
    DebuggerState {
        exited: true,
        exit_status: status,
        ..DebuggerState::default()
    }
}

async fn write_reply(writer: &mut OwnedWriteHalf, id: Value, reply: Result<Value, String>) -> std::io::Result<()> {
    let message = match reply {
        Ok(result) => json!({ "id": id, "result": result, "error": null }),
        Err(error) => json!({ "id": id, "result": null, "error": error }),
    };
    let mut bytes = serde_json::to_vec(&message)?;
    bytes.push(b'\n');
    writer.write_all(&bytes).await
}

impl State {
    async fn handle(&self, method: &str, params: &Value) -> Result<Value, String> {
        match method {
            "RPCServer.CreateBreakpoint" => {
                let requested: NativeBreakpoint = params
                    .get("Breakpoint")
                    .cloned()
                    .map(serde_json::from_value)
                    .transpose()
                    .map_err(|err| err.to_string())?
                    .ok_or_else(|| "missing Breakpoint".to_string())?;

                if let Some(lines) = self.config.valid_lines.get(&requested.file) {
                    if !lines.contains(&requested.line) {
                        return Err(format!(
                            "could not find statement at {}:{}",
                            requested.file, requested.line
                        ));
                    }
                }

                let mut runtime = self.runtime.lock().await;
                let id = runtime.next_breakpoint_id;
                runtime.next_breakpoint_id += 1;
                let file = match &self.config.work_dir {
                    Some(dir) if !requested.file.starts_with('/') => {
                        format!("{}/{}", dir.trim_end_matches('/'), requested.file)
                    }
                    _ => requested.file.clone(),
                };
                let created = NativeBreakpoint {
                    id,
                    file,
                    ..requested
                };
                runtime.breakpoints.insert(id, created.clone());
                Ok(json!({ "Breakpoint": created }))
            }
            "RPCServer.ClearBreakpoint" => {
                let id = params.get("Id").and_then(|v| v.as_i64()).unwrap_or_default();
                match self.runtime.lock().await.breakpoints.remove(&id) {
                    Some(removed) => Ok(json!({ "Breakpoint": removed })),
                    None => Err(format!("non existent breakpoint {id}")),
                }
            }
            "RPCServer.ListThreads" => Ok(json!({ "Threads": self.config.threads })),
            "RPCServer.Stacktrace" => {
                let depth = params.get("Depth").and_then(|v| v.as_i64()).unwrap_or(50).max(0);
                let frames: Vec<_> = self
                    .config
                    .frames
                    .iter()
                    .take(depth as usize + 1)
                    .cloned()
                    .collect();
                Ok(json!({ "Locations": frames }))
            }
            "RPCServer.ListLocalVars" => Ok(json!({ "Variables": self.config.locals })),
            "RPCServer.Eval" => {
                let expr = params.get("Expr").and_then(|v| v.as_str()).unwrap_or_default();
                match self.lookup(expr) {
                    Some(variable) => Ok(json!({ "Variable": variable })),
                    None => Err(format!("could not find symbol value for {expr}")),
                }
            }
            other => Err(format!("unknown method {other}")),
        }
    }

    fn lookup(&self, expr: &str) -> Option<NativeVariable> {
        let mut segments = expr.trim().split('.');
        let root = segments.next()?;
        let mut current = self.config.locals.iter().find(|var| var.name == root)?;
        for segment in segments {
            current = current.child(segment)?;
        }
        let mut found = current.clone();
        found.name = expr.trim().to_string();
        Some(found)
    }

    async fn stopped_state(&self, file: &str, line: i64) -> DebuggerState {
        let breakpoint = self
            .runtime
            .lock()
            .await
            .breakpoints
            .values()
            .find(|bp| bp.file == file && bp.line == line)
            .cloned();
        let thread = NativeThread {
            id: 1,
            file: file.to_string(),
            line,
            goroutine_id: 1,
            function: self.config.frames.first().and_then(|f| f.function.clone()),
            breakpoint,
            ..NativeThread::default()
        };
        DebuggerState {
            current_thread: Some(thread),
            threads: self.config.threads.clone(),
            ..DebuggerState::default()
        }
    }

    fn halted_state(&self) -> DebuggerState {
        let thread = self.config.threads.first().cloned();
        DebuggerState {
            current_thread: thread,
            threads: self.config.threads.clone(),
            ..DebuggerState::default()
        }
    }
}
