use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    sync::Arc,
};

use serde_json::{json, Value};
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use tether_native::{
    DebuggerState, LaunchRequest, NativeDebugger, NativeError, NativeFrame, NativeThread, NativeVariable,
    OutputLine,
};

use crate::{
    catalog::{CatalogEntry, NewBreakpoint},
    context::AdapterContext,
    dap_tokio::{DapError, DapReader, DapWriter, Outgoing, Request},
    session::{FrameRef, Session, SessionState, ThreadInfo, VariableRef},
};

#[derive(Debug, Error)]
pub enum WireServerError {
    #[error(transparent)]
    Dap(#[from] DapError),

    #[error(transparent)]
    Native(#[from] NativeError),

    #[error("{0}")]
    InvalidRequest(String),

    #[error("not attached to a native debugger")]
    NotAttached,
}

impl WireServerError {
    /// Fatal errors end the connection; everything else becomes an error response.
    pub fn is_fatal(&self) -> bool {
        matches!(self, WireServerError::Dap(_))
    }
}

type Result<T> = std::result::Result<T, WireServerError>;

/// Frames requested when the client does not bound `levels`.
const DEFAULT_STACK_DEPTH: i64 = 50;
/// Upper bound on the frames requested from the native debugger for one `stackTrace`.
const MAX_STACK_DEPTH: i64 = 1024;

/// Native goroutine selector for "the current one".
const CURRENT_GOROUTINE: i64 = -1;

const PENDING_MESSAGE: &str = "breakpoint will be installed once the program is running";

/// Serve a single DAP session over stdin/stdout.
pub async fn run_stdio(ctx: AdapterContext) -> anyhow::Result<()> {
    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();
    run(stdin, stdout, ctx, CancellationToken::new())
        .await
        .map_err(anyhow::Error::from)
}

/// Serve one DAP session until the client closes the stream or `cancel` fires.
///
/// The native debugger is detached (and a launched debuggee killed) before this returns,
/// whichever way the session ends.
pub async fn run<R, W>(reader: R, writer: W, ctx: AdapterContext, cancel: CancellationToken) -> Result<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outgoing>();

    let writer_task = tokio::spawn(async move {
        let mut writer = DapWriter::new(writer);
        while let Some(msg) = out_rx.recv().await {
            if let Err(err) = writer.write_outgoing(msg).await {
                tracing::debug!(error = %err, "failed to write DAP message");
                break;
            }
        }
    });

    let mut connection = Connection::new(ctx, Outbox { tx: out_tx }, cancel.clone());
    let mut reader = DapReader::new(reader);

    let result = loop {
        let request = tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            request = reader.read_request() => request,
        };
        let request = match request {
            Ok(Some(request)) => request,
            Ok(None) => break Ok(()),
            Err(err) => break Err(WireServerError::from(err)),
        };
        if request.message_type != "request" {
            continue;
        }

        match connection.dispatch(&request).await {
            Ok(()) => {}
            Err(err) if err.is_fatal() => break Err(err),
            Err(err) => {
                tracing::warn!(command = %request.command, error = %err, "request failed");
                connection.out.respond_err(&request, err.to_string());
            }
        }
    };

    if let Err(err) = &result {
        tracing::error!(session = connection.session.id(), error = %err, "DAP connection failed");
    }
    connection.teardown().await;
    drop(connection);
    let _ = writer_task.await;
    result
}

/// Queue of messages for the connection's writer task.
#[derive(Debug, Clone)]
struct Outbox {
    tx: mpsc::UnboundedSender<Outgoing>,
}

impl Outbox {
    fn respond(&self, request: &Request, body: Option<Value>) {
        let _ = self.tx.send(Outgoing::response(request, true, body, None));
    }

    fn respond_err(&self, request: &Request, message: impl Into<String>) {
        let _ = self
            .tx
            .send(Outgoing::response(request, false, None, Some(message.into())));
    }

    fn event(&self, event: &str, body: Option<Value>) {
        let _ = self.tx.send(Outgoing::event(event, body));
    }

    fn output(&self, category: &str, text: impl Into<String>) {
        self.event(
            "output",
            Some(json!({ "category": category, "output": text.into() })),
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunCommand {
    Continue,
    Next,
    StepIn,
    StepOut,
}

#[derive(Debug)]
struct RequestedBreakpoint {
    line: u32,
    condition: Option<String>,
    hit_condition: Option<String>,
    log_message: Option<String>,
}

struct Connection {
    ctx: AdapterContext,
    session: Session,
    out: Outbox,
    cancel: CancellationToken,
    debugger: Option<NativeDebugger>,
    output_task: Option<JoinHandle<()>>,
    /// Set while a debuggee we launched waits for `configurationDone`.
    launched: bool,
    configured: bool,
    stop_on_entry: bool,
}

impl Connection {
    fn new(ctx: AdapterContext, out: Outbox, cancel: CancellationToken) -> Self {
        let session = Session::new(ctx.next_session_id());
        tracing::info!(session = session.id(), "DAP session started");
        Self {
            ctx,
            session,
            out,
            cancel,
            debugger: None,
            output_task: None,
            launched: false,
            configured: false,
            stop_on_entry: false,
        }
    }

    async fn dispatch(&mut self, request: &Request) -> Result<()> {
        tracing::trace!(session = self.session.id(), command = %request.command, seq = request.seq, "request");
        match request.command.as_str() {
            "initialize" => {
                self.initialize(request);
                Ok(())
            }
            "launch" => self.launch(request).await,
            "attach" => self.attach(request).await,
            "configurationDone" => {
                self.out.respond(request, None);
                self.configured = true;
                self.start_if_ready().await;
                Ok(())
            }
            "setBreakpoints" => self.set_breakpoints(request).await,
            "continue" => self.run_control(request, RunCommand::Continue).await,
            "next" => self.run_control(request, RunCommand::Next).await,
            "stepIn" => self.run_control(request, RunCommand::StepIn).await,
            "stepOut" => self.run_control(request, RunCommand::StepOut).await,
            "threads" => self.threads(request).await,
            "stackTrace" => self.stack_trace(request).await,
            "scopes" => self.scopes(request),
            "variables" => self.variables(request).await,
            "evaluate" => self.evaluate(request).await,
            "disconnect" => {
                self.teardown().await;
                self.out.respond(request, None);
                self.out.event("terminated", None);
                Ok(())
            }
            other => {
                tracing::debug!(command = other, "ignoring unsupported request");
                Ok(())
            }
        }
    }

    fn initialize(&mut self, request: &Request) {
        let body = json!({
            "supportsConfigurationDoneRequest": true,
            "supportsConditionalBreakpoints": true,
            "supportsHitConditionalBreakpoints": true,
            "supportsLogPoints": true,
            "supportsEvaluateForHovers": true,
            "supportsSetVariable": false,
            "supportsStepBack": false,
        });
        self.out.respond(request, Some(body));
        self.session.transition(SessionState::Initialized);
        self.out.event("initialized", None);
    }

    async fn launch(&mut self, request: &Request) -> Result<()> {
        let args = &request.arguments;
        let program = args
            .get("program")
            .and_then(Value::as_str)
            .filter(|program| !program.is_empty())
            .ok_or_else(|| invalid("launch.program is required"))?;
        let launch = LaunchRequest {
            program: PathBuf::from(program),
            args: string_array(args, "args"),
            cwd: args.get("cwd").and_then(Value::as_str).map(PathBuf::from),
        };

        self.close_debugger().await;

        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let mut debugger = NativeDebugger::new(self.ctx.debugger_config().clone());
        debugger.launch(&launch, Some(output_tx)).await?;

        let pid = debugger.process_id();
        self.output_task = Some(spawn_output_forwarder(output_rx, self.out.clone()));
        self.debugger = Some(debugger);
        self.launched = true;
        self.stop_on_entry = args.get("stopOnEntry").and_then(Value::as_bool).unwrap_or(false);
        self.session.transition(SessionState::Launched);

        self.out.respond(request, None);
        self.out.event(
            "process",
            Some(json!({
                "name": program,
                "systemProcessId": pid,
                "isLocalProcess": true,
                "startMethod": "launch",
            })),
        );

        self.install_pending_breakpoints().await;
        self.start_if_ready().await;
        Ok(())
    }

    async fn attach(&mut self, request: &Request) -> Result<()> {
        let host = request
            .arguments
            .get("host")
            .and_then(Value::as_str)
            .unwrap_or("127.0.0.1");
        let port = request
            .arguments
            .get("port")
            .and_then(Value::as_u64)
            .and_then(|port| u16::try_from(port).ok())
            .ok_or_else(|| invalid("attach.port is required"))?;
        let ip: IpAddr = if host.eq_ignore_ascii_case("localhost") {
            Ipv4Addr::LOCALHOST.into()
        } else {
            host.parse()
                .map_err(|err| invalid(format!("invalid host {host:?}: {err}")))?
        };
        let addr = SocketAddr::new(ip, port);

        self.close_debugger().await;

        let mut debugger = NativeDebugger::new(self.ctx.debugger_config().clone());
        debugger.attach(addr).await?;
        self.debugger = Some(debugger);
        self.launched = false;
        self.session.transition(SessionState::Launched);

        self.out.respond(request, None);
        self.out.event(
            "process",
            Some(json!({
                "name": addr.to_string(),
                "isLocalProcess": false,
                "startMethod": "attach",
            })),
        );

        self.install_pending_breakpoints().await;
        Ok(())
    }

    /// Resume (or report the entry stop of) a launched debuggee once the client finished
    /// configuring it.
    async fn start_if_ready(&mut self) {
        if !(self.launched && self.configured) {
            return;
        }
        self.launched = false;

        if self.stop_on_entry {
            let thread_id = match self.debugger.as_ref() {
                Some(debugger) => debugger
                    .list_threads()
                    .await
                    .ok()
                    .and_then(|threads| threads.first().map(dap_thread_id))
                    .unwrap_or(1),
                None => 1,
            };
            self.session.transition(SessionState::Stopped);
            self.out.event(
                "stopped",
                Some(json!({ "reason": "entry", "threadId": thread_id, "allThreadsStopped": true })),
            );
            return;
        }

        match self.execute(RunCommand::Continue, None).await {
            Ok(state) => self.report_stop(&state, RunCommand::Continue),
            Err(err) => {
                tracing::warn!(error = %err, "failed to start debuggee");
                self.out.output("console", format!("failed to start program: {err}\n"));
                self.report_abandoned(&err, None);
            }
        }
    }

    async fn set_breakpoints(&mut self, request: &Request) -> Result<()> {
        let source_path = request
            .arguments
            .get("source")
            .and_then(|source| source.get("path"))
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("setBreakpoints.source.path is required"))?
            .to_string();
        let requested = requested_breakpoints(&request.arguments);

        // Drop the previous batch first so re-requested lines are not rejected as duplicates.
        let previous = self.session.breakpoints_for(&source_path);
        if let Some(debugger) = self.debugger.as_mut() {
            for entry in &previous {
                let Some(native_id) = entry.native_id() else {
                    continue;
                };
                if let Err(err) = debugger.clear_breakpoint(native_id).await {
                    tracing::warn!(native_id, error = %err, "failed to clear native breakpoint");
                }
            }
        }
        self.ctx
            .catalog()
            .remove_many(previous.iter().map(|entry| entry.id()));

        let mut entries = Vec::with_capacity(requested.len());
        for bp in requested {
            let resolved = self.resolve_breakpoint(&source_path, bp).await;
            entries.push(self.ctx.catalog().add(resolved));
        }

        let body: Vec<Value> = entries.iter().map(|entry| entry.to_dap()).collect();
        self.session.replace_breakpoints(&source_path, entries);
        tracing::debug!(
            session = self.session.id(),
            source = %source_path,
            count = body.len(),
            "breakpoints replaced"
        );
        self.out.respond(request, Some(json!({ "breakpoints": body })));
        Ok(())
    }

    async fn resolve_breakpoint(&mut self, source_file: &str, requested: RequestedBreakpoint) -> NewBreakpoint {
        let mut resolved = NewBreakpoint {
            source_file: source_file.to_string(),
            source_line: requested.line,
            condition: requested.condition,
            hit_condition: requested.hit_condition,
            log_message: requested.log_message,
            ..NewBreakpoint::default()
        };

        let generated = match self.ctx.maps().translate_to_generated(source_file, requested.line) {
            Ok(generated) => generated,
            Err(err) => {
                tracing::debug!(source = source_file, line = requested.line, error = %err, "breakpoint not translated");
                resolved.message = Some(err.to_string());
                return resolved;
            }
        };
        resolved.generated = Some(generated.clone());

        let Some(debugger) = self.debugger.as_mut() else {
            resolved.message = Some(PENDING_MESSAGE.to_string());
            return resolved;
        };
        match debugger
            .create_breakpoint(
                &generated.file,
                generated.line,
                resolved.condition.as_deref(),
                resolved.hit_condition.as_deref(),
            )
            .await
        {
            Ok(native_id) => {
                resolved.native_id = Some(native_id);
                resolved.verified = true;
            }
            Err(err) => {
                tracing::warn!(file = %generated.file, line = generated.line, error = %err, "native breakpoint rejected");
                resolved.message = Some(err.to_string());
            }
        }
        resolved
    }

    /// Install breakpoints recorded before a native debugger was available.
    async fn install_pending_breakpoints(&mut self) {
        for entry in self.session.all_breakpoints() {
            if entry.is_verified() {
                continue;
            }
            let Some(generated) = entry.generated.clone() else {
                continue;
            };
            let Some(debugger) = self.debugger.as_mut() else {
                return;
            };

            let condition = entry.condition();
            match debugger
                .create_breakpoint(
                    &generated.file,
                    generated.line,
                    condition.as_deref(),
                    entry.hit_condition.as_deref(),
                )
                .await
            {
                Ok(native_id) => {
                    entry.set_native_id(Some(native_id));
                    entry.set_message(None);
                    entry.set_verified(true);
                }
                Err(err) => entry.set_message(Some(err.to_string())),
            }
            self.out.event(
                "breakpoint",
                Some(json!({ "reason": "changed", "breakpoint": entry.to_dap() })),
            );
        }
    }

    async fn run_control(&mut self, request: &Request, command: RunCommand) -> Result<()> {
        if self.debugger.is_none() {
            return Err(WireServerError::NotAttached);
        }
        let goroutine = request.arguments.get("threadId").and_then(Value::as_i64);

        match self.execute(command, goroutine).await {
            Ok(state) => {
                let body = (command == RunCommand::Continue).then(|| json!({ "allThreadsContinued": true }));
                self.out.respond(request, body);
                self.report_stop(&state, command);
                Ok(())
            }
            Err(err @ WireServerError::Native(NativeError::Timeout | NativeError::Cancelled)) => {
                self.out.respond_err(request, err.to_string());
                self.report_abandoned(&err, goroutine);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Run `command` until the debuggee stops somewhere other than a logpoint.
    async fn execute(&mut self, command: RunCommand, goroutine: Option<i64>) -> Result<DebuggerState> {
        let cancel = self.cancel.child_token();
        loop {
            self.session.clear_handles();
            self.session.transition(match command {
                RunCommand::Continue => SessionState::Running,
                _ => SessionState::Stepping,
            });

            let debugger = self.debugger.as_mut().ok_or(WireServerError::NotAttached)?;
            let result = match command {
                RunCommand::Continue => debugger.continue_(&cancel).await,
                RunCommand::Next => debugger.next(goroutine, &cancel).await,
                RunCommand::StepIn => debugger.step_in(goroutine, &cancel).await,
                RunCommand::StepOut => debugger.step_out(goroutine, &cancel).await,
            };
            let state = match result {
                Ok(state) => state,
                Err(err) => {
                    self.session.transition(SessionState::Stopped);
                    return Err(err.into());
                }
            };
            if state.exited {
                return Ok(state);
            }

            let hits = self.hit_entries(&state);
            if hits.is_empty() || !hits.iter().all(|entry| entry.is_logpoint()) {
                return Ok(state);
            }

            let thread = state.current_thread.as_ref().map(dap_thread_id);
            for entry in &hits {
                if let Some(template) = &entry.log_message {
                    let text = self.render_log_message(template, thread).await;
                    self.out.output("console", format!("{text}\n"));
                }
            }
            if command != RunCommand::Continue {
                return Ok(state);
            }
        }
    }

    /// Catalog entries of this session placed where the current thread stopped.
    fn hit_entries(&self, state: &DebuggerState) -> Vec<Arc<CatalogEntry>> {
        let Some(hit) = state.hit_breakpoint() else {
            return Vec::new();
        };
        // Reported locations carry the debugger's resolved paths; only the native id is stable.
        self.session
            .all_breakpoints()
            .into_iter()
            .filter(|entry| entry.native_id() == Some(hit.id))
            .collect()
    }

    /// Expand `{expression}` placeholders of a logpoint message.
    async fn render_log_message(&self, template: &str, goroutine: Option<i64>) -> String {
        let mut rendered = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(start) = rest.find('{') {
            rendered.push_str(&rest[..start]);
            let after = &rest[start + 1..];
            let Some(end) = after.find('}') else {
                rendered.push_str(&rest[start..]);
                rest = "";
                break;
            };

            let expression = after[..end].trim();
            let value = match self.debugger.as_ref() {
                Some(debugger) => match debugger.evaluate(expression, goroutine, 0).await {
                    Ok(value) => display_value(&value),
                    Err(err) => format!("<{err}>"),
                },
                None => "<not attached>".to_string(),
            };
            rendered.push_str(&value);
            rest = &after[end + 1..];
        }
        rendered.push_str(rest);
        rendered
    }

    fn report_stop(&self, state: &DebuggerState, command: RunCommand) {
        self.session.transition(SessionState::Stopped);
        if state.exited {
            self.out.event("exited", Some(json!({ "exitCode": state.exit_status })));
            self.out.event("terminated", None);
            return;
        }

        let thread_id = state.current_thread.as_ref().map(dap_thread_id).unwrap_or(1);
        let hits: Vec<u64> = self
            .hit_entries(state)
            .iter()
            .filter(|entry| !entry.is_logpoint())
            .map(|entry| entry.id())
            .collect();
        let reason = if !hits.is_empty() {
            "breakpoint"
        } else if command != RunCommand::Continue {
            "step"
        } else if state.hit_breakpoint().is_some() {
            "breakpoint"
        } else {
            "pause"
        };

        let mut body = json!({ "reason": reason, "threadId": thread_id, "allThreadsStopped": true });
        if !hits.is_empty() {
            body["hitBreakpointIds"] = json!(hits);
        }
        self.out.event("stopped", Some(body));
    }

    /// The native debugger was halted after a timed out or cancelled run-control command.
    fn report_abandoned(&self, err: &WireServerError, goroutine: Option<i64>) {
        let halted = matches!(
            err,
            WireServerError::Native(NativeError::Timeout | NativeError::Cancelled)
        );
        if halted && !self.cancel.is_cancelled() {
            self.out.event(
                "stopped",
                Some(json!({
                    "reason": "pause",
                    "threadId": goroutine.unwrap_or(1),
                    "allThreadsStopped": true,
                })),
            );
        }
    }

    fn debugger(&self) -> Result<&NativeDebugger> {
        self.debugger.as_ref().ok_or(WireServerError::NotAttached)
    }

    async fn threads(&mut self, request: &Request) -> Result<()> {
        let Some(debugger) = self.debugger.as_ref() else {
            self.out.respond(request, Some(json!({ "threads": [] })));
            return Ok(());
        };

        let threads: Vec<ThreadInfo> = debugger
            .list_threads()
            .await?
            .iter()
            .map(|thread| ThreadInfo {
                id: dap_thread_id(thread),
                name: thread_name(thread),
            })
            .collect();
        let body: Vec<Value> = threads
            .iter()
            .map(|thread| json!({ "id": thread.id, "name": thread.name }))
            .collect();
        self.session.set_threads(threads);
        self.out.respond(request, Some(json!({ "threads": body })));
        Ok(())
    }

    async fn stack_trace(&mut self, request: &Request) -> Result<()> {
        let thread_id = required_i64(request, "threadId")?;
        let start = request
            .arguments
            .get("startFrame")
            .and_then(Value::as_i64)
            .unwrap_or(0)
            .max(0);
        let levels = request
            .arguments
            .get("levels")
            .and_then(Value::as_i64)
            .filter(|&levels| levels > 0);
        let depth = start
            .saturating_add(levels.unwrap_or(DEFAULT_STACK_DEPTH))
            .min(MAX_STACK_DEPTH);

        let frames = self.debugger()?.stack_trace(Some(thread_id), depth).await?;
        let total = frames.len();
        let stack_frames: Vec<Value> = frames
            .iter()
            .enumerate()
            .skip(usize::try_from(start).unwrap_or(usize::MAX))
            .take(levels.and_then(|levels| usize::try_from(levels).ok()).unwrap_or(usize::MAX))
            .map(|(index, frame)| {
                let id = self.session.alloc_frame(FrameRef {
                    goroutine: thread_id,
                    index: index as i64,
                    generated_file: frame.file.clone(),
                    generated_line: frame.line,
                });
                self.dap_frame(id, frame)
            })
            .collect();

        self.out.respond(
            request,
            Some(json!({ "stackFrames": stack_frames, "totalFrames": total })),
        );
        Ok(())
    }

    /// DAP stack frame at the source position of `frame`, or at its generated position
    /// when no position map covers it.
    fn dap_frame(&self, id: i64, frame: &NativeFrame) -> Value {
        let translated = u32::try_from(frame.line)
            .ok()
            .and_then(|line| self.ctx.maps().translate_to_source(&frame.file, line).ok());

        let name = frame.function_name().unwrap_or("<unknown>");
        match translated {
            Some(position) => json!({
                "id": id,
                "name": name,
                "source": source_json(&position.file),
                "line": position.line,
                "column": position.column.max(1),
            }),
            None => json!({
                "id": id,
                "name": name,
                "source": source_json(&frame.file),
                "line": frame.line,
                "column": 1,
                "presentationHint": "subtle",
            }),
        }
    }

    fn scopes(&mut self, request: &Request) -> Result<()> {
        let frame_id = required_i64(request, "frameId")?;
        let frame = self
            .session
            .frame(frame_id)
            .ok_or_else(|| invalid(format!("unknown frameId {frame_id}")))?;
        let locals = self.session.alloc_variable(VariableRef::Locals {
            goroutine: frame.goroutine,
            frame: frame.index,
        });
        self.out.respond(
            request,
            Some(json!({
                "scopes": [{
                    "name": "Locals",
                    "presentationHint": "locals",
                    "variablesReference": locals,
                    "expensive": false,
                }]
            })),
        );
        Ok(())
    }

    async fn variables(&mut self, request: &Request) -> Result<()> {
        let reference = required_i64(request, "variablesReference")?;
        let variable = self
            .session
            .variable(reference)
            .ok_or_else(|| invalid(format!("unknown variablesReference {reference}")))?;
        let debugger = self.debugger()?;

        let (goroutine, frame, parent, children) = match variable {
            VariableRef::Locals { goroutine, frame } => {
                let locals = debugger.list_variables(Some(goroutine), frame).await?;
                (goroutine, frame, None, locals)
            }
            VariableRef::Path { goroutine, frame, path } => {
                let value = debugger.evaluate(&path, Some(goroutine), frame).await?;
                (goroutine, frame, Some(path), value.children)
            }
        };

        let variables: Vec<Value> = children
            .iter()
            .map(|child| {
                let path = child_path(parent.as_deref(), &child.name);
                self.dap_variable(child, path, goroutine, frame)
            })
            .collect();
        self.out.respond(request, Some(json!({ "variables": variables })));
        Ok(())
    }

    fn dap_variable(&self, variable: &NativeVariable, path: String, goroutine: i64, frame: i64) -> Value {
        let reference = if variable.has_children() {
            self.session.alloc_variable(VariableRef::Path {
                goroutine,
                frame,
                path: path.clone(),
            })
        } else {
            0
        };
        json!({
            "name": variable.name,
            "value": display_value(variable),
            "type": variable.type_name,
            "variablesReference": reference,
            "evaluateName": path,
        })
    }

    async fn evaluate(&mut self, request: &Request) -> Result<()> {
        let expression = request
            .arguments
            .get("expression")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("evaluate.expression is required"))?;
        let (goroutine, frame) = match request.arguments.get("frameId").and_then(Value::as_i64) {
            Some(frame_id) => {
                let frame = self
                    .session
                    .frame(frame_id)
                    .ok_or_else(|| invalid(format!("unknown frameId {frame_id}")))?;
                (frame.goroutine, frame.index)
            }
            None => (CURRENT_GOROUTINE, 0),
        };

        let value = self
            .debugger()?
            .evaluate(expression, Some(goroutine), frame)
            .await?;
        let reference = if value.has_children() {
            self.session.alloc_variable(VariableRef::Path {
                goroutine,
                frame,
                path: expression.to_string(),
            })
        } else {
            0
        };
        self.out.respond(
            request,
            Some(json!({
                "result": display_value(&value),
                "type": value.type_name,
                "variablesReference": reference,
            })),
        );
        Ok(())
    }

    /// Detach from the current native debugger, if any. Session breakpoints stay recorded
    /// and become pending again.
    async fn close_debugger(&mut self) {
        if let Some(debugger) = self.debugger.take() {
            if let Err(err) = debugger.close().await {
                tracing::warn!(session = self.session.id(), error = %err, "failed to detach native debugger");
            }
            for entry in self.session.all_breakpoints() {
                if entry.native_id().is_some() {
                    entry.set_native_id(None);
                    entry.set_verified(false);
                    entry.set_message(Some(PENDING_MESSAGE.to_string()));
                }
            }
        }
        if let Some(task) = self.output_task.take() {
            task.abort();
        }
        self.launched = false;
    }

    /// End the session. Safe to call any number of times.
    async fn teardown(&mut self) {
        self.close_debugger().await;
        let held = self.session.reset();
        if !held.is_empty() {
            self.ctx
                .catalog()
                .remove_many(held.iter().map(|entry| entry.id()));
        }
        if self.session.state() != SessionState::Disconnected {
            tracing::info!(session = self.session.id(), "DAP session ended");
        }
        self.session.transition(SessionState::Disconnected);
    }
}

fn spawn_output_forwarder(mut lines: mpsc::UnboundedReceiver<OutputLine>, out: Outbox) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(line) = lines.recv().await {
            out.output(line.category.as_str(), format!("{}\n", line.text));
        }
    })
}

fn invalid(message: impl Into<String>) -> WireServerError {
    WireServerError::InvalidRequest(message.into())
}

fn required_i64(request: &Request, key: &str) -> Result<i64> {
    request
        .arguments
        .get(key)
        .and_then(Value::as_i64)
        .ok_or_else(|| invalid(format!("{}.{key} is required", request.command)))
}

fn string_array(args: &Value, key: &str) -> Vec<String> {
    args.get(key)
        .and_then(Value::as_array)
        .map(|values| {
            values
                .iter()
                .filter_map(|value| value.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn requested_breakpoints(args: &Value) -> Vec<RequestedBreakpoint> {
    let text = |bp: &Value, key: &str| {
        bp.get(key)
            .and_then(Value::as_str)
            .filter(|text| !text.trim().is_empty())
            .map(str::to_string)
    };

    if let Some(breakpoints) = args.get("breakpoints").and_then(Value::as_array) {
        return breakpoints
            .iter()
            .filter_map(|bp| {
                let line = bp.get("line").and_then(Value::as_u64)?;
                Some(RequestedBreakpoint {
                    line: u32::try_from(line).ok()?,
                    condition: text(bp, "condition"),
                    hit_condition: text(bp, "hitCondition"),
                    log_message: text(bp, "logMessage"),
                })
            })
            .collect();
    }

    // Deprecated `lines` form.
    args.get("lines")
        .and_then(Value::as_array)
        .map(|lines| {
            lines
                .iter()
                .filter_map(|line| line.as_u64().and_then(|line| u32::try_from(line).ok()))
                .map(|line| RequestedBreakpoint {
                    line,
                    condition: None,
                    hit_condition: None,
                    log_message: None,
                })
                .collect()
        })
        .unwrap_or_default()
}

fn dap_thread_id(thread: &NativeThread) -> i64 {
    if thread.goroutine_id > 0 {
        thread.goroutine_id
    } else {
        thread.id
    }
}

fn thread_name(thread: &NativeThread) -> String {
    let id = dap_thread_id(thread);
    match thread.function_name() {
        Some(function) => format!("Goroutine {id} [{function}]"),
        None => format!("Goroutine {id}"),
    }
}

fn source_json(path: &str) -> Value {
    let name = Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string());
    json!({ "name": name, "path": path })
}

fn child_path(parent: Option<&str>, name: &str) -> String {
    match parent {
        None => name.to_string(),
        Some(parent) if name.starts_with('[') => format!("{parent}{name}"),
        Some(parent) => format!("{parent}.{name}"),
    }
}

fn display_value(variable: &NativeVariable) -> String {
    if !variable.unreadable.is_empty() {
        format!("<unreadable: {}>", variable.unreadable)
    } else if variable.value.is_empty() {
        variable.type_name.clone()
    } else {
        variable.value.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_paths_follow_expression_syntax() {
        assert_eq!(child_path(None, "user"), "user");
        assert_eq!(child_path(Some("user"), "Name"), "user.Name");
        assert_eq!(child_path(Some("items"), "[2]"), "items[2]");
    }

    #[test]
    fn requested_breakpoints_accept_both_forms() {
        let args = json!({
            "breakpoints": [
                { "line": 3, "condition": "x > 1" },
                { "line": 7, "logMessage": "x = {x}", "hitCondition": " " },
                { "column": 2 }
            ]
        });
        let requested = requested_breakpoints(&args);
        assert_eq!(requested.len(), 2);
        assert_eq!(requested[0].condition.as_deref(), Some("x > 1"));
        assert_eq!(requested[1].log_message.as_deref(), Some("x = {x}"));
        assert_eq!(requested[1].hit_condition, None);

        let legacy = requested_breakpoints(&json!({ "lines": [4, 5] }));
        assert_eq!(legacy.iter().map(|bp| bp.line).collect::<Vec<_>>(), vec![4, 5]);
    }

    #[test]
    fn only_transport_errors_are_fatal() {
        assert!(WireServerError::Dap(DapError::Protocol("bad".to_string())).is_fatal());
        assert!(!WireServerError::NotAttached.is_fatal());
        assert!(!WireServerError::Native(NativeError::Timeout).is_fatal());
    }

    #[test]
    fn display_prefers_unreadable_reason() {
        let variable = NativeVariable {
            name: "p".to_string(),
            type_name: "*main.T".to_string(),
            unreadable: "could not read memory".to_string(),
            ..NativeVariable::default()
        };
        assert_eq!(display_value(&variable), "<unreadable: could not read memory>");

        let structure = NativeVariable {
            name: "u".to_string(),
            type_name: "main.User".to_string(),
            ..NativeVariable::default()
        };
        assert_eq!(display_value(&structure), "main.User");
    }
}
