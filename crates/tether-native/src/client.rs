use std::{
    collections::HashMap,
    net::SocketAddr,
    path::PathBuf,
    time::Duration,
};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{LaunchError, NativeError, Result};
use crate::launch::{spawn_headless, DebuggerProcess, LaunchRequest, OutputLine};
use crate::rpc::{RpcClient, RpcClientConfig};
use crate::types::{
    BreakpointOut, ClearBreakpointIn, CommandIn, CommandOut, CreateBreakpointIn, DebuggerState,
    DetachIn, EvalIn, EvalOut, EvalScope, ListLocalVarsIn, ListLocalVarsOut, ListThreadsOut,
    LoadConfig, NativeBreakpoint, NativeFrame, NativeThread, NativeVariable, StacktraceIn,
    StacktraceOut,
};

#[derive(Debug, Clone)]
pub struct NativeDebuggerConfig {
    /// Native debugger executable.
    pub executable: PathBuf,
    /// Arguments placed before the headless-mode flags.
    pub extra_args: Vec<String>,
    /// Interface the headless server binds to; the port is always ephemeral.
    pub listen_host: String,
    pub announce_timeout: Duration,
    pub request_timeout: Duration,
    pub run_control_timeout: Duration,
    pub reap_timeout: Duration,
    pub exit_timeout: Duration,
    pub load_config: LoadConfig,
}

impl Default for NativeDebuggerConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("dlv"),
            extra_args: Vec::new(),
            listen_host: "127.0.0.1".to_string(),
            announce_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            run_control_timeout: Duration::from_secs(30),
            reap_timeout: Duration::from_secs(2),
            exit_timeout: Duration::from_secs(5),
            load_config: LoadConfig::default(),
        }
    }
}

/// Goroutine selector meaning "whatever the native debugger considers current".
const CURRENT_GOROUTINE: i64 = -1;

/// Owns the connection to exactly one native debugger and, when launched by us, its
/// process.
#[derive(Debug)]
pub struct NativeDebugger {
    config: NativeDebuggerConfig,
    rpc: Option<RpcClient>,
    process: Option<DebuggerProcess>,
    /// Last descriptor the native debugger returned for each breakpoint it holds.
    breakpoints: HashMap<i64, NativeBreakpoint>,
}

impl NativeDebugger {
    pub fn new(config: NativeDebuggerConfig) -> Self {
        Self {
            config,
            rpc: None,
            process: None,
            breakpoints: HashMap::new(),
        }
    }

    pub fn config(&self) -> &NativeDebuggerConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.rpc.as_ref().is_some_and(|rpc| !rpc.is_closed())
    }

    pub fn process_id(&self) -> Option<u32> {
        self.process.as_ref().and_then(|process| process.id())
    }

    pub fn breakpoint(&self, native_id: i64) -> Option<&NativeBreakpoint> {
        self.breakpoints.get(&native_id)
    }

    /// Start `request.program` under the native debugger and connect to it.
    ///
    /// Output of the debugger process (which includes the debuggee's output) is
    /// forwarded to `output` for as long as the process runs.
    pub async fn launch(
        &mut self,
        request: &LaunchRequest,
        output: Option<mpsc::UnboundedSender<OutputLine>>,
    ) -> Result<()> {
        if self.rpc.is_some() {
            self.detach().await?;
        }

        let (mut process, addr) = spawn_headless(&self.config, request, output).await?;
        let rpc = match RpcClient::connect_with_config(addr, self.rpc_config()).await {
            Ok(rpc) => rpc,
            Err(err) => {
                process.kill_and_reap(self.config.reap_timeout).await;
                return Err(match err {
                    NativeError::Io(source) => LaunchError::Connect { addr, source }.into(),
                    other => other,
                });
            }
        };

        self.rpc = Some(rpc);
        self.process = Some(process);
        Ok(())
    }

    /// Connect to a native debugger that is already running in headless mode.
    pub async fn attach(&mut self, addr: SocketAddr) -> Result<()> {
        if self.rpc.is_some() {
            self.detach().await?;
        }
        let rpc = RpcClient::connect_with_config(addr, self.rpc_config())
            .await
            .map_err(|err| match err {
                NativeError::Io(source) => LaunchError::Connect { addr, source }.into(),
                other => other,
            })?;
        self.rpc = Some(rpc);
        Ok(())
    }

    fn rpc_config(&self) -> RpcClientConfig {
        RpcClientConfig {
            connect_timeout: self.config.announce_timeout,
            reply_timeout: self.config.request_timeout,
        }
    }

    fn rpc(&self) -> Result<&RpcClient> {
        match &self.rpc {
            Some(rpc) if !rpc.is_closed() => Ok(rpc),
            _ => Err(NativeError::NotConnected),
        }
    }

    pub async fn create_breakpoint(
        &mut self,
        file: &str,
        line: u32,
        condition: Option<&str>,
        hit_condition: Option<&str>,
    ) -> Result<i64> {
        let request = CreateBreakpointIn {
            breakpoint: NativeBreakpoint {
                file: file.to_string(),
                line: i64::from(line),
                cond: condition.unwrap_or_default().to_string(),
                hit_cond: hit_condition.unwrap_or_default().to_string(),
                ..NativeBreakpoint::default()
            },
        };
        let out: BreakpointOut = self.rpc()?.call("RPCServer.CreateBreakpoint", request).await?;
        let id = out.breakpoint.id;
        tracing::debug!(native_id = id, file, line, "created native breakpoint");
        self.breakpoints.insert(id, out.breakpoint);
        Ok(id)
    }

    pub async fn clear_breakpoint(&mut self, native_id: i64) -> Result<()> {
        let _: BreakpointOut = self
            .rpc()?
            .call("RPCServer.ClearBreakpoint", ClearBreakpointIn { id: native_id })
            .await?;
        self.breakpoints.remove(&native_id);
        Ok(())
    }

    pub async fn continue_(&mut self, cancel: &CancellationToken) -> Result<DebuggerState> {
        self.run_control("continue", None, cancel).await
    }

    pub async fn next(&mut self, goroutine: Option<i64>, cancel: &CancellationToken) -> Result<DebuggerState> {
        self.run_control("next", goroutine, cancel).await
    }

    pub async fn step_in(&mut self, goroutine: Option<i64>, cancel: &CancellationToken) -> Result<DebuggerState> {
        self.run_control("step", goroutine, cancel).await
    }

    pub async fn step_out(&mut self, goroutine: Option<i64>, cancel: &CancellationToken) -> Result<DebuggerState> {
        self.run_control("stepOut", goroutine, cancel).await
    }

    /// Issue a run-control command and wait for the next stop.
    ///
    /// When the wait times out or `cancel` fires, the native debugger is told to halt so
    /// the operation does not keep running behind the caller's back.
    async fn run_control(
        &mut self,
        name: &str,
        goroutine: Option<i64>,
        cancel: &CancellationToken,
    ) -> Result<DebuggerState> {
        let rpc = self.rpc()?.clone();
        let command = CommandIn {
            name: name.to_string(),
            goroutine_id: goroutine.filter(|&g| g > 0),
        };

        tracing::debug!(command = name, ?goroutine, "run control");
        let result = rpc
            .call_with::<_, CommandOut>(
                "RPCServer.Command",
                command,
                self.config.run_control_timeout,
                Some(cancel),
            )
            .await;

        match result {
            Ok(out) => Ok(out.state),
            Err(err @ (NativeError::Timeout | NativeError::Cancelled)) => {
                tracing::warn!(command = name, error = %err, "run control abandoned; halting");
                self.halt(&rpc).await;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    async fn halt(&self, rpc: &RpcClient) {
        let command = CommandIn {
            name: "halt".to_string(),
            goroutine_id: None,
        };
        if let Err(err) = rpc.call::<_, CommandOut>("RPCServer.Command", command).await {
            tracing::warn!(error = %err, "failed to halt native debugger");
        }
    }

    pub async fn list_threads(&self) -> Result<Vec<NativeThread>> {
        let out: ListThreadsOut = self
            .rpc()?
            .call("RPCServer.ListThreads", serde_json::json!({}))
            .await?;
        Ok(out.threads)
    }

    /// Stack of `goroutine`, innermost frame first.
    pub async fn stack_trace(&self, goroutine: Option<i64>, depth: i64) -> Result<Vec<NativeFrame>> {
        let request = StacktraceIn {
            id: goroutine.unwrap_or(CURRENT_GOROUTINE),
            depth,
        };
        let out: StacktraceOut = self.rpc()?.call("RPCServer.Stacktrace", request).await?;
        Ok(out.locations)
    }

    pub async fn list_variables(&self, goroutine: Option<i64>, frame: i64) -> Result<Vec<NativeVariable>> {
        let request = ListLocalVarsIn {
            scope: EvalScope {
                goroutine_id: goroutine.unwrap_or(CURRENT_GOROUTINE),
                frame,
            },
            cfg: self.config.load_config,
        };
        let out: ListLocalVarsOut = self.rpc()?.call("RPCServer.ListLocalVars", request).await?;
        Ok(out.variables)
    }

    pub async fn evaluate(&self, expression: &str, goroutine: Option<i64>, frame: i64) -> Result<NativeVariable> {
        let request = EvalIn {
            scope: EvalScope {
                goroutine_id: goroutine.unwrap_or(CURRENT_GOROUTINE),
                frame,
            },
            expr: expression.to_string(),
            cfg: self.config.load_config,
        };
        let out: EvalOut = self.rpc()?.call("RPCServer.Eval", request).await?;
        Ok(out.variable)
    }

    /// Detach from the native debugger and stop the process we launched.
    ///
    /// Succeeds as a no-op when nothing is attached.
    pub async fn detach(&mut self) -> Result<()> {
        let rpc = self.rpc.take();
        let process = self.process.take();
        self.breakpoints.clear();

        let mut result = Ok(());
        if let Some(rpc) = rpc {
            if !rpc.is_closed() {
                let request = DetachIn {
                    kill: process.is_some(),
                };
                match rpc.call::<_, serde_json::Value>("RPCServer.Detach", request).await {
                    // Closing the connection is how the native debugger acknowledges a
                    // detach on some versions.
                    Ok(_) | Err(NativeError::ConnectionClosed) => {}
                    Err(err) => result = Err(err),
                }
            }
            rpc.shutdown();
        }

        if let Some(mut process) = process {
            process.kill_and_reap(self.config.exit_timeout).await;
        }

        result
    }

    /// [`Self::detach`], then drop the client.
    pub async fn close(mut self) -> Result<()> {
        self.detach().await
    }
}

impl Drop for NativeDebugger {
    fn drop(&mut self) {
        if let Some(rpc) = self.rpc.take() {
            rpc.shutdown();
        }
        // `kill_on_drop` takes care of a process that was never detached.
    }
}
