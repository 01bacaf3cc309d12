//! Spawning the native debugger in headless mode and discovering its listen address.

use std::{
    net::{Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    process::Stdio,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child, Command},
    sync::{mpsc, oneshot},
};

use crate::client::NativeDebuggerConfig;
use crate::error::LaunchError;

/// Marker printed by the native debugger once its RPC server accepts connections.
const LISTEN_MARKER: &str = "listening at";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl LaunchRequest {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputCategory {
    Stdout,
    Stderr,
}

impl OutputCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputCategory::Stdout => "stdout",
            OutputCategory::Stderr => "stderr",
        }
    }
}

/// One line of output captured from the native debugger process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub category: OutputCategory,
    pub text: String,
}

/// Check that `program` exists, is not a directory, and can be executed.
pub fn validate_program(program: &Path) -> Result<PathBuf, LaunchError> {
    let metadata = match std::fs::metadata(program) {
        Ok(metadata) => metadata,
        Err(_) => return Err(LaunchError::NotFound(program.to_path_buf())),
    };
    if metadata.is_dir() {
        return Err(LaunchError::IsDirectory(program.to_path_buf()));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if metadata.permissions().mode() & 0o111 == 0 {
            return Err(LaunchError::NotExecutable(program.to_path_buf()));
        }
    }

    Ok(std::fs::canonicalize(program).unwrap_or_else(|_| program.to_path_buf()))
}

/// Extract the address from a line such as `API server listening at: 127.0.0.1:38899`.
pub fn parse_listen_announcement(line: &str) -> Option<SocketAddr> {
    let lower = line.to_ascii_lowercase();
    let start = lower.find(LISTEN_MARKER)? + LISTEN_MARKER.len();
    let rest = line[start..].trim_start_matches(|c: char| c == ':' || c.is_whitespace());
    let token = rest.split_whitespace().next()?;
    let token = token.trim_end_matches(|c: char| matches!(c, '.' | ',' | ';'));

    if let Ok(addr) = token.parse::<SocketAddr>() {
        return Some(addr);
    }
    let (host, port) = token.rsplit_once(':')?;
    if host.eq_ignore_ascii_case("localhost") {
        let port = port.parse().ok()?;
        return Some(SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port));
    }
    None
}

/// A spawned native debugger process.
#[derive(Debug)]
pub(crate) struct DebuggerProcess {
    child: Child,
}

impl DebuggerProcess {
    pub(crate) fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Kill the process and wait up to `timeout` for it to be reaped.
    ///
    /// A wait that times out is logged; the process is left to `kill_on_drop`.
    pub(crate) async fn kill_and_reap(&mut self, timeout: Duration) {
        if let Err(err) = self.child.start_kill() {
            // Already exited; `wait` below reaps it.
            tracing::debug!(error = %err, "native debugger kill failed");
        }
        self.reap(timeout).await;
    }

    async fn reap(&mut self, timeout: Duration) {
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => tracing::debug!(%status, "native debugger reaped"),
            Ok(Err(err)) => tracing::warn!(error = %err, "failed to reap native debugger"),
            Err(_elapsed) => tracing::warn!(
                timeout_ms = timeout.as_millis() as u64,
                "timed out waiting for native debugger to exit"
            ),
        }
    }
}

/// Spawn the native debugger for `request` and wait for its listen announcement.
///
/// Every line the process prints is logged and forwarded to `output`. On failure the
/// child has been killed and reaped before this returns.
pub(crate) async fn spawn_headless(
    config: &NativeDebuggerConfig,
    request: &LaunchRequest,
    output: Option<mpsc::UnboundedSender<OutputLine>>,
) -> Result<(DebuggerProcess, SocketAddr), LaunchError> {
    let program = validate_program(&request.program)?;

    let mut command = Command::new(&config.executable);
    command
        .args(&config.extra_args)
        .arg("exec")
        .arg(&program)
        .arg("--headless")
        .arg(format!("--listen={}:0", config.listen_host))
        .arg("--api-version=2");
    if !request.args.is_empty() {
        command.arg("--").args(&request.args);
    }
    if let Some(cwd) = &request.cwd {
        command.current_dir(cwd);
    }
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(|source| LaunchError::Spawn {
        executable: config.executable.clone(),
        source,
    })?;
    tracing::info!(
        pid = child.id(),
        executable = %config.executable.display(),
        program = %program.display(),
        "spawned native debugger"
    );

    let (addr_tx, addr_rx) = oneshot::channel();
    let slot = Arc::new(SlotSender::new(addr_tx));
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(tee_lines(stdout, OutputCategory::Stdout, slot.clone(), output.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(tee_lines(stderr, OutputCategory::Stderr, slot.clone(), output));
    }
    // Only the readers hold the slot now, so the receiver errors once both streams close.
    drop(slot);

    let mut process = DebuggerProcess { child };
    let addr = match tokio::time::timeout(config.announce_timeout, addr_rx).await {
        Ok(Ok(addr)) => addr,
        Ok(Err(_closed)) => {
            process.kill_and_reap(config.reap_timeout).await;
            return Err(LaunchError::NoAnnouncement);
        }
        Err(_elapsed) => {
            process.kill_and_reap(config.reap_timeout).await;
            return Err(LaunchError::AnnouncementTimeout(config.announce_timeout));
        }
    };

    tracing::info!(%addr, "native debugger listening");
    Ok((process, addr))
}

/// Copy lines from `stream` to the log and to `output`, reporting the first listen
/// announcement through `slot`.
async fn tee_lines<R>(
    stream: R,
    category: OutputCategory,
    slot: Arc<SlotSender<SocketAddr>>,
    output: Option<mpsc::UnboundedSender<OutputLine>>,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                tracing::debug!(stream = category.as_str(), error = %err, "native debugger output closed");
                break;
            }
        };

        tracing::info!(stream = category.as_str(), "{line}");
        if let Some(addr) = parse_listen_announcement(&line) {
            slot.send(addr);
        }
        if let Some(output) = &output {
            let _ = output.send(OutputLine {
                category,
                text: line,
            });
        }
    }
}

/// A oneshot sender that several tasks may race to fire; only the first send wins.
struct SlotSender<T> {
    tx: Mutex<Option<oneshot::Sender<T>>>,
}

impl<T> SlotSender<T> {
    fn new(tx: oneshot::Sender<T>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
        }
    }

    fn send(&self, value: T) {
        let tx = match self.tx.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(tx) = tx {
            let _ = tx.send(value);
        }
    }
}
