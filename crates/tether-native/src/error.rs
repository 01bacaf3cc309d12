use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, NativeError>;

#[derive(Debug, Error)]
pub enum NativeError {
    #[error("native debugger is not connected")]
    NotConnected,

    #[error("native debugger did not answer in time")]
    Timeout,

    #[error("native debugger request cancelled")]
    Cancelled,

    #[error("native debugger connection closed")]
    ConnectionClosed,

    /// The native debugger answered with an error.
    #[error("native debugger rejected {method}: {message}")]
    Rpc { method: String, message: String },

    #[error("native debugger protocol error: {0}")]
    Protocol(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Launch(#[from] LaunchError),
}

/// Failures of the launch sequence. No child process outlives any of these.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("program {} does not exist", .0.display())]
    NotFound(PathBuf),

    #[error("program {} is a directory", .0.display())]
    IsDirectory(PathBuf),

    #[error("program {} is not executable", .0.display())]
    NotExecutable(PathBuf),

    #[error("failed to spawn native debugger {}: {source}", .executable.display())]
    Spawn {
        executable: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("native debugger exited before announcing its listen address")]
    NoAnnouncement,

    #[error("native debugger did not announce its listen address within {0:?}")]
    AnnouncementTimeout(std::time::Duration),

    #[error("failed to connect to native debugger at {addr}: {source}")]
    Connect {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },
}
