//! Driver for the out-of-process native debugger.
//!
//! The native debugger runs as a separate process in headless server mode and is
//! controlled over newline-delimited JSON-RPC. [`NativeDebugger`] owns both the process
//! and the RPC connection and exposes the narrow command surface the debug adapter needs:
//! breakpoints, run control, and introspection.

mod client;
mod error;
mod launch;
mod rpc;
pub mod types;

pub use client::{NativeDebugger, NativeDebuggerConfig};
pub use error::{LaunchError, NativeError, Result};
pub use launch::{parse_listen_announcement, validate_program, LaunchRequest, OutputCategory, OutputLine};
pub use rpc::{RpcClient, RpcClientConfig};
pub use types::{
    DebuggerState, EvalScope, Function, LoadConfig, NativeBreakpoint, NativeFrame, NativeThread,
    NativeVariable,
};

pub use tokio_util::sync::CancellationToken;

// Only needed by tests here and in downstream integration suites.
#[cfg(any(test, feature = "test-support"))]
pub mod mock;
