//! Tether debug adapter.
//!
//! Speaks the Debug Adapter Protocol to an editor and drives an out-of-process native
//! debugger on its behalf. Breakpoints and stack frames are translated between the
//! source language and the generated code through position maps.

pub mod catalog;
pub mod context;
pub mod dap_tokio;
pub mod server;
pub mod session;
pub mod wire_server;

pub use crate::catalog::{BreakpointCatalog, CatalogEntry, CatalogError, NewBreakpoint};
pub use crate::context::AdapterContext;
pub use crate::server::DapServer;
pub use crate::session::{Session, SessionState};
pub use crate::wire_server::WireServerError;
