//! The IPC-facing surface: the request/response handler local applications
//! call into, and a loopback transport stand-in for the wire protocol the
//! spec treats as external.

pub mod error;
pub mod handler;
pub mod transport;

pub use error::{IpcError, Result};
pub use handler::{NamedShadowPage, ShadowIpcHandler, UpdateResponse};
pub use transport::{LoopbackServer, LoopbackTransport, TransportRequest};
