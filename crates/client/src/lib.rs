//! Client SDK for the minibox sandbox service.
//!
//! Layers, from the wire up:
//!
//! ```text
//! +--------------------------------------------------+
//! |  Orchestrator       service name -> Sandbox      |
//! +--------------------------------------------------+
//! |  Sandbox            lifecycle + handles          |
//! |    CodeExecutor / CommandExecutor / FileSystem   |
//! +--------------------------------------------------+
//! |  Transport          request ids, stream demux    |
//! +--------------------------------------------------+
//! |  Connection         one JSON frame at a time     |
//! |    WsConnection / MockConnection                 |
//! +--------------------------------------------------+
//! ```
//!
//! A sandbox runs at most one execution at a time; filesystem operations
//! may interleave with it. Teardown is explicit (`destroy`) or scoped
//! (`Sandbox::scope`), and a teardown the service never confirmed is
//! reported as an uncertain release rather than swallowed.

#![deny(unused)]

pub mod connection;
pub mod executor;
pub mod filesystem;
pub mod orchestrator;
pub mod session;
pub mod transport;

pub use connection::{Connection, MockConnection, MockRemote, WsConnection};
pub use executor::{CodeExecutor, CommandExecutor, Execution, OutputStream};
pub use filesystem::FileSystem;
pub use orchestrator::{Orchestrator, Service};
pub use session::{Sandbox, SandboxState};
pub use transport::{PendingCall, Transport};
