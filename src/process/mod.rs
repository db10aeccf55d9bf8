//! Process Supervision Module
//!
//! Owns the OS-level child processes behind each connection (the kubectl
//! port-forward and the optional socat proxy), their output, and the
//! per-connection log/conflict callbacks.

pub mod command;
mod handlers;
pub mod output;
mod session;
mod supervisor;
mod system;
pub mod terminate;

#[cfg(test)]
pub(crate) mod mock;

pub use command::{resolve_binary, CommandSpec};
pub use handlers::{ConflictHandler, HandlerTable, LogHandler};
pub use session::{ProcessExit, ProcessRole, ProcessSession, SessionController};
pub use supervisor::ProcessSupervisor;
pub use system::{BinaryPaths, SystemSupervisor};
