//! Port Forwarding Module
//!
//! Connection registry and lifecycle engine: starts, stops and restarts
//! kubectl port-forwards (plus their optional socat proxies), recovers from
//! port conflicts and watches connection health.

mod bulk;
mod events;
mod lifecycle;
pub mod manager;
mod monitor;
pub mod recovery;
mod state;


pub use events::{ConnectionEvent, ConnectionEventEmitter};
pub use manager::{ManagerOptions, PortForwardManager};
pub use recovery::RecoveryPolicy;
pub use state::{ConnectionSnapshot, ConnectionStatus, LogEntry, MAX_LOG_ENTRIES};
