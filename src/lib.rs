//! Port Forwarder - kubectl port-forward supervisor
//!
//! Keeps a set of `kubectl port-forward` tunnels (and optional `socat`
//! proxies in front of them) running, recovering automatically when a local
//! port is taken by another process.

pub mod config;
pub mod error;
pub mod forwarding;
pub mod notify;
pub mod process;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use error::ForwarderError;
pub use forwarding::{ConnectionStatus, ManagerOptions, PortForwardManager};

/// Install the global tracing subscriber (`RUST_LOG` overrides the `info` default)
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
