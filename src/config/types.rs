//! Configuration types
//!
//! Persisted shape of port-forward connections and application settings.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::forwarding::RecoveryPolicy;

/// Current config file version
pub const CONFIG_VERSION: u32 = 1;

fn default_bind_address() -> String {
    "127.0.0.1".into()
}

fn default_true() -> bool {
    true
}

/// A single port-forward definition
///
/// Backed at runtime by a `kubectl port-forward` process and, when
/// `proxy_port` is set, a `socat` proxy that re-exposes the forwarded port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Stable identity, never reused
    pub id: Uuid,
    /// Display name
    pub name: String,
    /// Kubernetes namespace
    pub namespace: String,
    /// Target resource (e.g. "svc/postgres", "pod/api-0")
    pub resource: String,
    /// Optional kubeconfig context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// Local bind address for the forward
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Local port the forward listens on
    pub local_port: u16,
    /// Port on the target resource
    pub remote_port: u16,
    /// Optional proxy port (socat listens here and relays to `local_port`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_port: Option<u16>,
    /// Whether bulk start should bring this connection up
    #[serde(default = "default_true")]
    pub is_enabled: bool,
}

impl ConnectionConfig {
    /// Create a new enabled connection with a fresh id
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        resource: impl Into<String>,
        local_port: u16,
        remote_port: u16,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            namespace: namespace.into(),
            resource: resource.into(),
            context: None,
            bind_address: default_bind_address(),
            local_port,
            remote_port,
            proxy_port: None,
            is_enabled: true,
        }
    }

    /// Set the proxy port
    pub fn with_proxy_port(mut self, port: u16) -> Self {
        self.proxy_port = Some(port);
        self
    }

    /// Set the kubeconfig context
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Set the enable flag
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.is_enabled = enabled;
        self
    }

    /// Whether a proxy process is part of this connection
    pub fn has_proxy(&self) -> bool {
        self.proxy_port.is_some()
    }

    /// Ports this connection binds locally
    pub fn bound_ports(&self) -> Vec<u16> {
        let mut ports = vec![self.local_port];
        ports.extend(self.proxy_port);
        ports
    }
}

/// Settle and grace intervals used by the lifecycle engine
///
/// These are heuristic waits for OS-level resource release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timings {
    /// Delay between stop and start when restarting
    pub restart_delay_ms: u64,
    /// Wait after killing a port occupant before retrying
    pub conflict_grace_ms: u64,
    /// Wait after cancelling tasks before the forced sweep
    pub kill_settle_ms: u64,
    /// Health check interval of the monitoring loop
    pub monitor_interval_ms: u64,
    /// TCP probe timeout used by health checks
    pub health_probe_timeout_ms: u64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            restart_delay_ms: 500,
            conflict_grace_ms: 500,
            kill_settle_ms: 200,
            monitor_interval_ms: 5000,
            health_probe_timeout_ms: 1000,
        }
    }
}

impl Timings {
    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn conflict_grace(&self) -> Duration {
        Duration::from_millis(self.conflict_grace_ms)
    }

    pub fn kill_settle(&self) -> Duration {
        Duration::from_millis(self.kill_settle_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn health_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.health_probe_timeout_ms)
    }
}

/// Application settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Start all enabled connections on launch
    pub auto_start: bool,
    /// Send a notification when a connection drops unexpectedly
    pub show_notifications: bool,
    /// Custom kubectl binary
    pub kubectl_path: Option<PathBuf>,
    /// Custom socat binary
    pub socat_path: Option<PathBuf>,
    pub timings: Timings,
    pub recovery: RecoveryPolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            auto_start: false,
            show_notifications: true,
            kubectl_path: None,
            socat_path: None,
            timings: Timings::default(),
            recovery: RecoveryPolicy::default(),
        }
    }
}

/// On-disk config file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigFile {
    pub version: u32,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub connections: Vec<ConnectionConfig>,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            settings: Settings::default(),
            connections: Vec::new(),
        }
    }
}
