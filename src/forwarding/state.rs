//! Per-connection runtime state
//!
//! `ConnectionState` is owned by the manager's registry and only mutated
//! under its lock. Running tasks never hold a reference to it; they carry
//! the connection id plus the generation they were spawned for.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ConnectionConfig;
use crate::process::ProcessRole;

/// Maximum log entries retained per connection (oldest dropped first)
pub const MAX_LOG_ENTRIES: usize = 500;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Status of one process of a connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// One timestamped line in a connection's log buffer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
    /// Which process the line came from
    pub kind: ProcessRole,
    pub is_error: bool,
}

impl LogEntry {
    pub fn new(message: impl Into<String>, kind: ProcessRole, is_error: bool) -> Self {
        Self {
            timestamp: Utc::now(),
            message: message.into(),
            kind,
            is_error,
        }
    }
}

/// Cancellable handle to a spawned supervision task
#[derive(Debug)]
pub(crate) struct TaskHandle {
    id: u64,
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl TaskHandle {
    /// Spawn `future`; it is expected to watch `token` at its await points
    pub fn spawn<F>(token: CancellationToken, future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
            token,
            join: tokio::spawn(future),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Signal cancellation without waiting for the task
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Cancel and drop the task at its next await point, cooperative or not
    pub fn abort(self) {
        self.token.cancel();
        self.join.abort();
    }
}

/// Mutable record for one connection
#[derive(Debug)]
pub(crate) struct ConnectionState {
    pub id: Uuid,
    pub config: ConnectionConfig,
    pub port_forward_status: ConnectionStatus,
    pub proxy_status: ConnectionStatus,
    pub port_forward_task: Option<TaskHandle>,
    pub proxy_task: Option<TaskHandle>,
    pub is_intentionally_stopped: bool,
    pub logs: VecDeque<LogEntry>,
    /// Bumped by every start, stop and sweep
    pub generation: u64,
    pub is_recovering: bool,
    pub conflict_attempts: u32,
    /// Cancelled once the teardowns spawned by all stops so far have finished
    pub teardown: Option<CancellationToken>,
}

impl ConnectionState {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            id: config.id,
            config,
            port_forward_status: ConnectionStatus::Disconnected,
            proxy_status: ConnectionStatus::Disconnected,
            port_forward_task: None,
            proxy_task: None,
            is_intentionally_stopped: false,
            logs: VecDeque::new(),
            generation: 0,
            is_recovering: false,
            conflict_attempts: 0,
            teardown: None,
        }
    }

    /// Port forward connected and, when a proxy is configured, the proxy too
    pub fn is_fully_connected(&self) -> bool {
        self.port_forward_status == ConnectionStatus::Connected
            && (!self.config.has_proxy() || self.proxy_status == ConnectionStatus::Connected)
    }

    pub fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    pub fn push_log(&mut self, entry: LogEntry) {
        if self.logs.len() >= MAX_LOG_ENTRIES {
            self.logs.pop_front();
        }
        self.logs.push_back(entry);
    }

    pub fn clear_logs(&mut self) {
        self.logs.clear();
    }

    /// Take both task handles, signalling cancellation (proxy first)
    pub fn cancel_tasks(&mut self) {
        if let Some(task) = self.proxy_task.take() {
            task.cancel();
        }
        if let Some(task) = self.port_forward_task.take() {
            task.cancel();
        }
    }

    /// Take both task handles and abort them outright
    pub fn abort_tasks(&mut self) {
        if let Some(task) = self.proxy_task.take() {
            task.abort();
        }
        if let Some(task) = self.port_forward_task.take() {
            task.abort();
        }
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            id: self.id,
            config: self.config.clone(),
            port_forward_status: self.port_forward_status,
            proxy_status: self.proxy_status,
            is_intentionally_stopped: self.is_intentionally_stopped,
            is_recovering: self.is_recovering,
            port_forward_task_id: self.port_forward_task.as_ref().map(TaskHandle::id),
            proxy_task_id: self.proxy_task.as_ref().map(TaskHandle::id),
            is_fully_connected: self.is_fully_connected(),
            logs: self.logs.iter().cloned().collect(),
        }
    }
}

/// Read model of a connection handed out to callers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSnapshot {
    pub id: Uuid,
    pub config: ConnectionConfig,
    pub port_forward_status: ConnectionStatus,
    pub proxy_status: ConnectionStatus,
    pub is_intentionally_stopped: bool,
    pub is_recovering: bool,
    pub port_forward_task_id: Option<u64>,
    pub proxy_task_id: Option<u64>,
    pub is_fully_connected: bool,
    pub logs: Vec<LogEntry>,
}
