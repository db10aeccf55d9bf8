//! Port Forward Manager
//!
//! Registry of connections and the collaborators the lifecycle engine
//! drives. All connection state lives behind one mutex that is never held
//! across an `.await`; process I/O runs on spawned tasks that report back
//! through the registry by connection id.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::events::{ConnectionEvent, ConnectionEventEmitter};
use super::recovery::RecoveryPolicy;
use super::state::{ConnectionSnapshot, ConnectionState, LogEntry, TaskHandle};
use crate::config::{ConnectionConfig, ConnectionStore, Settings, Timings};
use crate::notify::Notifier;
use crate::process::ProcessSupervisor;

/// Tunables of a manager instance
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub timings: Timings,
    pub recovery: RecoveryPolicy,
    /// Notify when a connection drops without being stopped
    pub show_notifications: bool,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            timings: Timings::default(),
            recovery: RecoveryPolicy::default(),
            show_notifications: true,
        }
    }
}

impl From<&Settings> for ManagerOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            timings: settings.timings.clone(),
            recovery: settings.recovery.clone(),
            show_notifications: settings.show_notifications,
        }
    }
}

pub(crate) struct ManagerInner {
    pub(crate) supervisor: Arc<dyn ProcessSupervisor>,
    pub(crate) store: Arc<dyn ConnectionStore>,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) options: ManagerOptions,
    pub(crate) connections: Mutex<Vec<ConnectionState>>,
    pub(crate) is_killing: AtomicBool,
    pub(crate) monitor: Mutex<Option<TaskHandle>>,
    pub(crate) events: ConnectionEventEmitter,
    /// Held from snapshot to completed save so writes land in call order
    pub(crate) persist_lock: tokio::sync::Mutex<()>,
    /// Held for the whole of a kill sweep
    pub(crate) sweep_lock: tokio::sync::Mutex<()>,
}

/// Owner of all port-forward connections
///
/// Cheap to clone; clones share the same registry. Operations spawn their
/// supervision work onto the current Tokio runtime.
#[derive(Clone)]
pub struct PortForwardManager {
    pub(crate) inner: Arc<ManagerInner>,
}

impl PortForwardManager {
    /// Create an empty manager
    pub fn new(
        supervisor: Arc<dyn ProcessSupervisor>,
        store: Arc<dyn ConnectionStore>,
        notifier: Arc<dyn Notifier>,
        options: ManagerOptions,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                supervisor,
                store,
                notifier,
                options,
                connections: Mutex::new(Vec::new()),
                is_killing: AtomicBool::new(false),
                monitor: Mutex::new(None),
                events: ConnectionEventEmitter::new(),
                persist_lock: tokio::sync::Mutex::new(()),
                sweep_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Create a manager and populate it from the store
    ///
    /// A store that fails to load leaves the registry empty.
    pub async fn load(
        supervisor: Arc<dyn ProcessSupervisor>,
        store: Arc<dyn ConnectionStore>,
        notifier: Arc<dyn Notifier>,
        options: ManagerOptions,
    ) -> Self {
        let manager = Self::new(supervisor, store, notifier, options);
        match manager.inner.store.load().await {
            Ok(configs) => {
                info!("Loaded {} connection(s)", configs.len());
                *manager.inner.connections.lock() =
                    configs.into_iter().map(ConnectionState::new).collect();
            }
            Err(e) => warn!("Failed to load connections, starting empty: {}", e),
        }
        manager
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.inner.options
    }

    /// Subscribe to connection events
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Snapshot of every connection in display order
    pub fn connections(&self) -> Vec<ConnectionSnapshot> {
        self.inner
            .connections
            .lock()
            .iter()
            .map(ConnectionState::snapshot)
            .collect()
    }

    pub fn connection(&self, id: Uuid) -> Option<ConnectionSnapshot> {
        self.inner
            .connections
            .lock()
            .iter()
            .find(|c| c.id == id)
            .map(ConnectionState::snapshot)
    }

    /// Log buffer of a connection (empty for unknown ids)
    pub fn logs(&self, id: Uuid) -> Vec<LogEntry> {
        self.inner
            .connections
            .lock()
            .iter()
            .find(|c| c.id == id)
            .map(|c| c.logs.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// True iff there is at least one connection and all are fully connected
    pub fn all_connected(&self) -> bool {
        let connections = self.inner.connections.lock();
        !connections.is_empty() && connections.iter().all(ConnectionState::is_fully_connected)
    }

    pub fn connected_count(&self) -> usize {
        self.inner
            .connections
            .lock()
            .iter()
            .filter(|c| c.is_fully_connected())
            .count()
    }

    pub fn is_killing_processes(&self) -> bool {
        self.inner.is_killing.load(Ordering::SeqCst)
    }

    /// Append a connection and persist
    ///
    /// A config whose id is already registered is ignored.
    pub async fn add_connection(&self, config: ConnectionConfig) {
        let id = config.id;
        {
            let mut connections = self.inner.connections.lock();
            if connections.iter().any(|c| c.id == id) {
                warn!("Connection {} already exists, ignoring add", id);
                return;
            }
            warn_on_shared_ports(&connections, &config);
            info!("Adding connection {} ({})", config.name, id);
            connections.push(ConnectionState::new(config));
        }
        self.inner
            .events
            .emit(ConnectionEvent::ConnectionAdded { connection_id: id });
        self.inner.persist().await;
    }

    /// Stop a connection, drop it from the registry and persist
    pub async fn remove_connection(&self, id: Uuid) {
        if self.inner.stop_inner(id, true).is_none() {
            return;
        }
        let removed = {
            let mut connections = self.inner.connections.lock();
            let before = connections.len();
            connections.retain(|c| c.id != id);
            connections.len() != before
        };
        if !removed {
            return;
        }

        info!("Removed connection {}", id);
        self.inner
            .events
            .emit(ConnectionEvent::ConnectionRemoved { connection_id: id });
        self.inner.persist().await;
    }

    /// Replace a connection's config, restarting it if it was connected
    pub async fn update_connection(&self, config: ConnectionConfig) {
        let id = config.id;
        let Some(was_connected) = self
            .inner
            .with_connection(id, |state| state.is_fully_connected())
        else {
            debug!("Ignoring update for unknown connection {}", id);
            return;
        };

        if was_connected {
            self.inner.stop_inner(id, true);
        }

        let still_enabled = config.is_enabled;
        {
            let mut connections = self.inner.connections.lock();
            warn_on_shared_ports(&connections, &config);
            if let Some(state) = connections.iter_mut().find(|c| c.id == id) {
                state.config = config;
            }
        }
        self.inner
            .events
            .emit(ConnectionEvent::ConnectionUpdated { connection_id: id });
        self.inner.persist().await;

        if was_connected && still_enabled {
            self.inner.start_connection(id);
        }
    }
}

impl ManagerInner {
    /// Run `f` on a connection's state under the registry lock
    pub(crate) fn with_connection<R>(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut ConnectionState) -> R,
    ) -> Option<R> {
        let mut connections = self.connections.lock();
        connections.iter_mut().find(|c| c.id == id).map(f)
    }

    /// Run `f` only if the connection still belongs to `generation`
    ///
    /// Returns `None` for removed, stopped or superseded connections, which
    /// is what makes late callbacks and finished tasks inert.
    pub(crate) fn with_current<R>(
        &self,
        id: Uuid,
        generation: u64,
        f: impl FnOnce(&mut ConnectionState) -> R,
    ) -> Option<R> {
        let mut connections = self.connections.lock();
        connections
            .iter_mut()
            .find(|c| c.id == id)
            .filter(|c| c.generation == generation && !c.is_intentionally_stopped)
            .map(f)
    }

    pub(crate) fn is_current(&self, id: Uuid, generation: u64) -> bool {
        self.with_current(id, generation, |_| ()).is_some()
    }

    /// Append to a connection's log buffer and broadcast the line
    pub(crate) fn push_log(&self, state: &mut ConnectionState, entry: LogEntry) {
        state.push_log(entry.clone());
        self.events.emit_log_appended(state.id, entry);
    }

    pub(crate) fn emit_status(&self, state: &ConnectionState) {
        self.events
            .emit_status_changed(state.id, state.port_forward_status, state.proxy_status);
    }

    pub(crate) async fn persist(&self) {
        let _persisting = self.persist_lock.lock().await;
        let configs: Vec<ConnectionConfig> = self
            .connections
            .lock()
            .iter()
            .map(|c| c.config.clone())
            .collect();
        if let Err(e) = self.store.save(&configs).await {
            warn!("Failed to save connections: {}", e);
        }
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        for state in self.connections.get_mut().iter_mut() {
            state.cancel_tasks();
        }
        if let Some(monitor) = self.monitor.get_mut().take() {
            monitor.cancel();
        }
    }
}

/// Shared local ports are allowed but almost always a mistake
fn warn_on_shared_ports(connections: &[ConnectionState], config: &ConnectionConfig) {
    let ports = config.bound_ports();
    for other in connections.iter().filter(|c| c.id != config.id) {
        if let Some(port) = other
            .config
            .bound_ports()
            .into_iter()
            .find(|p| ports.contains(p))
        {
            warn!(
                "Connection {} shares local port {} with {}",
                config.name, port, other.config.name
            );
        }
    }
}
