//! Connection Lifecycle
//!
//! Start, stop and restart of a single connection, the supervision tasks
//! behind its two processes, and automatic recovery from port conflicts.
//!
//! Every start and stop bumps the connection's generation. Tasks, log
//! callbacks and conflict callbacks capture the generation they were
//! created for and become no-ops once it changes.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::events::ConnectionEvent;
use super::manager::{ManagerInner, PortForwardManager};
use super::state::{ConnectionStatus, LogEntry, TaskHandle};
use crate::config::ConnectionConfig;
use crate::error::ForwarderError;
use crate::process::{ConflictHandler, LogHandler, ProcessExit, ProcessRole};

impl PortForwardManager {
    /// Start a connection
    ///
    /// No-op for unknown ids and while a kill sweep is running. Any running
    /// tasks of the connection are superseded.
    pub fn start_connection(&self, id: Uuid) {
        self.inner.start_connection(id);
    }

    /// Stop a connection (idempotent)
    ///
    /// Returns immediately; processes are killed and callbacks deregistered
    /// on a background task.
    pub fn stop_connection(&self, id: Uuid) {
        self.inner.stop_inner(id, true);
    }

    /// Stop, wait for the port to be released, then start again
    pub async fn restart_connection(&self, id: Uuid) {
        self.inner.restart_inner(id, true).await;
    }
}

impl ManagerInner {
    pub(crate) fn start_connection(self: &Arc<Self>, id: Uuid) {
        self.start_inner(id, true);
    }

    /// `reset_recovery` is false only for restarts issued by recovery or
    /// monitoring, which must keep counting conflict attempts.
    pub(crate) fn start_inner(self: &Arc<Self>, id: Uuid, reset_recovery: bool) {
        if self.is_killing.load(Ordering::SeqCst) {
            debug!("Ignoring start of {} during kill sweep", id);
            return;
        }

        let mut connections = self.connections.lock();
        let Some(state) = connections.iter_mut().find(|c| c.id == id) else {
            return;
        };

        state.cancel_tasks();
        state.is_intentionally_stopped = false;
        state.is_recovering = false;
        if reset_recovery {
            state.conflict_attempts = 0;
        }
        state.port_forward_status = ConnectionStatus::Connecting;
        state.proxy_status = ConnectionStatus::Disconnected;
        let generation = state.next_generation();

        info!(
            "Starting port forward {} ({}) on port {}",
            state.config.name, id, state.config.local_port
        );

        let token = CancellationToken::new();
        let task = run_port_forward(
            Arc::downgrade(self),
            id,
            generation,
            state.config.clone(),
            token.clone(),
            state.teardown.clone(),
        );
        state.port_forward_task = Some(TaskHandle::spawn(token, task));
        self.emit_status(state);
    }

    /// Returns the connection's new generation, or `None` for unknown ids
    pub(crate) fn stop_inner(&self, id: Uuid, reset_recovery: bool) -> Option<u64> {
        let teardown = CancellationToken::new();
        let mut previous = None;
        let generation = self.with_connection(id, |state| {
            state.is_intentionally_stopped = true;
            state.is_recovering = false;
            if reset_recovery {
                state.conflict_attempts = 0;
            }
            let generation = state.next_generation();

            state.cancel_tasks();
            state.proxy_status = ConnectionStatus::Disconnected;
            state.port_forward_status = ConnectionStatus::Disconnected;
            state.clear_logs();
            previous = state.teardown.replace(teardown.clone());

            self.events
                .emit(ConnectionEvent::LogsCleared { connection_id: id });
            self.emit_status(state);
            info!("Stopping port forward {} ({})", state.config.name, id);
            generation
        })?;

        // Teardowns of one connection run in stop order, so an older one can
        // never deregister handlers installed after a newer start
        let supervisor = self.supervisor.clone();
        tokio::spawn(async move {
            if let Some(previous) = previous {
                previous.cancelled().await;
            }
            supervisor.kill_processes(id).await;
            supervisor.remove_log_handler(id).await;
            supervisor.remove_port_conflict_handler(id).await;
            teardown.cancel();
        });

        Some(generation)
    }

    pub(crate) async fn restart_inner(self: &Arc<Self>, id: Uuid, reset_recovery: bool) {
        let Some(generation) = self.stop_inner(id, reset_recovery) else {
            return;
        };

        tokio::time::sleep(self.options.timings.restart_delay()).await;

        // A stop or start issued meanwhile wins over this restart
        let untouched = self
            .with_connection(id, |state| state.generation == generation)
            .unwrap_or(false);
        if !untouched {
            debug!("Restart of {} superseded", id);
            return;
        }
        self.start_inner(id, reset_recovery);
    }

    /// Install log and conflict callbacks for `generation`
    ///
    /// Done under the registry lock so a concurrent stop or start cannot
    /// interleave with the registration.
    fn register_handlers(self: &Arc<Self>, id: Uuid, generation: u64) -> bool {
        let log_handler = log_handler(Arc::downgrade(self), id, generation);
        let conflict_handler = conflict_handler(Arc::downgrade(self), id, generation);
        let handlers = self.supervisor.handlers();

        self.with_current(id, generation, |_| {
            handlers.set_log_handler(id, log_handler);
            handlers.set_conflict_handler(id, conflict_handler);
        })
        .is_some()
    }

    /// Synchronous half of the conflict callback
    ///
    /// Returns the 1-based attempt number if recovery should proceed.
    fn begin_recovery(&self, id: Uuid, generation: u64, port: u16) -> Option<u32> {
        let policy = &self.options.recovery;
        let outcome = self.with_current(id, generation, |state| {
            if state.is_recovering {
                return Err(None);
            }
            state.conflict_attempts += 1;
            let attempt = state.conflict_attempts;
            if policy.allows(attempt) {
                state.is_recovering = true;
                return Ok(attempt);
            }

            let message = format!(
                "Port {} still in use after {} recovery attempt(s), giving up",
                port, policy.max_attempts
            );
            error!("{} ({})", message, state.config.name);
            self.push_log(state, LogEntry::new(message, ProcessRole::PortForward, true));
            state.port_forward_status = ConnectionStatus::Error;
            self.emit_status(state);
            Err(Some(state.config.name.clone()))
        });

        match outcome {
            Some(Ok(attempt)) => Some(attempt),
            Some(Err(Some(name))) => {
                if self.options.show_notifications {
                    self.notifier.notify(
                        "Port Conflict",
                        &format!("{}: port {} is held by another process", name, port),
                    );
                }
                None
            }
            Some(Err(None)) => None,
            None => {
                debug!("Ignoring stale port conflict on {} for {}", port, id);
                None
            }
        }
    }

    /// Kill the occupant of `port`, wait out the grace period and restart
    async fn recover_from_conflict(self: Arc<Self>, id: Uuid, generation: u64, port: u16, attempt: u32) {
        let logged = self.with_current(id, generation, |state| {
            let message = format!("Port {} in use, auto-recovering...", port);
            self.push_log(state, LogEntry::new(message, ProcessRole::PortForward, false));
        });
        if logged.is_none() {
            return;
        }
        warn!("Port {} in use for {}, recovery attempt {}", port, id, attempt);

        if !self.supervisor.kill_process_on_port(port).await {
            debug!("Nothing killed on port {}", port);
        }

        let grace = self
            .options
            .recovery
            .grace_for(attempt, self.options.timings.conflict_grace());
        tokio::time::sleep(grace).await;

        let retrying = self.with_current(id, generation, |state| {
            self.push_log(
                state,
                LogEntry::new("Retrying connection...", ProcessRole::PortForward, false),
            );
        });
        if retrying.is_none() {
            info!("Recovery of {} abandoned, connection was stopped", id);
            return;
        }

        self.restart_inner(id, false).await;
    }

    fn launch_failed(&self, id: Uuid, generation: u64, role: ProcessRole, err: &ForwarderError) {
        self.with_current(id, generation, |state| {
            error!("Failed to start {} for {}: {}", role, state.config.name, err);
            let message = format!("Failed to start {}: {}", role, err);
            self.push_log(state, LogEntry::new(message, role, true));
            match role {
                ProcessRole::PortForward => {
                    state.port_forward_status = ConnectionStatus::Error;
                    state.port_forward_task = None;
                }
                ProcessRole::Proxy => {
                    state.proxy_status = ConnectionStatus::Error;
                    state.proxy_task = None;
                }
            }
            self.emit_status(state);
        });
    }

    /// Port forward is ready; brings up the proxy when one is configured
    fn port_forward_connected(
        self: &Arc<Self>,
        id: Uuid,
        generation: u64,
        token: &CancellationToken,
    ) -> bool {
        self.with_current(id, generation, |state| {
            info!("Port forward {} connected", state.config.name);
            state.port_forward_status = ConnectionStatus::Connected;
            state.conflict_attempts = 0;
            state.is_recovering = false;

            if state.config.has_proxy() {
                state.proxy_status = ConnectionStatus::Connecting;
                let proxy_token = token.child_token();
                let task = run_proxy(
                    Arc::downgrade(self),
                    id,
                    generation,
                    state.config.clone(),
                    proxy_token.clone(),
                );
                state.proxy_task = Some(TaskHandle::spawn(proxy_token, task));
            }
            self.emit_status(state);
        })
        .is_some()
    }

    fn port_forward_exited(&self, id: Uuid, generation: u64, exit: ProcessExit) {
        let notify = self.with_current(id, generation, |state| {
            state.port_forward_task = None;
            if let Some(proxy) = state.proxy_task.take() {
                proxy.cancel();
            }
            if state.config.has_proxy() {
                state.proxy_status = ConnectionStatus::Disconnected;
            }

            let message = format!("Port forward {}", exit);
            if state.is_recovering {
                // Restart is already scheduled by the conflict handler
                debug!("{} ({}) during conflict recovery", message, state.config.name);
                state.port_forward_status = ConnectionStatus::Connecting;
                self.push_log(state, LogEntry::new(message, ProcessRole::PortForward, false));
                self.emit_status(state);
                return None;
            }

            warn!("{} ({}) unexpectedly", message, state.config.name);
            let already_failed = state.port_forward_status == ConnectionStatus::Error;
            state.port_forward_status = ConnectionStatus::Error;
            self.push_log(state, LogEntry::new(message, ProcessRole::PortForward, true));
            self.emit_status(state);

            (!already_failed).then(|| state.config.name.clone())
        });

        if let Some(Some(name)) = notify {
            if self.options.show_notifications {
                self.notifier.notify(
                    "Port Forward Disconnected",
                    &format!("{} disconnected unexpectedly", name),
                );
            }
        }
    }

    fn proxy_connected(&self, id: Uuid, generation: u64) -> bool {
        self.with_current(id, generation, |state| {
            info!("Proxy for {} listening on {:?}", state.config.name, state.config.proxy_port);
            state.proxy_status = ConnectionStatus::Connected;
            self.emit_status(state);
        })
        .is_some()
    }

    fn proxy_exited(&self, id: Uuid, generation: u64, exit: ProcessExit) {
        self.with_current(id, generation, |state| {
            warn!("Proxy for {} {}", state.config.name, exit);
            state.proxy_task = None;
            state.proxy_status = ConnectionStatus::Error;
            self.push_log(state, LogEntry::new(format!("Proxy {}", exit), ProcessRole::Proxy, true));
            self.emit_status(state);
        });
    }
}

fn log_handler(manager: Weak<ManagerInner>, id: Uuid, generation: u64) -> LogHandler {
    Arc::new(move |message: &str, role: ProcessRole, is_error: bool| {
        let Some(inner) = manager.upgrade() else {
            return;
        };
        inner.with_current(id, generation, |state| {
            inner.push_log(state, LogEntry::new(message, role, is_error));
        });
    })
}

fn conflict_handler(manager: Weak<ManagerInner>, id: Uuid, generation: u64) -> ConflictHandler {
    Arc::new(move |port: u16| -> BoxFuture<'static, ()> {
        let attempt = manager
            .upgrade()
            .and_then(|inner| inner.begin_recovery(id, generation, port));
        let manager = manager.clone();
        Box::pin(async move {
            let (Some(attempt), Some(inner)) = (attempt, manager.upgrade()) else {
                return;
            };
            inner.recover_from_conflict(id, generation, port, attempt).await;
        })
    })
}

/// Supervision task for the port-forward process of one generation
async fn run_port_forward(
    manager: Weak<ManagerInner>,
    id: Uuid,
    generation: u64,
    config: ConnectionConfig,
    token: CancellationToken,
    teardown: Option<CancellationToken>,
) {
    // Every earlier stop must finish killing and deregistering first
    if let Some(teardown) = teardown {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = teardown.cancelled() => {}
        }
    }

    let supervisor = {
        let Some(inner) = manager.upgrade() else {
            return;
        };
        if !inner.register_handlers(id, generation) {
            debug!("Start of {} superseded before launch", id);
            return;
        }
        inner.supervisor.clone()
    };

    let launched = tokio::select! {
        _ = token.cancelled() => return,
        result = supervisor.launch_port_forward(id, &config) => result,
    };
    let mut session = match launched {
        Ok(session) => session,
        Err(e) => {
            if let Some(inner) = manager.upgrade() {
                inner.launch_failed(id, generation, ProcessRole::PortForward, &e);
            }
            return;
        }
    };
    debug!("Port forward for {} running as pid {:?}", id, session.pid());

    let ready = tokio::select! {
        _ = token.cancelled() => return,
        result = session.wait_ready() => result,
    };
    if let Err(exit) = ready {
        if let Some(inner) = manager.upgrade() {
            inner.port_forward_exited(id, generation, exit);
        }
        return;
    }

    match manager.upgrade() {
        Some(inner) if inner.port_forward_connected(id, generation, &token) => {}
        _ => return,
    }

    let exit = tokio::select! {
        _ = token.cancelled() => return,
        exit = session.wait_exit() => exit,
    };
    if let Some(inner) = manager.upgrade() {
        inner.port_forward_exited(id, generation, exit);
    }
}

/// Supervision task for the proxy process; cancelled with its port forward
async fn run_proxy(
    manager: Weak<ManagerInner>,
    id: Uuid,
    generation: u64,
    config: ConnectionConfig,
    token: CancellationToken,
) {
    let Some(supervisor) = manager.upgrade().map(|inner| inner.supervisor.clone()) else {
        return;
    };

    let launched = tokio::select! {
        _ = token.cancelled() => return,
        result = supervisor.launch_proxy(id, &config) => result,
    };
    let mut session = match launched {
        Ok(session) => session,
        Err(e) => {
            if let Some(inner) = manager.upgrade() {
                inner.launch_failed(id, generation, ProcessRole::Proxy, &e);
            }
            return;
        }
    };

    let ready = tokio::select! {
        _ = token.cancelled() => return,
        result = session.wait_ready() => result,
    };
    if let Err(exit) = ready {
        if let Some(inner) = manager.upgrade() {
            inner.proxy_exited(id, generation, exit);
        }
        return;
    }

    match manager.upgrade() {
        Some(inner) if inner.proxy_connected(id, generation) => {}
        _ => return,
    }

    let exit = tokio::select! {
        _ = token.cancelled() => return,
        exit = session.wait_exit() => exit,
    };
    if let Some(inner) = manager.upgrade() {
        inner.proxy_exited(id, generation, exit);
    }
}
