//! Bulk operations across all connections

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use uuid::Uuid;

use super::manager::{ManagerInner, PortForwardManager};
use super::state::ConnectionStatus;

/// Upper bound on waiting for teardown in `shutdown`
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Clears the kill-sweep flag even if the sweep future is dropped midway
struct SweepGuard<'a>(&'a AtomicBool);

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl PortForwardManager {
    /// Start every enabled connection, then enable monitoring
    pub fn start_all(&self) {
        self.inner.start_all();
    }

    /// Disable monitoring, then stop every connection
    pub fn stop_all(&self) {
        self.inner.stop_all();
    }

    /// Stop everything and wait until the processes are torn down
    pub async fn shutdown(&self) {
        self.inner.stop_all();

        let pending: Vec<_> = self
            .inner
            .connections
            .lock()
            .iter()
            .filter_map(|c| c.teardown.clone())
            .collect();
        let waits = pending.iter().map(|t| t.cancelled());
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, futures_util::future::join_all(waits))
            .await
            .is_err()
        {
            warn!("Timed out waiting for {} connection(s) to shut down", pending.len());
        }
    }

    /// Emergency sweep for stuck processes
    ///
    /// Aborts all supervision tasks, waits for them to settle, force-kills
    /// every port-forwarder process on the system and resets all statuses.
    /// Starts are refused while the sweep runs. A call made during a running
    /// sweep waits for that sweep instead of starting another.
    pub async fn kill_stuck_processes(&self) {
        self.inner.kill_stuck_processes().await;
    }
}

impl ManagerInner {
    pub(crate) fn start_all(self: &Arc<Self>) {
        let enabled: Vec<Uuid> = self
            .connections
            .lock()
            .iter()
            .filter(|c| c.config.is_enabled)
            .map(|c| c.id)
            .collect();

        info!("Starting {} enabled connection(s)", enabled.len());
        for id in enabled {
            self.start_connection(id);
        }
        self.start_monitoring();
    }

    pub(crate) fn stop_all(&self) {
        self.stop_monitoring();

        let ids: Vec<Uuid> = self.connections.lock().iter().map(|c| c.id).collect();
        info!("Stopping {} connection(s)", ids.len());
        for id in ids {
            self.stop_inner(id, true);
        }
    }

    pub(crate) async fn kill_stuck_processes(&self) {
        let _sweep = match self.sweep_lock.try_lock() {
            Ok(sweep) => sweep,
            Err(_) => {
                info!("Kill sweep already in progress, waiting for it to finish");
                let _finished = self.sweep_lock.lock().await;
                return;
            }
        };
        self.is_killing.store(true, Ordering::SeqCst);
        // Declared after `_sweep` so the flag is cleared before waiters resume
        let _guard = SweepGuard(&self.is_killing);
        info!("Killing stuck port-forward processes");

        self.stop_monitoring();

        // Tasks may be wedged on a process that ignores cancellation, so
        // abort them instead of going through the per-connection stop
        {
            let mut connections = self.connections.lock();
            for state in connections.iter_mut() {
                state.abort_tasks();
                state.next_generation();
                state.is_recovering = false;
            }
        }

        tokio::time::sleep(self.options.timings.kill_settle()).await;

        self.supervisor.kill_all_port_forwarder_processes().await;

        let mut connections = self.connections.lock();
        for state in connections.iter_mut() {
            state.port_forward_status = ConnectionStatus::Disconnected;
            state.proxy_status = ConnectionStatus::Disconnected;
            self.emit_status(state);
        }
        info!("Kill sweep finished");
    }
}
