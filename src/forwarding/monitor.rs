//! Connection Health Monitoring
//!
//! A periodic loop that restarts connections whose process failed or whose
//! local port stopped accepting TCP connections.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::events::ConnectionEvent;
use super::manager::{ManagerInner, PortForwardManager};
use super::state::{ConnectionStatus, TaskHandle};

/// What a health check found for one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Healthy,
    Failed,
    PortClosed(u16),
}

impl PortForwardManager {
    /// Start the health monitoring loop (idempotent)
    pub fn start_monitoring(&self) {
        self.inner.start_monitoring();
    }

    pub fn stop_monitoring(&self) {
        self.inner.stop_monitoring();
    }

    pub fn is_monitoring(&self) -> bool {
        self.inner.monitor.lock().is_some()
    }

    /// Run one health check pass; returns how many restarts were issued
    pub async fn check_health(&self) -> usize {
        self.inner.check_health().await
    }
}

impl ManagerInner {
    pub(crate) fn start_monitoring(self: &Arc<Self>) {
        let interval = self.options.timings.monitor_interval();
        {
            let mut monitor = self.monitor.lock();
            if monitor.is_some() {
                return;
            }
            let token = CancellationToken::new();
            let task = monitor_loop(Arc::downgrade(self), interval, token.clone());
            *monitor = Some(TaskHandle::spawn(token, task));
        }

        info!("Connection monitoring started ({:?} interval)", interval);
        self.events
            .emit(ConnectionEvent::MonitoringChanged { is_monitoring: true });
    }

    pub(crate) fn stop_monitoring(&self) {
        let Some(task) = self.monitor.lock().take() else {
            return;
        };
        task.cancel();

        info!("Connection monitoring stopped");
        self.events
            .emit(ConnectionEvent::MonitoringChanged {
                is_monitoring: false,
            });
    }

    pub(crate) async fn check_health(self: &Arc<Self>) -> usize {
        if self.is_killing.load(Ordering::SeqCst) {
            return 0;
        }

        let max_attempts = self.options.recovery.max_attempts;
        let candidates: Vec<(Uuid, u64, ConnectionStatus, Vec<u16>)> = self
            .connections
            .lock()
            .iter()
            .filter(|c| {
                c.config.is_enabled
                    && !c.is_intentionally_stopped
                    && !c.is_recovering
                    && c.conflict_attempts <= max_attempts
            })
            .map(|c| {
                let mut ports = vec![c.config.local_port];
                if c.proxy_status == ConnectionStatus::Connected {
                    ports.extend(c.config.proxy_port);
                }
                (c.id, c.generation, c.port_forward_status, ports)
            })
            .collect();

        let timeout = self.options.timings.health_probe_timeout();
        let mut restarts = 0;
        for (id, generation, status, ports) in candidates {
            let verdict = match status {
                ConnectionStatus::Error => Verdict::Failed,
                ConnectionStatus::Connected => self.probe_ports(&ports, timeout).await,
                _ => Verdict::Healthy,
            };
            if verdict == Verdict::Healthy {
                continue;
            }

            // Skip connections stopped or restarted while probing
            if !self.is_current(id, generation) {
                continue;
            }
            match verdict {
                Verdict::PortClosed(port) => {
                    warn!("Health check: port {} of {} not accepting connections", port, id)
                }
                _ => info!("Health check: restarting failed connection {}", id),
            }

            let inner = self.clone();
            tokio::spawn(async move {
                inner.restart_inner(id, false).await;
            });
            restarts += 1;
        }

        if restarts > 0 {
            debug!("Health check issued {} restart(s)", restarts);
        }
        restarts
    }

    async fn probe_ports(&self, ports: &[u16], timeout: Duration) -> Verdict {
        for &port in ports {
            if !self.supervisor.is_port_listening(port, timeout).await {
                return Verdict::PortClosed(port);
            }
        }
        Verdict::Healthy
    }
}

async fn monitor_loop(manager: Weak<ManagerInner>, period: Duration, token: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(inner) = manager.upgrade() else {
            break;
        };
        inner.check_health().await;
    }
    debug!("Monitor loop exited");
}
