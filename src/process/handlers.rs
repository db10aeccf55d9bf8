//! Per-connection callback tables
//!
//! Log and port-conflict handlers registered by the lifecycle engine,
//! keyed by connection id. Handlers are cloned out of the table before
//! they run so no shard lock is held while user code executes.

use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use tracing::debug;
use uuid::Uuid;

use super::session::ProcessRole;

/// Receives one output line: `(message, role, is_error)`
pub type LogHandler = Arc<dyn Fn(&str, ProcessRole, bool) + Send + Sync>;

/// Invoked with the conflicting port; the returned future runs detached
pub type ConflictHandler = Arc<dyn Fn(u16) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Clone, Default)]
pub struct HandlerTable {
    log: Arc<DashMap<Uuid, LogHandler>>,
    conflict: Arc<DashMap<Uuid, ConflictHandler>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_log_handler(&self, id: Uuid, handler: LogHandler) {
        self.log.insert(id, handler);
    }

    pub fn remove_log_handler(&self, id: Uuid) {
        self.log.remove(&id);
    }

    pub fn set_conflict_handler(&self, id: Uuid, handler: ConflictHandler) {
        self.conflict.insert(id, handler);
    }

    pub fn remove_conflict_handler(&self, id: Uuid) {
        self.conflict.remove(&id);
    }

    pub fn log_handler(&self, id: Uuid) -> Option<LogHandler> {
        self.log.get(&id).map(|h| h.value().clone())
    }

    pub fn conflict_handler(&self, id: Uuid) -> Option<ConflictHandler> {
        self.conflict.get(&id).map(|h| h.value().clone())
    }

    pub fn has_log_handler(&self, id: Uuid) -> bool {
        self.log.contains_key(&id)
    }

    pub fn has_conflict_handler(&self, id: Uuid) -> bool {
        self.conflict.contains_key(&id)
    }

    /// Deliver a log line; returns false when no handler is registered
    pub fn emit_log(&self, id: Uuid, message: &str, role: ProcessRole, is_error: bool) -> bool {
        match self.log_handler(id) {
            Some(handler) => {
                handler(message, role, is_error);
                true
            }
            None => {
                debug!("No log handler for {}, dropping line", id);
                false
            }
        }
    }

    /// Fire the conflict handler on a detached task
    pub fn emit_conflict(&self, id: Uuid, port: u16) -> bool {
        match self.conflict_handler(id) {
            Some(handler) => {
                tokio::spawn(handler(port));
                true
            }
            None => {
                debug!("No conflict handler for {} (port {})", id, port);
                false
            }
        }
    }

    pub fn clear(&self) {
        self.log.clear();
        self.conflict.clear();
    }
}

impl std::fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerTable")
            .field("log_handlers", &self.log.len())
            .field("conflict_handlers", &self.conflict.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_log_handler_roundtrip() {
        let table = HandlerTable::new();
        let id = Uuid::new_v4();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        table.set_log_handler(
            id,
            Arc::new(move |msg: &str, role: ProcessRole, is_error: bool| {
                sink.lock().push((msg.to_string(), role, is_error))
            }),
        );

        assert!(table.emit_log(id, "Forwarding from 127.0.0.1:8080", ProcessRole::PortForward, false));
        table.remove_log_handler(id);
        assert!(!table.emit_log(id, "late line", ProcessRole::PortForward, false));

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "Forwarding from 127.0.0.1:8080");
    }

    #[tokio::test]
    async fn test_conflict_handler_runs_detached() {
        let table = HandlerTable::new();
        let id = Uuid::new_v4();
        let (tx, rx) = tokio::sync::oneshot::channel::<u16>();
        let tx = Arc::new(Mutex::new(Some(tx)));

        table.set_conflict_handler(
            id,
            Arc::new(move |port: u16| -> BoxFuture<'static, ()> {
                let tx = tx.clone();
                Box::pin(async move {
                    if let Some(tx) = tx.lock().take() {
                        let _ = tx.send(port);
                    }
                })
            }),
        );

        assert!(table.emit_conflict(id, 8080));
        assert_eq!(rx.await.unwrap(), 8080);
        assert!(!table.emit_conflict(Uuid::new_v4(), 8080));
    }
}
