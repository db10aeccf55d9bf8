//! Connection Event System
//!
//! Broadcasts connection status, log and registry changes to any number of
//! subscribers (UI, CLI output, tests).

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::state::{ConnectionStatus, LogEntry};

const EVENT_CAPACITY: usize = 256;

/// Connection event types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ConnectionEvent {
    /// Either status of a connection changed
    #[serde(rename_all = "camelCase")]
    StatusChanged {
        connection_id: Uuid,
        port_forward_status: ConnectionStatus,
        proxy_status: ConnectionStatus,
    },
    /// A line was appended to the connection's log buffer
    #[serde(rename_all = "camelCase")]
    LogAppended { connection_id: Uuid, entry: LogEntry },
    /// The log buffer was cleared (on stop)
    #[serde(rename_all = "camelCase")]
    LogsCleared { connection_id: Uuid },
    #[serde(rename_all = "camelCase")]
    ConnectionAdded { connection_id: Uuid },
    #[serde(rename_all = "camelCase")]
    ConnectionRemoved { connection_id: Uuid },
    #[serde(rename_all = "camelCase")]
    ConnectionUpdated { connection_id: Uuid },
    /// The health monitoring loop was started or stopped
    #[serde(rename_all = "camelCase")]
    MonitoringChanged { is_monitoring: bool },
}

/// Event emitter for the forwarding module
///
/// Sending never blocks; events are dropped when nobody subscribes.
#[derive(Clone)]
pub struct ConnectionEventEmitter {
    sender: broadcast::Sender<ConnectionEvent>,
}

impl ConnectionEventEmitter {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.sender.subscribe()
    }

    /// Emit a connection event
    pub fn emit(&self, event: ConnectionEvent) {
        let _ = self.sender.send(event);
    }

    pub fn emit_status_changed(
        &self,
        connection_id: Uuid,
        port_forward_status: ConnectionStatus,
        proxy_status: ConnectionStatus,
    ) {
        self.emit(ConnectionEvent::StatusChanged {
            connection_id,
            port_forward_status,
            proxy_status,
        });
    }

    pub fn emit_log_appended(&self, connection_id: Uuid, entry: LogEntry) {
        self.emit(ConnectionEvent::LogAppended {
            connection_id,
            entry,
        });
    }
}

impl Default for ConnectionEventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ConnectionEventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionEventEmitter")
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessRole;

    #[test]
    fn test_emit_without_subscribers() {
        let emitter = ConnectionEventEmitter::new();
        // Should not panic
        emitter.emit(ConnectionEvent::MonitoringChanged {
            is_monitoring: true,
        });
    }

    #[tokio::test]
    async fn test_subscriber_receives_log() {
        let emitter = ConnectionEventEmitter::new();
        let mut rx = emitter.subscribe();
        let id = Uuid::new_v4();

        emitter.emit_log_appended(id, LogEntry::new("hello", ProcessRole::Proxy, false));
        match rx.recv().await.unwrap() {
            ConnectionEvent::LogAppended {
                connection_id,
                entry,
            } => {
                assert_eq!(connection_id, id);
                assert_eq!(entry.message, "hello");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_event_serialization() {
        let event = ConnectionEvent::StatusChanged {
            connection_id: Uuid::nil(),
            port_forward_status: ConnectionStatus::Connected,
            proxy_status: ConnectionStatus::Disconnected,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"statusChanged\""));
        assert!(json.contains("\"portForwardStatus\":\"connected\""));
    }
}
