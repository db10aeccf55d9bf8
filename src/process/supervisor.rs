//! Process control capability consumed by the lifecycle engine
//!
//! One supervisor is shared by every connection. It owns the OS process
//! handles and the log/conflict callback tables, all keyed by connection id.

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use uuid::Uuid;

use super::handlers::{ConflictHandler, HandlerTable, LogHandler};
use super::session::ProcessSession;
use crate::config::ConnectionConfig;
use crate::error::ForwarderError;

#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    /// Callback tables backing the registration methods
    fn handlers(&self) -> &HandlerTable;

    async fn set_log_handler(&self, id: Uuid, handler: LogHandler) {
        self.handlers().set_log_handler(id, handler);
    }

    async fn remove_log_handler(&self, id: Uuid) {
        self.handlers().remove_log_handler(id);
    }

    async fn set_port_conflict_handler(&self, id: Uuid, handler: ConflictHandler) {
        self.handlers().set_conflict_handler(id, handler);
    }

    async fn remove_port_conflict_handler(&self, id: Uuid) {
        self.handlers().remove_conflict_handler(id);
    }

    /// Launch the port-forward process for a connection
    ///
    /// Output goes to the connection's log handler; a bind conflict fires
    /// its conflict handler.
    async fn launch_port_forward(
        &self,
        id: Uuid,
        config: &ConnectionConfig,
    ) -> Result<ProcessSession, ForwarderError>;

    /// Launch the proxy process for a connection
    async fn launch_proxy(
        &self,
        id: Uuid,
        config: &ConnectionConfig,
    ) -> Result<ProcessSession, ForwarderError>;

    /// Kill whatever process listens on `port`; true if something was killed
    async fn kill_process_on_port(&self, port: u16) -> bool;

    /// Kill every process launched for a connection
    async fn kill_processes(&self, id: Uuid);

    /// Force-kill every port-forwarder-family process on the system
    async fn kill_all_port_forwarder_processes(&self);

    /// Whether something accepts TCP connections on the loopback port
    async fn is_port_listening(&self, port: u16, timeout: Duration) -> bool {
        matches!(
            tokio::time::timeout(timeout, TcpStream::connect(("127.0.0.1", port))).await,
            Ok(Ok(_))
        )
    }
}
