//! Scriptable supervisor for engine tests

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use super::handlers::HandlerTable;
use super::session::{ProcessExit, ProcessRole, ProcessSession, SessionController};
use super::supervisor::ProcessSupervisor;
use crate::config::ConnectionConfig;
use crate::error::ForwarderError;

pub(crate) struct MockSupervisor {
    handlers: HandlerTable,
    auto_ready: AtomicBool,
    fail_launch: AtomicBool,
    listening: AtomicBool,
    next_pid: AtomicUsize,
    launches: Mutex<Vec<(Uuid, ProcessRole)>>,
    sessions: Mutex<Vec<(Uuid, Arc<SessionController>)>>,
    killed_ports: Mutex<Vec<u16>>,
    killed_connections: Mutex<Vec<Uuid>>,
    kill_all_calls: AtomicUsize,
    kill_delay: Mutex<Option<Duration>>,
}

impl MockSupervisor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            handlers: HandlerTable::new(),
            auto_ready: AtomicBool::new(true),
            fail_launch: AtomicBool::new(false),
            listening: AtomicBool::new(true),
            next_pid: AtomicUsize::new(1000),
            launches: Mutex::new(Vec::new()),
            sessions: Mutex::new(Vec::new()),
            killed_ports: Mutex::new(Vec::new()),
            killed_connections: Mutex::new(Vec::new()),
            kill_all_calls: AtomicUsize::new(0),
            kill_delay: Mutex::new(None),
        })
    }

    pub fn set_auto_ready(&self, ready: bool) {
        self.auto_ready.store(ready, Ordering::SeqCst);
    }

    pub fn set_fail_launch(&self, fail: bool) {
        self.fail_launch.store(fail, Ordering::SeqCst);
    }

    pub fn set_listening(&self, listening: bool) {
        self.listening.store(listening, Ordering::SeqCst);
    }

    /// Make the next `kill_processes` call take `delay` before it kills
    pub fn delay_next_kill(&self, delay: Duration) {
        *self.kill_delay.lock() = Some(delay);
    }

    pub fn launch_count(&self, id: Uuid, role: ProcessRole) -> usize {
        self.launches
            .lock()
            .iter()
            .filter(|(i, r)| *i == id && *r == role)
            .count()
    }

    /// Most recent session launched for a connection in the given role
    pub fn latest(&self, id: Uuid, role: ProcessRole) -> Option<Arc<SessionController>> {
        self.sessions
            .lock()
            .iter()
            .rev()
            .find(|(i, c)| *i == id && c.role() == role)
            .map(|(_, c)| c.clone())
    }

    /// Invoke the registered conflict handler as the process output would
    pub fn fire_conflict(&self, id: Uuid, port: u16) -> bool {
        self.handlers.emit_conflict(id, port)
    }

    /// Deliver an output line through the registered log handler
    pub fn emit_log(&self, id: Uuid, message: &str) -> bool {
        self.handlers
            .emit_log(id, message, ProcessRole::PortForward, false)
    }

    pub fn killed_ports(&self) -> Vec<u16> {
        self.killed_ports.lock().clone()
    }

    pub fn killed_connections(&self) -> Vec<Uuid> {
        self.killed_connections.lock().clone()
    }

    pub fn kill_all_calls(&self) -> usize {
        self.kill_all_calls.load(Ordering::SeqCst)
    }

    fn launch(&self, id: Uuid, role: ProcessRole) -> Result<ProcessSession, ForwarderError> {
        self.launches.lock().push((id, role));
        if self.fail_launch.load(Ordering::SeqCst) {
            return Err(ForwarderError::ProcessError("mock launch failure".into()));
        }

        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst) as u32;
        let (session, controller) = ProcessSession::channel(role, Some(pid));
        let controller = Arc::new(controller);
        if self.auto_ready.load(Ordering::SeqCst) {
            controller.mark_ready();
        }
        self.sessions.lock().push((id, controller));
        Ok(session)
    }
}

#[async_trait]
impl ProcessSupervisor for MockSupervisor {
    fn handlers(&self) -> &HandlerTable {
        &self.handlers
    }

    async fn launch_port_forward(
        &self,
        id: Uuid,
        _config: &ConnectionConfig,
    ) -> Result<ProcessSession, ForwarderError> {
        self.launch(id, ProcessRole::PortForward)
    }

    async fn launch_proxy(
        &self,
        id: Uuid,
        _config: &ConnectionConfig,
    ) -> Result<ProcessSession, ForwarderError> {
        self.launch(id, ProcessRole::Proxy)
    }

    async fn kill_process_on_port(&self, port: u16) -> bool {
        self.killed_ports.lock().push(port);
        true
    }

    async fn kill_processes(&self, id: Uuid) {
        let delay = self.kill_delay.lock().take();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.killed_connections.lock().push(id);
        for (_, controller) in self.sessions.lock().iter().filter(|(i, _)| *i == id) {
            controller.mark_exited(ProcessExit::killed());
        }
    }

    async fn kill_all_port_forwarder_processes(&self) {
        self.kill_all_calls.fetch_add(1, Ordering::SeqCst);
        for (_, controller) in self.sessions.lock().iter() {
            controller.mark_exited(ProcessExit::killed());
        }
    }

    async fn is_port_listening(&self, _port: u16, _timeout: Duration) -> bool {
        self.listening.load(Ordering::SeqCst)
    }
}
