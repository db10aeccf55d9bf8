//! OS-backed process supervisor
//!
//! Spawns `kubectl port-forward` and `socat` children with `tokio::process`,
//! pumps their output into the handler table, and reaps them.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::command::{port_forward_command, proxy_command, resolve_binary, CommandSpec};
use super::handlers::HandlerTable;
use super::output;
use super::session::{ProcessExit, ProcessRole, ProcessSession, SessionController};
use super::supervisor::ProcessSupervisor;
use super::terminate::{terminate_child, terminate_pid, TERMINATE_GRACE};
use crate::config::{ConnectionConfig, Settings};
use crate::error::ForwarderError;

/// socat prints nothing on success; it counts as ready once it survives this long
const PROXY_SETTLE: Duration = Duration::from_millis(250);

/// Upper bound on waiting for tracked children to exit in `kill_processes`
const KILL_WAIT_TIMEOUT: Duration = Duration::from_secs(3);

/// How long the reaper lets output readers drain before reporting an exit
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// How a launched process signals readiness
#[derive(Debug, Clone, Copy)]
enum Readiness {
    /// A `Forwarding from` line on stdout/stderr
    ForwardLine,
    /// Still running after the given interval
    AfterSettle(Duration),
}

/// A child tracked for a connection
struct TrackedProcess {
    role: ProcessRole,
    pid: Option<u32>,
    kill: CancellationToken,
    exited: CancellationToken,
}

/// Binary locations used by the system supervisor
#[derive(Debug, Clone, Default)]
pub struct BinaryPaths {
    pub kubectl: Option<PathBuf>,
    pub socat: Option<PathBuf>,
}

impl From<&Settings> for BinaryPaths {
    fn from(settings: &Settings) -> Self {
        Self {
            kubectl: settings.kubectl_path.clone(),
            socat: settings.socat_path.clone(),
        }
    }
}

pub struct SystemSupervisor {
    handlers: HandlerTable,
    processes: Arc<DashMap<Uuid, Vec<TrackedProcess>>>,
    binaries: BinaryPaths,
}

impl SystemSupervisor {
    pub fn new(binaries: BinaryPaths) -> Self {
        Self {
            handlers: HandlerTable::new(),
            processes: Arc::new(DashMap::new()),
            binaries,
        }
    }

    /// Number of live children tracked for a connection
    pub fn tracked_count(&self, id: Uuid) -> usize {
        self.processes.get(&id).map(|p| p.len()).unwrap_or(0)
    }

    async fn spawn_supervised(
        &self,
        id: Uuid,
        role: ProcessRole,
        spec: CommandSpec,
        readiness: Readiness,
        fallback_port: u16,
    ) -> Result<ProcessSession, ForwarderError> {
        info!("Launching {} for {}: {}", role, id, spec.display());

        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ForwarderError::SpawnFailed {
                program: spec.program.display().to_string(),
                source,
            })?;

        let pid = child.id();
        let (session, controller) = ProcessSession::channel(role, pid);
        let controller = Arc::new(controller);

        self.processes.entry(id).or_default().push(TrackedProcess {
            role,
            pid,
            kill: controller.kill_token(),
            exited: controller.exited_token(),
        });

        let ready_on_output = matches!(readiness, Readiness::ForwardLine);
        let mut pumps = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            pumps.push(tokio::spawn(pump_output(
                stdout,
                id,
                false,
                ready_on_output,
                fallback_port,
                self.handlers.clone(),
                controller.clone(),
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(tokio::spawn(pump_output(
                stderr,
                id,
                true,
                ready_on_output,
                fallback_port,
                self.handlers.clone(),
                controller.clone(),
            )));
        }

        if let Readiness::AfterSettle(settle) = readiness {
            let controller = controller.clone();
            tokio::spawn(async move {
                let exited = controller.exited_token();
                tokio::select! {
                    _ = tokio::time::sleep(settle) => controller.mark_ready(),
                    _ = exited.cancelled() => {}
                }
            });
        }

        // Reaper: owns the child until it exits or termination is requested
        let processes = self.processes.clone();
        tokio::spawn(async move {
            let kill = controller.kill_token();
            let waited = tokio::select! {
                status = child.wait() => Some(status),
                _ = kill.cancelled() => None,
            };
            let exit = match waited {
                Some(Ok(status)) => match status.code() {
                    Some(code) => ProcessExit::with_code(code),
                    None => ProcessExit::lost(),
                },
                Some(Err(e)) => {
                    warn!("Failed to wait on {} for {}: {}", role, id, e);
                    ProcessExit::lost()
                }
                None => {
                    terminate_child(&mut child, TERMINATE_GRACE).await;
                    ProcessExit::killed()
                }
            };

            // Conflict and log lines must reach the handlers before the exit does
            let drained = futures_util::future::join_all(pumps);
            if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, drained).await.is_err() {
                debug!("Output of {} for {} still open after exit", role, id);
            }

            debug!("{} for {} (pid {:?}) {}", role, id, pid, exit);
            controller.mark_exited(exit);

            if let Some(mut tracked) = processes.get_mut(&id) {
                tracked.retain(|p| !p.exited.is_cancelled());
            }
            processes.remove_if(&id, |_, tracked| tracked.is_empty());
        });

        Ok(session)
    }

    /// Request termination of tracked children and wait (bounded) for them to exit
    async fn terminate_tracked(tracked: Vec<TrackedProcess>) {
        for process in &tracked {
            debug!("Terminating {} (pid {:?})", process.role, process.pid);
            process.kill.cancel();
        }
        let waits = tracked.iter().map(|p| p.exited.cancelled());
        if tokio::time::timeout(KILL_WAIT_TIMEOUT, futures_util::future::join_all(waits))
            .await
            .is_err()
        {
            warn!("Timed out waiting for {} process(es) to exit", tracked.len());
        }
    }
}

impl Default for SystemSupervisor {
    fn default() -> Self {
        Self::new(BinaryPaths::default())
    }
}

/// Forward one output stream into the handler table
async fn pump_output<R>(
    stream: R,
    id: Uuid,
    is_stderr: bool,
    ready_on_output: bool,
    fallback_port: u16,
    handlers: HandlerTable,
    controller: Arc<SessionController>,
) where
    R: AsyncRead + Unpin,
{
    let role = controller.role();
    let mut lines = BufReader::new(stream).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                debug!("Output read error for {} {}: {}", role, id, e);
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if ready_on_output && output::is_forward_ready(line) {
            controller.mark_ready();
        }

        let is_error = is_stderr || output::looks_like_error(line);
        handlers.emit_log(id, line, role, is_error);

        if output::is_port_conflict(line) && controller.claim_conflict() {
            let port = output::extract_port(line).unwrap_or(fallback_port);
            warn!("Port conflict on {} for {} ({})", port, id, role);
            handlers.emit_conflict(id, port);
        }
    }
}

/// Run `lsof` to find listeners on a TCP port
async fn listening_pids(port: u16) -> Vec<u32> {
    let result = Command::new("lsof")
        .args(["-nP", "-t", &format!("-iTCP:{}", port), "-sTCP:LISTEN"])
        .stdin(Stdio::null())
        .output()
        .await;

    match result {
        Ok(out) => output::parse_pid_list(&String::from_utf8_lossy(&out.stdout)),
        Err(e) => {
            warn!("Failed to run lsof for port {}: {}", port, e);
            Vec::new()
        }
    }
}

/// Force-kill every kubectl port-forward and socat process on the machine
fn sweep_forwarder_processes() -> usize {
    use sysinfo::{Signal, System};

    let own_pid = std::process::id();
    let system = System::new_all();
    let mut killed = 0;

    for (pid, process) in system.processes() {
        if pid.as_u32() == own_pid {
            continue;
        }
        let name = process.name().to_string_lossy().to_lowercase();
        let cmdline = process
            .cmd()
            .iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ");

        let is_forwarder = (name.contains("kubectl") && cmdline.contains("port-forward"))
            || name == "socat";
        if !is_forwarder {
            continue;
        }

        let delivered = process.kill_with(Signal::Kill).unwrap_or_else(|| process.kill());
        if delivered {
            info!("Killed stray forwarder process {} ({})", pid, name);
            killed += 1;
        }
    }

    killed
}

#[async_trait]
impl ProcessSupervisor for SystemSupervisor {
    fn handlers(&self) -> &HandlerTable {
        &self.handlers
    }

    async fn launch_port_forward(
        &self,
        id: Uuid,
        config: &ConnectionConfig,
    ) -> Result<ProcessSession, ForwarderError> {
        let kubectl = resolve_binary("kubectl", self.binaries.kubectl.as_deref())?;
        let spec = port_forward_command(&kubectl, config);
        self.spawn_supervised(
            id,
            ProcessRole::PortForward,
            spec,
            Readiness::ForwardLine,
            config.local_port,
        )
        .await
    }

    async fn launch_proxy(
        &self,
        id: Uuid,
        config: &ConnectionConfig,
    ) -> Result<ProcessSession, ForwarderError> {
        let socat = resolve_binary("socat", self.binaries.socat.as_deref())?;
        let spec = proxy_command(&socat, config)?;
        let fallback_port = config.proxy_port.unwrap_or(config.local_port);
        self.spawn_supervised(
            id,
            ProcessRole::Proxy,
            spec,
            Readiness::AfterSettle(PROXY_SETTLE),
            fallback_port,
        )
        .await
    }

    async fn kill_process_on_port(&self, port: u16) -> bool {
        let own_pid = std::process::id();
        let pids: Vec<u32> = listening_pids(port)
            .await
            .into_iter()
            .filter(|pid| *pid != own_pid)
            .collect();

        if pids.is_empty() {
            debug!("No listener found on port {}", port);
            return false;
        }

        let mut killed = false;
        for pid in pids {
            info!("Killing process {} holding port {}", pid, port);
            killed |= terminate_pid(pid, Duration::from_millis(300)).await;
        }
        killed
    }

    async fn kill_processes(&self, id: Uuid) {
        let Some((_, tracked)) = self.processes.remove(&id) else {
            return;
        };
        Self::terminate_tracked(tracked).await;
    }

    async fn kill_all_port_forwarder_processes(&self) {
        let ids: Vec<Uuid> = self.processes.iter().map(|e| *e.key()).collect();
        let mut tracked = Vec::new();
        for id in ids {
            if let Some((_, mut processes)) = self.processes.remove(&id) {
                tracked.append(&mut processes);
            }
        }
        info!("Terminating {} tracked forwarder process(es)", tracked.len());
        Self::terminate_tracked(tracked).await;

        match tokio::task::spawn_blocking(sweep_forwarder_processes).await {
            Ok(killed) => info!("System sweep killed {} forwarder process(es)", killed),
            Err(e) => warn!("System sweep task failed: {}", e),
        }
    }
}
