//! Supervised Process Session
//!
//! A `ProcessSession` is the engine-side view of one running child process.
//! The supervisor keeps the matching `SessionController` and drives it from
//! the output readers and the exit waiter.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Which process of a connection a session or log line belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProcessRole {
    /// The `kubectl port-forward` process
    PortForward,
    /// The `socat` proxy in front of the forwarded port
    Proxy,
}

impl fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessRole::PortForward => write!(f, "port-forward"),
            ProcessRole::Proxy => write!(f, "proxy"),
        }
    }
}

/// How a supervised process ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessExit {
    /// Exit code, if the process exited normally
    pub code: Option<i32>,
    /// Whether termination was requested by the supervisor
    pub killed: bool,
}

impl ProcessExit {
    pub fn with_code(code: i32) -> Self {
        Self {
            code: Some(code),
            killed: false,
        }
    }

    pub fn killed() -> Self {
        Self {
            code: None,
            killed: true,
        }
    }

    /// The supervisor went away without reporting an exit
    pub fn lost() -> Self {
        Self {
            code: None,
            killed: false,
        }
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.killed) {
            (_, true) => write!(f, "terminated"),
            (Some(code), false) => write!(f, "exited with code {}", code),
            (None, false) => write!(f, "exited by signal"),
        }
    }
}

/// Handle to one supervised child process
///
/// Dropping the session requests termination of the process.
pub struct ProcessSession {
    role: ProcessRole,
    pid: Option<u32>,
    ready: Option<oneshot::Receiver<()>>,
    exit: Option<oneshot::Receiver<ProcessExit>>,
    exited: Option<ProcessExit>,
    kill: CancellationToken,
}

/// Supervisor side of a `ProcessSession`
pub struct SessionController {
    role: ProcessRole,
    pid: Option<u32>,
    ready: Mutex<Option<oneshot::Sender<()>>>,
    exit: Mutex<Option<oneshot::Sender<ProcessExit>>>,
    kill: CancellationToken,
    exited: CancellationToken,
    conflict_reported: AtomicBool,
}

impl ProcessSession {
    /// Create a connected session/controller pair
    pub fn channel(role: ProcessRole, pid: Option<u32>) -> (ProcessSession, SessionController) {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        let kill = CancellationToken::new();

        let session = ProcessSession {
            role,
            pid,
            ready: Some(ready_rx),
            exit: Some(exit_rx),
            exited: None,
            kill: kill.clone(),
        };
        let controller = SessionController {
            role,
            pid,
            ready: Mutex::new(Some(ready_tx)),
            exit: Mutex::new(Some(exit_tx)),
            kill,
            exited: CancellationToken::new(),
            conflict_reported: AtomicBool::new(false),
        };
        (session, controller)
    }

    pub fn role(&self) -> ProcessRole {
        self.role
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Wait until the process reports readiness
    ///
    /// Returns `Err` with the exit report if the process ends first.
    pub async fn wait_ready(&mut self) -> Result<(), ProcessExit> {
        enum Step {
            Ready,
            ReadyDropped,
            Exited(ProcessExit),
        }

        let Some(mut ready) = self.ready.take() else {
            return match &self.exited {
                Some(exit) => Err(exit.clone()),
                None => Ok(()),
            };
        };
        let Some(exit_rx) = self.exit.as_mut() else {
            return Err(self.wait_exit().await);
        };

        let step = tokio::select! {
            biased;
            r = &mut ready => if r.is_ok() { Step::Ready } else { Step::ReadyDropped },
            r = exit_rx => Step::Exited(r.unwrap_or_else(|_| ProcessExit::lost())),
        };

        match step {
            Step::Ready => Ok(()),
            Step::ReadyDropped => Err(self.wait_exit().await),
            Step::Exited(exit) => {
                self.exit = None;
                self.exited = Some(exit.clone());
                Err(exit)
            }
        }
    }

    /// Wait for the process to exit
    pub async fn wait_exit(&mut self) -> ProcessExit {
        if let Some(exit) = &self.exited {
            return exit.clone();
        }
        let exit = match self.exit.take() {
            Some(rx) => rx.await.unwrap_or_else(|_| ProcessExit::lost()),
            None => ProcessExit::lost(),
        };
        self.exited = Some(exit.clone());
        exit
    }

    /// Request termination without waiting
    pub fn kill(&self) {
        self.kill.cancel();
    }
}

impl Drop for ProcessSession {
    fn drop(&mut self) {
        self.kill.cancel();
    }
}

impl fmt::Debug for ProcessSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessSession")
            .field("role", &self.role)
            .field("pid", &self.pid)
            .field("exited", &self.exited)
            .finish()
    }
}

impl SessionController {
    pub fn role(&self) -> ProcessRole {
        self.role
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Signal readiness (first call wins)
    pub fn mark_ready(&self) {
        if let Some(tx) = self.ready.lock().take() {
            let _ = tx.send(());
        }
    }

    /// Report the exit (first call wins)
    pub fn mark_exited(&self, exit: ProcessExit) {
        self.ready.lock().take();
        if let Some(tx) = self.exit.lock().take() {
            let _ = tx.send(exit);
        }
        self.exited.cancel();
    }

    /// Token cancelled when termination is requested
    pub fn kill_token(&self) -> CancellationToken {
        self.kill.clone()
    }

    /// Token cancelled once the exit was reported
    pub fn exited_token(&self) -> CancellationToken {
        self.exited.clone()
    }

    pub fn is_kill_requested(&self) -> bool {
        self.kill.is_cancelled()
    }

    pub fn has_exited(&self) -> bool {
        self.exited.is_cancelled()
    }

    /// Returns true only for the first conflict seen on this session
    pub fn claim_conflict(&self) -> bool {
        !self.conflict_reported.swap(true, Ordering::SeqCst)
    }
}
