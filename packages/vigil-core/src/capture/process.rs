//! Child process ownership: spawning, stream attachment, and the
//! graceful-to-forceful termination protocol.
//!
//! Spawning sits behind the [`ProcessLauncher`] trait so supervisor tests can
//! script spawn outcomes without touching the OS. The production
//! [`SystemLauncher`] drives `tokio::process` with piped streams and a reaper
//! task that publishes the exit through a single-shot [`ExitGate`].

use std::process::Stdio;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};

use crate::error::LaunchError;

use super::command::CommandSpec;

/// Exit status of a helper process, as observed by its reaper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitNotice {
    /// Exit code; `None` when the process was terminated by a signal.
    pub code: Option<i32>,
}

/// Single-shot exit signal for one spawned child.
///
/// Restart scheduling waits on this gate so a new child is never spawned
/// while the old one could still hold the capture device.
#[derive(Debug, Clone)]
pub struct ExitGate {
    rx: watch::Receiver<Option<ExitNotice>>,
}

impl ExitGate {
    /// Whether the child has already exited.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// Waits for the child to exit.
    ///
    /// Resolves immediately when the exit was already observed. If the
    /// sending side disappears without publishing (reaper aborted), the gate
    /// resolves with an unknown exit code rather than hanging.
    pub async fn wait(&mut self) -> ExitNotice {
        loop {
            if let Some(notice) = *self.rx.borrow() {
                return notice;
            }
            if self.rx.changed().await.is_err() {
                return ExitNotice { code: None };
            }
        }
    }
}

/// Creates the sender half and gate of an exit signal.
#[must_use]
pub fn exit_pair() -> (watch::Sender<Option<ExitNotice>>, ExitGate) {
    let (tx, rx) = watch::channel(None);
    (tx, ExitGate { rx })
}

/// Control surface over one spawned child.
pub trait ChildControl: Send {
    /// Requests graceful termination (SIGTERM-equivalent).
    fn terminate(&mut self);

    /// Kills the child immediately (SIGKILL-equivalent).
    fn force_kill(&mut self);

    /// Returns the single-shot exit signal for this child.
    fn exit_gate(&self) -> ExitGate;

    /// OS process id, when still known.
    fn id(&self) -> Option<u32>;
}

/// One spawned helper process with its attached streams.
pub struct LaunchedChild {
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    pub stderr: Box<dyn AsyncRead + Send + Unpin>,
    /// Write half of the child's stdin for pipe inputs; dropped on teardown,
    /// which closes the pipe and lets the child exit on its own.
    pub stdin: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    pub control: Box<dyn ChildControl>,
}

/// Trait seam for spawning transcoder children.
///
/// `launch` is synchronous: a spawn either attaches immediately or fails
/// immediately; all waiting happens on the returned streams and gate.
pub trait ProcessLauncher: Send + Sync {
    fn launch(&self, spec: &CommandSpec) -> Result<LaunchedChild, LaunchError>;
}

/// Launches real transcoder processes via `tokio::process`.
pub struct SystemLauncher;

impl ProcessLauncher for SystemLauncher {
    fn launch(&self, spec: &CommandSpec) -> Result<LaunchedChild, LaunchError> {
        let mut command = Command::new(&spec.binary);
        command
            .args(&spec.args)
            .stdin(if spec.pipe_stdin {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                LaunchError::NotFound(spec.binary.clone())
            } else {
                LaunchError::Spawn {
                    binary: spec.binary.clone(),
                    source,
                }
            }
        })?;

        let stdout = child.stdout.take().ok_or_else(|| missing_pipe(spec, "stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing_pipe(spec, "stderr"))?;
        let stdin = child
            .stdin
            .take()
            .map(|pipe| Box::new(pipe) as Box<dyn AsyncWrite + Send + Unpin>);

        let pid = child.id();
        let (exit_tx, gate) = exit_pair();
        let (kill_tx, mut kill_rx) = mpsc::unbounded_channel::<()>();

        // Reaper: owns the child handle, forwards kill requests, publishes
        // the exit exactly once.
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    status = child.wait() => {
                        let code = status.ok().and_then(|s| s.code());
                        let _ = exit_tx.send(Some(ExitNotice { code }));
                        break;
                    }
                    Some(()) = kill_rx.recv() => {
                        let _ = child.start_kill();
                    }
                }
            }
        });

        log::debug!(
            "[Child] spawned pid={:?}: {}",
            pid,
            spec.display_line()
        );

        Ok(LaunchedChild {
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            stdin,
            control: Box::new(SystemChildControl { pid, kill_tx, gate }),
        })
    }
}

fn missing_pipe(spec: &CommandSpec, stream: &str) -> LaunchError {
    LaunchError::Spawn {
        binary: spec.binary.clone(),
        source: std::io::Error::other(format!("{stream} pipe was not attached")),
    }
}

struct SystemChildControl {
    pid: Option<u32>,
    kill_tx: mpsc::UnboundedSender<()>,
    gate: ExitGate,
}

impl ChildControl for SystemChildControl {
    fn terminate(&mut self) {
        #[cfg(unix)]
        {
            if let Some(pid) = self.pid {
                log::debug!("[Child] sending SIGTERM to pid={pid}");
                // SAFETY: signalling a child we spawned; kill(2) has no
                // memory-safety preconditions.
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGTERM);
                }
                return;
            }
        }
        // No graceful signal available on this platform; hard-kill instead.
        let _ = self.kill_tx.send(());
    }

    fn force_kill(&mut self) {
        log::debug!("[Child] force-killing pid={:?}", self.pid);
        let _ = self.kill_tx.send(());
    }

    fn exit_gate(&self) -> ExitGate {
        self.gate.clone()
    }

    fn id(&self) -> Option<u32> {
        self.pid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn exit_gate_resolves_after_publish() {
        let (tx, mut gate) = exit_pair();
        assert!(!gate.is_resolved());

        tx.send(Some(ExitNotice { code: Some(0) })).unwrap();
        assert!(gate.is_resolved());
        assert_eq!(gate.wait().await, ExitNotice { code: Some(0) });
        // A resolved gate stays resolved.
        assert_eq!(gate.wait().await, ExitNotice { code: Some(0) });
    }

    #[tokio::test]
    async fn exit_gate_survives_a_dropped_sender() {
        let (tx, mut gate) = exit_pair();
        drop(tx);
        assert_eq!(gate.wait().await, ExitNotice { code: None });
    }

    #[tokio::test]
    async fn cloned_gates_observe_the_same_exit() {
        let (tx, gate) = exit_pair();
        let mut a = gate.clone();
        let mut b = gate;
        tx.send(Some(ExitNotice { code: Some(7) })).unwrap();
        assert_eq!(a.wait().await.code, Some(7));
        assert_eq!(b.wait().await.code, Some(7));
    }
}
