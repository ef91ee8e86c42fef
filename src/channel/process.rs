//! Child process supervision
//!
//! Spawns the target executable with piped stdio, tracks liveness, and stops
//! or kills it. Each spawn is a new generation; the reader task of an older
//! generation retires as soon as its generation is no longer current.

use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::mpsc;

use crate::config::ChannelConfig;
use crate::{Error, Result};

/// A running child and the handles bound to it
struct LiveProcess {
    /// The child process
    child: Child,

    pid: u32,

    generation: u64,

    /// Stdin writer, shared so a write can finish outside the slot lock
    stdin: Arc<tokio::sync::Mutex<ChildStdin>>,

    /// Dropping this retires the reader task
    _shutdown_tx: mpsc::Sender<()>,
}

/// Result of a liveness check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Liveness {
    Alive(u64),
    /// The child had exited; its slot was just released
    Reclaimed(u64),
    Idle,
}

/// What a fresh spawn hands back to the channel
pub(crate) struct Spawned {
    pub pid: u32,
    pub generation: u64,
    pub stdout: ChildStdout,
    pub shutdown_rx: mpsc::Receiver<()>,
}

/// Owns at most one live child process
pub(crate) struct ProcessSupervisor {
    config: Arc<ChannelConfig>,

    slot: Mutex<Option<LiveProcess>>,

    /// Last generation handed out
    generations: AtomicU64,

    /// Generation of the live child, 0 when none
    current: Arc<AtomicU64>,
}

impl ProcessSupervisor {
    pub fn new(config: Arc<ChannelConfig>) -> Self {
        Self {
            config,
            slot: Mutex::new(None),
            generations: AtomicU64::new(0),
            current: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Shared generation token read by reader tasks
    pub fn current_token(&self) -> Arc<AtomicU64> {
        self.current.clone()
    }

    /// Number of generations started so far
    pub fn generations(&self) -> u64 {
        self.generations.load(Ordering::SeqCst)
    }

    /// Spawn a new child unless one is alive.
    ///
    /// `on_spawn` runs while the slot is still locked, so a concurrent start
    /// cannot observe the new generation before the caller has prepared for it.
    pub fn spawn<F, T>(&self, on_spawn: F) -> Result<Option<T>>
    where
        F: FnOnce(Spawned) -> T,
    {
        let mut slot = self.slot.lock();
        if Self::check_alive(&mut slot) {
            return Ok(None);
        }
        if slot.take().is_some() {
            self.current.store(0, Ordering::SeqCst);
        }

        let target = &self.config.target_path;
        tracing::info!("Spawning child process from: {:?}", target);

        let mut command = tokio::process::Command::new(target);
        command
            .args(self.config.command_args(std::process::id()))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .map_err(|e| Error::Spawn(format!("{:?}: {}", target, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Spawn("Failed to capture stdin".to_string()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Spawn("Failed to capture stdout".to_string()))?;

        let pid = child
            .id()
            .ok_or_else(|| Error::Spawn("Child exited before its pid was read".to_string()))?;

        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);

        *slot = Some(LiveProcess {
            child,
            pid,
            generation,
            stdin: Arc::new(tokio::sync::Mutex::new(stdin)),
            _shutdown_tx: shutdown_tx,
        });
        self.current.store(generation, Ordering::SeqCst);

        tracing::info!("Process started with PID: {} (generation {})", pid, generation);

        Ok(Some(on_spawn(Spawned {
            pid,
            generation,
            stdout,
            shutdown_rx,
        })))
    }

    /// Check the child, reclaiming the slot if it has exited
    pub fn poll(&self) -> Liveness {
        let mut slot = self.slot.lock();
        if Self::check_alive(&mut slot) {
            return slot
                .as_ref()
                .map(|p| Liveness::Alive(p.generation))
                .unwrap_or(Liveness::Idle);
        }
        match slot.take() {
            Some(process) => {
                self.current.store(0, Ordering::SeqCst);
                tracing::info!(
                    "Child process {} (generation {}) has exited",
                    process.pid,
                    process.generation
                );
                Liveness::Reclaimed(process.generation)
            }
            None => Liveness::Idle,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        let mut slot = self.slot.lock();
        if Self::check_alive(&mut slot) {
            return slot.as_ref().map(|p| p.pid);
        }
        None
    }

    /// Send a graceful termination request and release the handle.
    ///
    /// Does not wait for exit: the child gets the configured grace period in a
    /// background task before it is killed. Returns the retired generation,
    /// including one whose child had already exited.
    pub fn stop(&self) -> Option<u64> {
        let (mut process, alive) = self.take_slot()?;
        if !alive {
            tracing::info!("Process {} had already exited", process.pid);
            return Some(process.generation);
        }

        request_termination(&mut process.child, process.pid);
        drop(process.stdin);

        let grace = self.config.stop_grace();
        let pid = process.pid;
        let mut child = process.child;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    reap_after(&mut child, pid, grace).await;
                });
            }
            Err(_) => {
                // No runtime to wait on; kill_on_drop takes over
                tracing::warn!("No async runtime available, killing process {}", pid);
            }
        }

        tracing::info!("Process terminated");
        Some(process.generation)
    }

    /// Forcefully kill the child and release the handle
    pub fn kill(&self) -> Option<u64> {
        let (mut process, alive) = self.take_slot()?;
        if !alive {
            tracing::info!("Process {} had already exited", process.pid);
            return Some(process.generation);
        }
        if let Err(e) = process.child.start_kill() {
            tracing::warn!("Failed to kill process {}: {}", process.pid, e);
        }
        tracing::info!("Process killed");
        Some(process.generation)
    }

    /// Write one framed line to the child's stdin.
    ///
    /// The stdin mutex makes each line a critical section, so concurrent
    /// callers never interleave partial writes.
    pub async fn write_line(&self, line: &str) -> Result<()> {
        let stdin = {
            let mut slot = self.slot.lock();
            if !Self::check_alive(&mut slot) {
                return Err(Error::NotRunning);
            }
            match slot.as_ref() {
                Some(process) => process.stdin.clone(),
                None => return Err(Error::NotRunning),
            }
        };

        let mut stdin = stdin.lock().await;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(write_error)?;
        stdin.flush().await.map_err(write_error)?;
        Ok(())
    }

    /// Release the slot, reporting whether the child was still running
    fn take_slot(&self) -> Option<(LiveProcess, bool)> {
        let mut slot = self.slot.lock();
        let alive = Self::check_alive(&mut slot);
        let process = slot.take()?;
        self.current.store(0, Ordering::SeqCst);
        Some((process, alive))
    }

    fn check_alive(slot: &mut Option<LiveProcess>) -> bool {
        match slot.as_mut() {
            Some(process) => matches!(process.child.try_wait(), Ok(None)),
            None => false,
        }
    }
}

fn write_error(e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::BrokenPipe {
        Error::NotRunning
    } else {
        Error::Io(e)
    }
}

#[cfg(unix)]
fn request_termination(_child: &mut Child, pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        tracing::warn!("Failed to send SIGTERM to process {}: {}", pid, e);
    }
}

#[cfg(not(unix))]
fn request_termination(child: &mut Child, pid: u32) {
    // No graceful signal here; closing stdin is the polite request
    let _ = (child, pid);
}

async fn reap_after(child: &mut Child, pid: u32, grace: Duration) {
    tokio::select! {
        _ = tokio::time::sleep(grace) => {
            tracing::warn!("Process {} did not exit gracefully, killing...", pid);
            child.kill().await.ok();
        }
        status = child.wait() => {
            tracing::debug!("Process {} exited with status: {:?}", pid, status);
        }
    }
}
