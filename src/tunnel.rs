//! # Tunnel Supervisor
//!
//! Keeps an SSH port-forward alive between the local port the generation
//! client dials and the remote motion server.
//!
//! ## Lifecycle
//!
//! ```text
//! start() --spawn--> [grace period] --alive?--> Running
//!    ^                                  | no
//!    |                                  v
//!    +------ watchdog (every 5 s) <-- Stopped / Exited
//! ```
//!
//! `start` and `stop` are serialized by one mutex so the watchdog thread and
//! a reconfigure request can never spawn two tunnels. The watchdog restarts a
//! dead tunnel forever, without backoff; nothing else in the bridge retries.

use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::error::{BridgeError, TunnelError};
use crate::settings::RemotePortStore;

/// Describes the forwarding process to spawn for a given remote port.
pub trait ForwardCommand: Send + Sync {
    fn program(&self) -> &str;
    fn args(&self, remote_port: u16) -> Vec<String>;
}

/// `ssh -N -L <local>:127.0.0.1:<remote> <host>`.
#[derive(Debug, Clone)]
pub struct SshForward {
    pub program: String,
    pub host: String,
    pub local_port: u16,
}

impl ForwardCommand for SshForward {
    fn program(&self) -> &str {
        &self.program
    }

    fn args(&self, remote_port: u16) -> Vec<String> {
        vec![
            "-N".to_string(),
            "-o".to_string(),
            "ExitOnForwardFailure=yes".to_string(),
            "-L".to_string(),
            format!("{}:127.0.0.1:{}", self.local_port, remote_port),
            self.host.clone(),
        ]
    }
}

/// Timing knobs of the supervisor.
#[derive(Debug, Clone, Copy)]
pub struct TunnelTiming {
    /// How long a fresh child must survive before it counts as started.
    pub grace: Duration,
    /// Watchdog polling interval.
    pub poll_interval: Duration,
}

impl Default for TunnelTiming {
    fn default() -> Self {
        Self {
            grace: Duration::from_millis(1500),
            poll_interval: Duration::from_secs(5),
        }
    }
}

struct TunnelState {
    remote_port: u16,
    child: Option<Child>,
}

impl TunnelState {
    fn child_alive(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }
}

/// Owns the forwarding child process.
pub struct TunnelSupervisor {
    command: Box<dyn ForwardCommand>,
    store: RemotePortStore,
    timing: TunnelTiming,
    state: Mutex<TunnelState>,
}

impl TunnelSupervisor {
    /// Creates a stopped supervisor using the port persisted in `store`.
    pub fn new(command: Box<dyn ForwardCommand>, store: RemotePortStore, timing: TunnelTiming) -> Self {
        let remote_port = store.load();
        Self {
            command,
            store,
            timing,
            state: Mutex::new(TunnelState {
                remote_port,
                child: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TunnelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn remote_port(&self) -> u16 {
        self.lock().remote_port
    }

    pub fn is_running(&self) -> bool {
        self.lock().child_alive()
    }

    /// Process id of the live child, if any.
    pub fn pid(&self) -> Option<u32> {
        let mut state = self.lock();
        if state.child_alive() {
            state.child.as_ref().map(Child::id)
        } else {
            None
        }
    }

    /// Ensures a tunnel is running. Returns `false` (after logging) if the
    /// executable is missing or the child died within the grace period.
    pub fn start(&self) -> bool {
        match self.try_start() {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "SSH tunnel failed to start");
                false
            }
        }
    }

    /// Like [`TunnelSupervisor::start`] but reports why the start failed.
    pub fn try_start(&self) -> Result<(), TunnelError> {
        let mut state = self.lock();
        if state.child_alive() {
            return Ok(());
        }
        if let Some(mut stale) = state.child.take() {
            reap(&mut stale);
        }

        let program = self.command.program();
        if which::which(program).is_err() {
            return Err(TunnelError::CommandMissing {
                command: program.to_string(),
            });
        }

        let args = self.command.args(state.remote_port);
        info!(command = %format!("{} {}", program, args.join(" ")), "Starting SSH tunnel");

        let mut child = Command::new(program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => TunnelError::CommandMissing {
                    command: program.to_string(),
                },
                _ => TunnelError::Spawn(e),
            })?;

        // Give ssh time to bind the local port or fail.
        thread::sleep(self.timing.grace);

        match child.try_wait() {
            Ok(None) => {}
            Ok(Some(status)) => {
                return Err(TunnelError::ExitedImmediately {
                    status: status.to_string(),
                })
            }
            Err(e) => {
                reap(&mut child);
                return Err(TunnelError::Spawn(e));
            }
        }

        info!(pid = child.id(), remote_port = state.remote_port, "SSH tunnel started");
        state.child = Some(child);
        Ok(())
    }

    /// Terminates the live child, if any. Idempotent.
    pub fn stop(&self) {
        let mut state = self.lock();
        if let Some(mut child) = state.child.take() {
            reap(&mut child);
            info!(pid = child.id(), "SSH tunnel stopped");
        }
    }

    /// Validates and persists a new remote port, then restarts the tunnel
    /// against it.
    ///
    /// # Errors
    /// [`BridgeError::Validation`] for ports outside 1–65535, or an I/O error
    /// if the record cannot be written.
    pub fn reconfigure(&self, remote_port: i64) -> Result<u16, BridgeError> {
        let port = u16::try_from(remote_port)
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| BridgeError::Validation("remote_port must be 1-65535".to_string()))?;

        self.store.save(port)?;
        self.lock().remote_port = port;
        info!(remote_port = port, "Remote port reconfigured");

        self.stop();
        self.start();
        Ok(port)
    }

    /// One watchdog step: restarts the tunnel if it is absent or has exited.
    /// Returns `true` if a restart was attempted.
    pub fn check_liveness(&self) -> bool {
        if self.is_running() {
            return false;
        }
        warn!("SSH tunnel down, restarting");
        self.start();
        true
    }

    /// Spawns the watchdog thread. It polls for as long as the supervisor
    /// exists.
    pub fn spawn_watchdog(self: &Arc<Self>) -> std::io::Result<thread::JoinHandle<()>> {
        let supervisor = Arc::downgrade(self);
        let interval = self.timing.poll_interval;
        thread::Builder::new()
            .name("tunnel-watchdog".to_string())
            .spawn(move || loop {
                thread::sleep(interval);
                match supervisor.upgrade() {
                    Some(supervisor) => {
                        supervisor.check_liveness();
                    }
                    None => break,
                }
            })
    }
}

/// Kills `child` and collects its exit status. Both steps are no-ops once the
/// child has already exited.
fn reap(child: &mut Child) {
    if let Err(e) = child.kill() {
        debug!(pid = child.id(), error = %e, "Tunnel child already gone");
    }
    let _ = child.wait();
}

impl Drop for TunnelSupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}
