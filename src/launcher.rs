//! Local instance launcher
//!
//! Spawns backend processes on ports taken from the managed range, streams
//! their output to the log and watches them until they exit. Each child is
//! owned by its exit observer task; other code asks for termination through
//! a oneshot channel stored in the port table.

use crate::error::RouteError;
use crate::ports::{PortRange, PortTable};
use crate::registry::{Instance, InstanceMatch, LaunchSpec, SharedRegistry};
use parking_lot::Mutex;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Interval for polling the port table while waiting for children to exit
const DRAIN_POLL_INTERVAL_MS: u64 = 50;

/// Default grace period between SIGTERM and SIGKILL
const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Port table entry for one spawned process
#[derive(Debug)]
struct ChildEntry {
    pid: Option<u32>,
    app_id: String,
    kill_tx: Option<oneshot::Sender<()>>,
}

struct LauncherState {
    ports: Mutex<PortTable<ChildEntry>>,
    local_ip: String,
    registry: Option<SharedRegistry>,
    grace_period: Duration,
}

/// A process that was started and is now owned by its exit observer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launched {
    pub port: u16,
    pub pid: Option<u32>,
}

/// Spawns and supervises backend processes on this node.
///
/// Cloning is cheap; all clones share the same port table. Router nodes
/// attach a registry so that an exiting process also removes its instance
/// record; process-manager nodes run without one.
#[derive(Clone)]
pub struct InstanceLauncher {
    state: Arc<LauncherState>,
}

impl InstanceLauncher {
    pub fn new(range: PortRange, local_ip: impl Into<String>) -> Self {
        Self {
            state: Arc::new(LauncherState {
                ports: Mutex::new(PortTable::new(range)),
                local_ip: local_ip.into(),
                registry: None,
                grace_period: DEFAULT_GRACE_PERIOD,
            }),
        }
    }

    /// Create a launcher that deregisters instances when their process exits
    pub fn with_registry(range: PortRange, local_ip: impl Into<String>, registry: SharedRegistry) -> Self {
        Self {
            state: Arc::new(LauncherState {
                ports: Mutex::new(PortTable::new(range)),
                local_ip: local_ip.into(),
                registry: Some(registry),
                grace_period: DEFAULT_GRACE_PERIOD,
            }),
        }
    }

    pub fn local_ip(&self) -> &str {
        &self.state.local_ip
    }

    /// Number of processes currently holding a port
    pub fn running(&self) -> usize {
        self.state.ports.lock().len()
    }

    pub fn is_held(&self, port: u16) -> bool {
        self.state.ports.lock().contains(port)
    }

    /// Start a backend for `app_id` on the next free port.
    ///
    /// The child inherits this process's environment with `PORT` set to the
    /// allocated port. Allocation, spawn and registration in the port table
    /// happen under one lock, so concurrent launches never share a port.
    pub fn launch(&self, app_id: &str, spec: &LaunchSpec) -> Result<Launched, RouteError> {
        let mut ports = self.state.ports.lock();

        let port = ports.allocate().ok_or_else(|| {
            warn!(app_id, range = %ports.range(), "Managed port range exhausted");
            RouteError::NoCapacity(spec.to_string())
        })?;

        info!(app_id, port, command = %spec, "Creating new process");

        let mut cmd = Command::new(&spec.executable);
        cmd.args(&spec.args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.env("PORT", port.to_string());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            error!(app_id, command = %spec, error = %e, "Unable to start process");
            RouteError::SpawnFailed(spec.to_string())
        })?;

        if let Ok(Some(status)) = child.try_wait() {
            if !status.success() {
                error!(app_id, command = %spec, ?status, "Process exited immediately");
                return Err(RouteError::SpawnFailed(spec.to_string()));
            }
        }

        let pid = child.id();
        let (kill_tx, kill_rx) = oneshot::channel();
        ports.insert(
            port,
            ChildEntry {
                pid,
                app_id: app_id.to_string(),
                kill_tx: Some(kill_tx),
            },
        );
        drop(ports);

        let log_pid = pid.unwrap_or(0);
        if let Some(stdout) = child.stdout.take() {
            stream_output(stdout, log_pid, "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            stream_output(stderr, log_pid, "stderr");
        }

        let state = Arc::clone(&self.state);
        let app_id = app_id.to_string();
        tokio::spawn(async move {
            observe_exit(state, app_id, port, child, kill_rx).await;
        });

        info!(port, pid = log_pid, "Backend process spawned");
        Ok(Launched { port, pid })
    }

    /// Ask the process on `port` to stop. Returns false if no process holds the port.
    pub fn terminate(&self, port: u16) -> bool {
        let mut ports = self.state.ports.lock();
        let Some(entry) = ports.get_mut(port) else {
            return false;
        };
        match entry.kill_tx.take() {
            Some(tx) => {
                debug!(port, app_id = %entry.app_id, pid = ?entry.pid, "Requesting process termination");
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }

    /// Stop every spawned process and wait (bounded) for them to exit
    pub async fn stop_all(&self) {
        let senders: Vec<oneshot::Sender<()>> = {
            let mut ports = self.state.ports.lock();
            let held = ports.ports();
            held.into_iter().filter_map(|p| take_kill(&mut ports, p)).collect()
        };

        if senders.is_empty() {
            return;
        }

        info!(count = senders.len(), "Stopping all backend processes");
        for tx in senders {
            let _ = tx.send(());
        }

        let deadline = self.state.grace_period + Duration::from_secs(1);
        let start = Instant::now();
        while self.running() > 0 {
            if start.elapsed() > deadline {
                warn!(remaining = self.running(), "Timed out waiting for backends to exit");
                break;
            }
            tokio::time::sleep(Duration::from_millis(DRAIN_POLL_INTERVAL_MS)).await;
        }
    }
}

/// Take the kill sender for `port`; a second request for the same process yields nothing
fn take_kill(ports: &mut PortTable<ChildEntry>, port: u16) -> Option<oneshot::Sender<()>> {
    ports.get_mut(port).and_then(|e| e.kill_tx.take())
}

fn stream_output<R>(reader: R, pid: u32, stream: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    // Drain until EOF; dropping the pipe early would kill the child with SIGPIPE
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line).await {
                Ok(0) => break,
                Ok(_) => info!(pid, stream, "{}", String::from_utf8_lossy(&line).trim_end()),
                Err(e) => {
                    debug!(pid, stream, error = %e, "Stopped reading process output");
                    break;
                }
            }
        }
    });
}

async fn observe_exit(
    state: Arc<LauncherState>,
    app_id: String,
    port: u16,
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
) {
    let pid = child.id().unwrap_or(0);

    let status = tokio::select! {
        status = child.wait() => status.ok(),
        _ = kill_rx => stop_child(&mut child, pid, state.grace_period).await,
    };

    state.ports.lock().release(port);
    info!(port, pid, ?status, "Child process exited");

    let Some(registry) = state.registry.as_ref() else {
        return;
    };

    let instance = Instance::new(&state.local_ip, port);
    match registry
        .remove_instance(&app_id, &InstanceMatch::Endpoint(instance.clone()))
        .await
    {
        Ok(()) => info!(app_id, %instance, "Removed registration of application instance"),
        Err(e) => error!(app_id, %instance, error = %e, "Error removing registration of application instance"),
    }
}

/// SIGTERM, then SIGKILL once the grace period runs out
async fn stop_child(child: &mut Child, pid: u32, grace_period: Duration) -> Option<ExitStatus> {
    info!(pid, "Terminating backend process");

    #[cfg(unix)]
    {
        if pid != 0 {
            // SAFETY: pid belongs to a child we spawned and have not yet reaped
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }

    match tokio::time::timeout(grace_period, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        Ok(Err(e)) => {
            warn!(pid, error = %e, "Error waiting for backend to exit");
            None
        }
        Err(_) => {
            warn!(pid, grace_period_secs = grace_period.as_secs(), "Grace period exceeded, sending SIGKILL");
            let _ = child.kill().await;
            child.wait().await.ok()
        }
    }
}
