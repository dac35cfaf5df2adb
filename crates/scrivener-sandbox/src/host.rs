//! Worker-process isolation backend.
//!
//! Spawns `scrivener-worker` as a child process with a clean environment,
//! sends it the frame boot over length-delimited JSON IPC (stdin/stdout), and
//! relays every message the worker's frame posts onto the host bus.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::io::BufReader;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};

use crate::bus::MessageBus;
use crate::error::SandboxError;
use crate::frame::FrameBoot;
use crate::ipc::{read_message_with_limit, write_message, ParentMessage, WorkerMessage};
use crate::launcher::{FrameControl, FrameLauncher, LaunchedFrame};
use crate::protocol::HostEvent;

/// Worker binary file name.
pub const WORKER_BIN_NAME: &str = "scrivener-worker";

/// Environment variable overriding the worker location. Must be absolute.
pub const WORKER_BIN_ENV: &str = "SCRIVENER_WORKER_BIN";

/// When set, worker stderr is inherited instead of discarded.
pub const DEBUG_ENV: &str = "SCRIVENER_DEBUG";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Runs each frame in a fresh `scrivener-worker` process.
#[derive(Debug, Clone)]
pub struct WorkerLauncher {
    max_ipc_message_size: usize,
}

impl WorkerLauncher {
    /// Create a launcher with the given IPC message ceiling in bytes.
    pub fn new(max_ipc_message_size: usize) -> Self {
        Self {
            max_ipc_message_size,
        }
    }
}

impl Default for WorkerLauncher {
    fn default() -> Self {
        Self::new(crate::ipc::DEFAULT_MAX_IPC_MESSAGE_SIZE)
    }
}

struct WorkerControl {
    events: Mutex<Option<mpsc::UnboundedSender<HostEvent>>>,
    kill: Mutex<Option<oneshot::Sender<()>>>,
}

impl FrameControl for WorkerControl {
    fn deliver(&self, event: HostEvent) -> bool {
        lock(&self.events)
            .as_ref()
            .map(|tx| tx.send(event).is_ok())
            .unwrap_or(false)
    }

    fn terminate(&self) {
        lock(&self.events).take();
        if let Some(kill) = lock(&self.kill).take() {
            let _ = kill.send(());
        }
    }
}

#[async_trait]
impl FrameLauncher for WorkerLauncher {
    async fn launch(&self, boot: FrameBoot, bus: &MessageBus) -> Result<LaunchedFrame, SandboxError> {
        let worker_bin = find_worker_binary()?;

        let mut child = Command::new(&worker_bin)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(if std::env::var(DEBUG_ENV).is_ok() {
                Stdio::inherit()
            } else {
                Stdio::null()
            })
            .env_clear()
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                SandboxError::Execution(anyhow::anyhow!(
                    "failed to spawn worker at {}: {}",
                    worker_bin.display(),
                    e
                ))
            })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| SandboxError::Execution(anyhow::anyhow!("no stdin on child")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::Execution(anyhow::anyhow!("no stdout on child")))?;

        write_message(
            &mut stdin,
            &ParentMessage::Boot {
                boot,
                max_ipc_message_size: self.max_ipc_message_size,
            },
        )
        .await
        .map_err(|e| SandboxError::Execution(anyhow::anyhow!("failed to send Boot: {}", e)))?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        let bus = bus.clone();
        let limit = self.max_ipc_message_size;

        tokio::spawn(async move {
            supervise(child, stdin, BufReader::new(stdout), event_rx, kill_rx, bus, limit).await;
            if exit_tx.send(()).is_err() {
                tracing::debug!("worker exit receiver dropped");
            }
        });

        Ok(LaunchedFrame {
            control: Arc::new(WorkerControl {
                events: Mutex::new(Some(event_tx)),
                kill: Mutex::new(Some(kill_tx)),
            }),
            exited: exit_rx,
        })
    }
}

/// Pump IPC for one worker until it exits or is killed.
async fn supervise(
    mut child: Child,
    stdin: ChildStdin,
    mut stdout: BufReader<ChildStdout>,
    mut events: mpsc::UnboundedReceiver<HostEvent>,
    mut kill: oneshot::Receiver<()>,
    bus: MessageBus,
    limit: usize,
) {
    let reader = async {
        loop {
            match read_message_with_limit::<WorkerMessage, _>(&mut stdout, limit).await {
                Ok(Some(WorkerMessage::Post { message })) => bus.post(message),
                Ok(Some(WorkerMessage::Log { message })) => {
                    tracing::info!(target: "scrivener::sandbox::worker", "{}", message);
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "worker IPC read failed");
                    break;
                }
            }
        }
    };
    tokio::pin!(reader);

    let mut stdin = Some(stdin);
    let mut events_open = true;
    loop {
        tokio::select! {
            _ = &mut reader => break,
            event = events.recv(), if events_open => match event {
                Some(event) => {
                    if let Some(writer) = stdin.as_mut() {
                        if let Err(e) = write_message(writer, &ParentMessage::Deliver { event }).await {
                            tracing::warn!(error = %e, "failed to deliver host event to worker");
                        }
                    }
                }
                None => {
                    // closing stdin tells the worker the host let go
                    events_open = false;
                    stdin = None;
                }
            },
            _ = &mut kill => {
                if let Err(e) = child.kill().await {
                    tracing::debug!(error = %e, "worker already gone");
                }
                break;
            }
        }
    }

    match child.try_wait() {
        Ok(Some(status)) => tracing::debug!(%status, "worker exited"),
        _ => {
            let _ = child.kill().await;
        }
    }
}

/// Find the `scrivener-worker` binary.
///
/// Search order:
/// 1. `SCRIVENER_WORKER_BIN` environment variable (must be absolute path)
/// 2. Same directory as the current executable, or its parent (test binaries
///    live in `target/<profile>/deps/`)
///
/// On Unix, rejects world-writable binaries (mode & 0o002 != 0).
pub fn find_worker_binary() -> Result<PathBuf, SandboxError> {
    if let Ok(path) = std::env::var(WORKER_BIN_ENV) {
        let p = PathBuf::from(&path);
        if !p.is_absolute() {
            return Err(SandboxError::WorkerUnavailable {
                reason: format!("{WORKER_BIN_ENV} must be an absolute path, got: {path}"),
            });
        }
        if p.exists() {
            validate_binary_permissions(&p)?;
            return Ok(p);
        }
    }

    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            for candidate_dir in std::iter::once(dir).chain(dir.parent()) {
                let worker = candidate_dir.join(WORKER_BIN_NAME);
                if worker.exists() {
                    validate_binary_permissions(&worker)?;
                    return Ok(worker);
                }
            }
        }
    }

    Err(SandboxError::WorkerUnavailable {
        reason: format!(
            "{WORKER_BIN_NAME} binary not found. Set {WORKER_BIN_ENV} or install it next to the host binary"
        ),
    })
}

/// Validate binary file permissions (Unix only).
///
/// Rejects world-writable binaries to prevent binary substitution.
fn validate_binary_permissions(_path: &std::path::Path) -> Result<(), SandboxError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let metadata = std::fs::metadata(_path).map_err(|e| SandboxError::WorkerUnavailable {
            reason: format!("cannot read metadata for {}: {}", _path.display(), e),
        })?;
        let mode = metadata.permissions().mode();
        if mode & 0o002 != 0 {
            return Err(SandboxError::WorkerUnavailable {
                reason: format!(
                    "insecure permissions on worker binary {}: mode {:o} is world-writable",
                    _path.display(),
                    mode
                ),
            });
        }
    }
    Ok(())
}
