//! Isolation backends.
//!
//! A [`FrameLauncher`] turns a [`FrameBoot`] into a running frame that posts
//! onto the host [`MessageBus`]. The runner only sees the returned
//! [`LaunchedFrame`], so the protocol and timeout logic are identical whether
//! the isolate runs on a thread in this process or in a worker process.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use deno_core::v8;
use tokio::sync::{mpsc, oneshot};

use crate::bus::{MessageBus, Outbox};
use crate::error::SandboxError;
use crate::frame::{run_frame, FrameBoot};
use crate::protocol::HostEvent;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Host-side control over one running frame.
pub trait FrameControl: Send + Sync {
    /// Deliver a host event. Returns `false` if the frame is no longer accepting.
    fn deliver(&self, event: HostEvent) -> bool;

    /// Stop the frame. Idempotent.
    fn terminate(&self);
}

/// A frame that has been started.
pub struct LaunchedFrame {
    /// Control handle.
    pub control: Arc<dyn FrameControl>,
    /// Resolves (or errors) once the frame's context has exited.
    pub exited: oneshot::Receiver<()>,
}

/// Starts isolated frames.
#[async_trait]
pub trait FrameLauncher: Send + Sync {
    /// Start a frame for `boot` posting onto `bus`.
    async fn launch(&self, boot: FrameBoot, bus: &MessageBus) -> Result<LaunchedFrame, SandboxError>;
}

/// Runs each frame on a dedicated OS thread in this process.
#[derive(Debug, Clone, Copy, Default)]
pub struct InProcessLauncher;

#[derive(Default)]
struct IsolateSlot {
    handle: Option<v8::IsolateHandle>,
    terminated: bool,
}

struct InProcessControl {
    events: Mutex<Option<mpsc::UnboundedSender<HostEvent>>>,
    isolate: Arc<Mutex<IsolateSlot>>,
}

impl FrameControl for InProcessControl {
    fn deliver(&self, event: HostEvent) -> bool {
        lock(&self.events)
            .as_ref()
            .map(|tx| tx.send(event).is_ok())
            .unwrap_or(false)
    }

    fn terminate(&self) {
        // closing the channel ends the frame's listen loop
        lock(&self.events).take();
        let mut slot = lock(&self.isolate);
        slot.terminated = true;
        if let Some(handle) = &slot.handle {
            handle.terminate_execution();
        }
    }
}

#[async_trait]
impl FrameLauncher for InProcessLauncher {
    async fn launch(&self, boot: FrameBoot, bus: &MessageBus) -> Result<LaunchedFrame, SandboxError> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        let slot = Arc::new(Mutex::new(IsolateSlot::default()));
        let thread_slot = slot.clone();
        let outbox: Arc<dyn Outbox> = Arc::new(bus.clone());

        // V8 isolates are !Send, so each frame gets its own thread and runtime
        std::thread::Builder::new()
            .name("scrivener-frame".into())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to build frame runtime");
                        let _ = exit_tx.send(());
                        return;
                    }
                };
                let attach_slot = thread_slot.clone();
                rt.block_on(run_frame(boot, outbox, event_rx, move |handle| {
                    let mut slot = lock(&attach_slot);
                    if slot.terminated {
                        handle.terminate_execution();
                    }
                    slot.handle = Some(handle);
                }));
                lock(&thread_slot).handle = None;
                if exit_tx.send(()).is_err() {
                    tracing::debug!("frame exit receiver dropped");
                }
            })?;

        Ok(LaunchedFrame {
            control: Arc::new(InProcessControl {
                events: Mutex::new(Some(event_tx)),
                isolate: slot,
            }),
            exited: exit_rx,
        })
    }
}
