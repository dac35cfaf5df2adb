//! Scrivener sandbox worker: isolated child process hosting one render frame.
//!
//! Spawned by [`scrivener_sandbox::host::WorkerLauncher`]. It reads a `Boot`
//! message from stdin, runs the frame in a V8 isolate, and relays every
//! message the frame posts to stdout. Host events (`Deliver`) arrive on stdin
//! for as long as the host keeps it open.
//!
//! **Security**: This process runs with a clean environment and holds nothing
//! but the render code and its datasets.

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use scrivener_sandbox::bus::Outbox;
use scrivener_sandbox::frame::{run_frame, IsolateHandle};
use scrivener_sandbox::ipc::{read_message, read_message_with_limit, write_message, ParentMessage, WorkerMessage};
use scrivener_sandbox::protocol::HostEvent;
use tokio::io::{self, BufReader};
use tokio::sync::mpsc;

/// Outbox that forwards frame posts to the IPC writer.
struct IpcOutbox(mpsc::UnboundedSender<WorkerMessage>);

impl Outbox for IpcOutbox {
    fn post(&self, message: serde_json::Value) {
        if self.0.send(WorkerMessage::Post { message }).is_err() {
            tracing::debug!("IPC writer gone, dropping frame message");
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Clean environment: remove all env vars for security isolation
    let env_keys: Vec<String> = std::env::vars().map(|(k, _)| k).collect();
    for key in env_keys {
        std::env::remove_var(&key);
    }

    // Set up minimal logging to stderr (parent inherits it only in debug mode)
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(tracing::Level::WARN)
        .init();

    let mut stdin = BufReader::new(io::stdin());
    let mut stdout = io::stdout();

    let msg: ParentMessage = read_message(&mut stdin)
        .await
        .context("failed to read initial message from parent")?
        .context("parent closed stdin before sending Boot")?;

    let (boot, max_ipc_size) = match msg {
        ParentMessage::Boot {
            boot,
            max_ipc_message_size,
        } => (boot, max_ipc_message_size),
        other => {
            anyhow::bail!("expected Boot message, got: {:?}", other);
        }
    };

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<WorkerMessage>();
    let (event_tx, event_rx) = mpsc::unbounded_channel::<HostEvent>();
    let isolate: Arc<Mutex<Option<IsolateHandle>>> = Arc::new(Mutex::new(None));

    // Spawn the frame on a dedicated thread (V8 isolates are !Send)
    let frame_isolate = isolate.clone();
    let frame_thread = std::thread::spawn(move || {
        let rt = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                let _ = out_tx.send(WorkerMessage::Log {
                    message: format!("failed to create tokio runtime: {e}"),
                });
                return;
            }
        };
        let outbox: Arc<dyn Outbox> = Arc::new(IpcOutbox(out_tx));
        rt.block_on(run_frame(boot, outbox, event_rx, move |handle| {
            if let Ok(mut slot) = frame_isolate.lock() {
                *slot = Some(handle);
            }
        }));
    });

    // Parent messages are read on their own task so a partial read is never
    // cancelled by the select below.
    let (in_tx, mut in_rx) = mpsc::unbounded_channel::<ParentMessage>();
    tokio::spawn(async move {
        loop {
            match read_message_with_limit::<ParentMessage, _>(&mut stdin, max_ipc_size).await {
                Ok(Some(msg)) => {
                    if in_tx.send(msg).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(error = %e, "failed to read from parent");
                    break;
                }
            }
        }
    });

    // IPC event loop: multiplex between
    // 1. Messages posted by the frame (relayed to the parent)
    // 2. Host events from the parent (delivered to the frame)
    let mut events = Some(event_tx);
    let mut parent_open = true;
    loop {
        tokio::select! {
            msg = out_rx.recv() => match msg {
                Some(worker_msg) => {
                    write_message(&mut stdout, &worker_msg)
                        .await
                        .context("failed to write message to parent")?;
                }
                // Every outbox handle is gone: the frame has exited
                None => break,
            },
            incoming = in_rx.recv(), if parent_open => match incoming {
                Some(ParentMessage::Deliver { event }) => {
                    if let Some(tx) = &events {
                        let _ = tx.send(event);
                    }
                }
                Some(ParentMessage::Boot { .. }) => {
                    tracing::warn!("unexpected second Boot from parent");
                }
                None => {
                    // Parent let go: end the listen loop and stop any running script
                    parent_open = false;
                    events = None;
                    if let Ok(slot) = isolate.lock() {
                        if let Some(handle) = slot.as_ref() {
                            handle.terminate_execution();
                        }
                    }
                }
            },
        }
    }

    let _ = frame_thread.join();

    // The stdin reader may still be parked in a blocking read.
    std::process::exit(0)
}
