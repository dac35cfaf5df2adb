//! deno_core op definitions for the render frame.
//!
//! The `#[op2]` macro generates additional public items (v8 function pointers,
//! metadata structs) that cannot carry doc comments. We suppress `missing_docs`
//! at the module level; all actual functions and types are documented below.
#![allow(missing_docs)]

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use deno_core::op2;
use deno_core::OpState;
use deno_error::JsErrorBox;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::bus::Outbox;
use crate::protocol::{ExecutionToken, FrameEvent, HostEvent};

/// Where frame posts go, and the token that tags them.
///
/// The token lives only on the Rust side of the frame; script code never sees
/// it.
pub struct FrameOutbox {
    pub token: ExecutionToken,
    pub outbox: Arc<dyn Outbox>,
}

impl FrameOutbox {
    /// Tag and post one event.
    pub fn emit(&self, event: &FrameEvent) {
        self.outbox.post(event.to_message(&self.token));
    }
}

/// Datasets JSON handed to the frame at boot.
pub struct FrameDatasets(pub String);

/// Host events waiting for the frame's listen loop.
pub struct FrameInbound(pub Rc<AsyncMutex<mpsc::UnboundedReceiver<HostEvent>>>);

/// Post a message to the host.
///
/// Payloads that do not form a known frame event are dropped here so a frame
/// can never put arbitrary shapes on the bus.
#[op2(fast)]
pub fn op_sandbox_post(state: &mut OpState, #[string] json: &str) {
    let event: FrameEvent = match serde_json::from_str(json) {
        Ok(event) => event,
        Err(e) => {
            tracing::debug!(error = %e, "frame posted an unrecognized message");
            return;
        }
    };
    state.borrow::<FrameOutbox>().emit(&event);
}

/// Read the datasets JSON.
#[op2]
#[string]
pub fn op_sandbox_datasets(state: &mut OpState) -> String {
    state.borrow::<FrameDatasets>().0.clone()
}

/// Wait for the next host event. Resolves to an empty string once the host
/// has let go of the frame.
#[op2(async)]
#[string]
pub async fn op_sandbox_next_event(op_state: Rc<RefCell<OpState>>) -> Result<String, JsErrorBox> {
    let inbound = {
        let st = op_state.borrow();
        st.borrow::<FrameInbound>().0.clone()
    };
    let mut rx = inbound.lock().await;
    match rx.recv().await {
        Some(event) => serde_json::to_string(&event)
            .map_err(|e| JsErrorBox::generic(format!("host event serialization failed: {e}"))),
        None => Ok(String::new()),
    }
}

deno_core::extension!(
    sandbox_ext,
    ops = [op_sandbox_post, op_sandbox_datasets, op_sandbox_next_event],
);
