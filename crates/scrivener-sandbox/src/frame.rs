//! Frame driver: boots a fresh V8 isolate and runs one render inside it.
//!
//! V8 isolates are `!Send`, so [`run_frame`] must be driven on a dedicated
//! thread with its own single-threaded tokio runtime. The in-process launcher
//! and the worker binary both do exactly that.
//!
//! Each frame walks these steps, posting a tagged `render-error` at the first
//! failure:
//!
//! | step | failure tag |
//! |---|---|
//! | bootstrap (DOM shim, console, helpers, lockdown) | `boot-eval failed:` |
//! | payload decode (base64 → UTF-8) | `boot-decode failed:` |
//! | preparse (nesting pre-scan + syntax check) | `preparse:` |
//! | evaluate render code | `eval user code:` (`uncaught:` on the raw path) |
//! | `render(mount, datasets, helpers)` | `eval user code:` |
//! | event loop after render | `uncaught:` / `unhandledrejection:` |

use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use deno_core::{v8, JsRuntime, PollEventLoopOptions, RuntimeOptions};
use oxc_allocator::Allocator;
use oxc_parser::Parser;
use oxc_span::SourceType;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::bus::Outbox;
use crate::ops::{sandbox_ext, FrameDatasets, FrameInbound, FrameOutbox};
use crate::protocol::{ExecutionToken, FrameEvent, HostEvent};

/// Frame bootstrap source.
pub const BOOTSTRAP_JS: &str = include_str!("js/bootstrap.js");

/// Thread-safe handle used to terminate a frame's isolate from another thread.
pub type IsolateHandle = v8::IsolateHandle;

/// Maximum bracket nesting depth accepted by the preparse step.
/// Prevents parser stack overflow on deeply nested input.
const MAX_NESTING_DEPTH: usize = 256;

/// How render code travels into the frame.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "source", rename_all = "snake_case")]
pub enum CodePayload {
    /// Base64 text, decoded and preparsed inside the frame.
    Encoded(String),
    /// Raw source, evaluated directly with no decode or preparse stage.
    Raw(String),
}

impl CodePayload {
    /// Encode `code` for the default boot path.
    pub fn encode(code: &str) -> Self {
        Self::Encoded(STANDARD.encode(code.as_bytes()))
    }
}

impl std::fmt::Debug for CodePayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Encoded(s) => write!(f, "Encoded({} bytes)", s.len()),
            Self::Raw(s) => write!(f, "Raw({} bytes)", s.len()),
        }
    }
}

/// Everything a frame needs to boot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameBoot {
    /// Token tagging every message this frame posts.
    pub token: ExecutionToken,
    /// Render code.
    pub payload: CodePayload,
    /// Datasets serialized as JSON.
    pub datasets_json: String,
    /// V8 heap ceiling in bytes.
    pub max_heap_size: usize,
    /// Keep `Deno` and code-generation primitives available. Debug only.
    #[serde(default)]
    pub relaxed: bool,
}

/// State for the near-heap-limit callback.
struct HeapLimitState {
    handle: v8::IsolateHandle,
    /// Whether the heap limit has been triggered. Uses AtomicBool so the callback
    /// can use a shared `&` reference instead of `&mut`.
    triggered: AtomicBool,
}

/// V8 near-heap-limit callback. Terminates execution and grants 1MB grace
/// for the termination to propagate cleanly.
extern "C" fn near_heap_limit_callback(
    data: *mut std::ffi::c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    // SAFETY: `data` points to the boxed `HeapLimitState` owned by `run_frame`,
    // which drops the runtime before the box. V8 only invokes this callback
    // while the isolate is executing.
    let state = unsafe { &*(data as *const HeapLimitState) };
    if !state.triggered.swap(true, Ordering::SeqCst) {
        state.handle.terminate_execution();
    }
    current_heap_limit + 1024 * 1024
}

/// Boot a fresh isolate and drive one render to completion.
///
/// Returns once the frame's context is finished: either the render failed,
/// the host closed `inbound`, or the isolate was terminated. `on_isolate`
/// receives a thread-safe handle as soon as the isolate exists so the host
/// can terminate it.
pub async fn run_frame(
    boot: FrameBoot,
    outbox: Arc<dyn Outbox>,
    inbound: mpsc::UnboundedReceiver<HostEvent>,
    on_isolate: impl FnOnce(IsolateHandle),
) {
    let frame_outbox = FrameOutbox {
        token: boot.token.clone(),
        outbox: outbox.clone(),
    };
    frame_outbox.emit(&FrameEvent::BootStarted);

    let mut runtime = create_runtime(&boot, frame_outbox, inbound);
    on_isolate(runtime.v8_isolate().thread_safe_handle());

    let heap_state = Box::new(HeapLimitState {
        handle: runtime.v8_isolate().thread_safe_handle(),
        triggered: AtomicBool::new(false),
    });
    runtime.v8_isolate().add_near_heap_limit_callback(
        near_heap_limit_callback,
        &*heap_state as *const HeapLimitState as *mut std::ffi::c_void,
    );

    let result = drive(&mut runtime, &boot).await;

    if let Err(message) = result {
        let message = if heap_state.triggered.load(Ordering::SeqCst) {
            "heap limit exceeded".to_string()
        } else {
            message
        };
        tracing::debug!(error = %message, "frame failed");
        outbox.post(FrameEvent::error(message).to_message(&boot.token));
    }

    drop(runtime);
    drop(heap_state);
}

/// Create a fresh JsRuntime with the frame extension loaded and V8 heap limits set.
fn create_runtime(
    boot: &FrameBoot,
    outbox: FrameOutbox,
    inbound: mpsc::UnboundedReceiver<HostEvent>,
) -> JsRuntime {
    let create_params = v8::CreateParams::default().heap_limits(0, boot.max_heap_size);

    let mut runtime = JsRuntime::new(RuntimeOptions {
        extensions: vec![sandbox_ext::init_ops_and_esm()],
        create_params: Some(create_params),
        ..Default::default()
    });

    {
        let state = runtime.op_state();
        let mut state = state.borrow_mut();
        state.put(outbox);
        state.put(FrameDatasets(boot.datasets_json.clone()));
        state.put(FrameInbound(Rc::new(AsyncMutex::new(inbound))));
    }

    runtime
}

async fn drive(runtime: &mut JsRuntime, boot: &FrameBoot) -> Result<(), String> {
    runtime
        .execute_script("[scrivener:bootstrap]", bootstrap_source(boot.relaxed))
        .map_err(|e| format!("boot-eval failed: {e}"))?;

    let (code, raw) = match &boot.payload {
        CodePayload::Encoded(encoded) => (
            decode_payload(encoded).map_err(|e| format!("boot-decode failed: {e}"))?,
            false,
        ),
        CodePayload::Raw(code) => (code.clone(), true),
    };

    if !raw {
        preparse(&code).map_err(|e| format!("preparse: {e}"))?;
    }

    runtime
        .execute_script("[scrivener:render]", code)
        .map_err(|e| {
            if raw {
                format!("uncaught: {e}")
            } else {
                format!("eval user code: {e}")
            }
        })?;

    runtime
        .execute_script("[scrivener:start]", "__scrivenerFrame.start();")
        .map_err(|e| format!("uncaught: {e}"))?;

    runtime
        .run_event_loop(PollEventLoopOptions::default())
        .await
        .map_err(|e| classify_loop_error(&e.to_string()))
}

/// Bootstrap invocation for a frame.
pub fn bootstrap_source(relaxed: bool) -> String {
    format!("{BOOTSTRAP_JS}(Deno.core, {relaxed});")
}

fn decode_payload(encoded: &str) -> Result<String, String> {
    let bytes = STANDARD.decode(encoded.trim()).map_err(|e| e.to_string())?;
    String::from_utf8(bytes).map_err(|e| e.to_string())
}

fn classify_loop_error(message: &str) -> String {
    if message.contains("(in promise)") {
        format!("unhandledrejection: {message}")
    } else {
        format!("uncaught: {message}")
    }
}

/// Syntax-check render code without running it.
pub fn preparse(code: &str) -> Result<(), String> {
    check_nesting_depth(code)?;

    let allocator = Allocator::default();
    let ret = Parser::new(&allocator, code, SourceType::cjs()).parse();

    if ret.panicked {
        return Err("parser panicked on malformed input".into());
    }
    if let Some(first) = ret.errors.first() {
        return Err(first.to_string());
    }
    Ok(())
}

/// Lexical context of the nesting pre-scan.
#[derive(Clone, Copy)]
enum ScanMode {
    Code,
    Quoted(char),
    Template,
    LineComment,
    BlockComment,
}

/// Check nesting depth of brackets/braces/parens before parsing.
///
/// Brackets inside string literals, template text and comments are skipped;
/// template substitutions (`${...}`) count as code. Regex literals are not
/// recognized, so brackets inside them still count.
fn check_nesting_depth(code: &str) -> Result<(), String> {
    let mut depth: usize = 0;
    let mut max_depth: usize = 0;
    // depth at which each open template substitution started
    let mut substitutions: Vec<usize> = Vec::new();
    let mut mode = ScanMode::Code;
    let mut chars = code.chars().peekable();

    while let Some(ch) = chars.next() {
        match mode {
            ScanMode::Code => match ch {
                '/' if chars.peek() == Some(&'/') => {
                    chars.next();
                    mode = ScanMode::LineComment;
                }
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    mode = ScanMode::BlockComment;
                }
                '\'' | '"' => mode = ScanMode::Quoted(ch),
                '`' => mode = ScanMode::Template,
                '{' | '[' | '(' => {
                    depth += 1;
                    max_depth = max_depth.max(depth);
                }
                '}' if substitutions.last() == Some(&depth) => {
                    substitutions.pop();
                    depth = depth.saturating_sub(1);
                    mode = ScanMode::Template;
                }
                '}' | ']' | ')' => {
                    depth = depth.saturating_sub(1);
                }
                _ => {}
            },
            ScanMode::Quoted(quote) => match ch {
                '\\' => {
                    chars.next();
                }
                '\n' => mode = ScanMode::Code,
                c if c == quote => mode = ScanMode::Code,
                _ => {}
            },
            ScanMode::Template => match ch {
                '\\' => {
                    chars.next();
                }
                '`' => mode = ScanMode::Code,
                '$' if chars.peek() == Some(&'{') => {
                    chars.next();
                    depth += 1;
                    max_depth = max_depth.max(depth);
                    substitutions.push(depth);
                    mode = ScanMode::Code;
                }
                _ => {}
            },
            ScanMode::LineComment => {
                if ch == '\n' {
                    mode = ScanMode::Code;
                }
            }
            ScanMode::BlockComment => {
                if ch == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    mode = ScanMode::Code;
                }
            }
        }
    }

    if max_depth > MAX_NESTING_DEPTH {
        return Err(format!(
            "nesting too deep ({max_depth} levels, max {MAX_NESTING_DEPTH})"
        ));
    }
    Ok(())
}
