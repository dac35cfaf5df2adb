//! Caller-owned mount containers and the frames appended to them.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};

use crate::launcher::FrameControl;
use crate::protocol::HostEvent;

static NEXT_FRAME_ID: AtomicU64 = AtomicU64::new(1);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A mounted isolated context.
///
/// The host side of a frame only ever sees what the frame chose to post: its
/// rendered HTML snapshot and lifecycle state. There is no synchronous access
/// to the frame's globals.
pub struct Frame {
    id: u64,
    control: Arc<dyn FrameControl>,
    document: RwLock<String>,
    live: AtomicBool,
    injected: Mutex<Vec<String>>,
}

impl Frame {
    pub(crate) fn new(control: Arc<dyn FrameControl>) -> Self {
        Self {
            id: NEXT_FRAME_ID.fetch_add(1, Ordering::Relaxed),
            control,
            document: RwLock::new(String::new()),
            live: AtomicBool::new(true),
            injected: Mutex::new(Vec::new()),
        }
    }

    /// Process-unique frame id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Latest HTML snapshot of the frame's mount element.
    pub fn document_html(&self) -> String {
        self.document
            .read()
            .map(|doc| doc.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// Whether the frame's context is still running.
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Script sources injected into this frame. Only recorded in debug mode.
    pub fn injected_scripts(&self) -> Vec<String> {
        lock(&self.injected).clone()
    }

    /// Dispatch a synthetic click on the first element matching `selector`.
    ///
    /// Returns `false` when the frame is no longer live.
    pub fn click(&self, selector: impl Into<String>) -> bool {
        self.is_live()
            && self.control.deliver(HostEvent::Click {
                selector: selector.into(),
            })
    }

    pub(crate) fn deliver(&self, event: HostEvent) -> bool {
        self.is_live() && self.control.deliver(event)
    }

    pub(crate) fn terminate(&self) {
        self.live.store(false, Ordering::SeqCst);
        self.control.terminate();
    }

    pub(crate) fn mark_exited(&self) {
        self.live.store(false, Ordering::SeqCst);
    }

    pub(crate) fn set_document(&self, html: String) {
        match self.document.write() {
            Ok(mut doc) => *doc = html,
            Err(poisoned) => *poisoned.into_inner() = html,
        }
    }

    pub(crate) fn record_injected(&self, source: impl Into<String>) {
        lock(&self.injected).push(source.into());
    }
}

// The mount owns frames; letting go of the last handle ends the context.
impl Drop for Frame {
    fn drop(&mut self) {
        self.control.terminate();
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("id", &self.id)
            .field("live", &self.is_live())
            .finish()
    }
}

/// A container the caller owns. The runner only appends and removes frames.
#[derive(Clone, Default)]
pub struct Mount {
    frames: Arc<Mutex<Vec<Arc<Frame>>>>,
}

impl Mount {
    /// Create an empty mount.
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames currently attached, in append order.
    pub fn frames(&self) -> Vec<Arc<Frame>> {
        lock(&self.frames).clone()
    }

    /// Number of attached frames.
    pub fn len(&self) -> usize {
        lock(&self.frames).len()
    }

    /// Whether no frames are attached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The most recently appended frame.
    pub fn last_frame(&self) -> Option<Arc<Frame>> {
        lock(&self.frames).last().cloned()
    }

    /// Detach every frame. Frames no longer held elsewhere are terminated.
    pub fn clear(&self) {
        let frames = std::mem::take(&mut *lock(&self.frames));
        drop(frames);
    }

    pub(crate) fn append(&self, frame: Arc<Frame>) {
        lock(&self.frames).push(frame);
    }

    pub(crate) fn remove(&self, frame_id: u64) -> bool {
        let mut frames = lock(&self.frames);
        let before = frames.len();
        frames.retain(|f| f.id() != frame_id);
        frames.len() != before
    }

    pub(crate) fn downgrade(&self) -> WeakMount {
        WeakMount {
            frames: Arc::downgrade(&self.frames),
        }
    }
}

/// A mount reference that does not keep the caller's frames alive.
#[derive(Clone)]
pub(crate) struct WeakMount {
    frames: Weak<Mutex<Vec<Arc<Frame>>>>,
}

impl WeakMount {
    pub(crate) fn remove(&self, frame_id: u64) -> bool {
        match self.frames.upgrade() {
            Some(frames) => Mount { frames }.remove(frame_id),
            None => false,
        }
    }
}

impl std::fmt::Debug for Mount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mount").field("frames", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingControl {
        delivered: AtomicUsize,
        terminated: AtomicBool,
    }

    impl FrameControl for CountingControl {
        fn deliver(&self, _event: HostEvent) -> bool {
            self.delivered.fetch_add(1, Ordering::SeqCst);
            true
        }

        fn terminate(&self) {
            self.terminated.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn append_and_remove_frames() {
        let mount = Mount::new();
        let a = Arc::new(Frame::new(Arc::new(CountingControl::default())));
        let b = Arc::new(Frame::new(Arc::new(CountingControl::default())));
        mount.append(a.clone());
        mount.append(b.clone());
        assert_eq!(mount.len(), 2);
        assert_eq!(mount.last_frame().unwrap().id(), b.id());

        assert!(mount.remove(a.id()));
        assert!(!mount.remove(a.id()));
        assert_eq!(mount.frames().len(), 1);
    }

    #[test]
    fn clones_share_frames() {
        let mount = Mount::new();
        let view = mount.clone();
        mount.append(Arc::new(Frame::new(Arc::new(CountingControl::default()))));
        assert!(!view.is_empty());
    }

    #[test]
    fn terminated_frame_rejects_clicks() {
        let control = Arc::new(CountingControl::default());
        let frame = Frame::new(control.clone());
        assert!(frame.click("a"));
        frame.terminate();
        assert!(!frame.is_live());
        assert!(!frame.click("a"));
        assert_eq!(control.delivered.load(Ordering::SeqCst), 1);
        assert!(control.terminated.load(Ordering::SeqCst));
    }

    #[test]
    fn dropping_last_handle_terminates() {
        let control = Arc::new(CountingControl::default());
        let mount = Mount::new();
        mount.append(Arc::new(Frame::new(control.clone())));
        assert!(!control.terminated.load(Ordering::SeqCst));
        mount.clear();
        assert!(mount.is_empty());
        assert!(control.terminated.load(Ordering::SeqCst));
    }

    #[test]
    fn weak_mount_does_not_outlive_caller() {
        let control = Arc::new(CountingControl::default());
        let mount = Mount::new();
        let frame = Arc::new(Frame::new(control.clone()));
        let id = frame.id();
        mount.append(frame);
        let weak = mount.downgrade();
        assert!(weak.remove(id));

        let mount = Mount::new();
        let frame = Arc::new(Frame::new(control));
        let id = frame.id();
        mount.append(frame);
        let weak = mount.downgrade();
        drop(mount);
        assert!(!weak.remove(id));
    }

    #[test]
    fn document_snapshot_is_replaced() {
        let frame = Frame::new(Arc::new(CountingControl::default()));
        assert_eq!(frame.document_html(), "");
        frame.set_document("<p>one</p>".into());
        frame.set_document("<p>two</p>".into());
        assert_eq!(frame.document_html(), "<p>two</p>");
    }
}
