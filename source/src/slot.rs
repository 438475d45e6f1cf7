use qrscan_common::frame::{Frame, FrameSource, ReadyState};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Default)]
struct SlotState {
    frame: Option<Frame>,
    ready: bool,
    published: u64,
    overwritten: u64,
}

/// Single-frame mailbox between a capture task and the scan pipeline.
///
/// Publishing replaces any frame that was not taken yet, so a slow reader
/// always sees the newest frame and nothing queues up behind it.
#[derive(Clone, Default)]
pub struct LatestFrame {
    inner: Arc<Mutex<SlotState>>,
}

impl LatestFrame {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn publish(&self, frame: Frame) {
        let mut state = self.lock();
        if state.frame.replace(frame).is_some() {
            state.overwritten += 1;
        }
        state.published += 1;
        state.ready = true;
    }

    /// Take the newest unread frame, if any.
    pub fn take(&self) -> Option<Frame> {
        self.lock().frame.take()
    }

    pub fn is_ready(&self) -> bool {
        self.lock().ready
    }

    /// Frames published so far and how many of them were never read.
    pub fn counters(&self) -> (u64, u64) {
        let state = self.lock();
        (state.published, state.overwritten)
    }

    /// Drop any pending frame and mark the slot not ready.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.frame = None;
        state.ready = false;
    }
}

/// [`FrameSource`] backed by a [`LatestFrame`] slot and the task that fills it.
pub struct SlotSource {
    slot: LatestFrame,
    task: Option<JoinHandle<()>>,
    name: String,
}

impl SlotSource {
    pub fn new(slot: LatestFrame, task: Option<JoinHandle<()>>, name: impl Into<String>) -> Self {
        Self {
            slot,
            task,
            name: name.into(),
        }
    }

    pub fn slot(&self) -> &LatestFrame {
        &self.slot
    }
}

impl FrameSource for SlotSource {
    fn ready_state(&self) -> ReadyState {
        if self.slot.is_ready() {
            ReadyState::Ready
        } else {
            ReadyState::NotReady
        }
    }

    fn current_frame(&mut self) -> Option<Frame> {
        self.slot.take()
    }

    fn release(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!(source = self.name, "capture task aborted");
        }
        let (published, overwritten) = self.slot.counters();
        self.slot.reset();
        info!(source = self.name, published, overwritten, "frame source released");
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for SlotSource {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
