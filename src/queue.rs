//! Outbound write queue shared between the engine and the writer thread.
//!
//! Cancellation never races the writer: every queued item carries the
//! generation counter current at enqueue time, and the writer re-checks the
//! live counter between chunks. Bumping the counter therefore stops stale
//! payloads mid-flight without tearing down the queue itself.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// How an utterance index surfaces to the host once the device reaches it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexMark {
    /// Host-supplied index; reported through the event channel.
    Caller(u32),
    /// Engine-internal end-of-utterance sentinel; triggers done-speaking,
    /// never surfaced as an index.
    EndOfUtterance,
}

/// What the writer does with an item besides pushing its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    /// Ordinary speech payload.
    Normal,
    /// Re-assert the full settings prefix (snapshot taken at write time).
    SettingsSync,
    /// Apply pending formant diffs (snapshot taken at write time).
    FormantSync,
    /// Mute plus re-enable of index marking; jumps the queue.
    Mute,
}

#[derive(Debug)]
pub struct WriteItem {
    pub payload: Vec<u8>,
    /// Marks embedded in the payload, in payload order.
    pub marks: Vec<IndexMark>,
    pub generation: u64,
    pub created_at: Instant,
    /// Cancelable items die on a generation bump and age out while offline.
    pub cancelable: bool,
    pub kind: WriteKind,
}

impl WriteItem {
    pub fn speech(payload: Vec<u8>, marks: Vec<IndexMark>, generation: u64) -> Self {
        Self {
            payload,
            marks,
            generation,
            created_at: Instant::now(),
            cancelable: true,
            kind: WriteKind::Normal,
        }
    }

    pub fn sync(kind: WriteKind, generation: u64) -> Self {
        Self {
            payload: Vec::new(),
            marks: Vec::new(),
            generation,
            created_at: Instant::now(),
            cancelable: false,
            kind,
        }
    }
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<WriteItem>,
    closed: bool,
}

/// Blocking FIFO with cancel-aware sweeping.
#[derive(Default)]
pub struct WriteQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl WriteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, item: WriteItem) {
        if let Ok(mut state) = self.state.lock() {
            if state.closed {
                return;
            }
            state.items.push_back(item);
            self.available.notify_one();
        }
    }

    /// Queue-jump for mute items: the stop must reach the device before
    /// whatever speech is still pending.
    pub fn push_front(&self, item: WriteItem) {
        if let Ok(mut state) = self.state.lock() {
            if state.closed {
                return;
            }
            state.items.push_front(item);
            self.available.notify_one();
        }
    }

    /// Pop the next item, waiting up to `timeout`. `None` on timeout or when
    /// the queue has been closed and drained.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<WriteItem> {
        let mut state = self.state.lock().ok()?;
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            if state.closed {
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (next, result) = self.available.wait_timeout(state, deadline - now).ok()?;
            state = next;
            if result.timed_out() && state.items.is_empty() {
                return None;
            }
        }
    }

    /// Requeue an item at the head (offline retry keeps FIFO order).
    pub fn requeue(&self, item: WriteItem) {
        if let Ok(mut state) = self.state.lock() {
            state.items.push_front(item);
            self.available.notify_one();
        }
    }

    /// Drop cancelable items and pending mute jumps; settings/formant syncs
    /// survive so device state still converges after a cancel. Returns
    /// whether any cancelable speech was dropped (mute jumps do not count).
    pub fn sweep_cancelable(&self) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        let had_speech = state.items.iter().any(|item| item.cancelable);
        state
            .items
            .retain(|item| !item.cancelable && item.kind != WriteKind::Mute);
        had_speech
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().map(|s| s.items.is_empty()).unwrap_or(true)
    }

    /// Close for shutdown: rejects further pushes and wakes the writer.
    pub fn close(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.closed = true;
            state.items.clear();
            self.available.notify_all();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().map(|s| s.closed).unwrap_or(true)
    }
}
