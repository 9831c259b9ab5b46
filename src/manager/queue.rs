use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::commands::CommandBuffer;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WaitResult {
    Ready,
    TimedOut,
    Closed,
}

#[derive(Default)]
struct QueueState {
    buffers: VecDeque<CommandBuffer>,
    closed: bool,
}

/// FIFO handoff of command buffers between the two threads. Pushing marks a buffer as handed off
/// and wakes waiters; closing wakes every waiter for good.
#[derive(Default)]
pub struct BufferQueue {
    state: Mutex<QueueState>,
    signal: Condvar,
}

impl BufferQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hands the buffer back if the queue has been closed.
    pub fn push(&self, mut buffer: CommandBuffer) -> Result<(), CommandBuffer> {
        let mut state = self.state.lock().expect("Queue Lock");
        if state.closed {
            return Err(buffer);
        }

        buffer.mark_handed_off();
        state.buffers.push_back(buffer);
        drop(state);
        self.signal.notify_all();
        Ok(())
    }

    /// Moves everything that is queued to the back of `out`, in order.
    pub fn drain_into(&self, out: &mut VecDeque<CommandBuffer>) -> usize {
        let mut state = self.state.lock().expect("Queue Lock");
        let count = state.buffers.len();
        out.append(&mut state.buffers);
        count
    }

    /// Blocks until something is queued, the queue is closed, or `timeout` has passed.
    pub fn wait(&self, timeout: Duration) -> WaitResult {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().expect("Queue Lock");
        loop {
            if !state.buffers.is_empty() {
                return WaitResult::Ready;
            }
            if state.closed {
                return WaitResult::Closed;
            }

            let now = Instant::now();
            if now >= deadline {
                return WaitResult::TimedOut;
            }

            state = self
                .signal
                .wait_timeout(state, deadline - now)
                .expect("Queue Lock")
                .0;
        }
    }

    /// Wakes all waiters without queueing anything.
    pub fn notify(&self) {
        self.signal.notify_all();
    }

    pub fn close(&self) {
        self.state.lock().expect("Queue Lock").closed = true;
        self.signal.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().expect("Queue Lock").closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("Queue Lock").buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops everything that is queued, returning how many buffers were discarded.
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock().expect("Queue Lock");
        let count = state.buffers.len();
        state.buffers.clear();
        count
    }
}
