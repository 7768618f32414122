//! FIFO admission gate — one holder at a time, waiters served in arrival order.
//!
//! Used twice: by the conductor as its run queue and by the beat executor as
//! the process-wide beat serializer.  Taking a place in line is synchronous
//! ([`FifoGate::enter`]); waiting for the turn is async
//! ([`GateEntry::acquired`]).  The slot is released when the [`GatePermit`]
//! drops, on success, failure or cancellation alike, and handed straight to
//! the next waiter that is still listening.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::oneshot;

/// The waiter was removed by [`FifoGate::clear`] before its turn came.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("waiter discarded from the gate queue")]
pub struct GateDiscarded;

struct Waiter<T> {
    ticket: u64,
    meta: T,
    wake: oneshot::Sender<()>,
}

struct GateState<T> {
    holder: Option<(u64, T)>,
    pending: VecDeque<Waiter<T>>,
    next_ticket: u64,
}

pub struct FifoGate<T> {
    state: Mutex<GateState<T>>,
}

impl<T: Clone> FifoGate<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(GateState {
                holder: None,
                pending: VecDeque::new(),
                next_ticket: 0,
            }),
        })
    }

    /// Take the slot if it is free, otherwise join the back of the queue.
    pub fn enter(self: &Arc<Self>, meta: T) -> GateEntry<T> {
        let mut state = self.lock();
        let ticket = state.next_ticket;
        state.next_ticket += 1;

        let wait = if state.holder.is_none() {
            state.holder = Some((ticket, meta));
            None
        } else {
            let (wake, rx) = oneshot::channel();
            state.pending.push_back(Waiter { ticket, meta, wake });
            Some(rx)
        };

        GateEntry {
            gate: Arc::clone(self),
            ticket,
            wait,
            armed: true,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.lock().holder.is_some()
    }

    /// Metadata of the current holder.
    pub fn holder(&self) -> Option<T> {
        self.lock().holder.as_ref().map(|(_, meta)| meta.clone())
    }

    /// Metadata of everyone waiting, front of the queue first.
    pub fn pending(&self) -> Vec<T> {
        self.lock().pending.iter().map(|w| w.meta.clone()).collect()
    }

    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Discard every waiter that has not started.  The current holder is
    /// unaffected.  Discarded waiters observe [`GateDiscarded`].
    pub fn clear(&self) -> Vec<T> {
        let drained: Vec<Waiter<T>> = self.lock().pending.drain(..).collect();
        drained.into_iter().map(|w| w.meta).collect()
    }

    fn lock(&self) -> MutexGuard<'_, GateState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, ticket: u64) {
        let mut state = self.lock();
        if state.holder.as_ref().is_some_and(|(held, _)| *held == ticket) {
            hand_off(&mut state);
        }
    }

    fn abandon(&self, ticket: u64) {
        let mut state = self.lock();
        if state.holder.as_ref().is_some_and(|(held, _)| *held == ticket) {
            hand_off(&mut state);
        } else {
            state.pending.retain(|w| w.ticket != ticket);
        }
    }
}

fn hand_off<T>(state: &mut GateState<T>) {
    state.holder = None;
    while let Some(waiter) = state.pending.pop_front() {
        // A failed send means the waiter stopped listening; skip it.
        if waiter.wake.send(()).is_ok() {
            state.holder = Some((waiter.ticket, waiter.meta));
            return;
        }
    }
}

/// A place in line.  Dropping it before it is converted gives up the place
/// (or the slot, if it had already been handed over).
pub struct GateEntry<T: Clone> {
    gate: Arc<FifoGate<T>>,
    ticket: u64,
    wait: Option<oneshot::Receiver<()>>,
    armed: bool,
}

impl<T: Clone> GateEntry<T> {
    /// Whether the slot was free at `enter` time.
    pub fn is_immediate(&self) -> bool {
        self.wait.is_none()
    }

    /// Wait for this entry's turn.
    pub async fn acquired(mut self) -> Result<GatePermit<T>, GateDiscarded> {
        if let Some(rx) = self.wait.take() {
            if rx.await.is_err() {
                self.armed = false;
                return Err(GateDiscarded);
            }
        }
        self.armed = false;
        Ok(GatePermit {
            gate: Arc::clone(&self.gate),
            ticket: self.ticket,
        })
    }
}

impl<T: Clone> Drop for GateEntry<T> {
    fn drop(&mut self) {
        if self.armed {
            self.gate.abandon(self.ticket);
        }
    }
}

/// Exclusive hold on the gate.  Released on drop.
pub struct GatePermit<T: Clone> {
    gate: Arc<FifoGate<T>>,
    ticket: u64,
}

impl<T: Clone> Drop for GatePermit<T> {
    fn drop(&mut self) {
        self.gate.release(self.ticket);
    }
}
