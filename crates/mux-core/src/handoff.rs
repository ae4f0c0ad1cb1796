//! Unbuffered rendezvous handoff.
//!
//! A value passes from an offering side to a receiving side only when a
//! receiver is already waiting. [`Handoff::try_offer`] never blocks: with no
//! registered receiver it hands the value back. There is no queue of values,
//! only a queue of waiting receivers.
//!
//! Receivers register with [`Handoff::waiter`] and then await the returned
//! [`Waiter`]. Registering before checking some other condition lets callers
//! avoid missing an offer made in between.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::oneshot;

/// Why an offer was not taken. The value is handed back.
#[derive(Debug, Error)]
pub enum TryOfferError<T> {
    #[error("no receiver waiting")]
    NoReceiver(T),

    #[error("handoff closed")]
    Closed(T),
}

impl<T> TryOfferError<T> {
    pub fn into_inner(self) -> T {
        match self {
            Self::NoReceiver(v) | Self::Closed(v) => v,
        }
    }
}

struct State<T> {
    waiters: VecDeque<oneshot::Sender<T>>,
    closed: bool,
}

/// Rendezvous channel endpoint. Clones share the same channel.
pub struct Handoff<T> {
    shared: Arc<Mutex<State<T>>>,
}

impl<T> Clone for Handoff<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Default for Handoff<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Handoff<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("Handoff")
            .field("waiters", &state.waiters.len())
            .field("closed", &state.closed)
            .finish()
    }
}

impl<T> Handoff<T> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(State {
                waiters: VecDeque::new(),
                closed: false,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, State<T>> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register as a waiting receiver. Returns `None` once closed.
    pub fn waiter(&self) -> Option<Waiter<T>> {
        let mut state = self.state();
        if state.closed {
            return None;
        }
        // Drop registrations whose receiver went away.
        state.waiters.retain(|tx| !tx.is_closed());

        let (tx, rx) = oneshot::channel();
        state.waiters.push_back(tx);
        Some(Waiter { rx })
    }

    /// Wait for the next offered value. `None` means the handoff was closed.
    pub async fn recv(&self) -> Option<T> {
        self.waiter()?.recv().await
    }

    /// Hand `value` to a waiting receiver without blocking.
    pub fn try_offer(&self, value: T) -> Result<(), TryOfferError<T>> {
        let mut state = self.state();
        if state.closed {
            return Err(TryOfferError::Closed(value));
        }

        let mut value = value;
        while let Some(tx) = state.waiters.pop_front() {
            match tx.send(value) {
                Ok(()) => return Ok(()),
                Err(returned) => value = returned,
            }
        }
        Err(TryOfferError::NoReceiver(value))
    }

    /// Close the handoff. Every waiting receiver observes `None`.
    pub fn close(&self) {
        let mut state = self.state();
        state.closed = true;
        state.waiters.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Whether a live receiver is currently registered.
    pub fn has_waiter(&self) -> bool {
        self.state().waiters.iter().any(|tx| !tx.is_closed())
    }
}

/// A registered receiver. Dropping it withdraws the registration.
#[derive(Debug)]
pub struct Waiter<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> Waiter<T> {
    /// Wait for an offer. `None` means the handoff was closed.
    pub async fn recv(self) -> Option<T> {
        self.rx.await.ok()
    }
}
