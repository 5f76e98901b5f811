//! Cancelable one-shot timer.
//!
//! A [`Deadline`] invokes its handler with `Ok(())` when the duration elapses,
//! or with [`NetworkError::OperationCanceled`] if it is stopped, re-armed or
//! dropped first. Firing and stopping race by design; handlers must re-check
//! their owner's state before acting on a fire.

use crate::error::{Code, NetworkError};
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::trace;

#[derive(Default)]
struct Slot {
    generation: u64,
    cancel: Option<oneshot::Sender<()>>,
}

/// One-shot deadline timer
pub struct Deadline {
    duration: Duration,
    slot: Arc<Mutex<Slot>>,
    arms: AtomicUsize,
}

impl Deadline {
    /// Create an idle timer
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            slot: Arc::new(Mutex::new(Slot::default())),
            arms: AtomicUsize::new(0),
        }
    }

    fn lock(slot: &Mutex<Slot>) -> MutexGuard<'_, Slot> {
        slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Arm the timer, canceling any outstanding arm
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<F>(&self, handler: F)
    where
        F: FnOnce(Code) + Send + 'static,
    {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let generation = {
            let mut slot = Self::lock(&self.slot);
            slot.generation = slot.generation.wrapping_add(1);
            if let Some(previous) = slot.cancel.replace(cancel_tx) {
                let _ = previous.send(());
            }
            slot.generation
        };

        self.arms.fetch_add(1, Ordering::Relaxed);
        trace!("Deadline armed for {:?} (generation {})", self.duration, generation);

        let slot = Arc::downgrade(&self.slot);
        let duration = self.duration;
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(duration) => {
                    // A superseded arm reports cancellation, never a fire.
                    let current = match slot.upgrade() {
                        Some(slot) => {
                            let mut slot = Self::lock(&slot);
                            let current = slot.generation == generation;
                            if current {
                                slot.cancel = None;
                            }
                            current
                        }
                        None => false,
                    };

                    if current {
                        handler(Ok(()));
                    } else {
                        handler(Err(NetworkError::OperationCanceled));
                    }
                }
                _ = cancel_rx => handler(Err(NetworkError::OperationCanceled)),
            }
        });
    }

    /// Cancel the outstanding arm, a no-op when idle
    pub fn stop(&self) {
        if let Some(cancel) = Self::lock(&self.slot).cancel.take() {
            let _ = cancel.send(());
        }
    }

    /// True while an arm is outstanding
    pub fn armed(&self) -> bool {
        Self::lock(&self.slot).cancel.is_some()
    }

    /// Number of times the timer has been armed
    pub fn arm_count(&self) -> usize {
        self.arms.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Deadline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deadline")
            .field("duration", &self.duration)
            .field("armed", &self.armed())
            .field("arms", &self.arm_count())
            .finish()
    }
}

/// Jitter a duration into `[duration / 2, duration]`
pub fn randomize(duration: Duration) -> Duration {
    let floor = duration / 2;
    if floor == duration {
        return duration;
    }

    rand::thread_rng().gen_range(floor..=duration)
}
