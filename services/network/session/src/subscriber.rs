//! Exactly-once stop notification.

use crate::error::{Code, ResultHandler};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::trace;

#[derive(Default)]
struct State {
    code: Option<Code>,
    handlers: Vec<ResultHandler>,
}

/// Fans a single terminal code out to every subscriber
///
/// Handlers subscribed before [`StopSubscriber::relay`] are invoked by the
/// relay; handlers subscribed afterwards are invoked immediately with the
/// recorded code. Either way each handler runs exactly once.
#[derive(Default)]
pub struct StopSubscriber {
    state: Mutex<State>,
}

impl StopSubscriber {
    /// Create an unstopped subscriber
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a handler for the stop code
    pub fn subscribe<F>(&self, handler: F)
    where
        F: FnOnce(Code) + Send + 'static,
    {
        let mut state = self.lock();
        match state.code.clone() {
            Some(code) => {
                drop(state);
                handler(code);
            }
            None => state.handlers.push(Box::new(handler)),
        }
    }

    /// Deliver the stop code, returns false if already relayed
    pub fn relay(&self, code: Code) -> bool {
        let handlers = {
            let mut state = self.lock();
            if state.code.is_some() {
                return false;
            }
            state.code = Some(code.clone());
            std::mem::take(&mut state.handlers)
        };

        trace!("Relaying stop to {} subscribers", handlers.len());
        for handler in handlers {
            handler(code.clone());
        }

        true
    }

    /// True once a code has been relayed
    pub fn stopped(&self) -> bool {
        self.lock().code.is_some()
    }

    /// The relayed code, if any
    pub fn code(&self) -> Option<Code> {
        self.lock().code.clone()
    }
}

impl std::fmt::Debug for StopSubscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("StopSubscriber")
            .field("code", &state.code)
            .field("handlers", &state.handlers.len())
            .finish()
    }
}
