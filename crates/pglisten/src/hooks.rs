//! Consumer callback registries
//!
//! Callbacks are invoked in registration order. The registry is snapshotted
//! before each invocation, so a callback may register further callbacks
//! without deadlocking. A panicking callback is logged and does not prevent
//! the remaining callbacks from running.

use parking_lot::RwLock;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::error;

use crate::controller::ListenerState;
use crate::error::Error;
use crate::notification::Notification;

/// Receives every delivered notification
pub type NotificationCallback = Arc<dyn Fn(&Notification) + Send + Sync>;

/// Receives non-fatal errors (dropped events, malformed payloads, rejected commands)
pub type ErrorCallback = Arc<dyn Fn(&Error) + Send + Sync>;

/// Receives listener state transitions
pub type StateCallback = Arc<dyn Fn(ListenerState) + Send + Sync>;

/// All registered consumer callbacks
#[derive(Default)]
pub struct Hooks {
    notification: RwLock<Vec<NotificationCallback>>,
    error: RwLock<Vec<ErrorCallback>>,
    state: RwLock<Vec<StateCallback>>,
}

impl Hooks {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a notification callback
    pub fn on_notification(&self, callback: NotificationCallback) {
        self.notification.write().push(callback);
    }

    /// Register an error callback
    pub fn on_error(&self, callback: ErrorCallback) {
        self.error.write().push(callback);
    }

    /// Register a state callback
    pub fn on_state_change(&self, callback: StateCallback) {
        self.state.write().push(callback);
    }

    /// Number of notification callbacks
    pub fn notification_callbacks(&self) -> usize {
        self.notification.read().len()
    }

    pub(crate) fn emit_notification(&self, notification: &Notification) {
        let callbacks = self.notification.read().clone();
        for callback in callbacks {
            guarded("notification", || callback(notification));
        }
    }

    pub(crate) fn emit_error(&self, err: &Error) {
        let callbacks = self.error.read().clone();
        for callback in callbacks {
            guarded("error", || callback(err));
        }
    }

    pub(crate) fn emit_state(&self, state: ListenerState) {
        let callbacks = self.state.read().clone();
        for callback in callbacks {
            guarded("state", || callback(state));
        }
    }
}

fn guarded(kind: &str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!(callback = kind, "consumer callback panicked");
    }
}
