//! Per-call status holder shared between the caller and the channel.

use log::*;
use std::sync::Mutex;

pub type CancelCallback = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct CtrlState {
    failed: bool,
    error_text: String,
    cancelled: bool,
    cancel_cb: Option<CancelCallback>,
}

/// Mutable status of one call: failure flag plus message, cancel flag, and
/// at most one cancel callback.
///
/// The caller owns the controller; the channel borrows it for the duration
/// of a call. `set_failed` and `start_cancel` are monotonic until
/// [reset](Self::reset). Callbacks always fire with the internal lock
/// released.
#[derive(Default)]
pub struct XrpcController {
    state: Mutex<CtrlState>,
}

impl XrpcController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear failure, cancellation and the callback slot.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.failed = false;
        state.error_text.clear();
        state.cancelled = false;
        state.cancel_cb = None;
    }

    pub fn failed(&self) -> bool {
        self.state.lock().unwrap().failed
    }

    pub fn error_text(&self) -> String {
        self.state.lock().unwrap().error_text.clone()
    }

    pub fn set_failed<S: Into<String>>(&self, reason: S) {
        let reason = reason.into();
        error!("rpc call failed: {}", reason);
        let mut state = self.state.lock().unwrap();
        state.failed = true;
        state.error_text = reason;
    }

    /// Request cancellation. Idempotent; on the first transition the
    /// registered callback (if any) runs exactly once.
    pub fn start_cancel(&self) {
        let cb = {
            let mut state = self.state.lock().unwrap();
            if state.cancelled {
                return;
            }
            state.cancelled = true;
            state.cancel_cb.take()
        };
        if let Some(cb) = cb {
            cb();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.lock().unwrap().cancelled
    }

    /// Register the cancel callback, replacing any previous one. If the
    /// call is already cancelled the callback runs immediately.
    pub fn notify_on_cancel(&self, cb: CancelCallback) {
        {
            let mut state = self.state.lock().unwrap();
            if !state.cancelled {
                state.cancel_cb = Some(cb);
                return;
            }
        }
        cb();
    }
}
