//! Contract of the external hierarchical coordination service.
//!
//! The registry client is written against this trait only. The service must
//! provide atomic create/set/delete/get/children over a `/`-separated
//! namespace, ephemeral nodes tied to the session, one-shot watches, and
//! session state events. Watch and session events are pushed into the
//! channel registered at [Coordination::connect]; the registry client
//! consumes them from its own event thread, so implementations never run
//! user code on their internal threads.

use crossfire::MTx;

use crate::error::CoordError;

/// Session states reported by the coordination service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Connecting,
    Expired,
}

/// Events pushed by the coordination service. Node events carry the full
/// path; creation and change events also carry the node data at the time
/// of the mutation, so consumers never race a re-read against later
/// writes.
#[derive(Debug, Clone, PartialEq)]
pub enum CoordEvent {
    Session(SessionState),
    Created(String, String),
    Changed(String, String),
    Deleted(String),
    /// The children of the path changed (a child was created or deleted).
    ChildrenChanged(String),
}

pub type EventTx = MTx<CoordEvent>;

/// A session-scoped handle to the coordination service.
pub trait Coordination: Send + Sync + 'static {
    /// Open the session and register the event sink. Events stop (and the
    /// sink is dropped) when the session closes.
    fn connect(&self, events: EventTx) -> Result<(), CoordError>;

    fn state(&self) -> SessionState;

    fn create(&self, path: &str, data: &str, ephemeral: bool) -> Result<(), CoordError>;

    /// `Some(version)` when the node exists.
    fn exists(&self, path: &str) -> Result<Option<i32>, CoordError>;

    /// Compare-and-set on `version`; pass -1 to overwrite unconditionally.
    fn set(&self, path: &str, data: &str, version: i32) -> Result<(), CoordError>;

    fn get(&self, path: &str) -> Result<String, CoordError>;

    /// Child names (last path segment) under `path`.
    fn get_children(&self, path: &str) -> Result<Vec<String>, CoordError>;

    fn delete(&self, path: &str) -> Result<(), CoordError>;

    /// Arm an existence watch on `path`; watching an absent node is valid
    /// and fires on a future creation. Delivery may be one-shot, so
    /// consumers re-arm after every event; arming an already-armed watch
    /// is a no-op.
    fn watch(&self, path: &str) -> Result<(), CoordError>;

    /// Arm a watch for child changes under `path`, with the same
    /// re-arming contract as [watch](Self::watch).
    fn watch_children(&self, path: &str) -> Result<(), CoordError>;

    /// Close the session; ephemeral nodes it owns disappear.
    fn close(&self);
}

/// Parent path of `path`, `None` for top-level nodes.
pub(crate) fn parent_of(path: &str) -> Option<&str> {
    let idx = path.rfind('/')?;
    if idx == 0 {
        return None;
    }
    Some(&path[..idx])
}

/// Service name of a registry path shaped `/<service>/<instance>`.
pub(crate) fn service_of(path: &str) -> Option<&str> {
    let mut parts = path.split('/');
    parts.next()?; // leading empty segment
    let service = parts.next()?;
    if service.is_empty() {
        return None;
    }
    Some(service)
}
