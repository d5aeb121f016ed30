//! In-process coordination service with session and ephemeral-node
//! semantics.
//!
//! One [MemCoord] plays the role of the external ensemble; every
//! participant opens its own session handle with [MemCoord::session].
//! Watches stay armed across events, so re-arming is a no-op and event
//! delivery is exact. Intended for tests and single-process deployments; a
//! ZooKeeper-family backend implements the same [Coordination] trait out
//! of tree.

use log::*;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use super::coord::{parent_of, Coordination, CoordEvent, EventTx, SessionState};
use crate::error::CoordError;

struct Node {
    data: String,
    ephemeral: bool,
    version: i32,
    owner: u64,
}

struct SessionEntry {
    events: EventTx,
    state: SessionState,
}

#[derive(Default)]
struct Store {
    // BTreeMap keeps children in a deterministic order
    nodes: BTreeMap<String, Node>,
    sessions: HashMap<u64, SessionEntry>,
    node_watches: HashMap<String, Vec<u64>>,
    child_watches: HashMap<String, Vec<u64>>,
    next_session: u64,
}

impl Store {
    /// Sinks of the sessions watching `path`. Watches stay armed across
    /// events here, so a consumer's re-arm is an idempotent no-op.
    fn node_watchers(&self, path: &str) -> Vec<EventTx> {
        self.node_watches
            .get(path)
            .into_iter()
            .flatten()
            .filter_map(|id| self.sessions.get(id).map(|s| s.events.clone()))
            .collect()
    }

    fn child_watchers(&self, path: &str) -> Vec<EventTx> {
        self.child_watches
            .get(path)
            .into_iter()
            .flatten()
            .filter_map(|id| self.sessions.get(id).map(|s| s.events.clone()))
            .collect()
    }

    /// Remove a node, returning the events to deliver.
    fn remove_node(&mut self, path: &str) -> Vec<(EventTx, CoordEvent)> {
        let mut out = Vec::new();
        if self.nodes.remove(path).is_none() {
            return out;
        }
        for tx in self.node_watchers(path) {
            out.push((tx, CoordEvent::Deleted(path.to_string())));
        }
        if let Some(parent) = parent_of(path) {
            for tx in self.child_watchers(parent) {
                out.push((tx, CoordEvent::ChildrenChanged(parent.to_string())));
            }
        }
        out
    }
}

/// The shared in-process registry store.
#[derive(Clone, Default)]
pub struct MemCoord {
    inner: Arc<Mutex<Store>>,
}

impl MemCoord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new session handle. Each registry client owns one.
    pub fn session(&self) -> MemSession {
        MemSession { inner: self.inner.clone(), id: Mutex::new(None) }
    }

    /// Expire a session as the ensemble would on timeout: its ephemeral
    /// nodes vanish (notifying watchers) and the session itself receives
    /// the expiration event. Test hook.
    pub fn expire_session(&self, session: &MemSession) {
        let Some(id) = *session.id.lock().unwrap() else {
            return;
        };
        let mut deliveries = Vec::new();
        {
            let mut store = self.inner.lock().unwrap();
            let owned: Vec<String> = store
                .nodes
                .iter()
                .filter(|(_, n)| n.ephemeral && n.owner == id)
                .map(|(p, _)| p.clone())
                .collect();
            for path in owned {
                deliveries.extend(store.remove_node(&path));
            }
            if let Some(entry) = store.sessions.get_mut(&id) {
                entry.state = SessionState::Expired;
                deliveries
                    .push((entry.events.clone(), CoordEvent::Session(SessionState::Expired)));
            }
        }
        deliver(deliveries);
    }
}

/// One session on a [MemCoord] store.
pub struct MemSession {
    inner: Arc<Mutex<Store>>,
    id: Mutex<Option<u64>>,
}

impl MemSession {
    fn session_id(&self) -> Result<u64, CoordError> {
        let id = self.id.lock().unwrap().ok_or(CoordError::NotConnected)?;
        let store = self.inner.lock().unwrap();
        match store.sessions.get(&id).map(|s| s.state) {
            Some(SessionState::Connected) => Ok(id),
            Some(SessionState::Expired) => Err(CoordError::SessionExpired),
            _ => Err(CoordError::NotConnected),
        }
    }
}

fn deliver(deliveries: Vec<(EventTx, CoordEvent)>) {
    for (tx, ev) in deliveries {
        // a receiver that went away is not an error
        let _ = tx.send(ev);
    }
}

impl Coordination for MemSession {
    fn connect(&self, events: EventTx) -> Result<(), CoordError> {
        let mut slot = self.id.lock().unwrap();
        if slot.is_some() {
            return Err(CoordError::Backend("session already open".to_string()));
        }
        let mut store = self.inner.lock().unwrap();
        store.next_session += 1;
        let id = store.next_session;
        let _ = events.send(CoordEvent::Session(SessionState::Connected));
        store
            .sessions
            .insert(id, SessionEntry { events, state: SessionState::Connected });
        *slot = Some(id);
        debug!("memcoord session {} opened", id);
        Ok(())
    }

    fn state(&self) -> SessionState {
        let Some(id) = *self.id.lock().unwrap() else {
            return SessionState::Connecting;
        };
        let store = self.inner.lock().unwrap();
        store
            .sessions
            .get(&id)
            .map(|s| s.state)
            .unwrap_or(SessionState::Connecting)
    }

    fn create(&self, path: &str, data: &str, ephemeral: bool) -> Result<(), CoordError> {
        let id = self.session_id()?;
        let mut deliveries = Vec::new();
        {
            let mut store = self.inner.lock().unwrap();
            if store.nodes.contains_key(path) {
                return Err(CoordError::NodeExists);
            }
            store.nodes.insert(
                path.to_string(),
                Node { data: data.to_string(), ephemeral, version: 0, owner: id },
            );
            for tx in store.node_watchers(path) {
                deliveries.push((tx, CoordEvent::Created(path.to_string(), data.to_string())));
            }
            if let Some(parent) = parent_of(path) {
                for tx in store.child_watchers(parent) {
                    deliveries.push((tx, CoordEvent::ChildrenChanged(parent.to_string())));
                }
            }
        }
        deliver(deliveries);
        Ok(())
    }

    fn exists(&self, path: &str) -> Result<Option<i32>, CoordError> {
        self.session_id()?;
        let store = self.inner.lock().unwrap();
        Ok(store.nodes.get(path).map(|n| n.version))
    }

    fn set(&self, path: &str, data: &str, version: i32) -> Result<(), CoordError> {
        self.session_id()?;
        let mut deliveries = Vec::new();
        {
            let mut store = self.inner.lock().unwrap();
            let node = store.nodes.get_mut(path).ok_or(CoordError::NoNode)?;
            if version >= 0 && version != node.version {
                return Err(CoordError::BadVersion);
            }
            node.data = data.to_string();
            node.version += 1;
            for tx in store.node_watchers(path) {
                deliveries.push((tx, CoordEvent::Changed(path.to_string(), data.to_string())));
            }
        }
        deliver(deliveries);
        Ok(())
    }

    fn get(&self, path: &str) -> Result<String, CoordError> {
        self.session_id()?;
        let store = self.inner.lock().unwrap();
        store
            .nodes
            .get(path)
            .map(|n| n.data.clone())
            .ok_or(CoordError::NoNode)
    }

    fn get_children(&self, path: &str) -> Result<Vec<String>, CoordError> {
        self.session_id()?;
        let store = self.inner.lock().unwrap();
        if !store.nodes.contains_key(path) {
            return Err(CoordError::NoNode);
        }
        let prefix = format!("{}/", path);
        let children = store
            .nodes
            .range(prefix.clone()..)
            .take_while(|(p, _)| p.starts_with(&prefix))
            .filter(|(p, _)| !p[prefix.len()..].contains('/'))
            .map(|(p, _)| p[prefix.len()..].to_string())
            .collect();
        Ok(children)
    }

    fn delete(&self, path: &str) -> Result<(), CoordError> {
        self.session_id()?;
        let deliveries = {
            let mut store = self.inner.lock().unwrap();
            if !store.nodes.contains_key(path) {
                return Err(CoordError::NoNode);
            }
            store.remove_node(path)
        };
        deliver(deliveries);
        Ok(())
    }

    fn watch(&self, path: &str) -> Result<(), CoordError> {
        let id = self.session_id()?;
        let mut store = self.inner.lock().unwrap();
        let entry = store.node_watches.entry(path.to_string()).or_default();
        if !entry.contains(&id) {
            entry.push(id);
        }
        Ok(())
    }

    fn watch_children(&self, path: &str) -> Result<(), CoordError> {
        let id = self.session_id()?;
        let mut store = self.inner.lock().unwrap();
        let entry = store.child_watches.entry(path.to_string()).or_default();
        if !entry.contains(&id) {
            entry.push(id);
        }
        Ok(())
    }

    fn close(&self) {
        let Some(id) = self.id.lock().unwrap().take() else {
            return;
        };
        let mut deliveries = Vec::new();
        {
            let mut store = self.inner.lock().unwrap();
            let owned: Vec<String> = store
                .nodes
                .iter()
                .filter(|(_, n)| n.ephemeral && n.owner == id)
                .map(|(p, _)| p.clone())
                .collect();
            for path in owned {
                deliveries.extend(store.remove_node(&path));
            }
            // dropping the entry drops the event sink, ending the consumer
            store.sessions.remove(&id);
            for list in store.node_watches.values_mut() {
                list.retain(|w| *w != id);
            }
            for list in store.child_watches.values_mut() {
                list.retain(|w| *w != id);
            }
        }
        deliver(deliveries);
        debug!("memcoord session {} closed", id);
    }
}

impl Drop for MemSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossfire::AsyncRx;

    fn open(store: &MemCoord) -> (MemSession, AsyncRx<CoordEvent>) {
        let session = store.session();
        let (tx, rx) = crossfire::mpsc::unbounded_async();
        session.connect(tx).unwrap();
        // swallow the initial connected event
        let ev = futures::executor::block_on(rx.recv()).unwrap();
        assert_eq!(ev, CoordEvent::Session(SessionState::Connected));
        (session, rx)
    }

    fn next(rx: &AsyncRx<CoordEvent>) -> CoordEvent {
        futures::executor::block_on(rx.recv()).unwrap()
    }

    #[test]
    fn test_create_get_set_delete() {
        let store = MemCoord::new();
        let (s, _rx) = open(&store);

        s.create("/S", "", false).unwrap();
        s.create("/S/a", "da", true).unwrap();
        assert_eq!(s.get("/S/a").unwrap(), "da");
        assert_eq!(s.exists("/S/a").unwrap(), Some(0));
        assert!(matches!(s.create("/S/a", "x", true), Err(CoordError::NodeExists)));

        s.set("/S/a", "db", 0).unwrap();
        assert_eq!(s.get("/S/a").unwrap(), "db");
        assert!(matches!(s.set("/S/a", "dc", 0), Err(CoordError::BadVersion)));
        s.set("/S/a", "dc", -1).unwrap();
        assert_eq!(s.get("/S/a").unwrap(), "dc");

        s.create("/S/b", "x", true).unwrap();
        assert_eq!(s.get_children("/S").unwrap(), vec!["a", "b"]);

        s.delete("/S/a").unwrap();
        assert!(matches!(s.get("/S/a"), Err(CoordError::NoNode)));
        assert!(matches!(s.delete("/S/a"), Err(CoordError::NoNode)));
    }

    #[test]
    fn test_watch_events_carry_data() {
        let store = MemCoord::new();
        let (watcher, rx) = open(&store);
        let (writer, _wrx) = open(&store);

        watcher.watch("/S/a").unwrap();
        writer.create("/S", "", false).unwrap();
        writer.create("/S/a", "d1", true).unwrap();
        assert_eq!(next(&rx), CoordEvent::Created("/S/a".to_string(), "d1".to_string()));

        // the watch stays armed; re-arming is a no-op
        watcher.watch("/S/a").unwrap();
        writer.set("/S/a", "d2", -1).unwrap();
        assert_eq!(next(&rx), CoordEvent::Changed("/S/a".to_string(), "d2".to_string()));

        writer.delete("/S/a").unwrap();
        assert_eq!(next(&rx), CoordEvent::Deleted("/S/a".to_string()));
    }

    #[test]
    fn test_ephemeral_cleanup_on_close() {
        let store = MemCoord::new();
        let (owner, _orx) = open(&store);
        let (observer, orx) = open(&store);

        owner.create("/S", "", false).unwrap();
        owner.create("/S/a", "d", true).unwrap();
        observer.watch("/S/a").unwrap();

        owner.close();
        assert_eq!(next(&orx), CoordEvent::Deleted("/S/a".to_string()));
        // persistent parent survives
        assert_eq!(observer.exists("/S").unwrap(), Some(0));
        assert_eq!(observer.exists("/S/a").unwrap(), None);
    }

    #[test]
    fn test_expire_session() {
        let store = MemCoord::new();
        let (victim, vrx) = open(&store);
        victim.create("/S", "", false).unwrap();
        victim.create("/S/a", "d", true).unwrap();

        store.expire_session(&victim);
        assert_eq!(next(&vrx), CoordEvent::Session(SessionState::Expired));
        assert_eq!(victim.state(), SessionState::Expired);
        assert!(matches!(victim.get("/S/a"), Err(CoordError::SessionExpired)));
    }

    #[test]
    fn test_child_watch() {
        let store = MemCoord::new();
        let (watcher, rx) = open(&store);
        let (writer, _wrx) = open(&store);

        writer.create("/S", "", false).unwrap();
        watcher.watch_children("/S").unwrap();
        writer.create("/S/a", "d", true).unwrap();
        assert_eq!(next(&rx), CoordEvent::ChildrenChanged("/S".to_string()));
    }
}
