//! Caching, watchable client over the coordination service.
//!
//! The registry client publishes ephemeral service-instance nodes and
//! discovers them, keeping an in-process cache of
//! `service -> [(path, data)]`. Watch and session events arrive on a
//! channel consumed by a dedicated event thread; a heartbeat thread prunes
//! cache entries whose nodes vanished without a delete event reaching us.
//!
//! Locking: `session` serializes every call into the coordination handle,
//! `cache` protects the service cache and the watcher table. User watch
//! callbacks are invoked with neither lock held.

mod coord;
mod memory;

pub use coord::{Coordination, CoordEvent, EventTx, SessionState};
pub use memory::{MemCoord, MemSession};

use coord::{parent_of, service_of};
use crossfire::AsyncRx;
use log::*;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use crate::error::CoordError;

pub type WatchCallback = Arc<dyn Fn(&str) + Send + Sync + 'static>;

const CONNECT_RETRIES: usize = 5;
const CONNECT_BACKOFF: Duration = Duration::from_millis(1000);
const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(10);

#[derive(Default)]
struct CacheState {
    /// service name -> instances as (full path, node data), no duplicate paths
    services: HashMap<String, Vec<(String, String)>>,
    /// one callback per path, last registration wins
    watchers: HashMap<String, WatchCallback>,
    connected: bool,
}

struct RegInner<C: Coordination> {
    coord: C,
    session: Mutex<()>,
    cache: Mutex<CacheState>,
    stop_pair: (Mutex<bool>, Condvar),
    heartbeat_interval: Duration,
}

pub struct RegistryClient<C: Coordination> {
    inner: Arc<RegInner<C>>,
    started: AtomicBool,
    hb_thread: Mutex<Option<thread::JoinHandle<()>>>,
    ev_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl<C: Coordination> RegistryClient<C> {
    pub fn new(coord: C) -> Self {
        Self::with_heartbeat(coord, DEFAULT_HEARTBEAT)
    }

    pub fn with_heartbeat(coord: C, heartbeat_interval: Duration) -> Self {
        Self {
            inner: Arc::new(RegInner {
                coord,
                session: Mutex::new(()),
                cache: Mutex::new(CacheState::default()),
                stop_pair: (Mutex::new(false), Condvar::new()),
                heartbeat_interval,
            }),
            started: AtomicBool::new(false),
            hb_thread: Mutex::new(None),
            ev_thread: Mutex::new(None),
        }
    }

    /// The underlying coordination handle.
    pub fn coord(&self) -> &C {
        &self.inner.coord
    }

    pub fn is_connected(&self) -> bool {
        self.inner.cache.lock().unwrap().connected
    }

    /// Open the session, wait for it to connect (bounded retries with
    /// backoff), then start the event and heartbeat threads.
    pub fn start(&self) -> Result<(), CoordError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let (tx, rx) = crossfire::mpsc::unbounded_async();
        {
            let _s = self.inner.session.lock().unwrap();
            self.inner.coord.connect(tx)?;
        }
        let mut tries = 0;
        while self.inner.coord.state() != SessionState::Connected {
            tries += 1;
            if tries > CONNECT_RETRIES {
                error!("fail to connect coordination service after {} retries", CONNECT_RETRIES);
                self.inner.coord.close();
                return Err(CoordError::NotConnected);
            }
            thread::sleep(CONNECT_BACKOFF);
        }
        self.inner.cache.lock().unwrap().connected = true;
        info!("coordination session connected");

        let inner = self.inner.clone();
        let ev = thread::Builder::new()
            .name("xrpc-registry-ev".to_string())
            .spawn(move || run_events(inner, rx))
            .map_err(|e| CoordError::Backend(format!("fail to spawn event thread: {}", e)))?;
        *self.ev_thread.lock().unwrap() = Some(ev);

        let inner = self.inner.clone();
        let hb = thread::Builder::new()
            .name("xrpc-registry-hb".to_string())
            .spawn(move || run_heartbeat(inner))
            .map_err(|e| CoordError::Backend(format!("fail to spawn heartbeat thread: {}", e)))?;
        *self.hb_thread.lock().unwrap() = Some(hb);
        Ok(())
    }

    /// Tear down in reverse of [start](Self::start): stop the heartbeat,
    /// clear the watcher and cache tables, close the session, and join the
    /// event thread.
    pub fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        {
            let (lock, cv) = &self.inner.stop_pair;
            *lock.lock().unwrap() = true;
            cv.notify_all();
        }
        if let Some(h) = self.hb_thread.lock().unwrap().take() {
            let _ = h.join();
        }
        {
            let mut cache = self.inner.cache.lock().unwrap();
            cache.watchers.clear();
            cache.services.clear();
            cache.connected = false;
        }
        self.inner.coord.close();
        if let Some(h) = self.ev_thread.lock().unwrap().take() {
            let _ = h.join();
        }
        info!("registry client stopped");
    }

    /// Create or last-write-wins update the node at `path`, creating the
    /// persistent parent first when absent, then mirror it into the cache.
    pub fn register(&self, path: &str, data: &str, ephemeral: bool) -> Result<(), CoordError> {
        {
            let _s = self.inner.session.lock().unwrap();
            if let Some(parent) = parent_of(path) {
                match self.inner.coord.create(parent, "", false) {
                    Ok(()) | Err(CoordError::NodeExists) => {}
                    Err(e) => {
                        error!("fail to create parent {}: {}", parent, e);
                        return Err(e);
                    }
                }
            }
            match self.inner.coord.exists(path)? {
                Some(version) => self.inner.coord.set(path, data, version)?,
                None => self.inner.coord.create(path, data, ephemeral)?,
            }
        }
        if let Some(service) = service_of(path) {
            cache_upsert(&mut self.inner.cache.lock().unwrap(), service, path, data);
        }
        info!("registered {} with data {:?}", path, data);
        Ok(())
    }

    /// Delete the node at `path` (absence is fine) and drop it from the
    /// cache. The watcher for the path stays armed to catch a recreation.
    pub fn delete(&self, path: &str) -> Result<(), CoordError> {
        {
            let _s = self.inner.session.lock().unwrap();
            match self.inner.coord.exists(path)? {
                None => {}
                Some(_) => self.inner.coord.delete(path)?,
            }
        }
        cache_remove(&mut self.inner.cache.lock().unwrap(), path);
        Ok(())
    }

    /// Cache-first single-node lookup. A missing node is an error, the
    /// caller decides whether to retry.
    pub fn discover(&self, path: &str) -> Result<String, CoordError> {
        if let Some(service) = service_of(path) {
            let cache = self.inner.cache.lock().unwrap();
            if let Some(list) = cache.services.get(service) {
                if let Some((_, data)) = list.iter().find(|(p, _)| p == path) {
                    debug!("cache hit for {}", path);
                    return Ok(data.clone());
                }
            }
        }
        let data = {
            let _s = self.inner.session.lock().unwrap();
            self.inner.coord.get(path)?
        };
        if let Some(service) = service_of(path) {
            cache_upsert(&mut self.inner.cache.lock().unwrap(), service, path, &data);
        }
        info!("discovered {}: {:?}", path, data);
        Ok(data)
    }

    /// Cache-first listing of every instance of `service`.
    pub fn discover_service(&self, service: &str) -> Result<Vec<(String, String)>, CoordError> {
        {
            let cache = self.inner.cache.lock().unwrap();
            if let Some(list) = cache.services.get(service) {
                if !list.is_empty() {
                    return Ok(list.clone());
                }
            }
        }
        let parent = format!("/{}", service);
        let mut list = Vec::new();
        {
            let _s = self.inner.session.lock().unwrap();
            for child in self.inner.coord.get_children(&parent)? {
                let path = format!("{}/{}", parent, child);
                match self.inner.coord.get(&path) {
                    Ok(data) => list.push((path, data)),
                    // the instance vanished between listing and read
                    Err(CoordError::NoNode) => continue,
                    Err(e) => return Err(e),
                }
            }
            if let Err(e) = self.inner.coord.watch_children(&parent) {
                debug!("fail to arm child watch on {}: {}", parent, e);
            }
        }
        self.inner
            .cache
            .lock()
            .unwrap()
            .services
            .insert(service.to_string(), list.clone());
        Ok(list)
    }

    /// Instances of `service` whose `methods=` list contains `method`.
    /// Matching is on comma-delimited tokens, not substrings.
    pub fn find_instances_by_method(
        &self, service: &str, method: &str,
    ) -> Result<Vec<(String, String)>, CoordError> {
        let instances = match self.discover_service(service) {
            Ok(list) => list,
            Err(CoordError::NoNode) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        Ok(instances
            .into_iter()
            .filter(|(_, data)| {
                data.strip_prefix("methods=")
                    .map(|m| m.split(',').any(|tok| tok.trim() == method))
                    .unwrap_or(false)
            })
            .collect())
    }

    /// Watch `path` for data changes and deletion. The callback receives
    /// the new data, or the empty string on deletion, and stays armed
    /// across events. An existing node delivers its current data right
    /// away; watching an absent node is valid and stays silent until
    /// creation. A later registration for the same path replaces the
    /// earlier one.
    pub fn watch(
        &self, path: &str, cb: impl Fn(&str) + Send + Sync + 'static,
    ) -> Result<(), CoordError> {
        let cb: WatchCallback = Arc::new(cb);
        self.inner
            .cache
            .lock()
            .unwrap()
            .watchers
            .insert(path.to_string(), cb.clone());
        let existing = {
            let _s = self.inner.session.lock().unwrap();
            self.inner.coord.watch(path)?;
            self.inner.coord.get(path).ok()
        };
        if let Some(data) = existing {
            if let Some(service) = service_of(path) {
                cache_upsert(&mut self.inner.cache.lock().unwrap(), service, path, &data);
            }
            cb(&data);
        }
        Ok(())
    }
}

impl<C: Coordination> Drop for RegistryClient<C> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn cache_upsert(cache: &mut CacheState, service: &str, path: &str, data: &str) {
    let list = cache.services.entry(service.to_string()).or_default();
    match list.iter_mut().find(|(p, _)| p == path) {
        Some(entry) => entry.1 = data.to_string(),
        None => list.push((path.to_string(), data.to_string())),
    }
}

/// Remove one path from the cache, dropping the service key when it was
/// the last instance.
fn cache_remove(cache: &mut CacheState, path: &str) {
    let Some(service) = service_of(path) else {
        return;
    };
    if let Some(list) = cache.services.get_mut(service) {
        list.retain(|(p, _)| p != path);
        if list.is_empty() {
            cache.services.remove(service);
        }
    }
}

fn run_events<C: Coordination>(inner: Arc<RegInner<C>>, rx: AsyncRx<CoordEvent>) {
    while let Ok(ev) = futures::executor::block_on(rx.recv()) {
        match ev {
            CoordEvent::Session(SessionState::Connected) => {
                info!("coordination session connected");
                inner.cache.lock().unwrap().connected = true;
            }
            CoordEvent::Session(SessionState::Connecting) => {
                warn!("coordination session reconnecting");
                inner.cache.lock().unwrap().connected = false;
            }
            CoordEvent::Session(SessionState::Expired) => {
                // every ephemeral node is gone with the session
                error!("coordination session expired, dropping cache");
                let mut cache = inner.cache.lock().unwrap();
                cache.connected = false;
                cache.services.clear();
            }
            CoordEvent::Created(path, data) | CoordEvent::Changed(path, data) => {
                on_node_update(&inner, &path, &data);
            }
            CoordEvent::Deleted(path) => {
                on_node_delete(&inner, &path);
            }
            CoordEvent::ChildrenChanged(path) => {
                // force the next discover_service to re-read
                if let Some(service) = path.strip_prefix('/') {
                    debug!("children of {} changed, invalidating cache", path);
                    inner.cache.lock().unwrap().services.remove(service);
                }
                let _s = inner.session.lock().unwrap();
                if let Err(e) = inner.coord.watch_children(&path) {
                    debug!("fail to re-arm child watch on {}: {}", path, e);
                }
            }
        }
    }
    debug!("registry event loop ended");
}

fn on_node_update<C: Coordination>(inner: &Arc<RegInner<C>>, path: &str, data: &str) {
    let cb = {
        let mut cache = inner.cache.lock().unwrap();
        if let Some(service) = service_of(path) {
            cache_upsert(&mut cache, service, path, data);
        }
        cache.watchers.get(path).cloned()
    };
    debug!("node {} updated, data {:?}", path, data);
    if let Some(cb) = cb {
        cb(data);
    }
    rearm(inner, path);
}

fn on_node_delete<C: Coordination>(inner: &Arc<RegInner<C>>, path: &str) {
    let cb = {
        let mut cache = inner.cache.lock().unwrap();
        cache_remove(&mut cache, path);
        cache.watchers.get(path).cloned()
    };
    debug!("node {} deleted", path);
    if let Some(cb) = cb {
        cb("");
    }
    // stay armed so a future recreation is observed
    rearm(inner, path);
}

fn rearm<C: Coordination>(inner: &Arc<RegInner<C>>, path: &str) {
    let watched = inner.cache.lock().unwrap().watchers.contains_key(path);
    if !watched {
        return;
    }
    let _s = inner.session.lock().unwrap();
    if let Err(e) = inner.coord.watch(path) {
        warn!("fail to re-arm watch on {}: {}", path, e);
    }
}

/// Walk every cached service and prune entries whose node is no longer a
/// child. Errors are logged and skipped for the iteration.
fn run_heartbeat<C: Coordination>(inner: Arc<RegInner<C>>) {
    loop {
        {
            let (lock, cv) = &inner.stop_pair;
            let stopped = lock.lock().unwrap();
            if *stopped {
                return;
            }
            let (stopped, _) = cv.wait_timeout(stopped, inner.heartbeat_interval).unwrap();
            if *stopped {
                return;
            }
        }
        let services: Vec<String> =
            inner.cache.lock().unwrap().services.keys().cloned().collect();
        for service in services {
            let parent = format!("/{}", service);
            let children = {
                let _s = inner.session.lock().unwrap();
                inner.coord.get_children(&parent)
            };
            match children {
                Ok(kids) => {
                    let live: HashSet<String> =
                        kids.iter().map(|c| format!("{}/{}", parent, c)).collect();
                    let mut cache = inner.cache.lock().unwrap();
                    if let Some(list) = cache.services.get_mut(&service) {
                        let before = list.len();
                        list.retain(|(p, _)| live.contains(p));
                        if list.len() < before {
                            warn!("pruned {} stale instances of {}", before - list.len(), service);
                        }
                        if list.is_empty() {
                            cache.services.remove(&service);
                        }
                    }
                }
                Err(CoordError::NoNode) => {
                    inner.cache.lock().unwrap().services.remove(&service);
                }
                Err(e) => {
                    warn!("heartbeat check for {} failed: {}", service, e);
                }
            }
        }
    }
}
