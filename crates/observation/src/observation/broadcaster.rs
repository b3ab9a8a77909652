//! Change propagation for virtual roots
//!
//! Virtual nodes derive their content from a docbase elsewhere in the
//! repository. Changes below a docbase are invisible to diffing, so a
//! [`VirtualRootBroadcaster`] listens natively on every docbase and hands a
//! generic event at the virtual root's path to the upstream listeners that
//! overlap with it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::config::ObservationConfig;
use crate::event::{Event, EventFilter, EventListener, EventTypes};
use crate::path;
use crate::repository::{listener_addr, RepositoryError, Session, SessionId};

/// User id on events produced by a broadcaster
pub const BROADCASTER_USER_ID: &str = "VirtualRootBroadcaster";

struct UpstreamEntry {
    base_path: String,
    listener: Arc<dyn EventListener>,
}

type Upstream = Arc<Mutex<Vec<UpstreamEntry>>>;

/// Native listener on one docbase of one virtual root
struct VirtualRootListener {
    node_path: String,
    refresh: AtomicBool,
    upstream: Upstream,
}

impl VirtualRootListener {
    fn new(node_path: String, upstream: Upstream) -> Self {
        Self {
            node_path,
            refresh: AtomicBool::new(false),
            upstream,
        }
    }

    fn broadcast(&self) -> usize {
        if !self.refresh.swap(false, Ordering::SeqCst) {
            return 0;
        }
        let targets: Vec<Arc<dyn EventListener>> = self
            .upstream
            .lock()
            .iter()
            .filter(|u| path::overlaps(&self.node_path, &u.base_path))
            .map(|u| u.listener.clone())
            .collect();

        let event = Event::generic(&self.node_path, BROADCASTER_USER_ID);
        for listener in &targets {
            listener.on_event(std::slice::from_ref(&event));
        }
        targets.len()
    }
}

impl EventListener for VirtualRootListener {
    fn on_event(&self, _events: &[Event]) {
        if self.refresh.load(Ordering::SeqCst) {
            return;
        }
        let observed = self
            .upstream
            .lock()
            .iter()
            .any(|u| path::overlaps(&self.node_path, &u.base_path));
        if observed {
            self.refresh.store(true, Ordering::SeqCst);
        }
    }
}

/// Per-session registry of the listeners interested in virtual roots
pub struct VirtualRootBroadcaster {
    session: Weak<dyn Session>,
    config: Arc<ObservationConfig>,
    upstream: Upstream,
    roots: Mutex<Vec<Arc<VirtualRootListener>>>,
}

impl VirtualRootBroadcaster {
    pub fn new(session: &Arc<dyn Session>, config: Arc<ObservationConfig>) -> Self {
        Self {
            session: Arc::downgrade(session),
            config,
            upstream: Arc::new(Mutex::new(Vec::new())),
            roots: Mutex::new(Vec::new()),
        }
    }

    /// Register interest in virtual roots overlapping `base_path`
    pub fn subscribe(&self, listener: Arc<dyn EventListener>, base_path: &str) {
        if self.config.virtual_roots_disabled {
            return;
        }
        let mut upstream = self.upstream.lock();
        if upstream.is_empty() {
            self.start();
        }
        upstream.push(UpstreamEntry {
            base_path: base_path.to_string(),
            listener,
        });
    }

    pub fn unsubscribe(&self, listener: &Arc<dyn EventListener>) {
        let addr = listener_addr(listener);
        let mut upstream = self.upstream.lock();
        let before = upstream.len();
        upstream.retain(|u| listener_addr(&u.listener) != addr);
        if before > 0 && upstream.is_empty() {
            self.stop();
        }
    }

    pub fn is_active(&self) -> bool {
        !self.upstream.lock().is_empty()
    }

    pub fn is_dead(&self) -> bool {
        self.session
            .upgrade()
            .map(|s| !s.is_live())
            .unwrap_or(true)
    }

    /// Native registrations currently held, one per resolved docbase
    pub fn root_count(&self) -> usize {
        self.roots.lock().len()
    }

    /// Deliver pending refreshes; returns the number of deliveries
    pub fn broadcast(&self) -> usize {
        let roots: Vec<Arc<VirtualRootListener>> = self.roots.lock().clone();
        roots.iter().map(|root| root.broadcast()).sum()
    }

    fn docbase_identifiers(&self, values: &[crate::repository::Value]) -> Vec<String> {
        values
            .iter()
            .filter_map(|v| v.as_string())
            .flat_map(|s| {
                s.split(',')
                    .map(|id| id.trim().to_string())
                    .filter(|id| !id.is_empty())
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    fn start(&self) {
        let Some(session) = self.session.upgrade() else {
            tracing::warn!("session is gone, not subscribing to virtual roots");
            return;
        };
        let types: Vec<&str> = self
            .config
            .virtual_root_types
            .iter()
            .map(String::as_str)
            .collect();
        let nodes = match session.nodes_of_type(&types) {
            Ok(nodes) => nodes,
            Err(e) => {
                tracing::error!("failure to subscribe to virtual root nodes: {}", e);
                return;
            }
        };

        let mut roots = self.roots.lock();
        for node in nodes {
            let Some(docbase) = node.property(&self.config.docbase_property) else {
                tracing::warn!(
                    "virtual root {} has no {} property",
                    node.path,
                    self.config.docbase_property
                );
                continue;
            };
            for id in self.docbase_identifiers(&docbase.values) {
                let target = match session.node_by_identifier(&id) {
                    Ok(target) => target,
                    Err(RepositoryError::ItemNotFound(_)) => {
                        tracing::warn!(
                            "the {} property of virtual root {} refers to a non-existing identifier '{}'",
                            self.config.docbase_property,
                            node.path,
                            id
                        );
                        continue;
                    }
                    Err(e) => {
                        tracing::error!("failed to resolve docbase {} of {}: {}", id, node.path, e);
                        continue;
                    }
                };

                let listener = Arc::new(VirtualRootListener::new(
                    node.path.clone(),
                    self.upstream.clone(),
                ));
                let filter = EventFilter::subtree(target.path).with_event_types(
                    EventTypes::NODE_ADDED | EventTypes::NODE_REMOVED | EventTypes::PROPERTY_CHANGED,
                );
                match session.observation().add_event_listener(listener.clone(), filter) {
                    Ok(()) => roots.push(listener),
                    Err(e) => tracing::error!("failed to observe docbase of {}: {}", node.path, e),
                }
            }
        }
        tracing::debug!("{} observing {} virtual root docbases", session.id(), roots.len());
    }

    fn stop(&self) {
        let roots: Vec<Arc<VirtualRootListener>> = std::mem::take(&mut *self.roots.lock());
        let Some(session) = self.session.upgrade().filter(|s| s.is_live()) else {
            return;
        };
        for root in roots {
            let listener: Arc<dyn EventListener> = root;
            if let Err(e) = session.observation().remove_event_listener(&listener) {
                tracing::warn!("failed to unsubscribe virtual root listener: {}", e);
            }
        }
    }
}

/// Broadcasters keyed by repository session
pub struct Broadcasters {
    config: Arc<ObservationConfig>,
    by_session: Mutex<HashMap<SessionId, Arc<VirtualRootBroadcaster>>>,
}

impl Broadcasters {
    pub fn new(config: Arc<ObservationConfig>) -> Self {
        if config.virtual_roots_disabled {
            tracing::info!("virtual root observation is disabled");
        }
        Self {
            config,
            by_session: Mutex::new(HashMap::new()),
        }
    }

    pub fn for_session(&self, session: &Arc<dyn Session>) -> Arc<VirtualRootBroadcaster> {
        self.by_session
            .lock()
            .entry(session.id())
            .or_insert_with(|| Arc::new(VirtualRootBroadcaster::new(session, self.config.clone())))
            .clone()
    }

    pub fn get(&self, session: SessionId) -> Option<Arc<VirtualRootBroadcaster>> {
        self.by_session.lock().get(&session).cloned()
    }

    pub fn remove(&self, session: SessionId) {
        let removed = self.by_session.lock().remove(&session);
        if let Some(broadcaster) = removed {
            broadcaster.stop();
        }
    }

    /// Forget broadcasters without listeners or without a live session
    pub fn purge_idle(&self) -> usize {
        let idle: Vec<Arc<VirtualRootBroadcaster>> = {
            let mut by_session = self.by_session.lock();
            let ids: Vec<SessionId> = by_session
                .iter()
                .filter(|(_, b)| b.is_dead() || !b.is_active())
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| by_session.remove(id)).collect()
        };
        for broadcaster in &idle {
            broadcaster.stop();
        }
        idle.len()
    }

    pub fn len(&self) -> usize {
        self.by_session.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
