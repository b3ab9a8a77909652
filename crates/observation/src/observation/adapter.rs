use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::broadcaster::Broadcasters;
use super::broadcaster::VirtualRootBroadcaster;
use super::cache::{DirtyStates, SnapshotCache};
use super::snapshot::Snapshot;
use super::ObservationError;
use crate::config::ObservationConfig;
use crate::event::{Event, EventFilter, EventKind, EventListener};
use crate::node_type::NodeTypeRegistry;
use crate::path;
use crate::repository::{NodeView, RepositoryError, Session, UserSession, UserSessionId};

/// Native listener that only queues events until the next cycle
#[derive(Default)]
pub(crate) struct EventQueue {
    events: Mutex<Vec<Event>>,
}

impl EventQueue {
    fn take(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock())
    }

    fn clear(&self) {
        self.events.lock().clear();
    }

    fn parent_paths(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .map(|e| e.parent_path().to_string())
            .collect()
    }
}

impl EventListener for EventQueue {
    fn on_event(&self, events: &[Event]) {
        self.events.lock().extend_from_slice(events);
    }
}

struct AdapterState {
    session: Option<Arc<dyn Session>>,
    // identifier filter, shrunk to the identifiers that still resolve
    identifiers: Option<HashSet<String>>,
    is_virtual: bool,
    broadcaster: Option<Arc<VirtualRootBroadcaster>>,
    disposed: bool,
}

/// Stands in for one upstream listener registration
///
/// Keeps the subscription parameters, queues native events, and turns
/// snapshot diffs into the events the upstream listener should see.
pub struct ListenerAdapter {
    id: u64,
    filter: EventFilter,
    config: Arc<ObservationConfig>,
    owner: Weak<dyn UserSession>,
    owner_id: UserSessionId,
    upstream: Weak<dyn EventListener>,
    queue: Arc<EventQueue>,
    broadcasters: Arc<Broadcasters>,
    state: Mutex<AdapterState>,
}

impl fmt::Display for ListenerAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "listener #{} at {} (deep: {}, identifiers: {:?})",
            self.id, self.filter.path, self.filter.is_deep, self.filter.identifiers
        )
    }
}

impl ListenerAdapter {
    pub(crate) fn new(
        id: u64,
        owner: &Arc<dyn UserSession>,
        upstream: &Arc<dyn EventListener>,
        filter: EventFilter,
        config: Arc<ObservationConfig>,
        broadcasters: Arc<Broadcasters>,
    ) -> Self {
        let identifiers = filter
            .identifiers
            .as_ref()
            .map(|ids| ids.iter().cloned().collect());
        Self {
            id,
            filter,
            config,
            owner: Arc::downgrade(owner),
            owner_id: owner.id(),
            upstream: Arc::downgrade(upstream),
            queue: Arc::new(EventQueue::default()),
            broadcasters,
            state: Mutex::new(AdapterState {
                session: None,
                identifiers,
                is_virtual: false,
                broadcaster: None,
                disposed: false,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.filter.path
    }

    pub fn filter(&self) -> &EventFilter {
        &self.filter
    }

    pub fn owner_id(&self) -> UserSessionId {
        self.owner_id
    }

    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }

    pub(crate) fn upstream(&self) -> Option<Arc<dyn EventListener>> {
        self.upstream.upgrade()
    }

    pub(crate) fn is_upstream(&self, listener: &Arc<dyn EventListener>) -> bool {
        self.upstream.as_ptr() as *const () == Arc::as_ptr(listener) as *const ()
    }

    /// The upstream listener or the owning user session was reclaimed
    pub(crate) fn is_orphaned(&self) -> bool {
        self.upstream.strong_count() == 0 || self.owner.strong_count() == 0
    }

    fn queue_listener(&self) -> Arc<dyn EventListener> {
        self.queue.clone()
    }

    /// Subscribe natively and return the paths to prefetch into the cache
    pub(crate) fn init(&self) -> Result<Vec<String>, ObservationError> {
        if !path::is_absolute(&self.filter.path) {
            return Err(ObservationError::InvalidPath(self.filter.path.clone()));
        }
        let session = self
            .owner
            .upgrade()
            .and_then(|owner| owner.repository_session())
            .ok_or(ObservationError::NoSession)?;

        let mut state = self.state.lock();
        state.is_virtual = Self::is_virtual(session.as_ref(), &self.filter.path)?;
        self.subscribe(&mut state, session.clone())?;

        let mut fixed = vec![self.filter.path.clone()];
        if state.identifiers.is_some() {
            fixed.extend(
                self.referenced_nodes(&mut state, session.as_ref())
                    .into_iter()
                    .map(|n| n.path),
            );
        }
        Ok(fixed)
    }

    fn is_virtual(session: &dyn Session, path: &str) -> Result<bool, RepositoryError> {
        match session.node(path) {
            Ok(node) => Ok(!node.is_canonical),
            Err(RepositoryError::ItemNotFound(e)) => {
                tracing::debug!("item not found, assuming node was virtual: {}", e);
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    fn native_filter(&self, state: &AdapterState) -> EventFilter {
        EventFilter {
            identifiers: state
                .identifiers
                .as_ref()
                .map(|ids| ids.iter().cloned().collect()),
            ..self.filter.clone()
        }
    }

    /// Primary type match, the same rule the broadcaster's query applies
    fn is_virtual_root(&self, node: &NodeView) -> bool {
        self.config.is_virtual_root_type(&node.primary_type)
    }

    fn subscribe(
        &self,
        state: &mut AdapterState,
        session: Arc<dyn Session>,
    ) -> Result<(), ObservationError> {
        state.session = Some(session.clone());
        session
            .observation()
            .add_event_listener(self.queue_listener(), self.native_filter(state))?;

        let broadcaster = self.broadcasters.for_session(&session);
        state.broadcaster = Some(broadcaster.clone());

        // deep subscriptions may contain virtual roots anywhere below them
        if self.filter.is_deep && state.identifiers.is_none() {
            let eligible = match &self.filter.node_types {
                None => true,
                Some(types) => types.iter().any(|t| *t == self.config.document_type),
            };
            if eligible {
                broadcaster.subscribe(self.queue_listener(), &self.filter.path);
            }
            return Ok(());
        }

        // otherwise only a virtual root above the target, or a referenced one
        let mut current = Some(self.filter.path.clone());
        while let Some(p) = current.filter(|p| p.as_str() != path::ROOT) {
            match session.node(&p) {
                Ok(node) if self.is_virtual_root(&node) => {
                    broadcaster.subscribe(self.queue_listener(), &node.path);
                    break;
                }
                Ok(_) => {}
                Err(RepositoryError::PathNotFound(missing)) => {
                    tracing::warn!("path no longer exists, stopping observation; {}", missing);
                    break;
                }
                Err(e) => {
                    tracing::error!("failed to look up virtual root ancestor: {}", e);
                    break;
                }
            }
            current = path::parent_path(&p).map(str::to_string);
        }
        for node in self.referenced_nodes(state, session.as_ref()) {
            if self.is_virtual_root(&node) {
                broadcaster.subscribe(self.queue_listener(), &node.path);
            }
        }
        Ok(())
    }

    fn unsubscribe(&self, state: &mut AdapterState) -> Result<(), RepositoryError> {
        if let Some(broadcaster) = state.broadcaster.take() {
            broadcaster.unsubscribe(&self.queue_listener());
        }
        if let Some(session) = state.session.take() {
            if session.is_live() {
                session
                    .observation()
                    .remove_event_listener(&self.queue_listener())?;
            }
        }
        Ok(())
    }

    /// Resolve the identifier filter, forgetting identifiers that no
    ///  longer resolve
    fn referenced_nodes(&self, state: &mut AdapterState, session: &dyn Session) -> Vec<NodeView> {
        let Some(identifiers) = state.identifiers.as_ref() else {
            return Vec::new();
        };
        let mut nodes = Vec::with_capacity(identifiers.len());
        let mut valid = HashSet::with_capacity(identifiers.len());
        for id in identifiers {
            match session.node_by_identifier(id) {
                Ok(node) => {
                    nodes.push(node);
                    valid.insert(id.clone());
                }
                Err(RepositoryError::ItemNotFound(e)) => {
                    tracing::info!("could not dereference identifier {}: {}", id, e)
                }
                Err(e) => tracing::warn!("could not dereference identifier {}: {}", id, e),
            }
        }
        state.identifiers = Some(valid);
        nodes
    }

    pub(crate) fn dispose(&self) {
        let mut state = self.state.lock();
        self.dispose_locked(&mut state);
    }

    fn dispose_locked(&self, state: &mut AdapterState) {
        if state.disposed {
            return;
        }
        tracing::debug!("disposing {}", self);
        if let Err(e) = self.unsubscribe(state) {
            tracing::error!("unable to unregister event listener: {}", e);
        }
        state.disposed = true;
        self.queue.clear();
    }

    /// Current live session, resubscribing once if the old one died
    fn check_session(&self, state: &mut AdapterState) -> Result<Arc<dyn Session>, ObservationError> {
        if state.disposed {
            return Err(ObservationError::NotRegistered(self.to_string()));
        }
        match &state.session {
            None => return Err(ObservationError::NotRegistered(self.to_string())),
            Some(session) if session.is_live() => return Ok(session.clone()),
            Some(_) => {}
        }

        tracing::info!("resubscribing {}", self);
        // queued events refer to the dead session
        self.queue.clear();
        if let Err(e) = self.unsubscribe(state) {
            tracing::debug!("failed to unsubscribe: {}", e);
        }

        let session = self
            .owner
            .upgrade()
            .and_then(|owner| owner.repository_session())
            .filter(|s| s.is_live())
            .ok_or(ObservationError::NoSession)?;
        if let Err(e) = self.subscribe(state, session.clone()) {
            tracing::error!("failed to re-subscribe {}: {}", self, e);
        }
        Ok(session)
    }

    /// Collect the paths touched by queued native events
    pub(crate) fn pending_paths(&self, paths: &mut BTreeSet<String>) {
        let mut state = self.state.lock();
        if let Err(e) = self.check_session(&mut state) {
            tracing::debug!("skipping pending changes: {}", e);
            return;
        }
        paths.extend(self.queue.parent_paths());
    }

    /// Whether an event falls outside this subscription
    pub fn blocks(&self, event: &Event) -> bool {
        let state = self.state.lock();
        match &state.session {
            Some(session) => {
                let registry = session.node_types();
                self.blocks_with(&state, session.as_ref(), &registry, event)
            }
            None => true,
        }
    }

    fn blocks_with(
        &self,
        state: &AdapterState,
        session: &dyn Session,
        registry: &NodeTypeRegistry,
        event: &Event,
    ) -> bool {
        if !event.kind.is_generic() && !self.filter.event_types.contains(event.kind) {
            return true;
        }

        let parent_path = event.parent_path();
        if !session.item_exists(parent_path) {
            return true;
        }
        let parent = match session.node(parent_path) {
            Ok(parent) => parent,
            Err(e) => {
                tracing::warn!("unable to read {}: {}", parent_path, e);
                return true;
            }
        };

        if let Some(identifiers) = &state.identifiers {
            if !parent.is_node_type(registry, &self.config.referenceable_mixin) {
                return true;
            }
            match &parent.identifier {
                Some(id) if identifiers.contains(id) => {}
                _ => return true,
            }
        }

        if let Some(node_types) = &self.filter.node_types {
            if !registry.matches_any(parent.types(), node_types.iter().map(String::as_str)) {
                return true;
            }
        }

        !self.filter.covers(parent_path)
    }

    fn is_visible(&self, state: &AdapterState, node: &NodeView) -> bool {
        if !self.filter.covers(&node.path) {
            return false;
        }
        match &state.identifiers {
            Some(identifiers) => node
                .identifier
                .as_ref()
                .is_some_and(|id| identifiers.contains(id)),
            None => true,
        }
    }

    fn matches_node_types(&self, node: &NodeView, registry: &NodeTypeRegistry) -> bool {
        match &self.filter.node_types {
            Some(types) => types.iter().any(|t| node.is_node_type(registry, t)),
            None => true,
        }
    }

    fn add_pending(
        &self,
        state: &AdapterState,
        session: &dyn Session,
        paths: Vec<String>,
        nodes: &mut BTreeMap<String, NodeView>,
    ) {
        for p in paths {
            match session.node(&p) {
                Ok(node) if self.is_visible(state, &node) => {
                    nodes.insert(node.path.clone(), node);
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("failed to read pending node {}: {}", p, e),
            }
        }
    }

    /// Add the canonical descendants of every new node
    fn expand_new(&self, session: &dyn Session, nodes: &mut BTreeMap<String, NodeView>) {
        let mut stack: Vec<NodeView> = nodes
            .values()
            .filter(|n| n.is_new && n.is_canonical)
            .cloned()
            .collect();
        while let Some(node) = stack.pop() {
            for child in &node.children {
                let child_path = path::join(&node.path, child);
                match session.node(&child_path) {
                    Ok(child) if child.is_canonical => {
                        nodes.insert(child.path.clone(), child.clone());
                        stack.push(child);
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!("error while visiting {}: {}", child_path, e),
                }
            }
        }
    }

    /// Gather new and modified nodes within the subscription
    fn changed_nodes(
        &self,
        state: &mut AdapterState,
        session: &dyn Session,
        registry: &NodeTypeRegistry,
    ) -> Result<BTreeMap<String, NodeView>, RepositoryError> {
        let mut nodes = BTreeMap::new();
        let root = session.node(&self.filter.path)?;

        if root.is_pending()
            && self.is_visible(state, &root)
            && self.matches_node_types(&root, registry)
        {
            nodes.insert(root.path.clone(), root.clone());
        }
        if !root.is_new {
            match &self.filter.node_types {
                None => {
                    let pending = session.pending_changes(&root.path, None)?;
                    self.add_pending(state, session, pending, &mut nodes);
                }
                Some(types) => {
                    for t in types {
                        let pending = session.pending_changes(&root.path, Some(t))?;
                        self.add_pending(state, session, pending, &mut nodes);
                    }
                }
            }
        }

        for node in self.referenced_nodes(state, session) {
            if node.is_pending() && self.matches_node_types(&node, registry) {
                nodes.insert(node.path.clone(), node);
            }
        }

        self.expand_new(session, &mut nodes);
        Ok(nodes)
    }

    /// Drain queued events and diff changed nodes against the cache
    pub(crate) fn process(&self, dirty: &mut DirtyStates, cache: &SnapshotCache) -> Vec<Event> {
        let mut state = self.state.lock();
        let session = match self.check_session(&mut state) {
            Ok(session) => session,
            Err(e) => {
                tracing::debug!("{}", e);
                return Vec::new();
            }
        };
        self.collect_events(&mut state, session.as_ref(), dirty, cache)
    }

    fn collect_events(
        &self,
        state: &mut AdapterState,
        session: &dyn Session,
        dirty: &mut DirtyStates,
        cache: &SnapshotCache,
    ) -> Vec<Event> {
        let mut events = self.queue.take();
        if state.is_virtual {
            return events;
        }

        let registry = session.node_types();
        let mode = self.config.binary_mode;
        let nodes = match self.changed_nodes(state, session, &registry) {
            Ok(nodes) => nodes,
            Err(RepositoryError::PathNotFound(p)) => {
                tracing::warn!("root node no longer exists: {}", p);
                self.dispose_locked(state);
                return events;
            }
            Err(e) => {
                tracing::error!("failed to parse pending changes: {}", e);
                self.dispose_locked(state);
                return events;
            }
        };

        // keep cached parents of native events in step with the session
        for event in &events {
            let parent = event.parent_path();
            if nodes.contains_key(parent)
                || dirty.contains_key(parent)
                || !cache.contains(session.id(), parent)
            {
                continue;
            }
            if let Ok(node) = session.node(parent) {
                let snapshot = Snapshot::capture(&node, session.user_id(), mode);
                dirty.insert(parent.to_string(), Arc::new(snapshot));
            }
        }

        // a queued native event already reports what the refreshed state shows
        let queued: HashSet<(String, EventKind)> =
            events.iter().map(|e| (e.path.clone(), e.kind)).collect();

        for (p, node) in &nodes {
            let new_state = dirty
                .entry(p.clone())
                .or_insert_with(|| Arc::new(Snapshot::capture(node, session.user_id(), mode)))
                .clone();

            match cache.get(session.id(), p) {
                Some(old_state) => {
                    for event in old_state.diff(&new_state) {
                        if queued.contains(&(event.path.clone(), event.kind)) {
                            continue;
                        }
                        if !self.blocks_with(state, session, &registry, &event) {
                            events.push(event);
                        }
                    }
                }
                None => {
                    // a new node below a node diffed in this batch shows up
                    //  as that parent's NodeAdded
                    let covered = node.is_new
                        && path::parent_path(p).is_some_and(|parent| nodes.contains_key(parent));
                    if covered {
                        continue;
                    }
                    let event = new_state.change_event();
                    if !self.blocks_with(state, session, &registry, &event) {
                        events.push(event);
                    }
                }
            }
        }
        events
    }
}
