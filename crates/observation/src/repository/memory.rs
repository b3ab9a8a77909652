use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use super::{
    listener_addr, NodeView, ObservationManager, Property, RepositoryError, Session, SessionId,
    UserSession, UserSessionId, Value,
};
use crate::event::{Event, EventFilter, EventKind, EventListener};
use crate::node_type::NodeTypeRegistry;
use crate::path;

const REFERENCEABLE: &str = "mix:referenceable";
const ROOT_TYPE: &str = "rep:root";

static NEXT_USER_SESSION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, PartialEq)]
struct NodeRecord {
    primary_type: String,
    mixin_types: Vec<String>,
    identifier: Option<String>,
    properties: BTreeMap<String, Property>,
    canonical: bool,
    is_new: bool,
    is_modified: bool,
}

impl NodeRecord {
    fn new(primary_type: &str, canonical: bool) -> Self {
        Self {
            primary_type: primary_type.to_string(),
            mixin_types: Vec::new(),
            identifier: None,
            properties: BTreeMap::new(),
            canonical,
            is_new: false,
            is_modified: false,
        }
    }

    fn is_pending(&self) -> bool {
        self.is_new || self.is_modified
    }

    fn types(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.primary_type.as_str()).chain(self.mixin_types.iter().map(String::as_str))
    }

    fn is_node_type(&self, registry: &NodeTypeRegistry, wanted: &str) -> bool {
        self.types().any(|t| registry.is_node_type(t, wanted))
    }

    fn persisted(&self) -> Self {
        Self {
            is_new: false,
            is_modified: false,
            ..self.clone()
        }
    }
}

struct Registration {
    session: SessionId,
    listener: Arc<dyn EventListener>,
    filter: EventFilter,
}

struct Workspace {
    nodes: BTreeMap<String, NodeRecord>,
    registrations: Vec<Registration>,
}

/// In-memory tree repository
///
/// Persisted state lives in a shared workspace; every [`MemorySession`]
/// works on its own copy with transient changes until [`MemorySession::save`]
/// publishes them and notifies native listeners.
#[derive(Clone)]
pub struct MemoryRepository {
    inner: Arc<RwLock<Workspace>>,
    node_types: Arc<NodeTypeRegistry>,
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::with_node_types(NodeTypeRegistry::standard())
    }

    pub fn with_node_types(node_types: NodeTypeRegistry) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(path::ROOT.to_string(), NodeRecord::new(ROOT_TYPE, true));
        Self {
            inner: Arc::new(RwLock::new(Workspace {
                nodes,
                registrations: Vec::new(),
            })),
            node_types: Arc::new(node_types),
        }
    }

    /// Open a new session for `user_id` on the current persisted state
    pub fn login(&self, user_id: &str) -> Arc<MemorySession> {
        let nodes = self.inner.read().nodes.clone();
        let id = SessionId::next();
        tracing::debug!("opening {} for {}", id, user_id);
        Arc::new(MemorySession {
            id,
            user_id: user_id.to_string(),
            repository: self.clone(),
            live: AtomicBool::new(true),
            state: Mutex::new(SessionState {
                nodes,
                removed: BTreeSet::new(),
            }),
            observation: MemoryObservationManager {
                session: id,
                workspace: self.inner.clone(),
            },
        })
    }

    /// Number of native listener registrations across all sessions
    pub fn native_listener_count(&self) -> usize {
        self.inner.read().registrations.len()
    }
}

struct SessionState {
    nodes: BTreeMap<String, NodeRecord>,
    // top-most persisted paths removed in this session and not yet saved
    removed: BTreeSet<String>,
}

pub struct MemorySession {
    id: SessionId,
    user_id: String,
    repository: MemoryRepository,
    live: AtomicBool,
    state: Mutex<SessionState>,
    observation: MemoryObservationManager,
}

/// Canonical key for a path: `[1]` suffixes dropped
fn normalize(p: &str) -> Result<String, RepositoryError> {
    if !path::is_absolute(p) {
        return Err(RepositoryError::InvalidPath(p.to_string()));
    }
    let segments: Vec<&str> = path::segments(p)
        .map(|s| s.strip_suffix("[1]").unwrap_or(s))
        .collect();
    if segments.is_empty() {
        return Ok(path::ROOT.to_string());
    }
    Ok(format!("/{}", segments.join("/")))
}

/// The key itself plus all keys below it
fn subtree_keys(nodes: &BTreeMap<String, NodeRecord>, root: &str) -> Vec<String> {
    if root == path::ROOT {
        return nodes.keys().cloned().collect();
    }
    let prefix = format!("{}/", root);
    nodes
        .range(root.to_string()..)
        .take_while(|(k, _)| k.starts_with(root))
        .filter(|(k, _)| k.as_str() == root || k.starts_with(&prefix))
        .map(|(k, _)| k.clone())
        .collect()
}

fn child_names(nodes: &BTreeMap<String, NodeRecord>, parent: &str) -> Vec<String> {
    let depth = path::depth(parent) + 1;
    subtree_keys(nodes, parent)
        .into_iter()
        .filter(|k| path::depth(k) == depth)
        .map(|k| path::name(&k).to_string())
        .collect()
}

fn view(nodes: &BTreeMap<String, NodeRecord>, key: &str, record: &NodeRecord) -> NodeView {
    let (_, index) = path::split_index(path::name(key));
    NodeView {
        path: key.to_string(),
        index,
        primary_type: record.primary_type.clone(),
        mixin_types: record.mixin_types.clone(),
        identifier: record.identifier.clone(),
        properties: record.properties.values().cloned().collect(),
        children: child_names(nodes, key),
        is_new: record.is_new,
        is_modified: record.is_modified,
        is_canonical: record.canonical,
    }
}

fn filter_matches(
    filter: &EventFilter,
    event: &Event,
    nodes: &BTreeMap<String, NodeRecord>,
    registry: &NodeTypeRegistry,
) -> bool {
    if !filter.event_types.contains(event.kind) {
        return false;
    }
    let parent = event.parent_path();
    if !filter.covers(parent) {
        return false;
    }
    let Some(record) = nodes.get(parent) else {
        return false;
    };
    if let Some(ids) = &filter.identifiers {
        match &record.identifier {
            Some(id) if ids.contains(id) => {}
            _ => return false,
        }
    }
    if let Some(node_types) = &filter.node_types {
        if !node_types.iter().any(|t| record.is_node_type(registry, t)) {
            return false;
        }
    }
    true
}

impl MemorySession {
    pub fn repository(&self) -> &MemoryRepository {
        &self.repository
    }

    fn ensure_live(&self) -> Result<(), RepositoryError> {
        if self.is_live() {
            Ok(())
        } else {
            Err(RepositoryError::SessionClosed)
        }
    }

    fn mark_modified(state: &mut SessionState, key: &str) {
        if let Some(record) = state.nodes.get_mut(key) {
            if !record.is_new {
                record.is_modified = true;
            }
        }
    }

    fn insert_node(
        &self,
        parent: &str,
        name: &str,
        primary_type: &str,
        canonical: bool,
    ) -> Result<String, RepositoryError> {
        self.ensure_live()?;
        if name.is_empty() || name.contains('/') || name.contains('[') {
            return Err(RepositoryError::InvalidPath(name.to_string()));
        }
        let parent = normalize(parent)?;
        let mut state = self.state.lock();
        if !state.nodes.contains_key(&parent) {
            return Err(RepositoryError::PathNotFound(parent));
        }

        let siblings = child_names(&state.nodes, &parent)
            .iter()
            .filter(|c| path::split_index(c).0 == name)
            .count();
        let key = path::join(&parent, &path::indexed_name(name, siblings + 1));

        let mut record = NodeRecord::new(primary_type, canonical);
        record.is_new = true;
        if record.is_node_type(&self.repository.node_types, REFERENCEABLE) {
            record.identifier = Some(Uuid::new_v4().to_string());
        }
        state.nodes.insert(key.clone(), record);
        Self::mark_modified(&mut state, &parent);
        Ok(key)
    }

    /// Add a child node; same-name siblings get an index suffix
    pub fn add_node(
        &self,
        parent: &str,
        name: &str,
        primary_type: &str,
    ) -> Result<String, RepositoryError> {
        self.insert_node(parent, name, primary_type, true)
    }

    /// Add a non-canonical child node, standing in for derived content
    pub fn add_virtual_node(
        &self,
        parent: &str,
        name: &str,
        primary_type: &str,
    ) -> Result<String, RepositoryError> {
        self.insert_node(parent, name, primary_type, false)
    }

    pub fn add_mixin(&self, node: &str, mixin: &str) -> Result<(), RepositoryError> {
        self.ensure_live()?;
        let key = normalize(node)?;
        let mut state = self.state.lock();
        let record = state
            .nodes
            .get_mut(&key)
            .ok_or_else(|| RepositoryError::PathNotFound(key.clone()))?;
        if record.mixin_types.iter().any(|m| m == mixin) {
            return Ok(());
        }
        record.mixin_types.push(mixin.to_string());
        if record.identifier.is_none()
            && record.is_node_type(&self.repository.node_types, REFERENCEABLE)
        {
            record.identifier = Some(Uuid::new_v4().to_string());
        }
        Self::mark_modified(&mut state, &key);
        Ok(())
    }

    fn put_property(&self, node: &str, property: Property) -> Result<(), RepositoryError> {
        self.ensure_live()?;
        let key = normalize(node)?;
        let mut state = self.state.lock();
        let record = state
            .nodes
            .get_mut(&key)
            .ok_or_else(|| RepositoryError::PathNotFound(key.clone()))?;
        record.properties.insert(property.name.clone(), property);
        Self::mark_modified(&mut state, &key);
        Ok(())
    }

    pub fn set_property(
        &self,
        node: &str,
        name: &str,
        value: impl Into<Value>,
    ) -> Result<(), RepositoryError> {
        self.put_property(node, Property::single(name, value))
    }

    pub fn set_multi_property(
        &self,
        node: &str,
        name: &str,
        values: Vec<Value>,
    ) -> Result<(), RepositoryError> {
        self.put_property(node, Property::multi(name, values))
    }

    pub fn remove_property(&self, node: &str, name: &str) -> Result<(), RepositoryError> {
        self.ensure_live()?;
        let key = normalize(node)?;
        let mut state = self.state.lock();
        let record = state
            .nodes
            .get_mut(&key)
            .ok_or_else(|| RepositoryError::PathNotFound(key.clone()))?;
        if record.properties.remove(name).is_none() {
            return Err(RepositoryError::ItemNotFound(path::join(&key, name)));
        }
        Self::mark_modified(&mut state, &key);
        Ok(())
    }

    pub fn remove_node(&self, node: &str) -> Result<(), RepositoryError> {
        self.ensure_live()?;
        let key = normalize(node)?;
        let parent = path::parent_path(&key)
            .ok_or_else(|| RepositoryError::InvalidPath(key.clone()))?
            .to_string();
        let mut state = self.state.lock();
        let was_new = match state.nodes.get(&key) {
            Some(record) => record.is_new,
            None => return Err(RepositoryError::PathNotFound(key)),
        };
        for k in subtree_keys(&state.nodes, &key) {
            state.nodes.remove(&k);
        }
        if !was_new {
            state.removed.retain(|r| !path::is_ancestor(&key, r));
            state.removed.insert(key);
        }
        Self::mark_modified(&mut state, &parent);
        Ok(())
    }

    /// Persist transient changes and notify native listeners
    pub fn save(&self) -> Result<(), RepositoryError> {
        self.ensure_live()?;
        let registry = self.repository.node_types.clone();
        let deliveries = {
            let mut state = self.state.lock();
            let mut ws = self.repository.inner.write();
            let mut events = Vec::new();

            for removed in std::mem::take(&mut state.removed) {
                if !ws.nodes.contains_key(&removed) {
                    continue;
                }
                events.push(Event::new(&removed, EventKind::NodeRemoved, &self.user_id));
                for k in subtree_keys(&ws.nodes, &removed) {
                    ws.nodes.remove(&k);
                }
            }

            let pending: Vec<String> = state
                .nodes
                .iter()
                .filter(|(_, r)| r.is_pending())
                .map(|(k, _)| k.clone())
                .collect();
            for key in pending {
                let Some(record) = state.nodes.get_mut(&key) else {
                    continue;
                };
                match ws.nodes.get(&key) {
                    Some(old) if !record.is_new => {
                        for (name, property) in &old.properties {
                            match record.properties.get(name) {
                                Some(p) if p == property => {}
                                Some(_) => events.push(Event::child(
                                    &key,
                                    name,
                                    EventKind::PropertyChanged,
                                    &self.user_id,
                                )),
                                None => events.push(Event::child(
                                    &key,
                                    name,
                                    EventKind::PropertyRemoved,
                                    &self.user_id,
                                )),
                            }
                        }
                        for name in record.properties.keys() {
                            if !old.properties.contains_key(name) {
                                events.push(Event::child(
                                    &key,
                                    name,
                                    EventKind::PropertyAdded,
                                    &self.user_id,
                                ));
                            }
                        }
                    }
                    _ => {
                        events.push(Event::new(&key, EventKind::NodeAdded, &self.user_id));
                        for name in record.properties.keys() {
                            events.push(Event::child(
                                &key,
                                name,
                                EventKind::PropertyAdded,
                                &self.user_id,
                            ));
                        }
                    }
                }
                *record = record.persisted();
                ws.nodes.insert(key.clone(), record.clone());
            }

            tracing::debug!("{} saved with {} native events", self.id, events.len());

            let deliveries: Vec<(Arc<dyn EventListener>, Vec<Event>)> = ws
                .registrations
                .iter()
                .filter(|reg| !(reg.filter.no_local && reg.session == self.id))
                .filter_map(|reg| {
                    let matched: Vec<Event> = events
                        .iter()
                        .filter(|e| filter_matches(&reg.filter, e, &ws.nodes, &registry))
                        .cloned()
                        .collect();
                    (!matched.is_empty()).then(|| (reg.listener.clone(), matched))
                })
                .collect();
            deliveries
        };

        // deliver outside of the locks, listeners may call back into the session
        for (listener, events) in deliveries {
            listener.on_event(&events);
        }
        Ok(())
    }

    /// Close the session and drop its native listeners
    pub fn logout(&self) {
        if self.live.swap(false, Ordering::SeqCst) {
            tracing::debug!("closing {}", self.id);
            self.repository
                .inner
                .write()
                .registrations
                .retain(|reg| reg.session != self.id);
        }
    }
}

impl Session for MemorySession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn user_id(&self) -> &str {
        &self.user_id
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    fn item_exists(&self, p: &str) -> bool {
        if !self.is_live() {
            return false;
        }
        match normalize(p) {
            Ok(key) => self.state.lock().nodes.contains_key(&key),
            Err(_) => false,
        }
    }

    fn node(&self, p: &str) -> Result<NodeView, RepositoryError> {
        self.ensure_live()?;
        let key = normalize(p)?;
        let state = self.state.lock();
        let record = state
            .nodes
            .get(&key)
            .ok_or_else(|| RepositoryError::PathNotFound(key.clone()))?;
        Ok(view(&state.nodes, &key, record))
    }

    fn node_by_identifier(&self, identifier: &str) -> Result<NodeView, RepositoryError> {
        self.ensure_live()?;
        let state = self.state.lock();
        state
            .nodes
            .iter()
            .find(|(_, r)| r.identifier.as_deref() == Some(identifier))
            .map(|(k, r)| view(&state.nodes, k, r))
            .ok_or_else(|| RepositoryError::ItemNotFound(identifier.to_string()))
    }

    fn pending_changes(
        &self,
        root: &str,
        node_type: Option<&str>,
    ) -> Result<Vec<String>, RepositoryError> {
        self.ensure_live()?;
        let root = normalize(root)?;
        let state = self.state.lock();
        if !state.nodes.contains_key(&root) {
            return Err(RepositoryError::PathNotFound(root));
        }
        Ok(subtree_keys(&state.nodes, &root)
            .into_iter()
            .filter(|k| {
                state.nodes.get(k).is_some_and(|r| {
                    r.is_pending()
                        && node_type
                            .map(|t| r.is_node_type(&self.repository.node_types, t))
                            .unwrap_or(true)
                })
            })
            .collect())
    }

    fn refresh(&self, p: &str, keep_changes: bool) -> Result<(), RepositoryError> {
        self.ensure_live()?;
        let key = normalize(p)?;
        let mut state = self.state.lock();
        let ws = self.repository.inner.read();
        if !state.nodes.contains_key(&key) && !ws.nodes.contains_key(&key) {
            return Err(RepositoryError::PathNotFound(key));
        }

        let local_keys = subtree_keys(&state.nodes, &key);
        let persisted_keys = subtree_keys(&ws.nodes, &key);

        if keep_changes {
            for k in local_keys {
                let stale = state.nodes.get(&k).is_some_and(|r| !r.is_pending())
                    && !ws.nodes.contains_key(&k);
                if stale {
                    state.nodes.remove(&k);
                }
            }
            for k in persisted_keys {
                if state.removed.iter().any(|r| path::is_ancestor(r, &k)) {
                    continue;
                }
                if state.nodes.get(&k).is_some_and(NodeRecord::is_pending) {
                    continue;
                }
                if let Some(record) = ws.nodes.get(&k) {
                    state.nodes.insert(k, record.clone());
                }
            }
        } else {
            for k in local_keys {
                state.nodes.remove(&k);
            }
            state.removed.retain(|r| !path::is_ancestor(&key, r));
            for k in persisted_keys {
                if let Some(record) = ws.nodes.get(&k) {
                    state.nodes.insert(k, record.clone());
                }
            }
        }
        Ok(())
    }

    fn nodes_of_type(&self, types: &[&str]) -> Result<Vec<NodeView>, RepositoryError> {
        self.ensure_live()?;
        let state = self.state.lock();
        Ok(state
            .nodes
            .iter()
            .filter(|(_, r)| types.contains(&r.primary_type.as_str()))
            .map(|(k, r)| view(&state.nodes, k, r))
            .collect())
    }

    fn node_types(&self) -> Arc<NodeTypeRegistry> {
        self.repository.node_types.clone()
    }

    fn observation(&self) -> &dyn ObservationManager {
        &self.observation
    }
}

/// Native observation for one session, backed by the shared workspace
struct MemoryObservationManager {
    session: SessionId,
    workspace: Arc<RwLock<Workspace>>,
}

impl ObservationManager for MemoryObservationManager {
    fn add_event_listener(
        &self,
        listener: Arc<dyn EventListener>,
        filter: EventFilter,
    ) -> Result<(), RepositoryError> {
        if !path::is_absolute(&filter.path) {
            return Err(RepositoryError::InvalidPath(filter.path));
        }
        let addr = listener_addr(&listener);
        let mut ws = self.workspace.write();
        ws.registrations
            .retain(|reg| !(reg.session == self.session && listener_addr(&reg.listener) == addr));
        ws.registrations.push(Registration {
            session: self.session,
            listener,
            filter,
        });
        Ok(())
    }

    fn remove_event_listener(
        &self,
        listener: &Arc<dyn EventListener>,
    ) -> Result<(), RepositoryError> {
        let addr = listener_addr(listener);
        self.workspace
            .write()
            .registrations
            .retain(|reg| !(reg.session == self.session && listener_addr(&reg.listener) == addr));
        Ok(())
    }

    fn registered_event_listeners(&self) -> Vec<Arc<dyn EventListener>> {
        self.workspace
            .read()
            .registrations
            .iter()
            .filter(|reg| reg.session == self.session)
            .map(|reg| reg.listener.clone())
            .collect()
    }
}

/// A user session bound to a [`MemoryRepository`]; can log out and back in
pub struct MemoryUserSession {
    id: UserSessionId,
    user_id: String,
    repository: MemoryRepository,
    session: Mutex<Option<Arc<MemorySession>>>,
}

impl MemoryUserSession {
    pub fn new(repository: &MemoryRepository, user_id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_USER_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            user_id: user_id.to_string(),
            repository: repository.clone(),
            session: Mutex::new(Some(repository.login(user_id))),
        })
    }

    /// The current concrete session, for making changes
    pub fn session(&self) -> Option<Arc<MemorySession>> {
        self.session.lock().clone()
    }

    /// Close the current session and bind a fresh one
    pub fn relogin(&self) -> Arc<MemorySession> {
        let fresh = self.repository.login(&self.user_id);
        if let Some(old) = self.session.lock().replace(fresh.clone()) {
            old.logout();
        }
        fresh
    }

    pub fn logout(&self) {
        if let Some(old) = self.session.lock().take() {
            old.logout();
        }
    }
}

impl UserSession for MemoryUserSession {
    fn id(&self) -> UserSessionId {
        self.id
    }

    fn repository_session(&self) -> Option<Arc<dyn Session>> {
        self.session
            .lock()
            .clone()
            .map(|s| s as Arc<dyn Session>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<Event>>,
    }

    impl EventListener for Recorder {
        fn on_event(&self, events: &[Event]) {
            self.events.lock().extend_from_slice(events);
        }
    }

    #[test]
    fn test_add_and_read_node() {
        let repo = MemoryRepository::new();
        let session = repo.login("admin");

        let content = session.add_node("/", "content", "nt:unstructured").unwrap();
        session.set_property(&content, "title", "Home").unwrap();

        let node = session.node("/content").unwrap();
        assert!(node.is_new);
        assert_eq!(node.property("title").unwrap().values, vec![Value::from("Home")]);
        assert_eq!(session.node("/").unwrap().children, vec!["content".to_string()]);
        assert!(session.node("/").unwrap().is_modified);
    }

    #[test]
    fn test_same_name_siblings() {
        let repo = MemoryRepository::new();
        let session = repo.login("admin");

        assert_eq!(session.add_node("/", "doc", "nt:unstructured").unwrap(), "/doc");
        assert_eq!(session.add_node("/", "doc", "nt:unstructured").unwrap(), "/doc[2]");
        assert!(session.item_exists("/doc[1]"));
        assert_eq!(session.node("/doc[2]").unwrap().index, 2);
    }

    #[test]
    fn test_referenceable_nodes_get_identifiers() {
        let repo = MemoryRepository::new();
        let session = repo.login("admin");

        session.add_node("/", "plain", "nt:unstructured").unwrap();
        session.add_node("/", "handle", "hippo:handle").unwrap();
        assert!(session.node("/plain").unwrap().identifier.is_none());

        let id = session.node("/handle").unwrap().identifier.unwrap();
        assert_eq!(session.node_by_identifier(&id).unwrap().path, "/handle");

        session.add_mixin("/plain", "mix:referenceable").unwrap();
        assert!(session.node("/plain").unwrap().identifier.is_some());
    }

    #[test]
    fn test_pending_changes_and_save() {
        let repo = MemoryRepository::new();
        let session = repo.login("admin");
        session.add_node("/", "content", "nt:unstructured").unwrap();
        session.add_node("/content", "doc", "hippo:document").unwrap();

        let pending = session.pending_changes("/", None).unwrap();
        assert_eq!(pending, vec!["/", "/content", "/content/doc"]);
        let docs = session.pending_changes("/", Some("hippo:document")).unwrap();
        assert_eq!(docs, vec!["/content/doc"]);

        session.save().unwrap();
        assert!(session.pending_changes("/", None).unwrap().is_empty());

        let other = repo.login("editor");
        assert!(other.item_exists("/content/doc"));
    }

    #[test]
    fn test_native_events_on_save() {
        let repo = MemoryRepository::new();
        let writer = repo.login("admin");
        writer.add_node("/", "content", "nt:unstructured").unwrap();
        writer.save().unwrap();

        let reader = repo.login("editor");
        let recorder = Arc::new(Recorder::default());
        let listener: Arc<dyn EventListener> = recorder.clone();
        reader
            .observation()
            .add_event_listener(listener, EventFilter::subtree("/content"))
            .unwrap();

        writer.add_node("/content", "a", "nt:unstructured").unwrap();
        writer.set_property("/content", "title", "x").unwrap();
        writer.save().unwrap();

        let events = recorder.events.lock().clone();
        assert!(events.contains(&Event::new("/content/a", EventKind::NodeAdded, "admin")));
        assert!(events.contains(&Event::new(
            "/content/title",
            EventKind::PropertyAdded,
            "admin"
        )));

        writer.remove_node("/content/a").unwrap();
        writer.save().unwrap();
        let events = recorder.events.lock().clone();
        assert_eq!(
            events.last(),
            Some(&Event::new("/content/a", EventKind::NodeRemoved, "admin"))
        );
    }

    #[test]
    fn test_no_local_skips_own_changes() {
        let repo = MemoryRepository::new();
        let session = repo.login("admin");
        let recorder = Arc::new(Recorder::default());
        let listener: Arc<dyn EventListener> = recorder.clone();
        session
            .observation()
            .add_event_listener(listener, EventFilter::subtree("/").with_no_local(true))
            .unwrap();

        session.add_node("/", "content", "nt:unstructured").unwrap();
        session.save().unwrap();
        assert!(recorder.events.lock().is_empty());
    }

    #[test]
    fn test_refresh_keeps_transient_changes() {
        let repo = MemoryRepository::new();
        let writer = repo.login("admin");
        writer.add_node("/", "content", "nt:unstructured").unwrap();
        writer.add_node("/", "other", "nt:unstructured").unwrap();
        writer.save().unwrap();

        let reader = repo.login("editor");
        reader.set_property("/other", "draft", true).unwrap();

        writer.add_node("/content", "a", "nt:unstructured").unwrap();
        writer.save().unwrap();
        assert!(!reader.item_exists("/content/a"));

        reader.refresh("/", true).unwrap();
        assert!(reader.item_exists("/content/a"));
        assert!(reader.node("/other").unwrap().property("draft").is_some());

        reader.refresh("/other", false).unwrap();
        assert!(reader.node("/other").unwrap().property("draft").is_none());
    }

    #[test]
    fn test_logout_drops_registrations() {
        let repo = MemoryRepository::new();
        let session = repo.login("admin");
        let listener: Arc<dyn EventListener> = Arc::new(Recorder::default());
        session
            .observation()
            .add_event_listener(listener, EventFilter::subtree("/"))
            .unwrap();
        assert_eq!(repo.native_listener_count(), 1);

        session.logout();
        assert_eq!(repo.native_listener_count(), 0);
        assert!(matches!(session.node("/"), Err(RepositoryError::SessionClosed)));
        assert!(!session.item_exists("/"));
    }
}
