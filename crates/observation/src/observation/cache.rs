//! Per-session snapshot cache
//!
//! Holds the last known [`Snapshot`] of every observed node, per repository
//! session. Entries hold only a weak handle on their session and are purged
//! once it is gone or no longer live.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::snapshot::Snapshot;
use crate::config::BinaryMode;
use crate::repository::{Session, SessionId};

struct SessionEntry {
    session: Weak<dyn Session>,
    states: HashMap<String, Arc<Snapshot>>,
}

impl SessionEntry {
    fn is_dead(&self) -> bool {
        self.session
            .upgrade()
            .map(|s| !s.is_live())
            .unwrap_or(true)
    }
}

/// Snapshots produced during one processing cycle, keyed by path
pub type DirtyStates = HashMap<String, Arc<Snapshot>>;

#[derive(Default)]
pub struct SnapshotCache {
    entries: Mutex<HashMap<SessionId, SessionEntry>>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, session: SessionId, path: &str) -> Option<Arc<Snapshot>> {
        self.entries
            .lock()
            .get(&session)
            .and_then(|entry| entry.states.get(path).cloned())
    }

    pub fn contains(&self, session: SessionId, path: &str) -> bool {
        self.get(session, path).is_some()
    }

    /// Number of cached snapshots for a session
    pub fn len(&self, session: SessionId) -> usize {
        self.entries
            .lock()
            .get(&session)
            .map(|entry| entry.states.len())
            .unwrap_or(0)
    }

    pub fn session_count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Capture and cache every existing path that has no snapshot yet
    pub fn prefetch(&self, session: &Arc<dyn Session>, paths: &[String], mode: BinaryMode) {
        let mut entries = self.entries.lock();
        let entry = entries
            .entry(session.id())
            .or_insert_with(|| SessionEntry {
                session: Arc::downgrade(session),
                states: HashMap::new(),
            });

        for path in paths {
            if entry.states.contains_key(path) || !session.item_exists(path) {
                continue;
            }
            match session.node(path) {
                Ok(node) => {
                    let snapshot = Snapshot::capture(&node, session.user_id(), mode);
                    entry.states.insert(path.clone(), Arc::new(snapshot));
                }
                Err(e) => tracing::warn!("failed to initialize node state for {}: {}", path, e),
            }
        }
    }

    /// Merge a cycle's snapshots, then drop entries whose node is gone
    pub fn apply(&self, session: &Arc<dyn Session>, dirty: DirtyStates) {
        let mut entries = self.entries.lock();
        let entry = entries
            .entry(session.id())
            .or_insert_with(|| SessionEntry {
                session: Arc::downgrade(session),
                states: HashMap::new(),
            });

        entry.states.extend(dirty);
        entry.states.retain(|path, _| session.item_exists(path));
    }

    pub fn evict(&self, session: SessionId) {
        if self.entries.lock().remove(&session).is_some() {
            tracing::debug!("evicted snapshot cache for {}", session);
        }
    }

    /// Drop entries whose session was reclaimed or closed; returns how many
    pub fn purge_dead(&self) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_dead());
        before - entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{MemoryRepository, Session};

    #[test]
    fn test_prefetch_skips_missing_paths() {
        let repo = MemoryRepository::new();
        let memory = repo.login("admin");
        memory.add_node("/", "content", "nt:unstructured").unwrap();
        let session: Arc<dyn Session> = memory.clone();

        let cache = SnapshotCache::new();
        cache.prefetch(
            &session,
            &["/content".to_string(), "/missing".to_string()],
            BinaryMode::Presence,
        );

        assert!(cache.contains(session.id(), "/content"));
        assert!(!cache.contains(session.id(), "/missing"));
        assert_eq!(cache.len(session.id()), 1);
    }

    #[test]
    fn test_prefetch_keeps_existing_snapshot() {
        let repo = MemoryRepository::new();
        let memory = repo.login("admin");
        memory.add_node("/", "content", "nt:unstructured").unwrap();
        let session: Arc<dyn Session> = memory.clone();

        let cache = SnapshotCache::new();
        let paths = ["/content".to_string()];
        cache.prefetch(&session, &paths, BinaryMode::Presence);
        memory.set_property("/content", "title", "x").unwrap();
        cache.prefetch(&session, &paths, BinaryMode::Presence);

        let cached = cache.get(session.id(), "/content").unwrap();
        assert!(cached.property("title").is_none());
    }

    #[test]
    fn test_apply_prunes_removed_nodes() {
        let repo = MemoryRepository::new();
        let memory = repo.login("admin");
        memory.add_node("/", "a", "nt:unstructured").unwrap();
        memory.add_node("/", "b", "nt:unstructured").unwrap();
        let session: Arc<dyn Session> = memory.clone();

        let cache = SnapshotCache::new();
        cache.prefetch(
            &session,
            &["/a".to_string(), "/b".to_string()],
            BinaryMode::Presence,
        );
        memory.remove_node("/a").unwrap();

        let mut dirty = DirtyStates::new();
        let root = Snapshot::capture(&session.node("/").unwrap(), "admin", BinaryMode::Presence);
        dirty.insert("/".to_string(), Arc::new(root));
        cache.apply(&session, dirty);

        assert!(!cache.contains(session.id(), "/a"));
        assert!(cache.contains(session.id(), "/b"));
        assert!(cache.contains(session.id(), "/"));
    }

    #[test]
    fn test_purge_dead_sessions() {
        let repo = MemoryRepository::new();
        let cache = SnapshotCache::new();

        let closed = repo.login("admin");
        let closed_dyn: Arc<dyn Session> = closed.clone();
        cache.prefetch(&closed_dyn, &["/".to_string()], BinaryMode::Presence);

        {
            let dropped: Arc<dyn Session> = repo.login("editor");
            cache.prefetch(&dropped, &["/".to_string()], BinaryMode::Presence);
        }

        let open: Arc<dyn Session> = repo.login("author");
        cache.prefetch(&open, &["/".to_string()], BinaryMode::Presence);

        closed.logout();
        assert_eq!(cache.session_count(), 3);
        assert_eq!(cache.purge_dead(), 2);
        assert_eq!(cache.session_count(), 1);
        assert!(cache.contains(open.id(), "/"));
    }
}
