use std::collections::{BTreeMap, BTreeSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::adapter::ListenerAdapter;
use super::broadcaster::Broadcasters;
use super::cache::{DirtyStates, SnapshotCache};
use super::ObservationError;
use crate::config::ObservationConfig;
use crate::event::{EventFilter, EventListener};
use crate::path;
use crate::repository::{
    ObservationManager, RepositoryError, Session, UserSession, UserSessionId,
};

/// Handle on one registration
///
/// Dropping it queues the registration for disposal; the next call into
/// the coordinator unregisters it. Use [`Subscription::detach`] to keep
/// the registration alive for as long as the listener itself lives.
#[must_use = "dropping a Subscription unregisters the listener"]
pub struct Subscription {
    id: u64,
    disposals: flume::Sender<u64>,
    active: bool,
}

impl Subscription {
    fn new(id: u64, disposals: flume::Sender<u64>) -> Self {
        Self {
            id,
            disposals,
            active: true,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Keep the registration until the listener is dropped or removed
    pub fn detach(mut self) {
        self.active = false;
    }

    pub fn dispose(self) {
        drop(self)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.active {
            // the coordinator may be gone already
            let _ = self.disposals.send(self.id);
        }
    }
}

/// Owns the listener registrations, the snapshot cache and the
///  virtual root broadcasters for any number of user sessions
pub struct ObservationCoordinator {
    config: Arc<ObservationConfig>,
    listeners: Mutex<BTreeMap<u64, Arc<ListenerAdapter>>>,
    cache: SnapshotCache,
    broadcasters: Arc<Broadcasters>,
    disposals_tx: flume::Sender<u64>,
    disposals_rx: flume::Receiver<u64>,
    next_id: AtomicU64,
}

impl Default for ObservationCoordinator {
    fn default() -> Self {
        Self::new(ObservationConfig::default())
    }
}

impl ObservationCoordinator {
    pub fn new(config: ObservationConfig) -> Self {
        let config = Arc::new(config);
        let (disposals_tx, disposals_rx) = flume::unbounded();
        Self {
            broadcasters: Arc::new(Broadcasters::new(config.clone())),
            config,
            listeners: Mutex::new(BTreeMap::new()),
            cache: SnapshotCache::new(),
            disposals_tx,
            disposals_rx,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn cache(&self) -> &SnapshotCache {
        &self.cache
    }

    /// Register `listener` for the events of `user`'s repository session
    ///
    /// Only a weak reference to the listener is kept. Registering the same
    /// listener again replaces its previous registration.
    pub fn subscribe(
        &self,
        user: &Arc<dyn UserSession>,
        listener: &Arc<dyn EventListener>,
        filter: EventFilter,
    ) -> Result<Subscription, ObservationError> {
        self.cleanup();
        let session = user
            .repository_session()
            .ok_or(ObservationError::NoSession)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let adapter = Arc::new(ListenerAdapter::new(
            id,
            user,
            listener,
            filter,
            self.config.clone(),
            self.broadcasters.clone(),
        ));
        let fixed = adapter.init()?;

        let replaced: Vec<Arc<ListenerAdapter>> = {
            let mut listeners = self.listeners.lock();
            let previous: Vec<u64> = listeners
                .values()
                .filter(|a| a.is_upstream(listener))
                .map(|a| a.id())
                .collect();
            let replaced = previous
                .iter()
                .filter_map(|id| listeners.remove(id))
                .collect();
            listeners.insert(id, adapter.clone());
            replaced
        };
        for previous in replaced {
            tracing::debug!("replacing {}", previous);
            previous.dispose();
        }

        self.cache.prefetch(&session, &fixed, self.config.binary_mode);
        tracing::debug!("registered {}", adapter);
        Ok(Subscription::new(id, self.disposals_tx.clone()))
    }

    /// [`Self::subscribe`], keeping the registration for the listener's lifetime
    pub fn add_event_listener(
        &self,
        user: &Arc<dyn UserSession>,
        listener: &Arc<dyn EventListener>,
        filter: EventFilter,
    ) -> Result<(), ObservationError> {
        self.subscribe(user, listener, filter).map(Subscription::detach)
    }

    /// Returns whether the listener was registered
    pub fn remove_event_listener(&self, listener: &Arc<dyn EventListener>) -> bool {
        self.cleanup();
        let removed: Vec<Arc<ListenerAdapter>> = {
            let mut listeners = self.listeners.lock();
            let ids: Vec<u64> = listeners
                .values()
                .filter(|a| a.is_upstream(listener))
                .map(|a| a.id())
                .collect();
            ids.iter().filter_map(|id| listeners.remove(id)).collect()
        };
        if removed.is_empty() {
            tracing::info!("listener was not registered");
            return false;
        }
        for adapter in removed {
            adapter.dispose();
        }
        true
    }

    /// Live listeners across all user sessions
    pub fn registered_event_listeners(&self) -> Vec<Arc<dyn EventListener>> {
        self.cleanup();
        self.listeners
            .lock()
            .values()
            .filter_map(|a| a.upstream())
            .collect()
    }

    pub fn registered_for(&self, user: UserSessionId) -> Vec<Arc<dyn EventListener>> {
        self.cleanup();
        self.session_adapters(user)
            .iter()
            .filter_map(|a| a.upstream())
            .collect()
    }

    /// Observation manager bound to one user session
    pub fn scoped(self: &Arc<Self>, user: Arc<dyn UserSession>) -> SessionObservationManager {
        SessionObservationManager {
            coordinator: self.clone(),
            user,
        }
    }

    /// Adapters owned by `user`, ordered by subscription path
    fn session_adapters(&self, user: UserSessionId) -> Vec<Arc<ListenerAdapter>> {
        let mut adapters: Vec<Arc<ListenerAdapter>> = self
            .listeners
            .lock()
            .values()
            .filter(|a| a.owner_id() == user)
            .cloned()
            .collect();
        adapters.sort_by(|a, b| a.path().cmp(b.path()).then(a.id().cmp(&b.id())));
        adapters
    }

    /// Let virtual roots broadcast and reload the paths touched by native
    ///  events, keeping transient changes
    pub fn refresh_session(&self, user: &Arc<dyn UserSession>) {
        self.cleanup();
        let Some(session) = user.repository_session() else {
            tracing::info!("no repository session, cleaning up listeners");
            self.drop_user_adapters(user.id());
            return;
        };

        if let Some(broadcaster) = self.broadcasters.get(session.id()) {
            let delivered = broadcaster.broadcast();
            if delivered > 0 {
                tracing::debug!("virtual roots notified {} listeners", delivered);
            }
        }

        let mut paths = BTreeSet::new();
        for adapter in self.session_adapters(user.id()) {
            adapter.pending_paths(&mut paths);
        }
        Self::refresh_paths(session.as_ref(), paths);
    }

    fn refresh_paths(session: &dyn Session, mut paths: BTreeSet<String>) {
        if paths.contains(path::ROOT) {
            if let Err(e) = session.refresh(path::ROOT, true) {
                tracing::error!("failed to refresh session: {}", e);
            }
            return;
        }

        path::prune_descendants(&mut paths);
        for p in paths {
            tracing::debug!("refreshing {}, keeping changes", p);
            match session.refresh(&p, true) {
                Ok(()) => {}
                Err(RepositoryError::PathNotFound(_)) => {
                    tracing::info!("could not find path {} for event, discarding", p)
                }
                Err(e) => tracing::error!("failed to refresh {}: {}", p, e),
            }
        }
    }

    /// Deliver one batch of events to each of `user`'s listeners
    pub fn process_events(&self, user: &Arc<dyn UserSession>) {
        self.cleanup();
        let Some(session) = user.repository_session() else {
            tracing::error!("no repository session found for user session {}", user.id());
            return;
        };

        let mut dirty = DirtyStates::new();
        for adapter in self.session_adapters(user.id()) {
            let events = adapter.process(&mut dirty, &self.cache);
            if events.is_empty() {
                continue;
            }
            match adapter.upstream() {
                Some(listener) => {
                    for event in &events {
                        tracing::debug!("processing {}", event);
                    }
                    let delivery =
                        panic::catch_unwind(AssertUnwindSafe(|| listener.on_event(&events)));
                    if delivery.is_err() {
                        tracing::error!("{} panicked while handling events", adapter);
                    }
                }
                None => tracing::info!("listener disappeared during processing"),
            }
        }
        self.cache.apply(&session, dirty);
    }

    /// Dispose everything registered for `user`, typically at logout
    pub fn cleanup_listeners(&self, user: &Arc<dyn UserSession>) {
        self.cleanup();
        let disposed = self.drop_user_adapters(user.id());
        if disposed > 0 {
            tracing::debug!("disposed {} listeners of user session {}", disposed, user.id());
        }
        if let Some(session) = user.repository_session() {
            self.cache.evict(session.id());
            self.broadcasters.remove(session.id());
        }
    }

    fn drop_user_adapters(&self, user: UserSessionId) -> usize {
        let removed: Vec<Arc<ListenerAdapter>> = {
            let mut listeners = self.listeners.lock();
            let ids: Vec<u64> = listeners
                .values()
                .filter(|a| a.owner_id() == user)
                .map(|a| a.id())
                .collect();
            ids.iter().filter_map(|id| listeners.remove(id)).collect()
        };
        for adapter in &removed {
            adapter.dispose();
        }
        removed.len()
    }

    /// Drop registrations that were disposed, or whose subscription,
    ///  listener or owner is gone, then idle broadcasters and dead cache
    ///  entries
    fn cleanup(&self) {
        let dropped: BTreeSet<u64> = self.disposals_rx.try_iter().collect();
        let disposed: Vec<Arc<ListenerAdapter>> = {
            let mut listeners = self.listeners.lock();
            let ids: Vec<u64> = listeners
                .values()
                .filter(|a| dropped.contains(&a.id()) || a.is_orphaned() || a.is_disposed())
                .map(|a| a.id())
                .collect();
            ids.iter().filter_map(|id| listeners.remove(id)).collect()
        };
        for adapter in disposed {
            tracing::debug!("cleaning up {}", adapter);
            adapter.dispose();
        }

        let idle = self.broadcasters.purge_idle();
        let dead = self.cache.purge_dead();
        if idle > 0 || dead > 0 {
            tracing::debug!(
                "dropped {} idle broadcasters and {} dead session caches",
                idle,
                dead
            );
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }
}

/// [`ObservationManager`] view of a coordinator for one user session
pub struct SessionObservationManager {
    coordinator: Arc<ObservationCoordinator>,
    user: Arc<dyn UserSession>,
}

impl SessionObservationManager {
    pub fn refresh(&self) {
        self.coordinator.refresh_session(&self.user);
    }

    pub fn process(&self) {
        self.coordinator.process_events(&self.user);
    }
}

impl ObservationManager for SessionObservationManager {
    fn add_event_listener(
        &self,
        listener: Arc<dyn EventListener>,
        filter: EventFilter,
    ) -> Result<(), RepositoryError> {
        Ok(self
            .coordinator
            .add_event_listener(&self.user, &listener, filter)?)
    }

    fn remove_event_listener(
        &self,
        listener: &Arc<dyn EventListener>,
    ) -> Result<(), RepositoryError> {
        self.coordinator.remove_event_listener(listener);
        Ok(())
    }

    fn registered_event_listeners(&self) -> Vec<Arc<dyn EventListener>> {
        self.coordinator.registered_for(self.user.id())
    }
}
