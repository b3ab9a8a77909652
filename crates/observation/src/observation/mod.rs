//! Snapshot based observation on top of a repository's native events
//!
//! An [`ObservationCoordinator`] owns every registration made through it.
//! Each registration is backed by a [`ListenerAdapter`] that queues native
//! events and, when the session's owner asks for it, diffs the session's
//! transient state against the cached [`Snapshot`]s:
//!
//! 1. [`ObservationCoordinator::refresh_session`] lets virtual roots
//!    broadcast and refreshes the paths touched by native events.
//! 2. [`ObservationCoordinator::process_events`] collects and delivers one
//!    batch per listener, then merges the new snapshots into the cache.

mod adapter;
mod broadcaster;
mod cache;
mod coordinator;
mod snapshot;

pub use adapter::ListenerAdapter;
pub use broadcaster::{Broadcasters, VirtualRootBroadcaster, BROADCASTER_USER_ID};
pub use cache::{DirtyStates, SnapshotCache};
pub use coordinator::{ObservationCoordinator, SessionObservationManager, Subscription};
pub use snapshot::Snapshot;

use crate::repository::RepositoryError;

#[derive(Debug, thiserror::Error)]
pub enum ObservationError {
    #[error("no repository session bound to the user session")]
    NoSession,
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("{0} is no longer registered")]
    NotRegistered(String),
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
}

impl From<ObservationError> for RepositoryError {
    fn from(e: ObservationError) -> Self {
        match e {
            ObservationError::Repository(e) => e,
            ObservationError::InvalidPath(p) => RepositoryError::InvalidPath(p),
            other => RepositoryError::Other(anyhow::Error::new(other)),
        }
    }
}
