/**
 * Runtime configuration for the observation layer.
 *  Loaded from TOML or built from defaults.
 */
pub mod config;
/**
 * Events, event type masks and subscription filters.
 *  Shared by the native repository observation and
 *  the caching layer that sits on top of it.
 */
pub mod event;
/**
 * Supertype closure tables for node type checks.
 */
pub mod node_type;
/**
 * The snapshot / diff / dispatch machinery.
 *  Wraps a repository's native observation with
 *  per-session snapshot caching.
 */
pub mod observation;
/**
 * Repository path helpers.
 */
pub mod path;
/**
 * Traits describing the content repository we observe,
 *  plus an in-memory implementation.
 */
pub mod repository;

pub mod prelude {
    pub use crate::config::{BinaryMode, ObservationConfig};
    pub use crate::event::{Event, EventFilter, EventKind, EventListener, EventTypes};
    pub use crate::node_type::NodeTypeRegistry;
    pub use crate::observation::{
        ObservationCoordinator, ObservationError, SessionObservationManager, Snapshot,
        Subscription,
    };
    pub use crate::repository::{
        NodeView, ObservationManager, RepositoryError, Session, SessionId, UserSession, Value,
    };
}
