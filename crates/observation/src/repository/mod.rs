//! Content repository collaborators
//!
//! The observation layer consumes a tree-structured repository through these
//! traits:
//!
//! - **[`Session`]**: read access to nodes and properties, a "pending changes"
//!   introspection call, refresh and liveness, plus the repository's native
//!   push-based [`ObservationManager`].
//! - **[`UserSession`]**: the owner of a repository session (typically one per
//!   logged-in user). Its repository session may be replaced over time.
//!
//! [`memory`] contains an in-memory implementation used by the tests.

pub mod memory;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::event::{EventFilter, EventListener};
use crate::node_type::NodeTypeRegistry;

pub use memory::{MemoryRepository, MemorySession, MemoryUserSession};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a repository session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub fn next() -> Self {
        SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Identifier of a user session (the owner of repository sessions)
pub type UserSessionId = u64;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    String(String),
    Long(i64),
    Double(f64),
    Boolean(bool),
    Name(String),
    Path(String),
    /// Identifier of a referenceable node
    Reference(String),
    Binary(Vec<u8>),
}

/// Doubles compare by bit pattern, so a NaN equals itself
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::String(a), Value::String(b))
            | (Value::Name(a), Value::Name(b))
            | (Value::Path(a), Value::Path(b))
            | (Value::Reference(a), Value::Reference(b)) => a == b,
            (Value::Long(a), Value::Long(b)) => a == b,
            (Value::Double(a), Value::Double(b)) => a.to_bits() == b.to_bits(),
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Binary(a), Value::Binary(b)) => a == b,
            _ => false,
        }
    }
}

impl Value {
    /// String form of the value, `None` for binaries
    pub fn as_string(&self) -> Option<String> {
        match self {
            Value::String(s) | Value::Name(s) | Value::Path(s) | Value::Reference(s) => {
                Some(s.clone())
            }
            Value::Long(l) => Some(l.to_string()),
            Value::Double(d) => Some(d.to_string()),
            Value::Boolean(b) => Some(b.to_string()),
            Value::Binary(_) => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(l: i64) -> Self {
        Value::Long(l)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    pub name: String,
    pub values: Vec<Value>,
    pub multiple: bool,
}

impl Property {
    pub fn single(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            values: vec![value.into()],
            multiple: false,
        }
    }

    pub fn multi(name: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            values,
            multiple: true,
        }
    }
}

/// An owned read of a single node
#[derive(Debug, Clone, PartialEq)]
pub struct NodeView {
    pub path: String,
    /// Same-name-sibling index, starting at 1
    pub index: usize,
    pub primary_type: String,
    pub mixin_types: Vec<String>,
    /// Present only when the node is referenceable
    pub identifier: Option<String>,
    pub properties: Vec<Property>,
    /// Child segment names, `[n]` suffixed from the second sibling on
    pub children: Vec<String>,
    pub is_new: bool,
    pub is_modified: bool,
    /// False for virtual nodes, whose content is derived from elsewhere
    pub is_canonical: bool,
}

impl NodeView {
    /// Primary type followed by mixins
    pub fn types(&self) -> impl Iterator<Item = &str> + Clone {
        std::iter::once(self.primary_type.as_str()).chain(self.mixin_types.iter().map(String::as_str))
    }

    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn is_node_type(&self, registry: &NodeTypeRegistry, wanted: &str) -> bool {
        self.types().any(|t| registry.is_node_type(t, wanted))
    }

    pub fn is_pending(&self) -> bool {
        self.is_new || self.is_modified
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("path not found: {0}")]
    PathNotFound(String),
    #[error("item not found: {0}")]
    ItemNotFound(String),
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("item already exists: {0}")]
    ItemExists(String),
    #[error("session is no longer live")]
    SessionClosed,
    #[error("repository error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Native push-based observation, as offered by the repository and as
///  re-exposed by the caching layer
pub trait ObservationManager: Send + Sync {
    fn add_event_listener(
        &self,
        listener: Arc<dyn EventListener>,
        filter: EventFilter,
    ) -> Result<(), RepositoryError>;

    fn remove_event_listener(&self, listener: &Arc<dyn EventListener>)
        -> Result<(), RepositoryError>;

    fn registered_event_listeners(&self) -> Vec<Arc<dyn EventListener>>;
}

pub trait Session: Send + Sync {
    fn id(&self) -> SessionId;

    fn user_id(&self) -> &str;

    fn is_live(&self) -> bool;

    fn item_exists(&self, path: &str) -> bool;

    fn node(&self, path: &str) -> Result<NodeView, RepositoryError>;

    fn node_by_identifier(&self, identifier: &str) -> Result<NodeView, RepositoryError>;

    /// Paths of new or modified nodes in the subtree rooted at `root`
    ///  (root included), optionally restricted to nodes of `node_type`.
    ///  Removed nodes are not reported.
    fn pending_changes(
        &self,
        root: &str,
        node_type: Option<&str>,
    ) -> Result<Vec<String>, RepositoryError>;

    /// Reload the subtree at `path` from persisted state
    fn refresh(&self, path: &str, keep_changes: bool) -> Result<(), RepositoryError>;

    /// Query nodes by primary type
    fn nodes_of_type(&self, types: &[&str]) -> Result<Vec<NodeView>, RepositoryError>;

    fn node_types(&self) -> Arc<NodeTypeRegistry>;

    fn observation(&self) -> &dyn ObservationManager;
}

/// Owner of a repository session
pub trait UserSession: Send + Sync {
    fn id(&self) -> UserSessionId;

    /// The currently bound repository session, if any
    fn repository_session(&self) -> Option<Arc<dyn Session>>;
}

/// Identity of a shared listener, independent of vtable metadata
pub(crate) fn listener_addr(listener: &Arc<dyn EventListener>) -> usize {
    Arc::as_ptr(listener) as *const () as usize
}
