use std::fmt;
use std::ops::BitOr;

use crate::path;

/// Kind of a change event
///
/// Bit values match the classic content repository observation
/// constants. `Generic` (0) means "something below this path changed,
/// fetch it again".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    Generic,
    NodeAdded,
    NodeRemoved,
    PropertyAdded,
    PropertyRemoved,
    PropertyChanged,
}

impl EventKind {
    pub fn bits(self) -> u32 {
        match self {
            EventKind::Generic => 0,
            EventKind::NodeAdded => 1,
            EventKind::NodeRemoved => 2,
            EventKind::PropertyAdded => 4,
            EventKind::PropertyRemoved => 8,
            EventKind::PropertyChanged => 16,
        }
    }

    pub fn is_generic(self) -> bool {
        self == EventKind::Generic
    }
}

/// Bitmask of event kinds a listener is interested in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventTypes(u32);

impl EventTypes {
    pub const NONE: EventTypes = EventTypes(0);
    pub const NODE_ADDED: EventTypes = EventTypes(1);
    pub const NODE_REMOVED: EventTypes = EventTypes(2);
    pub const PROPERTY_ADDED: EventTypes = EventTypes(4);
    pub const PROPERTY_REMOVED: EventTypes = EventTypes(8);
    pub const PROPERTY_CHANGED: EventTypes = EventTypes(16);
    pub const ALL: EventTypes = EventTypes(31);

    pub fn from_bits(bits: u32) -> Self {
        EventTypes(bits & Self::ALL.0)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    /// Generic events carry no type bit and are never masked out here;
    ///  callers decide how to treat them
    pub fn contains(self, kind: EventKind) -> bool {
        self.0 & kind.bits() != 0
    }
}

impl BitOr for EventTypes {
    type Output = EventTypes;

    fn bitor(self, rhs: Self) -> Self::Output {
        EventTypes(self.0 | rhs.0)
    }
}

impl From<EventKind> for EventTypes {
    fn from(kind: EventKind) -> Self {
        EventTypes(kind.bits())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Event {
    /// Item path for typed events, subtree root for generic ones
    pub path: String,
    pub kind: EventKind,
    pub user_id: String,
}

impl Event {
    pub fn new(path: impl Into<String>, kind: EventKind, user_id: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind,
            user_id: user_id.into(),
        }
    }

    /// Event on the item `name` below `parent`
    pub fn child(parent: &str, name: &str, kind: EventKind, user_id: &str) -> Self {
        Self::new(path::join(parent, name), kind, user_id)
    }

    pub fn generic(path: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self::new(path, EventKind::Generic, user_id)
    }

    /// Path of the node this event is about: the item's parent for typed
    ///  events, the path itself for generic ones
    pub fn parent_path(&self) -> &str {
        if self.kind.is_generic() {
            return &self.path;
        }
        path::parent_path(&self.path).unwrap_or(path::ROOT)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({}) by {}", self.kind, self.path, self.user_id)
    }
}

/// Subscription parameters for an event listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFilter {
    pub event_types: EventTypes,
    pub path: String,
    /// Observe the whole subtree instead of the node alone
    pub is_deep: bool,
    /// Only report events whose parent has one of these identifiers
    pub identifiers: Option<Vec<String>>,
    /// Only report events whose parent is of one of these types
    ///  (supertypes included)
    pub node_types: Option<Vec<String>>,
    /// Skip events caused by the subscribing session itself
    pub no_local: bool,
}

impl EventFilter {
    /// All event kinds on the node at `path` only
    pub fn node(path: impl Into<String>) -> Self {
        Self {
            event_types: EventTypes::ALL,
            path: path.into(),
            is_deep: false,
            identifiers: None,
            node_types: None,
            no_local: false,
        }
    }

    /// All event kinds on the subtree rooted at `path`
    pub fn subtree(path: impl Into<String>) -> Self {
        Self {
            is_deep: true,
            ..Self::node(path)
        }
    }

    pub fn with_event_types(mut self, event_types: EventTypes) -> Self {
        self.event_types = event_types;
        self
    }

    pub fn with_identifiers<I, S>(mut self, identifiers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.identifiers = Some(identifiers.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_node_types<I, S>(mut self, node_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.node_types = Some(node_types.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_no_local(mut self, no_local: bool) -> Self {
        self.no_local = no_local;
        self
    }

    /// Whether a parent path falls inside the subscribed path
    pub fn covers(&self, parent_path: &str) -> bool {
        parent_path == self.path || (self.is_deep && path::is_ancestor(&self.path, parent_path))
    }
}

/// Receiver of event batches
pub trait EventListener: Send + Sync {
    fn on_event(&self, events: &[Event]);
}
