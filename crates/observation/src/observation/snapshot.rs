use std::collections::BTreeMap;

use crate::config::BinaryMode;
use crate::event::{Event, EventKind};
use crate::repository::{NodeView, Value};

const BINARY_MARKER: &str = "binary";

/// Immutable capture of a node's properties and child names
///
/// Two snapshots of the same path can be diffed into the events that
/// turn the first into the second. A snapshot is never updated; a changed
/// node gets a new snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    path: String,
    user_id: String,
    properties: BTreeMap<String, Vec<Value>>,
    children: Vec<String>,
}

fn substitute_binary(value: &Value, mode: BinaryMode) -> Value {
    match (value, mode) {
        (Value::Binary(_), BinaryMode::Presence) => Value::String(BINARY_MARKER.to_string()),
        (Value::Binary(bytes), BinaryMode::Digest) => {
            Value::String(blake3::hash(bytes).to_hex().to_string())
        }
        (other, _) => other.clone(),
    }
}

impl Snapshot {
    pub fn capture(node: &NodeView, user_id: &str, mode: BinaryMode) -> Self {
        let properties = node
            .properties
            .iter()
            .map(|p| {
                let values = p.values.iter().map(|v| substitute_binary(v, mode)).collect();
                (p.name.clone(), values)
            })
            .collect();

        Self {
            path: node.path.clone(),
            user_id: user_id.to_string(),
            properties,
            children: node.children.clone(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn property(&self, name: &str) -> Option<&[Value]> {
        self.properties.get(name).map(Vec::as_slice)
    }

    pub fn children(&self) -> &[String] {
        &self.children
    }

    /// Events leading from this state to `new`
    ///
    /// Changed and removed properties come first, then added properties,
    /// then added children, then removed children.
    pub fn diff(&self, new: &Snapshot) -> Vec<Event> {
        let mut events = Vec::new();
        let event = |name: &str, kind| Event::child(&self.path, name, kind, &self.user_id);

        for (name, old_values) in &self.properties {
            match new.properties.get(name) {
                Some(new_values) if new_values == old_values => {}
                Some(_) => events.push(event(name, EventKind::PropertyChanged)),
                None => events.push(event(name, EventKind::PropertyRemoved)),
            }
        }
        for name in new.properties.keys() {
            if !self.properties.contains_key(name) {
                events.push(event(name, EventKind::PropertyAdded));
            }
        }

        for child in &new.children {
            if !self.children.contains(child) {
                events.push(event(child, EventKind::NodeAdded));
            }
        }
        for child in &self.children {
            if !new.children.contains(child) {
                events.push(event(child, EventKind::NodeRemoved));
            }
        }
        events
    }

    /// "Something changed here" event, for nodes without a previous state
    pub fn change_event(&self) -> Event {
        Event::generic(&self.path, &self.user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::Property;

    fn node(properties: Vec<Property>, children: &[&str]) -> NodeView {
        NodeView {
            path: "/content".to_string(),
            index: 1,
            primary_type: "nt:unstructured".to_string(),
            mixin_types: Vec::new(),
            identifier: None,
            properties,
            children: children.iter().map(|c| c.to_string()).collect(),
            is_new: false,
            is_modified: false,
            is_canonical: true,
        }
    }

    fn capture(node: &NodeView) -> Snapshot {
        Snapshot::capture(node, "admin", BinaryMode::Presence)
    }

    fn kinds(events: &[Event]) -> Vec<(String, EventKind)> {
        events.iter().map(|e| (e.path.clone(), e.kind)).collect()
    }

    #[test]
    fn test_identical_states_diff_to_nothing() {
        let n = node(
            vec![Property::single("title", "x"), Property::single("count", 3i64)],
            &["a", "b[2]"],
        );
        assert!(capture(&n).diff(&capture(&n)).is_empty());
    }

    #[test]
    fn test_nan_double_equals_itself() {
        let n = node(vec![Property::single("ratio", Value::Double(f64::NAN))], &[]);
        assert!(capture(&n).diff(&capture(&n)).is_empty());

        let changed = node(vec![Property::single("ratio", Value::Double(0.5))], &[]);
        assert_eq!(
            kinds(&capture(&n).diff(&capture(&changed))),
            vec![("/content/ratio".to_string(), EventKind::PropertyChanged)]
        );
    }

    #[test]
    fn test_property_changes() {
        let old = capture(&node(
            vec![
                Property::single("kept", "same"),
                Property::single("changed", "before"),
                Property::single("zremoved", "gone"),
                Property::multi("tags", vec!["a".into(), "b".into()]),
            ],
            &[],
        ));
        let new = capture(&node(
            vec![
                Property::single("added", "new"),
                Property::single("kept", "same"),
                Property::single("changed", "after"),
                Property::multi("tags", vec!["a".into()]),
            ],
            &[],
        ));

        assert_eq!(
            kinds(&old.diff(&new)),
            vec![
                ("/content/changed".to_string(), EventKind::PropertyChanged),
                ("/content/tags".to_string(), EventKind::PropertyChanged),
                ("/content/zremoved".to_string(), EventKind::PropertyRemoved),
                ("/content/added".to_string(), EventKind::PropertyAdded),
            ]
        );
    }

    #[test]
    fn test_removals_precede_additions_regardless_of_input_order() {
        let forward = vec![Property::single("a", "1"), Property::single("b", "1")];
        let backward = vec![Property::single("b", "1"), Property::single("a", "1")];
        let new = capture(&node(vec![Property::single("c", "1")], &[]));

        for props in [forward, backward] {
            let events = capture(&node(props, &[])).diff(&new);
            let first_added = events
                .iter()
                .position(|e| e.kind == EventKind::PropertyAdded)
                .unwrap();
            assert!(events[..first_added]
                .iter()
                .all(|e| e.kind == EventKind::PropertyRemoved));
            assert_eq!(first_added, 2);
        }
    }

    #[test]
    fn test_child_changes() {
        let old = capture(&node(vec![], &["a", "b"]));
        let new = capture(&node(vec![], &["b", "c", "c[2]"]));
        assert_eq!(
            kinds(&old.diff(&new)),
            vec![
                ("/content/c".to_string(), EventKind::NodeAdded),
                ("/content/c[2]".to_string(), EventKind::NodeAdded),
                ("/content/a".to_string(), EventKind::NodeRemoved),
            ]
        );
    }

    #[test]
    fn test_binary_presence_mode_ignores_content() {
        let old = node(vec![Property::single("data", Value::Binary(vec![1, 2]))], &[]);
        let new = node(vec![Property::single("data", Value::Binary(vec![3, 4]))], &[]);
        assert!(capture(&old).diff(&capture(&new)).is_empty());

        let gone = node(vec![], &[]);
        assert_eq!(
            kinds(&capture(&old).diff(&capture(&gone))),
            vec![("/content/data".to_string(), EventKind::PropertyRemoved)]
        );
    }

    #[test]
    fn test_binary_digest_mode_detects_content() {
        let old = node(vec![Property::single("data", Value::Binary(vec![1, 2]))], &[]);
        let new = node(vec![Property::single("data", Value::Binary(vec![3, 4]))], &[]);
        let old = Snapshot::capture(&old, "admin", BinaryMode::Digest);
        let new = Snapshot::capture(&new, "admin", BinaryMode::Digest);
        assert_eq!(
            kinds(&old.diff(&new)),
            vec![("/content/data".to_string(), EventKind::PropertyChanged)]
        );
    }

    #[test]
    fn test_change_event() {
        let snapshot = capture(&node(vec![], &[]));
        let event = snapshot.change_event();
        assert_eq!(event.kind, EventKind::Generic);
        assert_eq!(event.path, "/content");
    }
}
