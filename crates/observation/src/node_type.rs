//! Node type schema as a precomputed supertype closure
//!
//! Type checks during event filtering are plain set lookups against a table
//! built once per schema version, instead of walking a live type hierarchy.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

static SCHEMA_VERSION: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
pub struct NodeTypeRegistry {
    version: u64,
    // type name -> the type itself plus all transitive supertypes
    closure: HashMap<String, HashSet<String>>,
}

#[derive(Debug, Clone, Default)]
pub struct NodeTypeRegistryBuilder {
    definitions: BTreeMap<String, Vec<String>>,
}

impl NodeTypeRegistryBuilder {
    /// Declare a type and its direct supertypes
    pub fn define(mut self, name: &str, supertypes: &[&str]) -> Self {
        self.definitions.insert(
            name.to_string(),
            supertypes.iter().map(|s| s.to_string()).collect(),
        );
        self
    }

    pub fn build(self) -> NodeTypeRegistry {
        let mut closure = HashMap::with_capacity(self.definitions.len());
        for name in self.definitions.keys() {
            let mut seen = HashSet::new();
            let mut stack = vec![name.clone()];
            while let Some(current) = stack.pop() {
                if !seen.insert(current.clone()) {
                    continue;
                }
                if let Some(supertypes) = self.definitions.get(&current) {
                    stack.extend(supertypes.iter().cloned());
                }
            }
            closure.insert(name.clone(), seen);
        }

        NodeTypeRegistry {
            version: SCHEMA_VERSION.fetch_add(1, Ordering::Relaxed) + 1,
            closure,
        }
    }
}

impl Default for NodeTypeRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

impl NodeTypeRegistry {
    pub fn builder() -> NodeTypeRegistryBuilder {
        NodeTypeRegistryBuilder::default()
    }

    /// The base repository types plus the CMS document and virtual
    ///  root types
    pub fn standard() -> Self {
        Self::builder()
            .define("nt:base", &[])
            .define("nt:unstructured", &["nt:base"])
            .define("rep:root", &["nt:unstructured"])
            .define("mix:referenceable", &[])
            .define("mix:versionable", &["mix:referenceable"])
            .define("hippo:document", &["nt:base"])
            .define("hippo:handle", &["nt:base", "mix:referenceable"])
            .define("hippostd:folder", &["hippo:document"])
            .define("hippo:facetsearch", &["nt:base"])
            .define("hippofacnav:facetnavigation", &["nt:base"])
            .build()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_defined(&self, name: &str) -> bool {
        self.closure.contains_key(name)
    }

    /// Whether `actual` is `wanted` or one of its subtypes.
    ///  Undefined types only match themselves.
    pub fn is_node_type(&self, actual: &str, wanted: &str) -> bool {
        if actual == wanted {
            return true;
        }
        self.closure
            .get(actual)
            .map(|supertypes| supertypes.contains(wanted))
            .unwrap_or(false)
    }

    /// Whether any of `actuals` satisfies any of `wanted`
    pub fn matches_any<'a, A, W>(&self, actuals: A, wanted: W) -> bool
    where
        A: IntoIterator<Item = &'a str>,
        W: IntoIterator<Item = &'a str> + Clone,
    {
        actuals.into_iter().any(|actual| {
            wanted
                .clone()
                .into_iter()
                .any(|w| self.is_node_type(actual, w))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitive_closure() {
        let registry = NodeTypeRegistry::standard();
        assert!(registry.is_node_type("hippostd:folder", "hippo:document"));
        assert!(registry.is_node_type("hippostd:folder", "nt:base"));
        assert!(registry.is_node_type("mix:versionable", "mix:referenceable"));
        assert!(!registry.is_node_type("hippo:document", "hippostd:folder"));
        assert!(!registry.is_node_type("nt:base", "mix:referenceable"));
    }

    #[test]
    fn test_undefined_types_match_themselves() {
        let registry = NodeTypeRegistry::standard();
        assert!(registry.is_node_type("my:type", "my:type"));
        assert!(!registry.is_node_type("my:type", "nt:base"));
        assert!(!registry.is_defined("my:type"));
    }

    #[test]
    fn test_cycles_terminate() {
        let registry = NodeTypeRegistry::builder()
            .define("a", &["b"])
            .define("b", &["a"])
            .build();
        assert!(registry.is_node_type("a", "b"));
        assert!(registry.is_node_type("b", "a"));
    }

    #[test]
    fn test_matches_any() {
        let registry = NodeTypeRegistry::standard();
        let actual = ["nt:unstructured", "mix:versionable"];
        assert!(registry.matches_any(actual, ["mix:referenceable"]));
        assert!(!registry.matches_any(actual, ["hippo:document", "hippo:handle"]));
    }

    #[test]
    fn test_versions_increase() {
        let first = NodeTypeRegistry::standard();
        let second = NodeTypeRegistry::standard();
        assert!(second.version() > first.version());
    }
}
