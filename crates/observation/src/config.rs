use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// How binary property values are represented inside a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BinaryMode {
    /// Replace every binary value with a constant marker; only
    ///  presence, absence and arity of binary properties is diffed
    #[default]
    Presence,
    /// Replace every binary value with its BLAKE3 digest so content
    ///  changes are reported as property changes
    Digest,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationConfig {
    /// Turn off the virtual root broadcaster entirely
    #[serde(default)]
    pub virtual_roots_disabled: bool,
    /// Primary types of nodes whose content is derived from a
    ///  backing subtree (search and navigation roots)
    #[serde(default = "default_virtual_root_types")]
    pub virtual_root_types: Vec<String>,
    /// Property on a virtual root holding the identifier(s) of
    ///  its backing node(s)
    #[serde(default = "default_docbase_property")]
    pub docbase_property: String,
    /// Node type that makes a filtered deep subscription eligible
    ///  for virtual root broadcasts
    #[serde(default = "default_document_type")]
    pub document_type: String,
    /// Mixin marking a node as referenceable by identifier
    #[serde(default = "default_referenceable_mixin")]
    pub referenceable_mixin: String,
    #[serde(default)]
    pub binary_mode: BinaryMode,
}

fn default_virtual_root_types() -> Vec<String> {
    vec![
        "hippo:facetsearch".to_string(),
        "hippofacnav:facetnavigation".to_string(),
    ]
}

fn default_docbase_property() -> String {
    "hippo:docbase".to_string()
}

fn default_document_type() -> String {
    "hippo:document".to_string()
}

fn default_referenceable_mixin() -> String {
    "mix:referenceable".to_string()
}

impl Default for ObservationConfig {
    fn default() -> Self {
        Self {
            virtual_roots_disabled: false,
            virtual_root_types: default_virtual_root_types(),
            docbase_property: default_docbase_property(),
            document_type: default_document_type(),
            referenceable_mixin: default_referenceable_mixin(),
            binary_mode: BinaryMode::default(),
        }
    }
}

impl ObservationConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    /// Load configuration from a TOML file; missing keys fall back to defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn is_virtual_root_type(&self, type_name: &str) -> bool {
        self.virtual_root_types.iter().any(|t| t == type_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_toml_is_default() {
        let config = ObservationConfig::from_toml_str("").unwrap();
        assert_eq!(config, ObservationConfig::default());
    }

    #[test]
    fn test_partial_toml() {
        let config = ObservationConfig::from_toml_str(
            r#"
            virtual_roots_disabled = true
            binary_mode = "digest"
            "#,
        )
        .unwrap();
        assert!(config.virtual_roots_disabled);
        assert_eq!(config.binary_mode, BinaryMode::Digest);
        assert_eq!(config.docbase_property, "hippo:docbase");
        assert!(config.is_virtual_root_type("hippo:facetsearch"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "virtual_root_types = [\"my:search\"]").unwrap();

        let config = ObservationConfig::load(file.path()).unwrap();
        assert_eq!(config.virtual_root_types, vec!["my:search".to_string()]);
        assert!(!config.is_virtual_root_type("hippo:facetsearch"));
    }

    #[test]
    fn test_invalid_toml() {
        let result = ObservationConfig::from_toml_str("binary_mode = \"sometimes\"");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }
}
