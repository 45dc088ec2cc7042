//! Plugin manifest schema and validation.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub use semver::{Version, VersionReq};

/// Categories accepted by default.
pub const ALLOWED_CATEGORIES: &[&str] = &[
    "core",
    "auth",
    "productivity",
    "communication",
    "analytics",
    "storage",
    "integration",
    "utility",
];

/// Parse a plugin version.
pub fn parse_version(s: &str) -> Result<Version> {
    Version::parse(s.trim())
        .map_err(|e| Error::invalid_manifest(format!("invalid semantic version {}: {}", s, e)))
}

/// Parse a version constraint. An empty constraint matches every version.
pub fn parse_requirement(s: &str) -> Result<VersionReq> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(VersionReq::STAR);
    }
    VersionReq::parse(s)
        .map_err(|e| Error::invalid_manifest(format!("invalid version constraint {}: {}", s, e)))
}

fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars.next().map_or(false, |c| c.is_ascii_lowercase())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
}

/// Plugin dependency specification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    /// Dependency name.
    pub name: String,
    /// Version constraint.
    #[serde(default = "default_requirement")]
    pub version: String,
    /// Whether this dependency is optional.
    #[serde(default)]
    pub optional: bool,
}

fn default_requirement() -> String {
    "*".to_string()
}

impl Dependency {
    /// Create a new required dependency.
    pub fn required(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            optional: false,
        }
    }

    /// Create a new optional dependency.
    pub fn optional(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            optional: true,
        }
    }

    /// Parse the version constraint.
    pub fn requirement(&self) -> Result<VersionReq> {
        parse_requirement(&self.version)
    }
}

/// Value type accepted for a configuration key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    /// Any string.
    String,
    /// Integer.
    Integer,
    /// Any number.
    Number,
    /// Boolean.
    Boolean,
    /// JSON array.
    Array,
    /// JSON object.
    Object,
}

impl FieldType {
    fn accepts(&self, value: &serde_json::Value) -> bool {
        use serde_json::Value;
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Array => matches!(value, Value::Array(_)),
            Self::Object => matches!(value, Value::Object(_)),
        }
    }
}

/// One accepted configuration key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigField {
    /// Expected value type.
    #[serde(rename = "type")]
    pub field_type: FieldType,
    /// Whether the key must be present.
    #[serde(default)]
    pub required: bool,
    /// Value used when the key is absent.
    #[serde(default)]
    pub default: Option<serde_json::Value>,
    /// Human-readable description.
    #[serde(default)]
    pub description: Option<String>,
}

/// Structural description of the configuration a plugin accepts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigSchema {
    /// Accepted keys.
    pub fields: BTreeMap<String, ConfigField>,
}

impl ConfigSchema {
    /// Check if the schema declares no keys.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Check a configuration object against the schema.
    pub fn validate(&self, config: &serde_json::Value) -> Result<()> {
        self.apply(config).map(|_| ())
    }

    /// Validate a configuration object and fill in defaults.
    ///
    /// Unknown keys are rejected.
    pub fn apply(&self, config: &serde_json::Value) -> Result<serde_json::Value> {
        let mut object = match config {
            serde_json::Value::Null => serde_json::Map::new(),
            serde_json::Value::Object(map) => map.clone(),
            other => {
                return Err(Error::invalid_manifest(format!(
                    "plugin configuration must be an object, got {}",
                    other
                )))
            }
        };

        for key in object.keys() {
            if !self.fields.contains_key(key) {
                return Err(Error::invalid_manifest(format!("unknown config key: {}", key)));
            }
        }

        for (key, field) in &self.fields {
            match object.get(key) {
                Some(value) if !field.field_type.accepts(value) => {
                    return Err(Error::invalid_manifest(format!(
                        "config key {} expects {:?}",
                        key, field.field_type
                    )));
                }
                Some(_) => {}
                None => {
                    if let Some(ref default) = field.default {
                        object.insert(key.clone(), default.clone());
                    } else if field.required {
                        return Err(Error::invalid_manifest(format!(
                            "missing required config key: {}",
                            key
                        )));
                    }
                }
            }
        }

        Ok(serde_json::Value::Object(object))
    }
}

/// Immutable descriptor of a plugin's identity, dependencies, and permissions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginManifest {
    /// Plugin name (unique identifier).
    #[serde(default)]
    pub name: String,

    /// Semantic version.
    #[serde(default)]
    pub version: String,

    /// Human-readable description.
    #[serde(default)]
    pub description: String,

    /// Plugin author.
    #[serde(default)]
    pub author: String,

    /// Category, checked against the host's accepted categories.
    #[serde(default)]
    pub category: String,

    /// Plugin dependencies, in declaration order.
    #[serde(default)]
    pub dependencies: Vec<Dependency>,

    /// Required capabilities.
    #[serde(default)]
    pub permissions: BTreeSet<String>,

    /// Accepted configuration keys.
    #[serde(default, alias = "config-schema")]
    pub config_schema: ConfigSchema,
}

impl PluginManifest {
    /// Create a new manifest with identity fields only.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: String::new(),
            author: String::new(),
            category: String::new(),
            dependencies: Vec::new(),
            permissions: BTreeSet::new(),
            config_schema: ConfigSchema::default(),
        }
    }

    /// Load a manifest from a TOML or JSON file, chosen by extension.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&content),
            _ => Self::from_toml(&content),
        }
    }

    /// Parse manifest from TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::ManifestParse(e.to_string()))
    }

    /// Parse manifest from JSON string.
    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).map_err(|e| Error::ManifestParse(e.to_string()))
    }

    /// Serialize to TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::ManifestParse(e.to_string()))
    }

    /// Validate the manifest.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::missing_field("name"));
        }
        if self.version.is_empty() {
            return Err(Error::missing_field("version"));
        }
        if self.author.is_empty() {
            return Err(Error::missing_field("author"));
        }
        if self.category.is_empty() {
            return Err(Error::missing_field("category"));
        }

        if !is_valid_name(&self.name) {
            return Err(Error::invalid_manifest(format!(
                "plugin name must be lowercase alphanumeric: {}",
                self.name
            )));
        }

        parse_version(&self.version)?;

        for dep in &self.dependencies {
            if dep.name == self.name {
                return Err(Error::invalid_manifest(format!(
                    "plugin {} depends on itself",
                    self.name
                )));
            }
            dep.requirement()?;
        }

        Ok(())
    }

    /// Parsed version of this plugin.
    pub fn parsed_version(&self) -> Result<Version> {
        parse_version(&self.version)
    }

    /// Check if this manifest requests a permission.
    pub fn requires_permission(&self, permission: &str) -> bool {
        self.permissions.contains(permission)
    }

    /// Names of required (non-optional) dependencies.
    pub fn required_dependencies(&self) -> impl Iterator<Item = &Dependency> {
        self.dependencies.iter().filter(|d| !d.optional)
    }
}

/// Builder for declaring manifests in code.
pub struct ManifestBuilder {
    manifest: PluginManifest,
}

impl ManifestBuilder {
    /// Create a new manifest builder.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            manifest: PluginManifest::new(name, version),
        }
    }

    /// Set the description.
    pub fn description(mut self, desc: impl Into<String>) -> Self {
        self.manifest.description = desc.into();
        self
    }

    /// Set the author.
    pub fn author(mut self, author: impl Into<String>) -> Self {
        self.manifest.author = author.into();
        self
    }

    /// Set the category.
    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.manifest.category = category.into();
        self
    }

    /// Add a permission requirement.
    pub fn permission(mut self, permission: impl Into<String>) -> Self {
        self.manifest.permissions.insert(permission.into());
        self
    }

    /// Add a dependency.
    pub fn dependency(mut self, dep: Dependency) -> Self {
        self.manifest.dependencies.push(dep);
        self
    }

    /// Declare a configuration key.
    pub fn config_field(mut self, key: impl Into<String>, field: ConfigField) -> Self {
        self.manifest.config_schema.fields.insert(key.into(), field);
        self
    }

    /// Build and validate the manifest.
    pub fn build(self) -> Result<PluginManifest> {
        self.manifest.validate()?;
        Ok(self.manifest)
    }

    /// Build without validation.
    pub fn build_unchecked(self) -> PluginManifest {
        self.manifest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_builder(name: &str) -> ManifestBuilder {
        ManifestBuilder::new(name, "1.0.0")
            .author("Host Team")
            .category("utility")
    }

    #[test]
    fn test_version_parse() {
        let v = parse_version("1.2.3").unwrap();
        assert_eq!(v, Version::new(1, 2, 3));

        let v = parse_version(" 0.1.0-beta.2+build5 ").unwrap();
        assert_eq!(v.pre.as_str(), "beta.2");
        assert_eq!(v.build.as_str(), "build5");

        assert!(parse_version("1.2").is_err());
        assert!(parse_version("01.2.3").is_err());
        assert!(matches!(
            parse_version("one.two.three").unwrap_err(),
            Error::ManifestValidation(_)
        ));
    }

    #[test]
    fn test_prerelease_ordering_is_numeric() {
        let rc9 = parse_version("1.0.0-rc.9").unwrap();
        let rc10 = parse_version("1.0.0-rc.10").unwrap();
        assert!(rc10 > rc9);
        assert!(rc10 < Version::new(1, 0, 0));

        assert!(parse_requirement(">=1.0.0-rc.9").unwrap().matches(&rc10));
    }

    #[test]
    fn test_caret_skips_other_prereleases() {
        let caret = parse_requirement("^1.0.0").unwrap();
        assert!(!caret.matches(&parse_version("1.1.0-alpha").unwrap()));
        assert!(caret.matches(&Version::new(1, 1, 0)));
    }

    #[test]
    fn test_version_req_caret_and_tilde() {
        let caret = parse_requirement("^1.2").unwrap();
        assert!(caret.matches(&Version::new(1, 2, 0)));
        assert!(caret.matches(&Version::new(1, 9, 3)));
        assert!(!caret.matches(&Version::new(2, 0, 0)));
        assert!(!caret.matches(&Version::new(1, 1, 0)));

        // bare versions are caret constraints
        let bare = parse_requirement("1.2").unwrap();
        assert!(bare.matches(&Version::new(1, 4, 0)));
        assert!(!bare.matches(&Version::new(2, 0, 0)));

        let zero = parse_requirement("^0.3.1").unwrap();
        assert!(zero.matches(&Version::new(0, 3, 4)));
        assert!(!zero.matches(&Version::new(0, 4, 0)));

        let tilde = parse_requirement("~1.2.3").unwrap();
        assert!(tilde.matches(&Version::new(1, 2, 9)));
        assert!(!tilde.matches(&Version::new(1, 3, 0)));
    }

    #[test]
    fn test_version_req_ranges() {
        let range = parse_requirement(">=1.0.0, <2.0.0").unwrap();
        assert!(range.matches(&Version::new(1, 5, 0)));
        assert!(!range.matches(&Version::new(2, 0, 0)));

        assert!(parse_requirement("*").unwrap().matches(&Version::new(9, 9, 9)));
        assert!(parse_requirement("").unwrap().matches(&Version::new(0, 0, 1)));
        assert!(parse_requirement("=1.0.0").unwrap().matches(&Version::new(1, 0, 0)));
        assert!(parse_requirement(">=x").is_err());
    }

    #[test]
    fn test_manifest_builder() {
        let manifest = valid_builder("billing")
            .description("Invoices and payments")
            .permission("db:write")
            .permission("events:publish")
            .dependency(Dependency::required("ledger", "^1.0"))
            .build()
            .unwrap();

        assert_eq!(manifest.name, "billing");
        assert_eq!(manifest.permissions.len(), 2);
        assert!(manifest.requires_permission("db:write"));
        assert_eq!(manifest.required_dependencies().count(), 1);
    }

    #[test]
    fn test_manifest_validation() {
        assert!(ManifestBuilder::new("x", "1.0.0").category("utility").build().is_err());
        assert!(ManifestBuilder::new("x", "1.0.0").author("a").build().is_err());
        assert!(ManifestBuilder::new("x", "1.0").author("a").category("utility").build().is_err());
        assert!(ManifestBuilder::new("x", "1.0.0").author("a").category("games").build().is_ok());
        assert!(ManifestBuilder::new("Bad Name", "1.0.0").author("a").category("core").build().is_err());

        let err = valid_builder("loop")
            .dependency(Dependency::required("loop", "*"))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::ManifestValidation(_)));
    }

    #[test]
    fn test_manifest_toml() {
        let toml = r#"
name = "tasks"
version = "2.1.0"
description = "Task tracking"
author = "Host Team"
category = "productivity"
permissions = ["db:read", "db:write"]

[[dependencies]]
name = "auth"
version = "^1.0"

[[dependencies]]
name = "notifications"
optional = true

[config_schema.page_size]
type = "integer"
default = 50
"#;

        let manifest = PluginManifest::from_toml(toml).unwrap();
        manifest.validate().unwrap();
        assert_eq!(manifest.name, "tasks");
        assert_eq!(manifest.dependencies.len(), 2);
        assert_eq!(manifest.dependencies[1].version, "*");
        assert!(manifest.dependencies[1].optional);
        assert!(manifest.config_schema.fields.contains_key("page_size"));
    }

    #[test]
    fn test_manifest_missing_author_parses_but_fails_validation() {
        let manifest = PluginManifest::from_json(
            r#"{"name": "chat", "version": "1.0.0", "category": "communication"}"#,
        )
        .unwrap();
        let err = manifest.validate().unwrap_err();
        assert!(err.to_string().contains("author"));
    }

    #[test]
    fn test_config_schema_apply() {
        let mut schema = ConfigSchema::default();
        schema.fields.insert(
            "limit".into(),
            ConfigField {
                field_type: FieldType::Integer,
                required: false,
                default: Some(serde_json::json!(10)),
                description: None,
            },
        );
        schema.fields.insert(
            "endpoint".into(),
            ConfigField {
                field_type: FieldType::String,
                required: true,
                default: None,
                description: Some("upstream URL".into()),
            },
        );

        let applied = schema
            .apply(&serde_json::json!({"endpoint": "http://upstream"}))
            .unwrap();
        assert_eq!(applied["limit"], 10);

        assert!(schema.apply(&serde_json::Value::Null).is_err());
        assert!(schema.apply(&serde_json::json!({"endpoint": 5})).is_err());
        assert!(schema
            .apply(&serde_json::json!({"endpoint": "x", "extra": true}))
            .is_err());
    }
}
