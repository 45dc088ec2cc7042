//! Plugin discovery over a `<root>/<category>/<plugin>/` directory tree.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::manifest::{PluginManifest, ALLOWED_CATEGORIES};
use crate::plugin::PluginCatalog;

/// Manifest file names looked for in each plugin directory, in order.
pub const DEFAULT_MANIFEST_FILES: &[&str] = &["plugin.toml", "plugin.json"];

/// Configuration for plugin discovery.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Manifest file names, first match wins.
    pub manifest_files: Vec<String>,
    /// Categories accepted by this host.
    pub allowed_categories: Vec<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            manifest_files: DEFAULT_MANIFEST_FILES.iter().map(|s| s.to_string()).collect(),
            allowed_categories: ALLOWED_CATEGORIES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl DiscoveryConfig {
    /// Create a new discovery configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the manifest file names.
    pub fn with_manifest_files<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.manifest_files = files.into_iter().map(Into::into).collect();
        self
    }

    /// Replace the accepted categories.
    pub fn with_allowed_categories<I, S>(mut self, categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_categories = categories.into_iter().map(Into::into).collect();
        self
    }

    /// Check a manifest category against the accepted list.
    pub fn check_category(&self, manifest: &PluginManifest) -> Result<()> {
        if self.allowed_categories.iter().any(|c| *c == manifest.category) {
            return Ok(());
        }
        Err(Error::invalid_manifest(format!(
            "category {} is not enabled on this host",
            manifest.category
        )))
    }
}

/// Where a discovered manifest came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestSource {
    /// Parsed from a manifest file.
    File(PathBuf),
    /// Declared by a compiled-in plugin factory.
    Static,
}

/// A validated manifest together with its location.
#[derive(Debug, Clone)]
pub struct DiscoveredPlugin {
    /// Validated manifest.
    pub manifest: PluginManifest,
    /// Plugin directory.
    pub dir: PathBuf,
    /// Manifest origin.
    pub source: ManifestSource,
}

/// Walks a plugin root and collects valid manifests.
pub struct Discovery {
    config: DiscoveryConfig,
    catalog: Option<Arc<PluginCatalog>>,
}

impl Discovery {
    /// Create a discovery pass that only reads manifest files.
    pub fn new(config: DiscoveryConfig) -> Self {
        Self {
            config,
            catalog: None,
        }
    }

    /// Accept directories without a manifest file when the catalog declares one.
    pub fn with_catalog(mut self, catalog: Arc<PluginCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Get the discovery configuration.
    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Return every valid manifest under `root`.
    pub fn discover(&self, root: &Path) -> Vec<PluginManifest> {
        self.scan(root).into_iter().map(|p| p.manifest).collect()
    }

    /// Walk `root` two levels deep, skipping anything that fails to load or validate.
    ///
    /// Results are ordered by category then plugin directory name. When two
    /// directories declare the same plugin name the first one wins.
    pub fn scan(&self, root: &Path) -> Vec<DiscoveredPlugin> {
        let categories = match sorted_dirs(root) {
            Ok(dirs) => dirs,
            Err(e) => {
                tracing::warn!(root = %root.display(), error = %e, "cannot read plugin root");
                return Vec::new();
            }
        };

        let mut found = Vec::new();
        let mut seen = HashSet::new();

        for category_dir in categories {
            let plugin_dirs = match sorted_dirs(&category_dir) {
                Ok(dirs) => dirs,
                Err(e) => {
                    tracing::warn!(dir = %category_dir.display(), error = %e, "cannot read category");
                    continue;
                }
            };

            for dir in plugin_dirs {
                match self.load_candidate(&dir) {
                    Ok(Some(plugin)) => {
                        if !seen.insert(plugin.manifest.name.clone()) {
                            tracing::warn!(
                                plugin = %plugin.manifest.name,
                                dir = %dir.display(),
                                "duplicate plugin name, skipping"
                            );
                            continue;
                        }
                        tracing::debug!(
                            plugin = %plugin.manifest.name,
                            version = %plugin.manifest.version,
                            "discovered plugin"
                        );
                        found.push(plugin);
                    }
                    Ok(None) => {
                        tracing::trace!(dir = %dir.display(), "no manifest");
                    }
                    Err(e) => {
                        tracing::warn!(dir = %dir.display(), error = %e, "skipping invalid plugin");
                    }
                }
            }
        }

        tracing::info!(root = %root.display(), count = found.len(), "plugin discovery finished");
        found
    }

    fn load_candidate(&self, dir: &Path) -> Result<Option<DiscoveredPlugin>> {
        let (manifest, source) = match self.find_manifest_file(dir) {
            Some(path) => (PluginManifest::from_file(&path)?, ManifestSource::File(path)),
            None => match self.static_manifest(dir) {
                Some(manifest) => (manifest, ManifestSource::Static),
                None => return Ok(None),
            },
        };

        manifest.validate()?;
        self.config.check_category(&manifest)?;

        Ok(Some(DiscoveredPlugin {
            manifest,
            dir: dir.to_path_buf(),
            source,
        }))
    }

    fn find_manifest_file(&self, dir: &Path) -> Option<PathBuf> {
        self.config
            .manifest_files
            .iter()
            .map(|name| dir.join(name))
            .find(|path| path.is_file())
    }

    fn static_manifest(&self, dir: &Path) -> Option<PluginManifest> {
        let catalog = self.catalog.as_ref()?;
        let name = dir.file_name()?.to_str()?;
        catalog.manifest(name)
    }
}

impl Default for Discovery {
    fn default() -> Self {
        Self::new(DiscoveryConfig::default())
    }
}

impl std::fmt::Debug for Discovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Discovery")
            .field("config", &self.config)
            .field("catalog", &self.catalog.is_some())
            .finish()
    }
}

/// Discover manifests under `root` with the default configuration.
pub fn discover(root: &Path) -> Vec<PluginManifest> {
    Discovery::default().discover(root)
}

fn sorted_dirs(path: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(path)? {
        let path = entry?.path();
        let hidden = path
            .file_name()
            .and_then(|n| n.to_str())
            .map_or(true, |n| n.starts_with('.') || n.starts_with("__"));
        if path.is_dir() && !hidden {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ManifestBuilder;
    use crate::plugin::{Plugin, PluginContext};
    use async_trait::async_trait;
    use std::fs;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn toml_manifest(name: &str, version: &str, category: &str) -> String {
        format!(
            "name = \"{}\"\nversion = \"{}\"\nauthor = \"tests\"\ncategory = \"{}\"\n",
            name, version, category
        )
    }

    #[test]
    fn test_discover_skips_invalid_siblings() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();

        write(root, "auth/login/plugin.toml", &toml_manifest("login", "1.0.0", "auth"));
        write(root, "auth/broken/plugin.toml", &toml_manifest("broken", "one", "auth"));
        write(root, "auth/garbage/plugin.toml", "this is = = not toml");
        write(
            root,
            "productivity/tasks/plugin.json",
            r#"{"name":"tasks","version":"0.3.1","author":"tests","category":"productivity"}"#,
        );
        write(root, "misc/weird/plugin.toml", &toml_manifest("weird", "1.0.0", "games"));

        let manifests = discover(root);
        let names: Vec<&str> = manifests.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["login", "tasks"]);
        assert_eq!(manifests[1].version, "0.3.1");
    }

    #[test]
    fn test_discover_is_exactly_two_levels_deep() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();

        write(root, "plugin.toml", &toml_manifest("top", "1.0.0", "core"));
        write(root, "core/plugin.toml", &toml_manifest("shallow", "1.0.0", "core"));
        write(root, "core/deep/nested/plugin.toml", &toml_manifest("deep", "1.0.0", "core"));
        write(root, "core/.hidden/plugin.toml", &toml_manifest("hidden", "1.0.0", "core"));

        assert!(discover(root).is_empty());
    }

    #[test]
    fn test_missing_root_yields_nothing() {
        let dir = TempDir::new().unwrap();
        assert!(discover(&dir.path().join("nope")).is_empty());
    }

    #[test]
    fn test_duplicate_names_keep_first() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();

        write(root, "auth/a/plugin.toml", &toml_manifest("same", "1.0.0", "auth"));
        write(root, "core/b/plugin.toml", &toml_manifest("same", "2.0.0", "core"));

        let found = Discovery::default().scan(root);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].manifest.version, "1.0.0");
        assert_eq!(found[0].source, ManifestSource::File(root.join("auth/a/plugin.toml")));
    }

    struct Noop;

    #[async_trait]
    impl Plugin for Noop {
        async fn initialize(&mut self, _ctx: &PluginContext) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_static_manifest_from_catalog() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("utility/clock")).unwrap();
        fs::create_dir_all(root.join("utility/unknown")).unwrap();

        let catalog = Arc::new(PluginCatalog::new());
        catalog.register_fn(
            ManifestBuilder::new("clock", "1.0.0")
                .author("tests")
                .category("utility")
                .build_unchecked(),
            || Box::new(Noop),
        );

        let found = Discovery::default().with_catalog(catalog).scan(root);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].manifest.name, "clock");
        assert_eq!(found[0].source, ManifestSource::Static);
    }

    #[test]
    fn test_category_restriction() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        write(root, "auth/login/plugin.toml", &toml_manifest("login", "1.0.0", "auth"));
        write(root, "core/kernel/plugin.toml", &toml_manifest("kernel", "1.0.0", "core"));

        let discovery = Discovery::new(DiscoveryConfig::new().with_allowed_categories(["core"]));
        let names: Vec<String> = discovery.discover(root).into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["kernel"]);
    }

    #[test]
    fn test_configured_category_extends_defaults() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        write(root, "games/chess/plugin.toml", &toml_manifest("chess", "1.0.0", "games"));
        write(root, "core/kernel/plugin.toml", &toml_manifest("kernel", "1.0.0", "core"));

        assert_eq!(Discovery::default().discover(root).len(), 1);

        let mut categories: Vec<String> = ALLOWED_CATEGORIES.iter().map(|c| c.to_string()).collect();
        categories.push("games".to_string());
        let discovery = Discovery::new(DiscoveryConfig::new().with_allowed_categories(categories));
        let names: Vec<String> = discovery.discover(root).into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["kernel", "chess"]);
    }
}
