//! The registry of loaded plugins and entry materialization.
//!
//! A plugin root is created once, at load time. Child entries are
//! materialized on demand from decoded `list` descriptors and live in the
//! method cache until evicted by TTL or by a fresh `list` on their parent;
//! the cached children *are* the tree. Materialization is also where a
//! descriptor's prefetched results get installed, so a later method call
//! is indistinguishable from one served by a live invocation.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use crate::cache::{CacheKey, MethodCaches};
use crate::decode::{EntryDescriptor, PrefetchValue};
use crate::entry::Entry;
use crate::error::{PluginError, Result};
use crate::invoke::PluginScript;
use crate::schema::SchemaMode;
use reef_types::{CacheDefaults, CacheableMethod};

/// One loaded plugin: its script, its singleton root, and its frozen
/// schema mode.
pub(crate) struct LoadedPlugin {
    pub(crate) script: PluginScript,
    pub(crate) root: Arc<Entry>,
    pub(crate) mode: SchemaMode,
}

impl std::fmt::Debug for LoadedPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedPlugin").finish_non_exhaustive()
    }
}

/// Process-wide map of loaded plugins, keyed by root name.
pub(crate) struct PluginRegistry {
    plugins: RwLock<HashMap<String, Arc<LoadedPlugin>>>,
}

impl PluginRegistry {
    pub(crate) fn new() -> Self {
        PluginRegistry {
            plugins: RwLock::new(HashMap::new()),
        }
    }

    /// Installs a freshly loaded plugin. The root is singleton: loading
    /// the same name twice is refused.
    pub(crate) async fn insert(&self, plugin: LoadedPlugin) -> Result<Arc<LoadedPlugin>> {
        let name = plugin.script.name().to_owned();
        let mut plugins = self.plugins.write().await;
        if plugins.contains_key(&name) {
            return Err(PluginError::Config(format!(
                "plugin '{name}' is already loaded"
            )));
        }
        let plugin = Arc::new(plugin);
        plugins.insert(name.clone(), Arc::clone(&plugin));
        debug!(plugin = %name, "registered plugin root");
        Ok(plugin)
    }

    /// Looks up a loaded plugin by root name.
    pub(crate) async fn get(&self, name: &str) -> Option<Arc<LoadedPlugin>> {
        self.plugins.read().await.get(name).cloned()
    }
}

/// Builds the cache key for one entry and method.
pub(crate) fn cache_key(entry: &Entry, method: CacheableMethod) -> CacheKey {
    CacheKey {
        path: entry.path().to_owned(),
        state: entry.state().to_owned(),
        method,
    }
}

/// Turns decoded descriptors into live entries for one plugin.
///
/// Bundles the plugin-scoped pieces materialization needs: the frozen
/// schema mode, the shared caches, and the shell defaults.
pub(crate) struct Materializer<'a> {
    pub(crate) mode: &'a SchemaMode,
    pub(crate) caches: &'a MethodCaches,
    pub(crate) defaults: &'a CacheDefaults,
    pub(crate) default_replacer: char,
}

impl Materializer<'_> {
    /// Materializes a plugin root. Schema-mode checks for the root are the
    /// loader's responsibility; the root is the one entry allowed to
    /// prefetch `schema`.
    pub(crate) async fn root(&self, desc: &EntryDescriptor) -> Result<Arc<Entry>> {
        let root = Arc::new(Entry::root(desc, self.default_replacer)?);
        self.seed(&root, desc).await?;
        Ok(root)
    }

    /// Materializes every child of `parent`, in listing order.
    pub(crate) async fn children(
        &self,
        parent: &Entry,
        descs: &[EntryDescriptor],
    ) -> Result<Vec<Arc<Entry>>> {
        let mut children = Vec::with_capacity(descs.len());
        for desc in descs {
            children.push(self.child(parent, desc).await?);
        }
        Ok(children)
    }

    /// Materializes one child: schema validation, slash replacement, and
    /// prefetch installation.
    pub(crate) async fn child(
        &self,
        parent: &Entry,
        desc: &EntryDescriptor,
    ) -> Result<Arc<Entry>> {
        let entry = Arc::new(Entry::child(parent, desc, self.default_replacer)?);
        self.mode.check_entry(desc, entry.path())?;
        self.mode
            .check_child_type(parent.type_id(), desc, entry.path())?;
        self.seed(&entry, desc).await?;
        Ok(entry)
    }

    /// Installs the descriptor's prefetched results with the same TTLs a
    /// live invocation would get.
    async fn seed(&self, entry: &Arc<Entry>, desc: &EntryDescriptor) -> Result<()> {
        for (method, value) in &desc.prefetched {
            match value {
                PrefetchValue::Read(content) => {
                    let ttl = entry.ttl_for(CacheableMethod::Read, self.defaults);
                    self.caches
                        .read
                        .insert_ready(
                            cache_key(entry, CacheableMethod::Read),
                            Arc::new(content.clone()),
                            ttl,
                        )
                        .await;
                }
                PrefetchValue::Metadata(object) => {
                    let ttl = entry.ttl_for(CacheableMethod::Metadata, self.defaults);
                    self.caches
                        .metadata
                        .insert_ready(
                            cache_key(entry, CacheableMethod::Metadata),
                            Arc::new(object.clone()),
                            ttl,
                        )
                        .await;
                }
                PrefetchValue::List(descs) => {
                    let children = Box::pin(self.children(entry, descs)).await?;
                    let ttl = entry.ttl_for(CacheableMethod::List, self.defaults);
                    self.caches
                        .list
                        .insert_ready(
                            cache_key(entry, CacheableMethod::List),
                            Arc::new(children),
                            ttl,
                        )
                        .await;
                }
                // The root's graph is consumed at load time; a child
                // carrying one was already rejected by check_entry.
                PrefetchValue::Schema(_) => {}
            }
            debug!(path = %entry.path(), method = %method, "installed prefetched result");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::decode_entry;
    use crate::schema::SchemaGraph;
    use reef_types::Method;
    use serde_json::json;
    use std::path::Path;

    fn fixture_root() -> Arc<Entry> {
        let desc = decode_entry(&json!({"name": "aws", "methods": ["list"]})).unwrap();
        Arc::new(Entry::root(&desc, '#').unwrap())
    }

    fn materializer<'a>(
        mode: &'a SchemaMode,
        caches: &'a MethodCaches,
        defaults: &'a CacheDefaults,
    ) -> Materializer<'a> {
        Materializer {
            mode,
            caches,
            defaults,
            default_replacer: '#',
        }
    }

    #[tokio::test]
    async fn duplicate_plugin_load_is_refused() {
        let registry = PluginRegistry::new();
        let script = PluginScript::from_path(Path::new("/p/aws.sh")).unwrap();
        let plugin = LoadedPlugin {
            script: script.clone(),
            root: fixture_root(),
            mode: SchemaMode::Off,
        };
        registry.insert(plugin).await.unwrap();

        let err = registry
            .insert(LoadedPlugin {
                script,
                root: fixture_root(),
                mode: SchemaMode::Off,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::Config(_)));
        assert!(registry.get("aws").await.is_some());
        assert!(registry.get("gcp").await.is_none());
    }

    #[tokio::test]
    async fn nested_prefetches_are_seeded() {
        let mode = SchemaMode::Off;
        let caches = MethodCaches::new();
        let defaults = CacheDefaults::default();
        let mat = materializer(&mode, &caches, &defaults);

        let root = fixture_root();
        let desc = decode_entry(&json!({
            "name": "vms",
            "methods": [["list", [
                {"name": "vm1", "methods": [["read", "hello"], ["metadata", {"zone": "b"}]]}
            ]]]
        }))
        .unwrap();

        let vms = mat.child(&root, &desc).await.unwrap();
        assert_eq!(vms.path(), "/aws/vms");

        let listed = caches
            .list
            .get_or_invoke(
                cache_key(&vms, CacheableMethod::List),
                std::time::Duration::from_secs(60),
                || async { panic!("prefetched list must short-circuit") },
            )
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        let vm1 = &listed[0];
        assert_eq!(vm1.path(), "/aws/vms/vm1");
        assert_eq!(vm1.attributes().size, Some(5));

        let content = caches
            .read
            .get_or_invoke(
                cache_key(vm1, CacheableMethod::Read),
                std::time::Duration::from_secs(60),
                || async { panic!("prefetched read must short-circuit") },
            )
            .await
            .unwrap();
        assert_eq!(content.as_slice(), b"hello");

        let meta = caches
            .metadata
            .get_or_invoke(
                cache_key(vm1, CacheableMethod::Metadata),
                std::time::Duration::from_secs(60),
                || async { panic!("prefetched metadata must short-circuit") },
            )
            .await
            .unwrap();
        assert_eq!(meta.as_ref(), &json!({"zone": "b"}));
    }

    #[tokio::test]
    async fn zero_ttl_prefetch_is_not_installed() {
        let mode = SchemaMode::Off;
        let caches = MethodCaches::new();
        let defaults = CacheDefaults::default();
        let mat = materializer(&mode, &caches, &defaults);

        let root = fixture_root();
        let desc = decode_entry(&json!({
            "name": "live",
            "methods": [["read", "data"]],
            "cache_ttls": {"read": 0}
        }))
        .unwrap();
        mat.child(&root, &desc).await.unwrap();
        assert_eq!(caches.read.len().await, 0);
    }

    #[tokio::test]
    async fn schema_mode_violations_surface_from_materialization() {
        let graph = SchemaGraph::from_value(json!({
            "root": {"label": "Root", "methods": ["list", "schema"], "children": ["vm"]},
            "vm": {"label": "VM", "methods": ["read", "schema"]}
        }))
        .unwrap();
        let mode = SchemaMode::On(Arc::new(graph));
        let caches = MethodCaches::new();
        let defaults = CacheDefaults::default();
        let mat = materializer(&mode, &caches, &defaults);

        let root_desc = decode_entry(&json!({
            "name": "aws", "methods": ["list", "schema"], "type_id": "root"
        }))
        .unwrap();
        let root = mat.root(&root_desc).await.unwrap();

        let bad = decode_entry(&json!({"name": "vm1", "methods": ["read"]})).unwrap();
        let err = mat.child(&root, &bad).await.unwrap_err();
        match err {
            PluginError::Schema { path, .. } => assert_eq!(path, "/aws/vm1"),
            other => panic!("expected Schema, got: {other}"),
        }

        let ok = decode_entry(&json!({
            "name": "vm1", "methods": ["read", "schema"], "type_id": "vm"
        }))
        .unwrap();
        let child = mat.child(&root, &ok).await.unwrap();
        assert!(child.supports(Method::Schema));
    }
}
