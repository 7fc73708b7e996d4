//! The host API surface.
//!
//! [`PluginHost`] is the narrow set of operations exported to the HTTP and
//! filesystem layers: load a plugin, then `list` / `read` / `metadata` /
//! `stream` / `exec` against entries, resolve paths, and fetch a plugin's
//! schema graph. Cacheable methods route through the method cache, which
//! may short-circuit an invocation entirely; everything else goes straight
//! to the invocation engine.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cache::{ListValue, MetadataValue, MethodCaches, ReadValue};
use crate::decode::{self, PrefetchValue};
use crate::entry::Entry;
use crate::error::{PluginError, Result};
use crate::exec::{self, ExecStream};
use crate::invoke::{self, PluginScript};
use crate::registry::{LoadedPlugin, Materializer, PluginRegistry, cache_key};
use crate::schema::{SchemaGraph, SchemaMode};
use crate::stream::{self, EntryStream};
use reef_types::{CacheableMethod, ExecOptions, ExternalPluginsConfig, Method};

/// The external-plugin runtime, shared process-wide.
pub struct PluginHost {
    config: ExternalPluginsConfig,
    registry: PluginRegistry,
    caches: MethodCaches,
}

impl std::fmt::Debug for PluginHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginHost").finish_non_exhaustive()
    }
}

impl PluginHost {
    /// Builds a host from the shell's configuration.
    pub fn new(config: ExternalPluginsConfig) -> Result<Self> {
        if config.slash_replacer == '/' {
            return Err(PluginError::Config(
                "slash_replacer must be a character other than '/'".into(),
            ));
        }
        Ok(PluginHost {
            config,
            registry: PluginRegistry::new(),
            caches: MethodCaches::new(),
        })
    }

    /// The configuration the host was built with.
    pub fn config(&self) -> &ExternalPluginsConfig {
        &self.config
    }

    /// Loads every plugin named by the configuration's `external-plugins`
    /// list, in order.
    pub async fn load_configured(&self, cancel: &CancellationToken) -> Result<Vec<Arc<Entry>>> {
        let mut roots = Vec::with_capacity(self.config.plugins.len());
        for def in &self.config.plugins {
            roots.push(self.load_external_plugin(&def.script, cancel).await?);
        }
        Ok(roots)
    }

    /// Loads one external plugin: runs `init`, validates the root, freezes
    /// the schema mode, and installs the root in the registry.
    pub async fn load_external_plugin(
        &self,
        script_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<Arc<Entry>> {
        let script = PluginScript::from_path(script_path)?;
        let name = script.name().to_owned();
        let plugin_config = self.config.plugin_config_for(&name);
        info!(plugin = %name, script = %script_path.display(), "loading external plugin");

        let output = invoke::invoke_buffered(
            &script,
            invoke::init_args(&plugin_config),
            Some(self.config.deadlines.init_deadline()),
            cancel,
        )
        .await
        .map_err(init_failure)?;

        let value = decode::parse_json(&output).map_err(init_failure)?;
        let desc = decode::decode_root(&value, &name).map_err(init_failure)?;

        if desc.name != name {
            return Err(PluginError::Config(format!(
                "plugin root is named '{}' but the script basename is '{name}'",
                desc.name
            )));
        }
        if !desc.methods.contains(&Method::List) {
            return Err(PluginError::Config(format!(
                "plugin root '{name}' must support list"
            )));
        }

        let root_path = format!("/{name}");
        let mode = if desc.methods.contains(&Method::Schema) {
            let graph = match desc.prefetched.get(&Method::Schema) {
                Some(PrefetchValue::Schema(graph)) => Arc::new(graph.clone()),
                _ => {
                    return Err(PluginError::Schema {
                        path: root_path,
                        reason: "a schema-mode root must prefetch its schema graph".into(),
                    });
                }
            };
            let type_id = desc
                .type_id
                .as_deref()
                .filter(|t| !t.is_empty())
                .ok_or_else(|| PluginError::Schema {
                    path: root_path.clone(),
                    reason: "schema mode is on but the root carries no type_id".into(),
                })?;
            graph.check_reachable(type_id, &root_path)?;
            SchemaMode::On(graph)
        } else {
            SchemaMode::Off
        };

        let materializer = self.materializer(&mode);
        let root = materializer.root(&desc).await?;
        let plugin = self
            .registry
            .insert(LoadedPlugin {
                script,
                root: Arc::clone(&root),
                mode,
            })
            .await?;
        info!(plugin = %name, path = %plugin.root.path(), "external plugin loaded");
        Ok(root)
    }

    /// Enumerates `entry`'s children, from cache when fresh.
    pub async fn list(&self, entry: &Arc<Entry>, cancel: &CancellationToken) -> Result<ListValue> {
        self.require(entry, Method::List)?;
        let plugin = self.plugin_of(entry).await?;
        let ttl = entry.ttl_for(CacheableMethod::List, &self.config.cache);
        self.caches
            .list
            .get_or_invoke(cache_key(entry, CacheableMethod::List), ttl, || {
                self.invoke_list(plugin, entry, cancel)
            })
            .await
    }

    async fn invoke_list(
        &self,
        plugin: Arc<LoadedPlugin>,
        entry: &Arc<Entry>,
        cancel: &CancellationToken,
    ) -> Result<ListValue> {
        let output = invoke::invoke_buffered(
            &plugin.script,
            invoke::method_args(Method::List, entry.path(), entry.state()),
            self.config.deadlines.deadline_for(Method::List),
            cancel,
        )
        .await?;
        let value = decode::parse_json(&output)?;
        let descs = decode::decode_entry_list(&value)?;
        let children = self.materializer(&plugin.mode).children(entry, &descs).await?;

        let surviving: HashSet<String> =
            children.iter().map(|c| c.segment().to_owned()).collect();
        self.caches
            .evict_missing_children(entry.path(), &surviving)
            .await;

        debug!(path = %entry.path(), count = children.len(), "listed children");
        Ok(Arc::new(children))
    }

    /// Reads `entry`'s content, from cache when fresh.
    pub async fn read(&self, entry: &Arc<Entry>, cancel: &CancellationToken) -> Result<ReadValue> {
        self.require(entry, Method::Read)?;
        let plugin = self.plugin_of(entry).await?;
        let ttl = entry.ttl_for(CacheableMethod::Read, &self.config.cache);
        self.caches
            .read
            .get_or_invoke(cache_key(entry, CacheableMethod::Read), ttl, || {
                self.invoke_read(plugin, entry, cancel)
            })
            .await
    }

    async fn invoke_read(
        &self,
        plugin: Arc<LoadedPlugin>,
        entry: &Arc<Entry>,
        cancel: &CancellationToken,
    ) -> Result<ReadValue> {
        let output = invoke::invoke_buffered(
            &plugin.script,
            invoke::method_args(Method::Read, entry.path(), entry.state()),
            self.config.deadlines.deadline_for(Method::Read),
            cancel,
        )
        .await?;
        Ok(Arc::new(output))
    }

    /// Fetches `entry`'s metadata object, from cache when fresh.
    pub async fn metadata(
        &self,
        entry: &Arc<Entry>,
        cancel: &CancellationToken,
    ) -> Result<MetadataValue> {
        self.require(entry, Method::Metadata)?;
        let plugin = self.plugin_of(entry).await?;
        let ttl = entry.ttl_for(CacheableMethod::Metadata, &self.config.cache);
        self.caches
            .metadata
            .get_or_invoke(cache_key(entry, CacheableMethod::Metadata), ttl, || {
                self.invoke_metadata(plugin, entry, cancel)
            })
            .await
    }

    async fn invoke_metadata(
        &self,
        plugin: Arc<LoadedPlugin>,
        entry: &Arc<Entry>,
        cancel: &CancellationToken,
    ) -> Result<MetadataValue> {
        let output = invoke::invoke_buffered(
            &plugin.script,
            invoke::method_args(Method::Metadata, entry.path(), entry.state()),
            self.config.deadlines.deadline_for(Method::Metadata),
            cancel,
        )
        .await?;
        Ok(Arc::new(decode::decode_metadata(&output)?))
    }

    /// Opens `entry`'s content stream. Never cached and never subject to
    /// an implicit deadline.
    pub async fn stream(
        &self,
        entry: &Arc<Entry>,
        cancel: &CancellationToken,
    ) -> Result<EntryStream> {
        self.require(entry, Method::Stream)?;
        let plugin = self.plugin_of(entry).await?;
        stream::open(&plugin.script, entry, cancel).await
    }

    /// Executes `cmd` on the resource `entry` represents, returning the
    /// packet stream.
    pub async fn exec(
        &self,
        entry: &Arc<Entry>,
        cmd: &str,
        args: &[String],
        opts: ExecOptions,
        cancel: &CancellationToken,
    ) -> Result<ExecStream> {
        self.require(entry, Method::Exec)?;
        let plugin = self.plugin_of(entry).await?;
        exec::spawn_exec(&plugin.script, entry, cmd, args, opts, cancel).await
    }

    /// The schema graph of a loaded plugin, `None` when schema mode is off
    /// or the plugin is unknown.
    pub async fn schema_graph(&self, plugin: &str) -> Option<Arc<SchemaGraph>> {
        self.registry
            .get(plugin)
            .await
            .and_then(|p| p.mode.graph().cloned())
    }

    /// Invalidates cached results for `entry` and everything below it, so
    /// the next access re-enumerates.
    pub async fn refresh(&self, entry: &Entry) {
        debug!(path = %entry.path(), "refreshing entry subtree");
        self.caches.invalidate_subtree(entry.path()).await;
    }

    /// Resolves an absolute virtual path, invoking `list` for any segment
    /// not already cached.
    pub async fn resolve(&self, path: &str, cancel: &CancellationToken) -> Result<Arc<Entry>> {
        let mut segments = path.split('/').filter(|s| !s.is_empty());
        let plugin_name = segments
            .next()
            .ok_or_else(|| PluginError::NotFound(path.to_owned()))?;
        let plugin = self
            .registry
            .get(plugin_name)
            .await
            .ok_or_else(|| PluginError::NotFound(path.to_owned()))?;

        let mut current = Arc::clone(&plugin.root);
        for segment in segments {
            let children = self.list(&current, cancel).await?;
            current = children
                .iter()
                .find(|child| child.segment() == segment)
                .cloned()
                .ok_or_else(|| PluginError::NotFound(path.to_owned()))?;
        }
        Ok(current)
    }

    fn materializer<'a>(&'a self, mode: &'a SchemaMode) -> Materializer<'a> {
        Materializer {
            mode,
            caches: &self.caches,
            defaults: &self.config.cache,
            default_replacer: self.config.slash_replacer,
        }
    }

    fn require(&self, entry: &Entry, method: Method) -> Result<()> {
        if entry.supports(method) {
            return Ok(());
        }
        Err(PluginError::UnsupportedMethod {
            method,
            path: entry.path().to_owned(),
        })
    }

    async fn plugin_of(&self, entry: &Entry) -> Result<Arc<LoadedPlugin>> {
        self.registry.get(entry.plugin()).await.ok_or_else(|| {
            PluginError::Config(format!("plugin '{}' is not loaded", entry.plugin()))
        })
    }
}

/// `init` failures are configuration errors, not runtime ones: the plugin
/// could not even establish its root.
fn init_failure(err: PluginError) -> PluginError {
    match err {
        PluginError::Invocation { .. } | PluginError::Decode(_) | PluginError::Io(_) => {
            PluginError::Config(format!("init failed: {err}"))
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reef_types::ExternalPluginsConfig;

    #[test]
    fn slash_as_replacer_is_refused() {
        let config = ExternalPluginsConfig {
            slash_replacer: '/',
            ..ExternalPluginsConfig::default()
        };
        let err = PluginHost::new(config).unwrap_err();
        assert!(matches!(err, PluginError::Config(_)));
    }

    #[test]
    fn init_failures_map_to_config() {
        let err = init_failure(PluginError::Invocation {
            code: 1,
            stderr: "bad credentials".into(),
        });
        match err {
            PluginError::Config(reason) => assert!(reason.contains("bad credentials")),
            other => panic!("expected Config, got: {other}"),
        }

        let passthrough = init_failure(PluginError::Cancelled);
        assert!(matches!(passthrough, PluginError::Cancelled));
    }
}
