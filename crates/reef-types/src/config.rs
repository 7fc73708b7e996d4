//! External-plugin configuration records.
//!
//! The embedding shell hands the runtime a JSON document; the
//! `external-plugins` key is an ordered list of script records, and
//! plugin-specific configuration lives under a top-level key named after
//! each plugin's root. Cache TTL and deadline defaults may be overridden
//! at the same level.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::method::{CacheableMethod, Method};

/// Character substituted for literal `/` in entry names by default.
pub const DEFAULT_SLASH_REPLACER: char = '#';

/// One record of the `external-plugins` list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExternalPluginDef {
    /// Absolute path to the plugin script.
    pub script: PathBuf,
}

/// Default TTLs, in seconds, for the cacheable methods.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheDefaults {
    pub list: u64,
    pub read: u64,
    pub metadata: u64,
}

fn default_ttl_secs() -> u64 {
    15
}

impl Default for CacheDefaults {
    fn default() -> Self {
        CacheDefaults {
            list: default_ttl_secs(),
            read: default_ttl_secs(),
            metadata: default_ttl_secs(),
        }
    }
}

impl CacheDefaults {
    /// The default TTL for one cacheable method.
    pub fn ttl_for(&self, method: CacheableMethod) -> Duration {
        let secs = match method {
            CacheableMethod::List => self.list,
            CacheableMethod::Read => self.read,
            CacheableMethod::Metadata => self.metadata,
        };
        Duration::from_secs(secs)
    }
}

/// Default deadlines, in seconds, for the bounded methods.
///
/// `stream` and `exec` have no implicit deadline and rely on caller
/// cancellation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MethodDeadlines {
    pub init: u64,
    pub list: u64,
    pub read: u64,
    pub metadata: u64,
    pub schema: u64,
}

fn default_deadline_secs() -> u64 {
    30
}

impl Default for MethodDeadlines {
    fn default() -> Self {
        MethodDeadlines {
            init: default_deadline_secs(),
            list: default_deadline_secs(),
            read: default_deadline_secs(),
            metadata: default_deadline_secs(),
            schema: default_deadline_secs(),
        }
    }
}

impl MethodDeadlines {
    /// The deadline for a bounded method; `None` for `stream`/`exec`.
    pub fn deadline_for(&self, method: Method) -> Option<Duration> {
        let secs = match method {
            Method::List => self.list,
            Method::Read => self.read,
            Method::Metadata => self.metadata,
            Method::Schema => self.schema,
            Method::Stream | Method::Exec => return None,
        };
        Some(Duration::from_secs(secs))
    }

    /// The deadline for the `init` handshake.
    pub fn init_deadline(&self) -> Duration {
        Duration::from_secs(self.init)
    }
}

/// Top-level configuration for the external-plugin runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalPluginsConfig {
    /// Ordered plugin records.
    #[serde(rename = "external-plugins", default)]
    pub plugins: Vec<ExternalPluginDef>,

    /// Cache TTL defaults, overridable per entry via `cache_ttls`.
    #[serde(default)]
    pub cache: CacheDefaults,

    /// Per-method deadline defaults.
    #[serde(default)]
    pub deadlines: MethodDeadlines,

    /// Replacement for literal `/` in entry names.
    #[serde(default = "default_slash_replacer")]
    pub slash_replacer: char,

    /// Remaining top-level keys: plugin-scoped configuration, keyed by the
    /// plugin root's name.
    #[serde(flatten)]
    pub plugin_config: serde_json::Map<String, serde_json::Value>,
}

fn default_slash_replacer() -> char {
    DEFAULT_SLASH_REPLACER
}

impl Default for ExternalPluginsConfig {
    fn default() -> Self {
        ExternalPluginsConfig {
            plugins: Vec::new(),
            cache: CacheDefaults::default(),
            deadlines: MethodDeadlines::default(),
            slash_replacer: default_slash_replacer(),
            plugin_config: serde_json::Map::new(),
        }
    }
}

impl ExternalPluginsConfig {
    /// The configuration subobject for one plugin, `{}` when absent.
    pub fn plugin_config_for(&self, root_name: &str) -> serde_json::Value {
        self.plugin_config
            .get(root_name)
            .cloned()
            .unwrap_or_else(|| serde_json::Value::Object(serde_json::Map::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_matches_empty_document() {
        let config = ExternalPluginsConfig::default();
        assert!(config.plugins.is_empty());
        assert_eq!(config.slash_replacer, DEFAULT_SLASH_REPLACER);
        assert!(config.plugin_config.is_empty());
    }

    #[test]
    fn defaults_from_empty_document() {
        let config: ExternalPluginsConfig = serde_json::from_value(json!({})).unwrap();
        assert!(config.plugins.is_empty());
        assert_eq!(config.slash_replacer, '#');
        assert_eq!(config.cache.ttl_for(CacheableMethod::List), Duration::from_secs(15));
        assert_eq!(
            config.deadlines.deadline_for(Method::Read),
            Some(Duration::from_secs(30))
        );
        assert_eq!(config.deadlines.deadline_for(Method::Stream), None);
    }

    #[test]
    fn plugin_list_and_scoped_config() {
        let config: ExternalPluginsConfig = serde_json::from_value(json!({
            "external-plugins": [
                {"script": "/opt/reef/aws.sh"},
                {"script": "/opt/reef/k8s.rb"}
            ],
            "aws": {"profile": "sandbox"}
        }))
        .unwrap();
        assert_eq!(config.plugins.len(), 2);
        assert_eq!(config.plugins[0].script, PathBuf::from("/opt/reef/aws.sh"));
        assert_eq!(config.plugin_config_for("aws"), json!({"profile": "sandbox"}));
        assert_eq!(config.plugin_config_for("k8s"), json!({}));
    }

    #[test]
    fn ttl_and_deadline_overrides() {
        let config: ExternalPluginsConfig = serde_json::from_value(json!({
            "cache": {"list": 0, "read": 120},
            "deadlines": {"init": 5}
        }))
        .unwrap();
        assert_eq!(config.cache.ttl_for(CacheableMethod::List), Duration::ZERO);
        assert_eq!(config.cache.ttl_for(CacheableMethod::Read), Duration::from_secs(120));
        assert_eq!(config.cache.ttl_for(CacheableMethod::Metadata), Duration::from_secs(15));
        assert_eq!(config.deadlines.init_deadline(), Duration::from_secs(5));
    }

    #[test]
    fn unknown_cache_key_rejected() {
        let err = serde_json::from_value::<CacheDefaults>(json!({"lits": 3})).unwrap_err();
        assert!(err.to_string().contains("unknown field"), "got: {err}");
    }
}
