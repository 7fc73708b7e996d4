//! Materialized entries.
//!
//! An [`Entry`] is an immutable snapshot built from a decoded descriptor:
//! once constructed it never changes, and re-listing a parent replaces its
//! children with fresh entries. Callers hold cheap `Arc` clones; cache
//! identity is the virtual path plus the opaque state string, so a stale
//! handle yields a stale-but-consistent view.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use crate::decode::EntryDescriptor;
use crate::error::{PluginError, Result};
use reef_types::{CacheDefaults, CacheableMethod, EntryAttributes, Method};

/// One navigable node of a plugin's subtree.
#[derive(Debug, Clone)]
pub struct Entry {
    name: String,
    segments: Vec<String>,
    path: String,
    state: String,
    methods: BTreeSet<Method>,
    attributes: EntryAttributes,
    cache_ttls: HashMap<CacheableMethod, u64>,
    slash_replacer: char,
    type_id: Option<String>,
}

impl Entry {
    /// Materializes a plugin root from its decoded `init` descriptor.
    pub(crate) fn root(desc: &EntryDescriptor, default_replacer: char) -> Result<Entry> {
        Entry::build(&[], desc, default_replacer)
    }

    /// Materializes a child under `parent` from a `list` descriptor.
    pub(crate) fn child(
        parent: &Entry,
        desc: &EntryDescriptor,
        default_replacer: char,
    ) -> Result<Entry> {
        Entry::build(&parent.segments, desc, default_replacer)
    }

    fn build(
        parent_segments: &[String],
        desc: &EntryDescriptor,
        default_replacer: char,
    ) -> Result<Entry> {
        let replacer = desc.slash_replacer.unwrap_or(default_replacer);
        if desc.name.contains('/') && desc.name.contains(replacer) {
            return Err(PluginError::Decode(format!(
                "entry name '{}' mixes '/' with its replacement character '{replacer}'",
                desc.name
            )));
        }
        let segment = desc.name.replace('/', &replacer.to_string());

        let mut segments = parent_segments.to_vec();
        segments.push(segment);
        let path = format!("/{}", segments.join("/"));

        Ok(Entry {
            name: desc.name.clone(),
            segments,
            path,
            state: desc.state.clone(),
            methods: desc.methods.iter().copied().collect(),
            attributes: desc.attributes.clone(),
            cache_ttls: desc.cache_ttls.clone(),
            slash_replacer: replacer,
            type_id: desc.type_id.clone(),
        })
    }

    /// Raw name as returned by the plugin.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path segments from the plugin root downward.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Final path segment, with slashes replaced.
    pub fn segment(&self) -> &str {
        self.segments.last().map(String::as_str).unwrap_or("")
    }

    /// Absolute virtual path, `/<plugin>/<…>`.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The plugin root's name this entry belongs to.
    pub fn plugin(&self) -> &str {
        self.segments.first().map(String::as_str).unwrap_or("")
    }

    /// Opaque state string, re-supplied on every invocation.
    pub fn state(&self) -> &str {
        &self.state
    }

    /// Advertised methods.
    pub fn methods(&self) -> impl Iterator<Item = Method> + '_ {
        self.methods.iter().copied()
    }

    /// True when the entry advertises `method`.
    pub fn supports(&self, method: Method) -> bool {
        self.methods.contains(&method)
    }

    /// Reported attributes.
    pub fn attributes(&self) -> &EntryAttributes {
        &self.attributes
    }

    /// The entry's type within the plugin's schema graph, when schema mode
    /// is on.
    pub fn type_id(&self) -> Option<&str> {
        self.type_id.as_deref()
    }

    /// The character substituted for `/` in this entry's name.
    pub fn slash_replacer(&self) -> char {
        self.slash_replacer
    }

    /// Effective TTL for one cacheable method: the entry's override or the
    /// shell default.
    pub fn ttl_for(&self, method: CacheableMethod, defaults: &CacheDefaults) -> Duration {
        match self.cache_ttls.get(&method) {
            Some(secs) => Duration::from_secs(*secs),
            None => defaults.ttl_for(method),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::decode_entry;
    use serde_json::json;

    fn root_fixture() -> Entry {
        let desc = decode_entry(&json!({"name": "aws", "methods": ["list"]})).unwrap();
        Entry::root(&desc, '#').unwrap()
    }

    #[test]
    fn root_path_is_single_segment() {
        let root = root_fixture();
        assert_eq!(root.path(), "/aws");
        assert_eq!(root.plugin(), "aws");
        assert!(root.supports(Method::List));
        assert!(!root.supports(Method::Exec));
    }

    #[test]
    fn child_path_extends_parent() {
        let root = root_fixture();
        let desc = decode_entry(&json!({"name": "vm1", "methods": ["read"], "state": "s1"}))
            .unwrap();
        let child = Entry::child(&root, &desc, '#').unwrap();
        assert_eq!(child.path(), "/aws/vm1");
        assert_eq!(child.state(), "s1");
        assert_eq!(child.plugin(), "aws");
    }

    #[test]
    fn slashes_in_names_are_replaced() {
        let root = root_fixture();
        let desc = decode_entry(&json!({"name": "us-east/web", "methods": ["list"]})).unwrap();
        let child = Entry::child(&root, &desc, '#').unwrap();
        assert_eq!(child.name(), "us-east/web");
        assert_eq!(child.segment(), "us-east#web");
        assert_eq!(child.path(), "/aws/us-east#web");
    }

    #[test]
    fn per_entry_replacer_overrides_default() {
        let root = root_fixture();
        let desc = decode_entry(&json!({
            "name": "a/b", "methods": ["read"], "slash_replacer": "_"
        }))
        .unwrap();
        let child = Entry::child(&root, &desc, '#').unwrap();
        assert_eq!(child.segment(), "a_b");
    }

    #[test]
    fn ambiguous_name_rejected() {
        let root = root_fixture();
        let desc = decode_entry(&json!({"name": "a/b#c", "methods": ["read"]})).unwrap();
        let err = Entry::child(&root, &desc, '#').unwrap_err();
        assert!(matches!(err, PluginError::Decode(_)));
    }

    #[test]
    fn ttl_override_beats_default() {
        let root = root_fixture();
        let desc = decode_entry(&json!({
            "name": "vm1", "methods": ["read"], "cache_ttls": {"read": 120}
        }))
        .unwrap();
        let child = Entry::child(&root, &desc, '#').unwrap();
        let defaults = CacheDefaults::default();
        assert_eq!(
            child.ttl_for(CacheableMethod::Read, &defaults),
            Duration::from_secs(120)
        );
        assert_eq!(
            child.ttl_for(CacheableMethod::List, &defaults),
            defaults.ttl_for(CacheableMethod::List)
        );
    }
}
