//! Output decoder for plugin subprocess results.
//!
//! `init` and each `list` element produce an *entry descriptor*: a JSON
//! object with `name` and `methods` required. A method entry is either a
//! bare name or a two-element `[name, prefetchedResult]` tuple; prefetched
//! `list` results decode recursively, prefetched `read` results are raw
//! strings. Decoding is strict: unknown top-level keys, duplicate methods,
//! and leading non-JSON noise are all protocol violations.

use std::collections::HashMap;

use serde_json::Value;

use crate::error::{PluginError, Result};
use crate::schema::SchemaGraph;
use reef_types::{CacheableMethod, EntryAttributes, Method};

/// A pre-parsed method result embedded in an entry descriptor.
#[derive(Debug, Clone)]
pub enum PrefetchValue {
    /// Child descriptors a live `list` would have returned.
    List(Vec<EntryDescriptor>),
    /// Content bytes a live `read` would have returned.
    Read(Vec<u8>),
    /// The metadata object a live `metadata` would have returned.
    Metadata(Value),
    /// The schema graph; legal only on the plugin root.
    Schema(SchemaGraph),
}

/// One decoded entry descriptor, not yet materialized into the tree.
#[derive(Debug, Clone, Default)]
pub struct EntryDescriptor {
    /// Raw name as returned by the plugin.
    pub name: String,
    /// Advertised methods, in declaration order, duplicates rejected.
    pub methods: Vec<Method>,
    /// Prefetched results, a subset of `methods`.
    pub prefetched: HashMap<Method, PrefetchValue>,
    /// Opaque plugin-defined state snapshot.
    pub state: String,
    /// Optional filesystem attributes.
    pub attributes: EntryAttributes,
    /// Per-entry TTL overrides in seconds; unknown keys were dropped.
    pub cache_ttls: HashMap<CacheableMethod, u64>,
    /// Per-entry override of the slash replacement character.
    pub slash_replacer: Option<char>,
    /// Type identifier; required when schema mode is on.
    pub type_id: Option<String>,
}

const KNOWN_KEYS: [&str; 7] = [
    "name",
    "methods",
    "state",
    "attributes",
    "cache_ttls",
    "slash_replacer",
    "type_id",
];

/// Parses raw `init` or `list` stdout into JSON, strictly.
pub fn parse_json(bytes: &[u8]) -> Result<Value> {
    serde_json::from_slice(bytes).map_err(PluginError::decode)
}

/// Decodes a `metadata` result, which must be a JSON object.
pub fn decode_metadata(bytes: &[u8]) -> Result<Value> {
    let value = parse_json(bytes)?;
    if !value.is_object() {
        return Err(PluginError::Decode(format!(
            "metadata must be a JSON object, got {}",
            json_kind(&value)
        )));
    }
    Ok(value)
}

/// Decodes a `list` result: a JSON array of entry descriptors.
pub fn decode_entry_list(value: &Value) -> Result<Vec<EntryDescriptor>> {
    let Value::Array(items) = value else {
        return Err(PluginError::Decode(format!(
            "list result must be a JSON array, got {}",
            json_kind(value)
        )));
    };
    items.iter().map(decode_entry).collect()
}

/// Decodes one entry descriptor.
pub fn decode_entry(value: &Value) -> Result<EntryDescriptor> {
    let Value::Object(fields) = value else {
        return Err(PluginError::Decode(format!(
            "entry descriptor must be a JSON object, got {}",
            json_kind(value)
        )));
    };

    for key in fields.keys() {
        if !KNOWN_KEYS.contains(&key.as_str()) {
            return Err(PluginError::Decode(format!(
                "unknown entry descriptor key '{key}'"
            )));
        }
    }

    let name = fields
        .get("name")
        .and_then(Value::as_str)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| PluginError::Decode("entry descriptor requires a non-empty name".into()))?
        .to_owned();

    let (methods, prefetched) = decode_methods(fields.get("methods"), &name)?;

    let state = match fields.get("state") {
        None => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => {
            return Err(PluginError::Decode(format!(
                "entry '{name}': state must be a string, got {}",
                json_kind(other)
            )));
        }
    };

    let mut attributes = match fields.get("attributes") {
        None => EntryAttributes::default(),
        Some(value) => serde_json::from_value(value.clone())
            .map_err(|err| PluginError::Decode(format!("entry '{name}': {err}")))?,
    };

    let cache_ttls = decode_cache_ttls(fields.get("cache_ttls"), &name)?;

    let slash_replacer = match fields.get("slash_replacer") {
        None => None,
        Some(Value::String(s)) => {
            let mut chars = s.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => Some(c),
                _ => {
                    return Err(PluginError::Decode(format!(
                        "entry '{name}': slash_replacer must be a single character, got '{s}'"
                    )));
                }
            }
        }
        Some(other) => {
            return Err(PluginError::Decode(format!(
                "entry '{name}': slash_replacer must be a string, got {}",
                json_kind(other)
            )));
        }
    };

    let type_id = match fields.get("type_id") {
        None => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => {
            return Err(PluginError::Decode(format!(
                "entry '{name}': type_id must be a string, got {}",
                json_kind(other)
            )));
        }
    };

    // A prefetched read fixes the size when the plugin did not report one.
    if attributes.size.is_none()
        && let Some(PrefetchValue::Read(content)) = prefetched.get(&Method::Read)
    {
        attributes.size = Some(content.len() as u64);
    }

    Ok(EntryDescriptor {
        name,
        methods,
        prefetched,
        state,
        attributes,
        cache_ttls,
        slash_replacer,
        type_id,
    })
}

/// Decodes an `init` result, which may omit `name` and `methods`.
///
/// A missing name defaults to the plugin name derived from the script; a
/// missing methods list defaults to `["list"]`, the one method every root
/// must support.
pub fn decode_root(value: &Value, plugin_name: &str) -> Result<EntryDescriptor> {
    let Value::Object(fields) = value else {
        return Err(PluginError::Decode(format!(
            "init result must be a JSON object, got {}",
            json_kind(value)
        )));
    };
    let mut fields = fields.clone();
    fields
        .entry("name")
        .or_insert_with(|| Value::String(plugin_name.to_owned()));
    fields
        .entry("methods")
        .or_insert_with(|| Value::Array(vec![Value::String("list".into())]));
    decode_entry(&Value::Object(fields))
}

fn decode_methods(
    value: Option<&Value>,
    name: &str,
) -> Result<(Vec<Method>, HashMap<Method, PrefetchValue>)> {
    let Some(Value::Array(items)) = value else {
        return Err(PluginError::Decode(format!(
            "entry '{name}' requires a methods array"
        )));
    };

    let mut methods = Vec::with_capacity(items.len());
    let mut prefetched = HashMap::new();
    for item in items {
        let (method, prefetch) = match item {
            Value::String(raw) => (parse_method(raw, name)?, None),
            Value::Array(tuple) => {
                let [raw, result] = tuple.as_slice() else {
                    return Err(PluginError::Decode(format!(
                        "entry '{name}': a method tuple must be [name, prefetchedResult]"
                    )));
                };
                let raw = raw.as_str().ok_or_else(|| {
                    PluginError::Decode(format!(
                        "entry '{name}': method tuple name must be a string"
                    ))
                })?;
                let method = parse_method(raw, name)?;
                (method, Some(decode_prefetch(method, result, name)?))
            }
            other => {
                return Err(PluginError::Decode(format!(
                    "entry '{name}': method entries must be strings or tuples, got {}",
                    json_kind(other)
                )));
            }
        };
        if methods.contains(&method) {
            return Err(PluginError::Decode(format!(
                "entry '{name}': duplicate method '{method}'"
            )));
        }
        methods.push(method);
        if let Some(value) = prefetch {
            prefetched.insert(method, value);
        }
    }
    Ok((methods, prefetched))
}

fn parse_method(raw: &str, name: &str) -> Result<Method> {
    raw.parse::<Method>()
        .map_err(|err| PluginError::Decode(format!("entry '{name}': {err}")))
}

fn decode_prefetch(method: Method, result: &Value, name: &str) -> Result<PrefetchValue> {
    match method {
        Method::List => Ok(PrefetchValue::List(decode_entry_list(result)?)),
        Method::Read => {
            let content = result.as_str().ok_or_else(|| {
                PluginError::Decode(format!(
                    "entry '{name}': prefetched read must be a string, got {}",
                    json_kind(result)
                ))
            })?;
            Ok(PrefetchValue::Read(content.as_bytes().to_vec()))
        }
        Method::Metadata => {
            if !result.is_object() {
                return Err(PluginError::Decode(format!(
                    "entry '{name}': prefetched metadata must be an object, got {}",
                    json_kind(result)
                )));
            }
            Ok(PrefetchValue::Metadata(result.clone()))
        }
        Method::Schema => Ok(PrefetchValue::Schema(SchemaGraph::from_value(
            result.clone(),
        )?)),
        Method::Stream | Method::Exec => Err(PluginError::Decode(format!(
            "entry '{name}': method '{method}' cannot carry a prefetched result"
        ))),
    }
}

fn decode_cache_ttls(
    value: Option<&Value>,
    name: &str,
) -> Result<HashMap<CacheableMethod, u64>> {
    let Some(value) = value else {
        return Ok(HashMap::new());
    };
    let Value::Object(fields) = value else {
        return Err(PluginError::Decode(format!(
            "entry '{name}': cache_ttls must be an object, got {}",
            json_kind(value)
        )));
    };

    let mut ttls = HashMap::new();
    for (key, ttl) in fields {
        // Keys outside the cacheable set are ignored, not rejected.
        let Ok(method) = key.parse::<Method>() else {
            continue;
        };
        let Ok(method) = CacheableMethod::try_from(method) else {
            continue;
        };
        let secs = ttl.as_u64().ok_or_else(|| {
            PluginError::Decode(format!(
                "entry '{name}': cache_ttls.{key} must be a non-negative integer, got {ttl}"
            ))
        })?;
        ttls.insert(method, secs);
    }
    Ok(ttls)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
