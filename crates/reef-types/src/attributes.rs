//! Filesystem-facing attributes carried by an entry.
//!
//! Plugins report attributes in a permissive wire form: times are Unix
//! seconds, `mode` is either a JSON number or a string with an optional
//! `0`/`0o`/`0x` prefix. Internally times are `chrono::DateTime<Utc>`.

use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Optional attributes an entry may carry.
///
/// Absent fields mean "the plugin did not report this"; the filesystem
/// layer substitutes its own defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EntryAttributes {
    /// Last access time.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "unix_seconds")]
    pub atime: Option<DateTime<Utc>>,

    /// Last modification time.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "unix_seconds")]
    pub mtime: Option<DateTime<Utc>>,

    /// Last status-change time.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "unix_seconds")]
    pub ctime: Option<DateTime<Utc>>,

    /// Creation time.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "unix_seconds")]
    pub crtime: Option<DateTime<Utc>>,

    /// Content size in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,

    /// Permission bits.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_mode",
        serialize_with = "serialize_mode"
    )]
    pub mode: Option<u32>,

    /// Arbitrary plugin-supplied metadata snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

impl EntryAttributes {
    /// True when no attribute was reported.
    pub fn is_empty(&self) -> bool {
        self.atime.is_none()
            && self.mtime.is_none()
            && self.ctime.is_none()
            && self.crtime.is_none()
            && self.size.is_none()
            && self.mode.is_none()
            && self.meta.is_none()
    }
}

mod unix_seconds {
    use chrono::{DateTime, TimeZone, Utc};
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        time: &Option<DateTime<Utc>>,
        ser: S,
    ) -> Result<S::Ok, S::Error> {
        match time {
            Some(t) => ser.serialize_some(&t.timestamp()),
            None => ser.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        de: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let secs = Option::<i64>::deserialize(de)?;
        match secs {
            None => Ok(None),
            Some(s) if s < 0 => Err(D::Error::custom(format!("negative time {s}"))),
            Some(s) => Utc
                .timestamp_opt(s, 0)
                .single()
                .map(Some)
                .ok_or_else(|| D::Error::custom(format!("time {s} out of range"))),
        }
    }
}

/// Accepts a JSON number or a string with an optional `0`, `0o`, or `0x`
/// prefix (a bare `0`-prefixed string is read as octal).
pub fn parse_mode(value: &serde_json::Value) -> Result<u32, String> {
    match value {
        serde_json::Value::Number(n) => n
            .as_u64()
            .and_then(|m| u32::try_from(m).ok())
            .ok_or_else(|| format!("mode {n} is not a non-negative 32-bit integer")),
        serde_json::Value::String(s) => {
            let s = s.trim();
            let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                u32::from_str_radix(hex, 16)
            } else if let Some(oct) = s.strip_prefix("0o").or_else(|| s.strip_prefix("0O")) {
                u32::from_str_radix(oct, 8)
            } else if s.len() > 1 && s.starts_with('0') {
                u32::from_str_radix(&s[1..], 8)
            } else {
                s.parse::<u32>()
            };
            parsed.map_err(|_| format!("invalid mode string '{s}'"))
        }
        other => Err(format!("mode must be a number or string, got {other}")),
    }
}

fn deserialize_mode<'de, D: Deserializer<'de>>(de: D) -> Result<Option<u32>, D::Error> {
    let value = Option::<serde_json::Value>::deserialize(de)?;
    match value {
        None => Ok(None),
        Some(v) => parse_mode(&v).map(Some).map_err(D::Error::custom),
    }
}

fn serialize_mode<S: Serializer>(mode: &Option<u32>, ser: S) -> Result<S::Ok, S::Error> {
    match mode {
        Some(m) => ser.serialize_some(m),
        None => ser.serialize_none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_unix_seconds() {
        let attrs: EntryAttributes =
            serde_json::from_value(json!({"mtime": 1_700_000_000, "size": 42})).unwrap();
        assert_eq!(attrs.mtime.unwrap().timestamp(), 1_700_000_000);
        assert_eq!(attrs.size, Some(42));
        assert!(attrs.atime.is_none());
    }

    #[test]
    fn rejects_negative_time() {
        let err = serde_json::from_value::<EntryAttributes>(json!({"atime": -5})).unwrap_err();
        assert!(err.to_string().contains("negative time"), "got: {err}");
    }

    #[test]
    fn mode_accepts_number_and_strings() {
        assert_eq!(parse_mode(&json!(420)).unwrap(), 420);
        assert_eq!(parse_mode(&json!("0644")).unwrap(), 0o644);
        assert_eq!(parse_mode(&json!("0o644")).unwrap(), 0o644);
        assert_eq!(parse_mode(&json!("0x1ed")).unwrap(), 0x1ed);
        assert_eq!(parse_mode(&json!("644")).unwrap(), 644);
    }

    #[test]
    fn mode_rejects_garbage() {
        assert!(parse_mode(&json!("rwxr-xr-x")).is_err());
        assert!(parse_mode(&json!(-1)).is_err());
        assert!(parse_mode(&json!([1])).is_err());
    }

    #[test]
    fn rejects_unknown_attribute_keys() {
        let err =
            serde_json::from_value::<EntryAttributes>(json!({"sise": 42})).unwrap_err();
        assert!(err.to_string().contains("unknown field"), "got: {err}");
    }

    #[test]
    fn roundtrips_through_wire_form() {
        let attrs: EntryAttributes = serde_json::from_value(json!({
            "atime": 100, "mtime": 200, "ctime": 300, "crtime": 400,
            "size": 7, "mode": "0755", "meta": {"kind": "pod"}
        }))
        .unwrap();
        let wire = serde_json::to_value(&attrs).unwrap();
        assert_eq!(wire["atime"], 100);
        assert_eq!(wire["mode"], json!(0o755));
        let back: EntryAttributes = serde_json::from_value(wire).unwrap();
        assert_eq!(back, attrs);
    }

    #[test]
    fn empty_reports_empty() {
        assert!(EntryAttributes::default().is_empty());
        let attrs: EntryAttributes = serde_json::from_value(json!({"size": 1})).unwrap();
        assert!(!attrs.is_empty());
    }
}
