//! Method identifiers for the plugin subprocess protocol.
//!
//! Every capability an entry can advertise maps to one [`Method`]. The
//! cacheable subset (`list`, `read`, `metadata`) is modelled separately as
//! [`CacheableMethod`] so the method cache cannot be keyed by a method it
//! does not memoize.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A method an entry can advertise and the shell can invoke on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    /// Enumerate child entries.
    List,
    /// Read the entry's content as raw bytes.
    Read,
    /// Fetch the entry's full metadata object.
    Metadata,
    /// Stream the entry's content as an unbounded byte stream.
    Stream,
    /// Execute a command on the resource the entry represents.
    Exec,
    /// Describe the entry's type within the plugin's schema graph.
    Schema,
}

impl Method {
    /// The protocol name, as passed on the plugin's argv.
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::List => "list",
            Method::Read => "read",
            Method::Metadata => "metadata",
            Method::Stream => "stream",
            Method::Exec => "exec",
            Method::Schema => "schema",
        }
    }

    /// All methods, in protocol order.
    pub fn all() -> [Method; 6] {
        [
            Method::List,
            Method::Read,
            Method::Metadata,
            Method::Stream,
            Method::Exec,
            Method::Schema,
        ]
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = UnknownMethod;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "list" => Ok(Method::List),
            "read" => Ok(Method::Read),
            "metadata" => Ok(Method::Metadata),
            "stream" => Ok(Method::Stream),
            "exec" => Ok(Method::Exec),
            "schema" => Ok(Method::Schema),
            other => Err(UnknownMethod(other.to_owned())),
        }
    }
}

/// Error returned when a string does not name a protocol method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownMethod(pub String);

impl fmt::Display for UnknownMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown method '{}'", self.0)
    }
}

impl std::error::Error for UnknownMethod {}

/// The subset of methods whose results the shell memoizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheableMethod {
    /// Cached child enumeration.
    List,
    /// Cached content bytes.
    Read,
    /// Cached metadata object.
    Metadata,
}

impl CacheableMethod {
    /// The protocol name of the underlying method.
    pub fn as_str(&self) -> &'static str {
        Method::from(*self).as_str()
    }
}

impl From<CacheableMethod> for Method {
    fn from(m: CacheableMethod) -> Method {
        match m {
            CacheableMethod::List => Method::List,
            CacheableMethod::Read => Method::Read,
            CacheableMethod::Metadata => Method::Metadata,
        }
    }
}

impl TryFrom<Method> for CacheableMethod {
    type Error = Method;

    /// Fails with the original method when it is not cacheable.
    fn try_from(m: Method) -> Result<Self, Method> {
        match m {
            Method::List => Ok(CacheableMethod::List),
            Method::Read => Ok(CacheableMethod::Read),
            Method::Metadata => Ok(CacheableMethod::Metadata),
            other => Err(other),
        }
    }
}

impl fmt::Display for CacheableMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_json_values() {
        assert_eq!(serde_json::to_string(&Method::List).unwrap(), "\"list\"");
        assert_eq!(serde_json::to_string(&Method::Exec).unwrap(), "\"exec\"");
        assert_eq!(serde_json::to_string(&Method::Schema).unwrap(), "\"schema\"");
    }

    #[test]
    fn method_from_str_roundtrip() {
        for m in Method::all() {
            assert_eq!(m.as_str().parse::<Method>().unwrap(), m);
        }
    }

    #[test]
    fn method_from_str_unknown() {
        let err = "write".parse::<Method>().unwrap_err();
        assert_eq!(err.to_string(), "unknown method 'write'");
    }

    #[test]
    fn cacheable_subset_conversions() {
        assert_eq!(CacheableMethod::try_from(Method::List), Ok(CacheableMethod::List));
        assert_eq!(CacheableMethod::try_from(Method::Stream), Err(Method::Stream));
        assert_eq!(Method::from(CacheableMethod::Metadata), Method::Metadata);
    }
}
