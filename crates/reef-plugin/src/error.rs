//! Error taxonomy for the external-plugin runtime.
//!
//! Every failure surfaces to the caller; nothing is retried internally.
//! The enum is `Clone` so a cache leader's outcome can be shared with the
//! followers coalesced onto the same invocation, which is why the I/O
//! variant wraps its source in an `Arc`.

use std::sync::Arc;

use thiserror::Error;

use reef_types::Method;

/// Errors produced by the plugin runtime.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum PluginError {
    /// The plugin subprocess exited non-zero; the message is its stderr.
    #[error("plugin exited with code {code}: {stderr}")]
    Invocation {
        /// The subprocess exit code.
        code: i32,
        /// Full stderr, trimmed of trailing whitespace.
        stderr: String,
    },

    /// The plugin's output violated the protocol (malformed JSON, bad
    /// stream header, unknown descriptor key).
    #[error("invalid plugin output: {0}")]
    Decode(String),

    /// Schema-mode inconsistency or unknown type within a plugin subtree.
    #[error("schema violation at {path}: {reason}")]
    Schema {
        /// Virtual path of the offending entry.
        path: String,
        /// What was violated.
        reason: String,
    },

    /// The caller requested a method the entry does not advertise.
    #[error("entry {path} does not support {method}")]
    UnsupportedMethod {
        /// The requested method.
        method: Method,
        /// Virtual path of the entry.
        path: String,
    },

    /// The invocation was cancelled or its deadline fired.
    #[error("invocation cancelled")]
    Cancelled,

    /// Path resolution walked to a segment no `list` result contains.
    #[error("no entry at {0}")]
    NotFound(String),

    /// Plugin load failed: bad script path, `init` failure, root name
    /// mismatch, or invalid runtime configuration.
    #[error("plugin configuration error: {0}")]
    Config(String),

    /// Underlying I/O failure while driving the subprocess.
    #[error("io error: {0}")]
    Io(#[source] Arc<std::io::Error>),
}

impl From<std::io::Error> for PluginError {
    fn from(err: std::io::Error) -> Self {
        PluginError::Io(Arc::new(err))
    }
}

impl PluginError {
    /// Wraps a JSON parse failure as a protocol violation.
    pub fn decode(err: serde_json::Error) -> Self {
        PluginError::Decode(err.to_string())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, PluginError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invocation_display_carries_stderr() {
        let err = PluginError::Invocation {
            code: 2,
            stderr: "no such volume".into(),
        };
        assert_eq!(err.to_string(), "plugin exited with code 2: no such volume");
    }

    #[test]
    fn unsupported_method_display() {
        let err = PluginError::UnsupportedMethod {
            method: Method::Exec,
            path: "/aws/vm1".into(),
        };
        assert_eq!(err.to_string(), "entry /aws/vm1 does not support exec");
    }

    #[test]
    fn schema_display_names_the_path() {
        let err = PluginError::Schema {
            path: "/k8s/pods/web".into(),
            reason: "missing type_id".into(),
        };
        assert!(err.to_string().contains("/k8s/pods/web"));
        assert!(err.to_string().contains("missing type_id"));
    }

    #[test]
    fn io_errors_are_cloneable() {
        let err: PluginError =
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed").into();
        let copy = err.clone();
        assert!(copy.to_string().contains("pipe closed"));
    }

    #[test]
    fn json_errors_become_decode() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err = PluginError::decode(json_err);
        assert!(matches!(err, PluginError::Decode(_)));
    }
}
