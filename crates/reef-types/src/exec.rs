//! Wire types for the `exec` packet protocol.
//!
//! Command output is framed into a packet sequence: zero or more `stdout` /
//! `stderr` packets in the order the bytes were read, then exactly one
//! `exitcode` packet. When the exit code cannot be determined the final
//! packet carries `err` instead of `data`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Options forwarded to the plugin's `exec` method.
///
/// `input` stays on the host side: its presence turns into `"stdin": true`
/// in the wire JSON and the bytes themselves are written to the child's
/// stdin.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Allocate a pseudo-terminal on the remote side.
    pub tty: bool,
    /// Run the command with elevated privileges.
    pub elevate: bool,
    /// Bytes to feed to the command's stdin.
    pub input: Option<Vec<u8>>,
}

impl ExecOptions {
    /// The single-line JSON object passed as the `<optsJSON>` argument.
    ///
    /// Only flags that are set appear, so the default options serialize to
    /// `{}`.
    pub fn to_wire_json(&self) -> serde_json::Value {
        let mut opts = serde_json::Map::new();
        if self.tty {
            opts.insert("tty".into(), serde_json::Value::Bool(true));
        }
        if self.elevate {
            opts.insert("elevate".into(), serde_json::Value::Bool(true));
        }
        if self.input.is_some() {
            opts.insert("stdin".into(), serde_json::Value::Bool(true));
        }
        serde_json::Value::Object(opts)
    }
}

/// Discriminator for [`ExecPacket`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PacketKind {
    Stdout,
    Stderr,
    Exitcode,
}

/// One framed unit of `exec` output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecPacket {
    /// Which stream (or the final exit code) this packet carries.
    #[serde(rename = "typeField")]
    pub kind: PacketKind,

    /// When the host read the chunk or observed the exit.
    pub timestamp: DateTime<Utc>,

    /// Chunk text for `stdout`/`stderr`; the integer code for `exitcode`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,

    /// Failure description when the payload could not be produced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

impl ExecPacket {
    /// A chunk read from the command's stdout.
    pub fn stdout(chunk: &[u8]) -> Self {
        Self::chunk(PacketKind::Stdout, chunk)
    }

    /// A chunk read from the command's stderr.
    pub fn stderr(chunk: &[u8]) -> Self {
        Self::chunk(PacketKind::Stderr, chunk)
    }

    fn chunk(kind: PacketKind, chunk: &[u8]) -> Self {
        ExecPacket {
            kind,
            timestamp: Utc::now(),
            data: Some(serde_json::Value::String(
                String::from_utf8_lossy(chunk).into_owned(),
            )),
            err: None,
        }
    }

    /// The terminal packet carrying the command's exit code.
    pub fn exit_code(code: i32) -> Self {
        ExecPacket {
            kind: PacketKind::Exitcode,
            timestamp: Utc::now(),
            data: Some(serde_json::Value::Number(code.into())),
            err: None,
        }
    }

    /// The terminal packet when the exit code could not be determined.
    pub fn exit_error(reason: impl Into<String>) -> Self {
        ExecPacket {
            kind: PacketKind::Exitcode,
            timestamp: Utc::now(),
            data: None,
            err: Some(reason.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_serialize_empty() {
        assert_eq!(ExecOptions::default().to_wire_json().to_string(), "{}");
    }

    #[test]
    fn set_flags_appear_in_wire_json() {
        let opts = ExecOptions {
            tty: true,
            elevate: false,
            input: Some(b"hi".to_vec()),
        };
        let wire = opts.to_wire_json();
        assert_eq!(wire["tty"], true);
        assert_eq!(wire["stdin"], true);
        assert!(wire.get("elevate").is_none());
    }

    #[test]
    fn stdout_packet_shape() {
        let pkt = ExecPacket::stdout(b"bar\n");
        let json = serde_json::to_value(&pkt).unwrap();
        assert_eq!(json["typeField"], "stdout");
        assert_eq!(json["data"], "bar\n");
        assert!(json.get("err").is_none());
    }

    #[test]
    fn exit_code_packet_shape() {
        let json = serde_json::to_value(ExecPacket::exit_code(0)).unwrap();
        assert_eq!(json["typeField"], "exitcode");
        assert_eq!(json["data"], 0);
    }

    #[test]
    fn exit_error_packet_carries_err() {
        let json = serde_json::to_value(ExecPacket::exit_error("killed by signal")).unwrap();
        assert_eq!(json["typeField"], "exitcode");
        assert!(json.get("data").is_none());
        assert_eq!(json["err"], "killed by signal");
    }
}
