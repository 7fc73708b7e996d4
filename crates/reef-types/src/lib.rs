//! Shared vocabulary types for the reef shell.
//!
//! The reef shell presents heterogeneous infrastructure as one navigable
//! virtual filesystem, fed by external plugin scripts. This crate holds the
//! types spoken on both sides of that boundary: the protocol
//! [`Method`](method::Method) identifiers, entry
//! [`EntryAttributes`](attributes::EntryAttributes), the `exec` packet wire
//! format, and the runtime's configuration records.
//!
//! The runtime itself lives in `reef-plugin`; callers such as the HTTP API
//! and the filesystem mount consume these types without depending on the
//! runtime.

pub mod attributes;
pub mod config;
pub mod exec;
pub mod method;

pub use attributes::EntryAttributes;
pub use config::{
    CacheDefaults, ExternalPluginDef, ExternalPluginsConfig, MethodDeadlines,
    DEFAULT_SLASH_REPLACER,
};
pub use exec::{ExecOptions, ExecPacket, PacketKind};
pub use method::{CacheableMethod, Method, UnknownMethod};
