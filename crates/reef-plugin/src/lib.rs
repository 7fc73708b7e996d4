//! External plugin runtime for the reef shell.
//!
//! An external plugin is an executable script. The shell runs it with
//! `init` to materialize its root entry, then drives every subsequent
//! method (`list`, `read`, `metadata`, `stream`, `exec`, `schema`) as a
//! fresh subprocess with a strict argv protocol and output grammar. This
//! crate owns that whole lifecycle:
//!
//! - [`invoke`] -- subprocess spawning, process-group isolation, and the
//!   `SIGTERM` -> grace -> `SIGKILL` cancellation path
//! - [`decode`] -- strict decoding of entry descriptors, metadata, and
//!   prefetched results
//! - [`entry`] plus an internal registry -- immutable materialized
//!   entries, one singleton root per loaded plugin
//! - an internal method cache -- TTL memoization of
//!   `list`/`read`/`metadata` with at-most-one in-flight invocation per
//!   key
//! - [`schema`] -- schema graphs and the frozen per-plugin schema mode
//! - [`stream`] / [`exec`] -- the `200` header protocol and the exec
//!   packet protocol
//! - [`host`] -- the narrow API surface the HTTP and filesystem layers
//!   call
//!
//! # Example
//!
//! ```rust,no_run
//! use std::path::Path;
//! use reef_plugin::PluginHost;
//! use reef_types::ExternalPluginsConfig;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() -> Result<(), reef_plugin::PluginError> {
//! let host = PluginHost::new(ExternalPluginsConfig::default())?;
//! let cancel = CancellationToken::new();
//! let root = host
//!     .load_external_plugin(Path::new("/opt/reef/aws.sh"), &cancel)
//!     .await?;
//! for child in host.list(&root, &cancel).await?.iter() {
//!     println!("{}", child.path());
//! }
//! # Ok(())
//! # }
//! ```

pub mod decode;
pub mod entry;
pub mod error;
pub mod exec;
pub mod host;
pub mod invoke;
pub mod schema;
pub mod stream;

pub(crate) mod cache;
pub(crate) mod registry;

pub use self::entry::Entry;
pub use self::error::{PluginError, Result};
pub use self::exec::ExecStream;
pub use self::host::PluginHost;
pub use self::invoke::{PluginScript, TERM_GRACE};
pub use self::schema::{SchemaGraph, SchemaMode, SchemaNode};
pub use self::stream::EntryStream;
