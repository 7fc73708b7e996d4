//! The `stream` header protocol.
//!
//! A streaming plugin prints the literal header line `200` once it is
//! ready, then writes content bytes until it exits or is cancelled. The
//! decoder consumes exactly the header line; anything already buffered
//! past the newline is preserved for the caller, so partial lines are
//! never lost.

use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader, ReadBuf};
use tokio::process::{Child, ChildStdout};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::debug;

use crate::entry::Entry;
use crate::error::{PluginError, Result};
use crate::invoke::{
    PluginScript, ProcessGroupGuard, SpawnedPlugin, method_args, spawn_plugin,
    terminate_on_cancel,
};
use reef_types::Method;

/// Expected header line, without the trailing newline.
const STREAM_READY: &str = "200";

/// An open content stream from one `stream` invocation.
///
/// Reads delegate to the plugin's stdout. Dropping the stream terminates
/// the plugin's process group; so does cancelling the token the stream
/// was opened with.
pub struct EntryStream {
    reader: BufReader<ChildStdout>,
    guard: ProcessGroupGuard,
    _cancel_watch: DropGuard,
    _child: Child,
}

impl std::fmt::Debug for EntryStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryStream").finish_non_exhaustive()
    }
}

impl AsyncRead for EntryStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

impl Drop for EntryStream {
    fn drop(&mut self) {
        self.guard.terminate();
    }
}

/// Opens a `stream` invocation and validates the header.
pub(crate) async fn open(
    script: &PluginScript,
    entry: &Entry,
    cancel: &CancellationToken,
) -> Result<EntryStream> {
    if cancel.is_cancelled() {
        return Err(PluginError::Cancelled);
    }

    let args = method_args(Method::Stream, entry.path(), entry.state());
    let SpawnedPlugin { mut child, guard } = spawn_plugin(script, &args, false)?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| std::io::Error::other("failed to capture plugin stdout"))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| std::io::Error::other("failed to capture plugin stderr"))?;
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stderr.read_to_end(&mut buf).await;
        buf
    });

    let mut reader = BufReader::new(stdout);
    let mut header = String::new();
    tokio::select! {
        read = reader.read_line(&mut header) => {
            read?;
        }
        _ = cancel.cancelled() => {
            guard.terminate();
            return Err(PluginError::Cancelled);
        }
    }

    if header.trim_end() != STREAM_READY {
        guard.terminate();
        // The plugin's own failure beats a header complaint.
        let status = child.wait().await?;
        let stderr_buf = stderr_task.await.map_err(std::io::Error::other)?;
        if !status.success() {
            return Err(PluginError::Invocation {
                code: status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&stderr_buf).trim_end().to_owned(),
            });
        }
        return Err(PluginError::Decode(format!(
            "expected stream header '{STREAM_READY}', got '{}'",
            header.trim_end()
        )));
    }

    debug!(plugin = %script.name(), path = %entry.path(), "stream header accepted");
    let cancel_watch = terminate_on_cancel(cancel, guard.clone());
    Ok(EntryStream {
        reader,
        guard,
        _cancel_watch: cancel_watch,
        _child: child,
    })
}
