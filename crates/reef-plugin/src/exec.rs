//! The `exec` packet protocol.
//!
//! The plugin's `exec` method effectively replaces itself with the target
//! command, so there is no out-of-band error channel: stdout and stderr
//! are forwarded verbatim as packets, in the order the bytes were read,
//! and the command's exit code arrives as the final packet. A bounded
//! channel carries the packets; a send that the caller cannot consume
//! blocks the pump, and cancellation unblocks it by terminating the
//! process group and draining.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdout};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::entry::Entry;
use crate::error::{PluginError, Result};
use crate::invoke::{PluginScript, ProcessGroupGuard, SpawnedPlugin, exec_args, spawn_plugin};
use reef_types::{ExecOptions, ExecPacket};

/// Packets buffered between the pump and a slow caller.
const PACKET_BUFFER: usize = 16;

/// Bytes read from the child per packet, at most.
const READ_CHUNK: usize = 8 * 1024;

/// The packet stream of one `exec` invocation.
pub struct ExecStream {
    rx: mpsc::Receiver<ExecPacket>,
}

impl ExecStream {
    /// The next packet; `None` once the exit-code packet has been
    /// consumed (or the invocation was cancelled mid-drain).
    pub async fn next(&mut self) -> Option<ExecPacket> {
        self.rx.recv().await
    }

    /// Drains the stream into a vector.
    pub async fn collect(mut self) -> Vec<ExecPacket> {
        let mut packets = Vec::new();
        while let Some(packet) = self.next().await {
            packets.push(packet);
        }
        packets
    }
}

/// Spawns an `exec` invocation and starts the packet pump.
pub(crate) async fn spawn_exec(
    script: &PluginScript,
    entry: &Entry,
    cmd: &str,
    args: &[String],
    opts: ExecOptions,
    cancel: &CancellationToken,
) -> Result<ExecStream> {
    if cancel.is_cancelled() {
        return Err(PluginError::Cancelled);
    }

    let wire_opts = opts.to_wire_json();
    let argv = exec_args(entry.path(), entry.state(), &wire_opts, cmd, args);
    let SpawnedPlugin { mut child, guard } = spawn_plugin(script, &argv, opts.input.is_some())?;

    if let Some(input) = opts.input {
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| std::io::Error::other("failed to capture plugin stdin"))?;
        // Written concurrently with the pump: a large input would
        // otherwise deadlock against an unread output pipe.
        tokio::spawn(async move {
            if let Err(err) = stdin.write_all(&input).await {
                warn!(error = %err, "failed to write exec input");
            }
            // Dropping stdin closes the pipe.
        });
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| std::io::Error::other("failed to capture plugin stdout"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| std::io::Error::other("failed to capture plugin stderr"))?;

    let (tx, rx) = mpsc::channel(PACKET_BUFFER);
    debug!(plugin = %script.name(), path = %entry.path(), cmd, "starting exec packet pump");
    tokio::spawn(pump(child, stdout, stderr, guard, tx, cancel.clone()));
    Ok(ExecStream { rx })
}

async fn pump(
    mut child: Child,
    mut stdout: ChildStdout,
    mut stderr: ChildStderr,
    guard: ProcessGroupGuard,
    tx: mpsc::Sender<ExecPacket>,
    cancel: CancellationToken,
) {
    let mut out_buf = vec![0u8; READ_CHUNK];
    let mut err_buf = vec![0u8; READ_CHUNK];
    let mut out_done = false;
    let mut err_done = false;
    let mut saw_cancel = false;
    let mut read_failure: Option<std::io::Error> = None;

    while !(out_done && err_done) {
        tokio::select! {
            read = stdout.read(&mut out_buf), if !out_done => match read {
                Ok(0) => out_done = true,
                Ok(n) => {
                    if !send_packet(&tx, &cancel, &guard, ExecPacket::stdout(&out_buf[..n])).await {
                        return;
                    }
                }
                Err(err) => {
                    out_done = true;
                    read_failure.get_or_insert(err);
                }
            },
            read = stderr.read(&mut err_buf), if !err_done => match read {
                Ok(0) => err_done = true,
                Ok(n) => {
                    if !send_packet(&tx, &cancel, &guard, ExecPacket::stderr(&err_buf[..n])).await {
                        return;
                    }
                }
                Err(err) => {
                    err_done = true;
                    read_failure.get_or_insert(err);
                }
            },
            _ = cancel.cancelled(), if !saw_cancel => {
                saw_cancel = true;
                guard.terminate();
            }
        }
    }

    let final_packet = match child.wait().await {
        Ok(status) => match status.code() {
            Some(code) => ExecPacket::exit_code(code),
            None => ExecPacket::exit_error("command terminated by signal"),
        },
        Err(err) => ExecPacket::exit_error(format!("could not determine the exit code: {err}")),
    };
    let final_packet = match read_failure {
        Some(err) => ExecPacket::exit_error(format!("output stream failed: {err}")),
        None => final_packet,
    };
    send_packet(&tx, &cancel, &guard, final_packet).await;
}

/// Sends one packet, honouring backpressure.
///
/// Returns `false` when the caller is gone and pumping should stop. A
/// cancelled invocation drops the packet instead of blocking, which is
/// what lets a blocked pump drain after cancellation.
async fn send_packet(
    tx: &mpsc::Sender<ExecPacket>,
    cancel: &CancellationToken,
    guard: &ProcessGroupGuard,
    packet: ExecPacket,
) -> bool {
    if cancel.is_cancelled() {
        return true;
    }
    tokio::select! {
        sent = tx.send(packet) => {
            if sent.is_err() {
                // Receiver dropped: nobody is listening any more.
                guard.terminate();
                return false;
            }
            true
        }
        _ = cancel.cancelled() => {
            guard.terminate();
            true
        }
    }
}
