//! Subprocess invocation engine.
//!
//! Every plugin method call spawns the plugin script as a fresh child in
//! its own process group, with stdout/stderr piped back to the shell. The
//! argument vector is exactly `<script> <method> <path> <state> <extra…>`
//! (`init` uses `<script> init <configJSON>`).
//!
//! Cancellation and deadlines share one kill path: `SIGTERM` to the whole
//! group, a 5 second grace period, then `SIGKILL` to whatever survived.
//! Plugins commonly fork helpers (tunnels, polling loops), so a
//! single-pid kill is never enough.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

use crate::error::{PluginError, Result};
use reef_types::Method;

/// Grace period between `SIGTERM` and `SIGKILL` on cancellation.
pub const TERM_GRACE: Duration = Duration::from_secs(5);

/// A plugin script on disk plus the root name derived from it.
///
/// The root name is the script basename without its extension and becomes
/// the plugin's first path segment; it cannot be renamed.
#[derive(Debug, Clone)]
pub struct PluginScript {
    path: PathBuf,
    name: String,
}

impl PluginScript {
    /// Builds the script handle, deriving the plugin name.
    pub fn from_path(path: &Path) -> Result<Self> {
        if !path.is_absolute() {
            return Err(PluginError::Config(format!(
                "plugin script path must be absolute, got {}",
                path.display()
            )));
        }
        let name = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .filter(|stem| !stem.is_empty())
            .ok_or_else(|| {
                PluginError::Config(format!(
                    "cannot derive a plugin name from {}",
                    path.display()
                ))
            })?
            .to_owned();
        Ok(PluginScript {
            path: path.to_owned(),
            name,
        })
    }

    /// The plugin root's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The script's path on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Argv tail for `init`: `init <configJSON>`.
///
/// `serde_json` emits single-line JSON, so the argument never embeds a
/// newline.
pub(crate) fn init_args(config: &serde_json::Value) -> Vec<String> {
    vec!["init".to_owned(), config.to_string()]
}

/// Argv tail for the entry methods: `<method> <path> <state>`.
///
/// `state` is always passed, even when empty, so the plugin sees a fixed
/// argument layout. It goes through argv verbatim; the shell never
/// interprets it.
pub(crate) fn method_args(method: Method, path: &str, state: &str) -> Vec<String> {
    vec![method.as_str().to_owned(), path.to_owned(), state.to_owned()]
}

/// Argv tail for `exec`: `exec <path> <state> <optsJSON> <cmd> <args…>`.
pub(crate) fn exec_args(
    path: &str,
    state: &str,
    opts: &serde_json::Value,
    cmd: &str,
    args: &[String],
) -> Vec<String> {
    let mut argv = vec![
        "exec".to_owned(),
        path.to_owned(),
        state.to_owned(),
        opts.to_string(),
        cmd.to_owned(),
    ];
    argv.extend(args.iter().cloned());
    argv
}

/// Owns termination of one invocation's process group.
///
/// `terminate` is idempotent and safe to call from several tasks; the
/// first call sends `SIGTERM` and schedules the `SIGKILL` escalation.
#[derive(Clone)]
pub(crate) struct ProcessGroupGuard {
    inner: Arc<GuardInner>,
}

struct GuardInner {
    pgid: Pid,
    plugin: String,
    op: String,
    fired: AtomicBool,
}

impl ProcessGroupGuard {
    fn new(pid: u32, plugin: &str, op: &str) -> Self {
        ProcessGroupGuard {
            inner: Arc::new(GuardInner {
                pgid: Pid::from_raw(pid as i32),
                plugin: plugin.to_owned(),
                op: op.to_owned(),
                fired: AtomicBool::new(false),
            }),
        }
    }

    /// Sends `SIGTERM` to the group and arms the `SIGKILL` escalation.
    pub(crate) fn terminate(&self) {
        if self.inner.fired.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(
            plugin = %self.inner.plugin,
            op = %self.inner.op,
            pgid = self.inner.pgid.as_raw(),
            "terminating plugin process group"
        );
        if killpg(self.inner.pgid, Signal::SIGTERM).is_err() {
            // ESRCH: the group is already gone, nothing to escalate.
            return;
        }
        let inner = Arc::clone(&self.inner);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(TERM_GRACE).await;
                    inner.kill_survivors();
                });
            }
            // No runtime to sleep on, so no grace period either.
            Err(_) => self.inner.kill_survivors(),
        }
    }
}

impl GuardInner {
    fn kill_survivors(&self) {
        // Signal 0 probes whether any group member is left.
        if killpg(self.pgid, None).is_ok() {
            warn!(
                plugin = %self.plugin,
                op = %self.op,
                pgid = self.pgid.as_raw(),
                "process group survived SIGTERM grace period, sending SIGKILL"
            );
            let _ = killpg(self.pgid, Signal::SIGKILL);
        }
    }
}

/// A freshly spawned plugin process and its termination guard.
pub(crate) struct SpawnedPlugin {
    pub(crate) child: Child,
    pub(crate) guard: ProcessGroupGuard,
}

/// Spawns the script with the given argv tail in a new process group.
pub(crate) fn spawn_plugin(
    script: &PluginScript,
    args: &[String],
    want_stdin: bool,
) -> Result<SpawnedPlugin> {
    let op = args.first().map(String::as_str).unwrap_or("");
    let mut command = Command::new(script.path());
    command
        .args(args)
        .stdin(if want_stdin {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);

    debug!(
        plugin = %script.name(),
        op,
        script = %script.path().display(),
        "spawning plugin process"
    );

    let child = command.spawn()?;
    let pid = child.id().ok_or_else(|| {
        PluginError::Config(format!("plugin '{}' exited before startup", script.name()))
    })?;
    let guard = ProcessGroupGuard::new(pid, script.name(), op);
    Ok(SpawnedPlugin { child, guard })
}

fn missing_pipe(which: &str) -> PluginError {
    std::io::Error::other(format!("failed to capture plugin {which}")).into()
}

/// Runs one buffered invocation to completion.
///
/// stdout and stderr are collected concurrently with the wait so a large
/// payload cannot deadlock on a full pipe. Non-zero exit produces an
/// [`PluginError::Invocation`] carrying the trimmed stderr; stdout is
/// discarded on error.
pub(crate) async fn invoke_buffered(
    script: &PluginScript,
    args: Vec<String>,
    deadline: Option<Duration>,
    cancel: &CancellationToken,
) -> Result<Vec<u8>> {
    if cancel.is_cancelled() {
        return Err(PluginError::Cancelled);
    }

    let op = args.first().cloned().unwrap_or_default();
    let SpawnedPlugin { mut child, guard } = spawn_plugin(script, &args, false)?;
    let mut stdout = child.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;
    let mut stderr = child.stderr.take().ok_or_else(|| missing_pipe("stderr"))?;

    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        stdout.read_to_end(&mut buf).await?;
        Ok::<_, std::io::Error>(buf)
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        stderr.read_to_end(&mut buf).await?;
        Ok::<_, std::io::Error>(buf)
    });

    let status = {
        let wait = async move { child.wait().await };
        let limit = async {
            match deadline {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            status = wait => status?,
            _ = cancel.cancelled() => {
                guard.terminate();
                return Err(PluginError::Cancelled);
            }
            _ = limit => {
                debug!(plugin = %script.name(), op = %op, "invocation deadline fired");
                guard.terminate();
                return Err(PluginError::Cancelled);
            }
        }
    };

    let stdout_buf = stdout_task.await.map_err(std::io::Error::other)??;
    let stderr_buf = stderr_task.await.map_err(std::io::Error::other)??;

    if status.success() {
        debug!(
            plugin = %script.name(),
            op = %op,
            stdout_bytes = stdout_buf.len(),
            "plugin invocation succeeded"
        );
        return Ok(stdout_buf);
    }

    let code = status.code().unwrap_or(-1);
    let stderr = String::from_utf8_lossy(&stderr_buf)
        .trim_end()
        .to_owned();
    debug!(plugin = %script.name(), op = %op, code, "plugin invocation failed");
    Err(PluginError::Invocation { code, stderr })
}

/// Arms group termination on caller cancellation for a streaming
/// invocation.
///
/// The returned [`DropGuard`] disarms the watcher when the stream handle
/// goes away; dropping the handle itself is the other termination path.
pub(crate) fn terminate_on_cancel(
    cancel: &CancellationToken,
    guard: ProcessGroupGuard,
) -> DropGuard {
    let done = CancellationToken::new();
    let watcher_done = done.clone();
    let cancel = cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => guard.terminate(),
            _ = watcher_done.cancelled() => {}
        }
    });
    done.drop_guard()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::atomic::AtomicU64;

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    fn fixture_script(body: &str) -> PathBuf {
        let id = COUNTER.fetch_add(1, Ordering::Relaxed);
        let pid = std::process::id();
        let dir = std::env::temp_dir().join(format!("reef_invoke_test_{pid}_{id}"));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("fixture.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn cleanup(script: &Path) {
        if let Some(dir) = script.parent() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }

    #[test]
    fn script_name_is_basename_without_extension() {
        let script = PluginScript::from_path(Path::new("/p/myplugin.rb")).unwrap();
        assert_eq!(script.name(), "myplugin");

        let script = PluginScript::from_path(Path::new("/p/no_ext")).unwrap();
        assert_eq!(script.name(), "no_ext");
    }

    #[test]
    fn relative_script_path_rejected() {
        let err = PluginScript::from_path(Path::new("plugins/aws.sh")).unwrap_err();
        assert!(matches!(err, PluginError::Config(_)));
    }

    #[test]
    fn init_argv_shape() {
        let args = init_args(&serde_json::json!({"profile": "dev"}));
        assert_eq!(args, vec!["init", r#"{"profile":"dev"}"#]);
    }

    #[test]
    fn method_argv_passes_empty_state() {
        let args = method_args(Method::List, "/aws/vms", "");
        assert_eq!(args, vec!["list", "/aws/vms", ""]);
    }

    #[test]
    fn exec_argv_shape() {
        let args = exec_args(
            "/aws/vm1",
            "s1",
            &serde_json::json!({"tty": true}),
            "echo",
            &["bar".to_owned()],
        );
        assert_eq!(
            args,
            vec!["exec", "/aws/vm1", "s1", r#"{"tty":true}"#, "echo", "bar"]
        );
    }

    #[tokio::test]
    async fn buffered_success_returns_stdout() {
        let script_path = fixture_script(r#"printf 'hello %s' "$2""#);
        let script = PluginScript::from_path(&script_path).unwrap();

        let out = invoke_buffered(
            &script,
            method_args(Method::Read, "/fixture/a", ""),
            Some(Duration::from_secs(5)),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(out, b"hello /fixture/a");

        cleanup(&script_path);
    }

    #[tokio::test]
    async fn buffered_failure_carries_exit_and_stderr() {
        let script_path = fixture_script("echo 'volume not found' >&2\nexit 3");
        let script = PluginScript::from_path(&script_path).unwrap();

        let err = invoke_buffered(
            &script,
            method_args(Method::List, "/fixture", ""),
            Some(Duration::from_secs(5)),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        match err {
            PluginError::Invocation { code, stderr } => {
                assert_eq!(code, 3);
                assert_eq!(stderr, "volume not found");
            }
            other => panic!("expected Invocation, got: {other}"),
        }

        cleanup(&script_path);
    }

    #[tokio::test]
    async fn buffered_cancellation_surfaces_cancelled() {
        let script_path = fixture_script("sleep 60");
        let script = PluginScript::from_path(&script_path).unwrap();

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let err = invoke_buffered(
            &script,
            method_args(Method::Read, "/fixture", ""),
            None,
            &cancel,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PluginError::Cancelled));

        cleanup(&script_path);
    }

    #[tokio::test]
    async fn buffered_deadline_surfaces_cancelled() {
        let script_path = fixture_script("sleep 60");
        let script = PluginScript::from_path(&script_path).unwrap();

        let err = invoke_buffered(
            &script,
            method_args(Method::Read, "/fixture", ""),
            Some(Duration::from_millis(100)),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PluginError::Cancelled));

        cleanup(&script_path);
    }

    #[tokio::test]
    async fn terminate_is_idempotent() {
        let script_path = fixture_script("sleep 60");
        let script = PluginScript::from_path(&script_path).unwrap();

        let SpawnedPlugin { mut child, guard } =
            spawn_plugin(&script, &method_args(Method::Read, "/fixture", ""), false).unwrap();
        guard.terminate();
        guard.clone().terminate();
        let status = child.wait().await.unwrap();
        assert!(!status.success());

        cleanup(&script_path);
    }
}
