//! The executor: spawns a command, wires its stdio into a [`Session`], and
//! runs the yield/timeout/abort/exit race that decides what to hand back to
//! the caller.
//!
//! The call is settled at most once (single-shot, first-wins), but output
//! capture and the session's lifecycle continue in a detached supervisor
//! task until the process actually exits, even if the call was already
//! settled as "running" or as a timeout/abort failure.

use crate::config;
use crate::guard;
use crate::kill;
use crate::output;
use crate::pty;
use crate::registry::SessionRegistry;
use crate::session::{Session, SessionStatus, StdinMode, Stream, Transport};
use crate::shell;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Minimum/maximum/default yield window, in milliseconds.
const YIELD_MS_MIN: u64 = 10;
const YIELD_MS_MAX: u64 = 120_000;

/// Default timeout in seconds; `<= 0` disables the timeout.
const TIMEOUT_SECONDS_DEFAULT: i64 = 1800;

/// Input parameters for [`start`].
#[derive(Debug, Clone, Default)]
pub struct StartParams {
    pub command: String,
    pub workdir: Option<String>,
    pub env: Option<HashMap<String, String>>,
    pub yield_ms: Option<u64>,
    pub background: bool,
    pub timeout: Option<i64>,
    pub stdin_mode: StdinMode,
}

/// The outcome of a `start` call: exactly one of these is produced, exactly
/// once, per invocation.
#[derive(Debug, Clone)]
pub enum ExecutorOutcome {
    /// The yield window elapsed (or `background` was set) before the
    /// process finished; it continues running in the background.
    Running { session_id: String, warning: Option<String> },
    /// The process finished within the yield window with a clean exit.
    Success {
        session_id: String,
        text: String,
        warning: Option<String>,
    },
    /// The process finished within the yield window with a failure, or the
    /// invocation was invalid before anything was spawned.
    Failed {
        session_id: Option<String>,
        reason: String,
    },
}

/// Progress callback, invoked after each output slice is appended. The
/// agent framework side of this contract is out of scope; tests and the
/// MCP edge may pass a no-op.
pub type OnUpdate = Arc<dyn Fn() + Send + Sync>;

pub fn no_op_on_update() -> OnUpdate {
    Arc::new(|| {})
}

/// Start a command, backed by `registry`, and return once the call settles
/// (running / success / failure). The spawned process and its session
/// continue to be driven to completion by a detached task regardless of
/// which of the three outcomes settles the call.
pub async fn start(
    params: StartParams,
    cancel: CancellationToken,
    on_update: OnUpdate,
    registry: SessionRegistry,
) -> ExecutorOutcome {
    if params.command.trim().is_empty() {
        return ExecutorOutcome::Failed {
            session_id: None,
            reason: "command must not be empty".to_string(),
        };
    }
    if let Err(reason) = guard::validate(&params.command) {
        return ExecutorOutcome::Failed {
            session_id: None,
            reason,
        };
    }

    let shell_cfg = shell::resolve();
    let cwd = params.workdir.clone().unwrap_or_else(current_dir_string);

    let mut env_map = config::build_child_env(params.env.as_ref());

    let mut stdin_mode = params.stdin_mode;
    let mut warning = None;

    if stdin_mode == StdinMode::Pty {
        env_map
            .entry("TERM".to_string())
            .or_insert_with(|| shell::DEFAULT_TERM.to_string());
    }

    let spawned = if stdin_mode == StdinMode::Pty {
        match spawn_pty(&shell_cfg, &params.command, &cwd, &env_map) {
            Ok(s) => Some(s),
            Err(e) => {
                warning = Some(format!(
                    "Warning: {e}, falling back to pipe mode."
                ));
                stdin_mode = StdinMode::Pipe;
                None
            }
        }
    } else {
        None
    };

    let spawned = match spawned {
        Some(s) => s,
        None => match spawn_pipe(&shell_cfg, &params.command, &cwd, &env_map) {
            Ok(s) => s,
            Err(e) => {
                return ExecutorOutcome::Failed {
                    session_id: None,
                    reason: format!("failed to spawn process: {e}"),
                };
            }
        },
    };

    let SpawnedProcess {
        child,
        pid,
        transport,
        readers,
    } = spawned;

    let max_output_chars = crate::config::max_output_chars();
    let session = Arc::new(Session::new(
        uuid::Uuid::new_v4().to_string(),
        params.command.clone(),
        cwd,
        stdin_mode,
        pid,
        max_output_chars,
        transport,
        warning.clone(),
    ));
    registry.add(session.clone()).await;

    let reader_handles: Vec<_> = readers
        .into_iter()
        .map(|(stream, reader)| spawn_reader(session.clone(), stream, reader, on_update.clone()))
        .collect();

    let yield_ms = if params.background {
        0
    } else {
        params
            .yield_ms
            .unwrap_or_else(config::default_yield_ms)
            .clamp(YIELD_MS_MIN, YIELD_MS_MAX)
    };
    let timeout_secs = params.timeout.unwrap_or(TIMEOUT_SECONDS_DEFAULT);

    let (tx, rx) = oneshot::channel();
    tokio::spawn(supervise(
        session,
        registry,
        child,
        pid,
        yield_ms,
        timeout_secs,
        cancel,
        tx,
        warning,
        reader_handles,
    ));

    rx.await.unwrap_or(ExecutorOutcome::Failed {
        session_id: None,
        reason: "executor task ended without settling".to_string(),
    })
}

struct SpawnedProcess {
    child: Child,
    pid: Option<u32>,
    transport: Transport,
    readers: Vec<(Stream, Box<dyn AsyncRead + Unpin + Send>)>,
}

fn current_dir_string() -> String {
    std::env::current_dir()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| ".".to_string())
}

fn spawn_pipe(
    shell_cfg: &shell::ShellConfig,
    command: &str,
    cwd: &str,
    env: &HashMap<String, String>,
) -> Result<SpawnedProcess, String> {
    let mut cmd = Command::new(shell_cfg.program);
    cmd.arg(shell_cfg.command_flag)
        .arg(command)
        .current_dir(cwd)
        .env_clear()
        .envs(env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| e.to_string())?;
    let pid = child.id();
    let stdin = child.stdin.take();
    let stdout = child.stdout.take().expect("stdout was piped");
    let stderr = child.stderr.take().expect("stderr was piped");

    Ok(SpawnedProcess {
        child,
        pid,
        transport: Transport::Pipe { stdin },
        readers: vec![
            (Stream::Stdout, Box::new(stdout)),
            (Stream::Stderr, Box::new(stderr)),
        ],
    })
}

fn spawn_pty(
    shell_cfg: &shell::ShellConfig,
    command: &str,
    cwd: &str,
    env: &HashMap<String, String>,
) -> Result<SpawnedProcess, String> {
    let opened = pty::open()?;

    let mut cmd = pty_process::Command::new(shell_cfg.program);
    cmd = cmd.arg(shell_cfg.command_flag).arg(command).current_dir(cwd);
    for (k, v) in env {
        cmd = cmd.env(k, v);
    }

    let child = cmd
        .spawn(opened.pts)
        .map_err(|e| format!("failed to spawn process with PTY: {e}"))?;
    let pid = child.id();

    let (read_half, write_half) = opened.pty.into_split();

    Ok(SpawnedProcess {
        child,
        pid,
        transport: Transport::Pty { writer: write_half },
        // A PTY has one fd for both stdout and stderr; there's no stream
        // distinction left to preserve once the kernel interleaves them.
        readers: vec![(Stream::Stdout, Box::new(read_half))],
    })
}

fn spawn_reader(
    session: Arc<Session>,
    stream: Stream,
    mut reader: Box<dyn AsyncRead + Unpin + Send>,
    on_update: OnUpdate,
) -> tokio::task::JoinHandle<()> {
    let preserve_ansi = session.stdin_mode == StdinMode::Pty;
    tokio::spawn(async move {
        let mut buf = vec![0u8; crate::session::MAX_CHUNK_CHARS];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let raw = String::from_utf8_lossy(&buf[..n]);
                    let sanitized = output::sanitize(&raw, preserve_ansi);
                    if sanitized.is_empty() {
                        continue;
                    }
                    for slice in chunk_chars(&sanitized, crate::session::MAX_CHUNK_CHARS) {
                        session.append_output(stream, &slice).await;
                        on_update();
                    }
                }
            }
        }
    })
}

fn chunk_chars(s: &str, max_chars: usize) -> Vec<String> {
    let chars: Vec<char> = s.chars().collect();
    if chars.len() <= max_chars {
        return vec![s.to_string()];
    }
    chars
        .chunks(max_chars)
        .map(|c| c.iter().collect())
        .collect()
}

/// How long to wait for output readers to drain once the child has exited,
/// guarding against a grandchild that inherited stdio fds and never closes
/// them.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// A synchronous-success result longer than this many lines is presented as
/// a head/tail/error-lines window instead of dumped whole.
const SUCCESS_WINDOW_MAX_LINES: usize = 200;

fn render_window(window: &output::OutputWindow) -> String {
    let mut out = window.head.join("\n");
    out.push_str("\n...\n");
    out.push_str(&window.tail.join("\n"));
    if !window.error_lines.is_empty() {
        out.push_str("\n\nErrors:\n");
        out.push_str(&window.error_lines.join("\n"));
    }
    out
}

#[allow(clippy::too_many_arguments)]
async fn supervise(
    session: Arc<Session>,
    registry: SessionRegistry,
    mut child: Child,
    pid: Option<u32>,
    yield_ms: u64,
    timeout_secs: i64,
    cancel: CancellationToken,
    settle: oneshot::Sender<ExecutorOutcome>,
    warning: Option<String>,
    reader_handles: Vec<tokio::task::JoinHandle<()>>,
) {
    let start = Instant::now();
    let mut settle = Some(settle);

    let mut yield_sleep = Some(Box::pin(tokio::time::sleep(Duration::from_millis(yield_ms))));
    let mut timeout_sleep = if timeout_secs > 0 {
        Some(Box::pin(tokio::time::sleep(Duration::from_secs(
            timeout_secs as u64,
        ))))
    } else {
        None
    };

    let mut timed_out = false;
    let mut aborted = false;

    let status = loop {
        tokio::select! {
            _ = async { yield_sleep.as_mut().unwrap().as_mut().await }, if yield_sleep.is_some() => {
                yield_sleep = None;
                session.mark_backgrounded().await;
                if let Some(tx) = settle.take() {
                    let _ = tx.send(ExecutorOutcome::Running {
                        session_id: session.id.clone(),
                        warning: warning.clone(),
                    });
                }
            }
            _ = async { timeout_sleep.as_mut().unwrap().as_mut().await }, if timeout_sleep.is_some() && !timed_out && !aborted => {
                timeout_sleep = None;
                timed_out = true;
                abort_process(&session, pid).await;
            }
            _ = cancel.cancelled(), if !timed_out && !aborted => {
                aborted = true;
                abort_process(&session, pid).await;
            }
            status = child.wait() => {
                break status;
            }
        }
    };

    // Ensure every byte the OS had already enqueued before exit is visible
    // before the session flips to "exited" for pollers: wait for the reader
    // tasks to observe EOF on their fds, bounded in case a grandchild
    // inherited stdio and is keeping the pipe open.
    let _ = tokio::time::timeout(READER_DRAIN_TIMEOUT, async {
        for handle in reader_handles {
            let _ = handle.await;
        }
    })
    .await;

    let duration = start.elapsed();
    let (exit_code, exit_signal) = match &status {
        Ok(exit_status) => exit_status_parts(exit_status),
        Err(_) => (None, None),
    };

    let success = exit_code == Some(0) && exit_signal.is_none() && !timed_out && !aborted;
    let session_status = if success {
        SessionStatus::Completed
    } else {
        SessionStatus::Failed
    };

    registry
        .mark_exited(&session, exit_code, exit_signal.clone(), session_status)
        .await;

    let Some(tx) = settle.take() else {
        return;
    };

    if success {
        let agg = session.aggregated().await;
        let trimmed = agg.trim();
        let text = if trimmed.is_empty() {
            "(no output)".to_string()
        } else {
            let lines: Vec<String> = trimmed.lines().map(str::to_string).collect();
            if lines.len() > SUCCESS_WINDOW_MAX_LINES {
                render_window(&output::window(&lines, SUCCESS_WINDOW_MAX_LINES))
            } else {
                trimmed.to_string()
            }
        };
        let _ = tx.send(ExecutorOutcome::Success {
            session_id: session.id.clone(),
            text,
            warning,
        });
    } else {
        let reason = if timed_out {
            format!("timed out after {timeout_secs} seconds")
        } else if let Some(sig) = &exit_signal {
            format!("killed by signal {sig}")
        } else if aborted {
            "aborted before exit code".to_string()
        } else {
            format!("exited with code {}", exit_code.unwrap_or(-1))
        };
        let _ = tx.send(ExecutorOutcome::Failed {
            session_id: Some(session.id.clone()),
            reason,
        });
    }

    let _ = duration;
}

async fn abort_process(session: &Arc<Session>, pid: Option<u32>) {
    if let Some(pid) = pid {
        let _ = kill::kill_tree(pid);
    }
    if session.stdin_mode == StdinMode::Pty {
        // Dropping the PTY master write half hangs up the slave side, the
        // same way closing a real terminal does.
        let _ = session.take_transport().await;
    }
}

#[cfg(unix)]
fn exit_status_parts(status: &std::process::ExitStatus) -> (Option<i32>, Option<String>) {
    use std::os::unix::process::ExitStatusExt;
    if let Some(signal) = status.signal() {
        (None, Some(signal_name(signal)))
    } else {
        (status.code(), None)
    }
}

#[cfg(not(unix))]
fn exit_status_parts(status: &std::process::ExitStatus) -> (Option<i32>, Option<String>) {
    (status.code(), None)
}

#[cfg(unix)]
fn signal_name(signal: i32) -> String {
    nix::sys::signal::Signal::try_from(signal)
        .map(|s| s.as_str().to_string())
        .unwrap_or_else(|_| format!("SIG{signal}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_command_fails_without_spawning() {
        let registry = SessionRegistry::new();
        let outcome = start(
            StartParams {
                command: String::new(),
                ..Default::default()
            },
            CancellationToken::new(),
            no_op_on_update(),
            registry,
        )
        .await;
        assert!(matches!(outcome, ExecutorOutcome::Failed { session_id: None, .. }));
    }

    #[tokio::test]
    async fn dangerous_command_fails_without_spawning() {
        let registry = SessionRegistry::new();
        let outcome = start(
            StartParams {
                command: "rm -rf /".to_string(),
                ..Default::default()
            },
            CancellationToken::new(),
            no_op_on_update(),
            registry,
        )
        .await;
        assert!(matches!(outcome, ExecutorOutcome::Failed { session_id: None, .. }));
    }

    #[tokio::test]
    async fn fast_command_resolves_success() {
        let registry = SessionRegistry::new();
        let outcome = start(
            StartParams {
                command: "echo hi".to_string(),
                yield_ms: Some(1000),
                ..Default::default()
            },
            CancellationToken::new(),
            no_op_on_update(),
            registry.clone(),
        )
        .await;
        match outcome {
            ExecutorOutcome::Success { text, .. } => assert!(text.contains("hi")),
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn background_flag_yields_immediately() {
        let registry = SessionRegistry::new();
        let outcome = start(
            StartParams {
                command: "sleep 2 && echo done".to_string(),
                background: true,
                ..Default::default()
            },
            CancellationToken::new(),
            no_op_on_update(),
            registry.clone(),
        )
        .await;
        assert!(matches!(outcome, ExecutorOutcome::Running { .. }));
    }

    #[tokio::test]
    async fn timeout_kills_and_fails() {
        let registry = SessionRegistry::new();
        let outcome = start(
            StartParams {
                command: "sleep 60".to_string(),
                timeout: Some(1),
                yield_ms: Some(120_000),
                ..Default::default()
            },
            CancellationToken::new(),
            no_op_on_update(),
            registry.clone(),
        )
        .await;
        match outcome {
            ExecutorOutcome::Failed { reason, .. } => {
                assert!(reason.contains("timed out after 1 seconds"), "{reason}")
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn external_cancel_fails_before_backgrounding() {
        let registry = SessionRegistry::new();
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel_clone.cancel();
        });
        let outcome = start(
            StartParams {
                command: "sleep 30".to_string(),
                yield_ms: Some(10_000),
                ..Default::default()
            },
            cancel,
            no_op_on_update(),
            registry,
        )
        .await;
        assert!(matches!(outcome, ExecutorOutcome::Failed { .. }));
    }
}
