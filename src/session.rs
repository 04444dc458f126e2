//! The [`Session`] data model: one shell invocation and its lifecycle record.
//!
//! A session is created by the executor at spawn time, mutated by output
//! listeners and the controller as it runs, and retained read-only after
//! exit until the registry's TTL sweep (or an explicit `clear`/`remove`)
//! drops it. See `registry.rs` for the indexed live/finished storage this
//! type is kept in, and `executor.rs` for how it's spawned and driven.

use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Bytes of `aggregated` retained in `tail` for cheap previews.
const TAIL_CHARS: usize = 4096;

/// Maximum size of a single output slice appended in one step.
pub const MAX_CHUNK_CHARS: usize = 8 * 1024;

/// The transport that was actually used to talk to the child's stdio.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize, schemars::JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum StdinMode {
    #[default]
    Pipe,
    Pty,
}

/// Derived/recorded terminal status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
}

/// Which stream an appended chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// Live write/kill handle, discriminated by the transport actually in use.
///
/// A tagged variant rather than a trait object: the session owns exactly
/// one of these, matching the transport named in `stdin_mode`.
pub enum Transport {
    Pipe {
        stdin: Option<tokio::process::ChildStdin>,
    },
    Pty {
        writer: pty_process::OwnedWritePty,
    },
}

/// Mutable fields of a session, serialized behind one lock so appends,
/// drains, and status transitions are each atomic with respect to one
/// another.
struct SessionState {
    ended_at: Option<u64>,
    aggregated: String,
    tail: String,
    pending_stdout: String,
    pending_stderr: String,
    total_output_chars: usize,
    truncated: bool,
    backgrounded: bool,
    exited: bool,
    exit_code: Option<i32>,
    exit_signal: Option<String>,
    status: SessionStatus,
    transport: Option<Transport>,
    warning: Option<String>,
}

/// One command invocation and its lifecycle record.
pub struct Session {
    pub id: String,
    pub command: String,
    pub cwd: String,
    pub stdin_mode: StdinMode,
    pub pid: Option<u32>,
    pub started_at: u64,
    pub max_output_chars: usize,
    state: Mutex<SessionState>,
}

/// A point-in-time, lock-free snapshot of a session for display/status use.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub command: String,
    pub cwd: String,
    pub stdin_mode: StdinMode,
    pub pid: Option<u32>,
    pub started_at: u64,
    pub ended_at: Option<u64>,
    pub max_output_chars: usize,
    pub total_output_chars: usize,
    pub truncated: bool,
    pub backgrounded: bool,
    pub exited: bool,
    pub exit_code: Option<i32>,
    pub exit_signal: Option<String>,
    pub status: SessionStatus,
    pub tail: String,
    pub warning: Option<String>,
}

/// Milliseconds since the Unix epoch, for `started_at`/`ended_at` timestamps.
#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        command: String,
        cwd: String,
        stdin_mode: StdinMode,
        pid: Option<u32>,
        max_output_chars: usize,
        transport: Transport,
        warning: Option<String>,
    ) -> Self {
        Self {
            id,
            command,
            cwd,
            stdin_mode,
            pid,
            started_at: now_ms(),
            max_output_chars,
            state: Mutex::new(SessionState {
                ended_at: None,
                aggregated: String::new(),
                tail: String::new(),
                pending_stdout: String::new(),
                pending_stderr: String::new(),
                total_output_chars: 0,
                truncated: false,
                backgrounded: false,
                exited: false,
                exit_code: None,
                exit_signal: None,
                status: SessionStatus::Running,
                transport: Some(transport),
                warning,
            }),
        }
    }

    /// Append a sanitized, already-sliced chunk of output.
    ///
    /// Enforces the cap invariant: once `total_output_chars >= max`, further
    /// output is dropped and `truncated` is set (and stays set). A chunk
    /// that straddles the cap is itself truncated to fit, never split across
    /// this call and a future one.
    ///
    /// No-op once the session has exited (invariant: exited => no further
    /// appends).
    pub async fn append_output(&self, stream: Stream, chunk: &str) {
        let mut state = self.state.lock().await;
        if state.exited {
            return;
        }

        let remaining = self.max_output_chars.saturating_sub(state.total_output_chars);
        if remaining == 0 {
            state.truncated = true;
            return;
        }

        let to_append = if chunk.chars().count() > remaining {
            state.truncated = true;
            truncate_chars(chunk, remaining)
        } else {
            chunk.to_string()
        };

        state.aggregated.push_str(&to_append);
        state.total_output_chars += to_append.chars().count();

        match stream {
            Stream::Stdout => state.pending_stdout.push_str(&to_append),
            Stream::Stderr => state.pending_stderr.push_str(&to_append),
        }

        let agg = state.aggregated.clone();
        state.tail = tail_chars(&agg, TAIL_CHARS);
    }

    /// Atomically swap the pending stdout/stderr buffers with empty ones.
    pub async fn drain(&self) -> (String, String) {
        let mut state = self.state.lock().await;
        (
            std::mem::take(&mut state.pending_stdout),
            std::mem::take(&mut state.pending_stderr),
        )
    }

    /// Idempotent true-transition: backgrounded can only go false -> true.
    pub async fn mark_backgrounded(&self) {
        let mut state = self.state.lock().await;
        state.backgrounded = true;
    }

    pub async fn is_backgrounded(&self) -> bool {
        self.state.lock().await.backgrounded
    }

    /// Idempotent terminal-state update. The first call sets `ended_at` and
    /// signals the caller (via the returned bool) that this is the
    /// first-ever exit so the registry knows to move the session.
    /// Subsequent calls update status fields without re-signaling a move.
    pub async fn mark_exited(
        &self,
        exit_code: Option<i32>,
        exit_signal: Option<String>,
        status: SessionStatus,
    ) -> bool {
        let mut state = self.state.lock().await;
        let first = !state.exited;
        if first {
            state.ended_at = Some(now_ms());
        }
        state.exited = true;
        state.exit_code = exit_code;
        state.exit_signal = exit_signal;
        state.status = status;
        first
    }

    pub async fn exited(&self) -> bool {
        self.state.lock().await.exited
    }

    pub async fn set_warning(&self, warning: String) {
        self.state.lock().await.warning = Some(warning);
    }

    /// Take the stdin/kill transport handle out of the session, if present.
    /// Used by `write`/`kill` controller actions; leaves `None` behind so a
    /// second take is a no-op rather than a double-close.
    pub async fn take_transport(&self) -> Option<Transport> {
        self.state.lock().await.transport.take()
    }

    pub async fn put_transport_back(&self, transport: Transport) {
        self.state.lock().await.transport = Some(transport);
    }

    pub async fn aggregated(&self) -> String {
        self.state.lock().await.aggregated.clone()
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let state = self.state.lock().await;
        SessionSnapshot {
            id: self.id.clone(),
            command: self.command.clone(),
            cwd: self.cwd.clone(),
            stdin_mode: self.stdin_mode,
            pid: self.pid,
            started_at: self.started_at,
            ended_at: state.ended_at,
            max_output_chars: self.max_output_chars,
            total_output_chars: state.total_output_chars,
            truncated: state.truncated,
            backgrounded: state.backgrounded,
            exited: state.exited,
            exit_code: state.exit_code,
            exit_signal: state.exit_signal.clone(),
            status: state.status,
            tail: state.tail.clone(),
            warning: state.warning.clone(),
        }
    }
}

/// Write raw bytes to whatever transport the session holds, closing stdin
/// (pipe: shutdown, pty: Ctrl-D) if `eof` is set.
pub async fn write_to_transport(
    transport: &mut Transport,
    data: &[u8],
    eof: bool,
) -> Result<(), String> {
    match transport {
        Transport::Pipe { stdin } => {
            let Some(handle) = stdin else {
                return Err("stdin is already closed".to_string());
            };
            if !data.is_empty() {
                handle
                    .write_all(data)
                    .await
                    .map_err(|e| format!("failed to write to stdin: {e}"))?;
                handle
                    .flush()
                    .await
                    .map_err(|e| format!("failed to flush stdin: {e}"))?;
            }
            if eof {
                handle
                    .shutdown()
                    .await
                    .map_err(|e| format!("failed to close stdin: {e}"))?;
                *stdin = None;
            }
            Ok(())
        }
        Transport::Pty { writer } => {
            if !data.is_empty() {
                writer
                    .write_all(data)
                    .await
                    .map_err(|e| format!("failed to write to pty: {e}"))?;
                writer
                    .flush()
                    .await
                    .map_err(|e| format!("failed to flush pty: {e}"))?;
            }
            if eof {
                writer
                    .write_all(&[0x04])
                    .await
                    .map_err(|e| format!("failed to send EOF to pty: {e}"))?;
                writer
                    .flush()
                    .await
                    .map_err(|e| format!("failed to flush pty: {e}"))?;
            }
            Ok(())
        }
    }
}

fn truncate_chars(s: &str, n: usize) -> String {
    s.chars().take(n).collect()
}

fn tail_chars(s: &str, n: usize) -> String {
    let total = s.chars().count();
    if total <= n {
        s.to_string()
    } else {
        s.chars().skip(total - n).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_session(max_output_chars: usize) -> Session {
        Session::new(
            "s1".to_string(),
            "echo hi".to_string(),
            "/tmp".to_string(),
            StdinMode::Pipe,
            Some(123),
            max_output_chars,
            Transport::Pipe { stdin: None },
            None,
        )
    }

    #[tokio::test]
    async fn append_then_drain_roundtrips() {
        let s = test_session(1000);
        s.append_output(Stream::Stdout, "hello").await;
        s.append_output(Stream::Stderr, "world").await;
        let (out, err) = s.drain().await;
        assert_eq!(out, "hello");
        assert_eq!(err, "world");

        // Second drain with no intervening append returns empty (law:
        // drain idempotence).
        let (out2, err2) = s.drain().await;
        assert!(out2.is_empty());
        assert!(err2.is_empty());
    }

    #[tokio::test]
    async fn cap_invariant_truncates_and_sticks() {
        let s = test_session(5);
        s.append_output(Stream::Stdout, "abcdefghij").await;
        let snap = s.snapshot().await;
        assert_eq!(snap.total_output_chars, 5);
        assert!(snap.truncated);

        // Further output is dropped, but truncated never clears.
        s.append_output(Stream::Stdout, "more").await;
        let snap2 = s.snapshot().await;
        assert_eq!(snap2.total_output_chars, 5);
        assert!(snap2.truncated);
    }

    #[tokio::test]
    async fn exited_session_drops_further_appends() {
        let s = test_session(1000);
        s.append_output(Stream::Stdout, "before").await;
        s.mark_exited(Some(0), None, SessionStatus::Completed).await;
        s.append_output(Stream::Stdout, "after").await;

        let agg = s.aggregated().await;
        assert_eq!(agg, "before");
    }

    #[tokio::test]
    async fn mark_exited_is_idempotent_about_ended_at() {
        let s = test_session(1000);
        let first = s.mark_exited(Some(0), None, SessionStatus::Completed).await;
        assert!(first);
        let snap1 = s.snapshot().await;

        let second = s.mark_exited(Some(1), None, SessionStatus::Failed).await;
        assert!(!second);
        let snap2 = s.snapshot().await;

        assert_eq!(snap1.ended_at, snap2.ended_at);
        assert_eq!(snap2.exit_code, Some(1));
    }

    #[tokio::test]
    async fn backgrounded_only_transitions_forward() {
        let s = test_session(1000);
        assert!(!s.is_backgrounded().await);
        s.mark_backgrounded().await;
        assert!(s.is_backgrounded().await);
        s.mark_backgrounded().await;
        assert!(s.is_backgrounded().await);
    }
}
