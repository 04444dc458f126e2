//! Controller: the stateless dispatcher for session follow-up actions
//! (`list`, `poll`, `log`, `write`, `kill`, `clear`, `remove`).
//!
//! Every action but `list` requires a `session_id`; callers that omit one
//! get a structured failure, not a panic -- this module never assumes its
//! input already passed validation.

use crate::kill;
use crate::output;
use crate::registry::SessionRegistry;
use crate::session::{write_to_transport, SessionSnapshot, SessionStatus};
use serde::Serialize;

/// Length of the display-friendly short id prefix shown in `list`.
const SHORT_ID_LEN: usize = 8;
/// Middle-truncation width for the derived name's target token.
const NAME_TARGET_MAX: usize = 48;
/// `log` with no offset/limit returns a windowed head/tail/error-lines view
/// once the transcript exceeds this many lines, instead of the whole thing.
const LOG_WINDOW_MAX_LINES: usize = 200;

#[derive(Debug, Clone, Serialize)]
pub struct ListEntry {
    pub id: String,
    pub short_id: String,
    pub name: String,
    pub status: SessionStatus,
    pub pid: Option<u32>,
    pub started_at: u64,
    pub ended_at: Option<u64>,
    pub cwd: String,
    pub command: String,
    pub tail: String,
    pub truncated: bool,
    pub error_lines: Vec<String>,
    pub exit_code: Option<i32>,
    pub exit_signal: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PollResult {
    pub status: SessionStatus,
    pub text: String,
    pub exit_code: Option<i32>,
    pub exit_signal: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogResult {
    pub text: String,
    pub total_lines: usize,
    pub total_chars: usize,
    pub error_lines: Vec<String>,
    pub windowed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct WriteResult {
    pub session_id: String,
    pub written: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct KillResult {
    pub session_id: String,
    pub killed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RemoveResult {
    pub session_id: String,
    pub removed: bool,
}

/// `list`: running and finished sessions, newest-first.
pub async fn list(registry: &SessionRegistry) -> Vec<ListEntry> {
    let mut snapshots = registry.list_running().await;
    snapshots.extend(registry.list_finished().await);
    snapshots.sort_by_key(|s| std::cmp::Reverse(s.started_at));
    snapshots.into_iter().map(to_entry).collect()
}

fn to_entry(snap: SessionSnapshot) -> ListEntry {
    let short_id = snap.id.chars().take(SHORT_ID_LEN).collect();
    let error_lines = output::extract_errors(
        &snap
            .tail
            .lines()
            .map(str::to_string)
            .collect::<Vec<String>>(),
    );
    ListEntry {
        name: derive_name(&snap.command),
        short_id,
        id: snap.id,
        status: snap.status,
        pid: snap.pid,
        started_at: snap.started_at,
        ended_at: snap.ended_at,
        cwd: snap.cwd,
        command: snap.command,
        tail: snap.tail,
        truncated: snap.truncated,
        error_lines,
        exit_code: snap.exit_code,
        exit_signal: snap.exit_signal,
    }
}

/// `poll`: drain pending output from a backgrounded session and report its
/// current status.
pub async fn poll(registry: &SessionRegistry, session_id: &str) -> Result<PollResult, String> {
    let session = registry
        .get_any(session_id)
        .await
        .ok_or_else(|| format!("no active session with id {session_id}"))?;

    if !session.is_backgrounded().await {
        return Err("session is not backgrounded yet; poll is only valid after the call returned a running result".to_string());
    }

    let (stdout, stderr) = registry.drain(&session).await;
    let text = match (stdout.is_empty(), stderr.is_empty()) {
        (true, true) => "(no new output)".to_string(),
        (false, true) => stdout,
        (true, false) => stderr,
        (false, false) => format!("{stdout}\n{stderr}"),
    };

    let snap = session.snapshot().await;
    Ok(PollResult {
        status: snap.status,
        text,
        exit_code: snap.exit_code,
        exit_signal: snap.exit_signal,
    })
}

/// `log`: a windowed view of a session's full aggregated output by line.
///
/// With `offset` absent and `limit` present, returns the last `limit`
/// lines. Otherwise returns lines `[offset, offset+limit)`, or from
/// `offset` to the end when `limit` is absent.
pub async fn log(
    registry: &SessionRegistry,
    session_id: &str,
    offset: Option<usize>,
    limit: Option<usize>,
) -> Result<LogResult, String> {
    let session = registry
        .get_any(session_id)
        .await
        .ok_or_else(|| format!("no active session with id {session_id}"))?;

    let aggregated = session.aggregated().await;
    let lines: Vec<&str> = aggregated.lines().collect();
    let total_lines = lines.len();
    let total_chars = aggregated.chars().count();

    // With no offset/limit given at all, a huge transcript is presented as a
    // head/tail/error-lines window rather than dumped whole.
    if offset.is_none() && limit.is_none() && total_lines > LOG_WINDOW_MAX_LINES {
        let owned_lines: Vec<String> = lines.iter().map(|l| (*l).to_string()).collect();
        let window = output::window(&owned_lines, LOG_WINDOW_MAX_LINES);
        let mut text = window.head.join("\n");
        text.push_str("\n...\n");
        text.push_str(&window.tail.join("\n"));
        return Ok(LogResult {
            text,
            total_lines,
            total_chars,
            error_lines: window.error_lines,
            windowed: true,
        });
    }

    let selected: Vec<&str> = match (offset, limit) {
        (None, Some(limit)) => {
            let start = total_lines.saturating_sub(limit);
            lines[start..].to_vec()
        }
        (Some(offset), Some(limit)) => {
            let start = offset.min(total_lines);
            let end = (offset + limit).min(total_lines);
            lines[start..end].to_vec()
        }
        (Some(offset), None) => {
            let start = offset.min(total_lines);
            lines[start..].to_vec()
        }
        (None, None) => lines,
    };

    let error_lines = output::extract_errors(
        &selected.iter().map(|l| (*l).to_string()).collect::<Vec<String>>(),
    );

    Ok(LogResult {
        text: selected.join("\n"),
        total_lines,
        total_chars,
        error_lines,
        windowed: false,
    })
}

/// `write`: send bytes (and optionally EOF) to a backgrounded, still-live
/// session's stdin.
pub async fn write(
    registry: &SessionRegistry,
    session_id: &str,
    data: &str,
    eof: bool,
) -> Result<WriteResult, String> {
    let session = registry
        .get_any(session_id)
        .await
        .ok_or_else(|| format!("no active session with id {session_id}"))?;

    if !session.is_backgrounded().await {
        return Err("session is not backgrounded yet; write is only valid after the call returned a running result".to_string());
    }
    if session.exited().await {
        return Err(format!("session {session_id} has already exited; stdin is closed"));
    }

    let Some(mut transport) = session.take_transport().await else {
        return Err(format!("session {session_id} has no writable stdin"));
    };

    let result = write_to_transport(&mut transport, data.as_bytes(), eof).await;
    session.put_transport_back(transport).await;
    result?;

    Ok(WriteResult {
        session_id: session_id.to_string(),
        written: true,
    })
}

/// `kill`: force-terminate a backgrounded session's process tree.
pub async fn kill_session(
    registry: &SessionRegistry,
    session_id: &str,
) -> Result<KillResult, String> {
    let session = registry
        .get_any(session_id)
        .await
        .ok_or_else(|| format!("no active session with id {session_id}"))?;

    if !session.is_backgrounded().await {
        return Err("session is not backgrounded yet; kill is only valid after the call returned a running result".to_string());
    }

    if let Some(pid) = session.pid {
        kill::kill_tree(pid)?;
    }

    registry
        .mark_exited(
            &session,
            None,
            Some("SIGKILL".to_string()),
            SessionStatus::Failed,
        )
        .await;

    Ok(KillResult {
        session_id: session_id.to_string(),
        killed: true,
    })
}

/// `clear`: drop a finished session from the registry. Fails on a still-live one.
pub async fn clear(registry: &SessionRegistry, session_id: &str) -> Result<RemoveResult, String> {
    if registry.get(session_id).await.is_some() {
        return Err(format!(
            "session {session_id} is still running; clear only applies to finished sessions"
        ));
    }
    registry
        .get_finished(session_id)
        .await
        .ok_or_else(|| format!("no finished session with id {session_id}"))?;

    registry.delete(session_id).await;
    Ok(RemoveResult {
        session_id: session_id.to_string(),
        removed: true,
    })
}

/// `remove`: works on live or finished sessions. A live one is killed first.
pub async fn remove(registry: &SessionRegistry, session_id: &str) -> Result<RemoveResult, String> {
    if let Some(session) = registry.get(session_id).await {
        if let Some(pid) = session.pid {
            let _ = kill::kill_tree(pid);
        }
        registry
            .mark_exited(
                &session,
                None,
                Some("SIGKILL".to_string()),
                SessionStatus::Failed,
            )
            .await;
    } else if registry.get_finished(session_id).await.is_none() {
        return Err(format!("no session with id {session_id}"));
    }

    registry.delete(session_id).await;
    Ok(RemoveResult {
        session_id: session_id.to_string(),
        removed: true,
    })
}

/// Tokenize the command the way a shell does for display purposes: split on
/// whitespace but keep single- or double-quoted segments intact.
fn tokenize(command: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut in_token = false;

    for c in command.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '\'' || c == '"' => {
                quote = Some(c);
                in_token = true;
            }
            None if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            None => {
                current.push(c);
                in_token = true;
            }
        }
    }
    if in_token {
        tokens.push(current);
    }
    tokens
}

/// Derive a short human-readable name from a command: `verb target`, with
/// the target middle-truncated to [`NAME_TARGET_MAX`] characters.
fn derive_name(command: &str) -> String {
    let tokens = tokenize(command);
    let Some(verb) = tokens.first() else {
        return String::new();
    };

    let target = tokens[1..]
        .iter()
        .find(|t| !t.starts_with('-'))
        .or_else(|| tokens.get(1));

    match target {
        Some(target) => format!("{verb} {}", truncate_middle(target, NAME_TARGET_MAX)),
        None => verb.clone(),
    }
}

fn truncate_middle(s: &str, max: usize) -> String {
    let chars: Vec<char> = s.chars().collect();
    if chars.len() <= max {
        return s.to_string();
    }
    let keep = max.saturating_sub(3);
    let head = keep / 2;
    let tail = keep - head;
    let head_part: String = chars[..head].iter().collect();
    let tail_part: String = chars[chars.len() - tail..].iter().collect();
    format!("{head_part}...{tail_part}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_verb_and_target() {
        assert_eq!(derive_name("git status"), "git status");
        assert_eq!(derive_name("npm run build"), "npm run");
        assert_eq!(derive_name("ls -la /tmp"), "ls /tmp");
    }

    #[test]
    fn derive_name_respects_quotes() {
        assert_eq!(
            derive_name("echo \"hello world\""),
            "echo hello world"
        );
    }

    #[test]
    fn truncate_middle_preserves_short_strings() {
        assert_eq!(truncate_middle("short", 48), "short");
    }

    #[test]
    fn truncate_middle_shortens_long_strings() {
        let long = "a".repeat(100);
        let truncated = truncate_middle(&long, 48);
        assert_eq!(truncated.chars().count(), 48);
        assert!(truncated.contains("..."));
    }

    #[tokio::test]
    async fn poll_fails_on_unknown_session() {
        let registry = SessionRegistry::new();
        let result = poll(&registry, "nope").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn clear_fails_on_live_session() {
        use crate::session::{Session, StdinMode, Transport};
        use std::sync::Arc;

        let registry = SessionRegistry::new();
        let session = Arc::new(Session::new(
            "s1".to_string(),
            "echo hi".to_string(),
            "/tmp".to_string(),
            StdinMode::Pipe,
            Some(1),
            1000,
            Transport::Pipe { stdin: None },
            None,
        ));
        registry.add(session).await;

        assert!(clear(&registry, "s1").await.is_err());
    }
}
