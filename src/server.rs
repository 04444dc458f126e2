//! MCP server: tool definitions using rmcp macros.
//!
//! Exposes exactly two tools to the agent layer: `bash` (start a command,
//! possibly backgrounding it) and `process` (every follow-up action against
//! a previously started session, dispatched by `action`).

use crate::controller;
use crate::executor::{self, ExecutorOutcome, StartParams};
use crate::registry::SessionRegistry;
use crate::session::StdinMode;
use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::*;
use rmcp::schemars;
use rmcp::tool;
use rmcp::tool_handler;
use rmcp::tool_router;
use rmcp::{ErrorData as McpError, ServerHandler};
use serde::Serialize;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct BashParams {
    /// The shell command to execute.
    pub command: String,
    /// Working directory. Defaults to the server's current directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,
    /// Environment variable overlay, merged over the inherited environment.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
    /// Milliseconds to wait synchronously before backgrounding. Clamped to
    /// [10, 120000]; default 20000.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub yield_ms: Option<u64>,
    /// If true, yield immediately after spawn instead of waiting.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub background: Option<bool>,
    /// Timeout in seconds; default 1800; `<= 0` disables it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<i64>,
    /// `pipe` or `pty`. Defaults to `pipe`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdin_mode: Option<StdinMode>,
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct ProcessParams {
    /// One of: list, poll, log, write, kill, clear, remove.
    pub action: String,
    /// Required for every action but `list`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Payload for `write`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    /// Close stdin after writing `data`, for `write`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eof: Option<bool>,
    /// Starting line index for `log`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<usize>,
    /// Line count for `log`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
struct BashDetails {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    exit_signal: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct ToolResponse {
    text: String,
    details: BashDetails,
}

fn json_content<T: Serialize>(value: &T) -> Result<CallToolResult, McpError> {
    let json = serde_json::to_value(value)
        .map_err(|e| McpError::internal_error(format!("JSON serialization error: {e}"), None))?;
    Ok(CallToolResult::structured(json))
}

fn err_result(msg: impl Into<String>) -> Result<CallToolResult, McpError> {
    Ok(CallToolResult::error(vec![Content::text(msg.into())]))
}

/// The bashd MCP server: a session registry plus the two-tool surface that
/// dispatches against it.
#[derive(Clone)]
pub struct BashdServer {
    registry: SessionRegistry,
    tool_router: ToolRouter<BashdServer>,
}

impl BashdServer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            registry: SessionRegistry::with_job_ttl_ms(Some(crate::config::DEFAULT_JOB_TTL_MS)),
            tool_router: Self::tool_router(),
        }
    }
}

impl Default for BashdServer {
    fn default() -> Self {
        Self::new()
    }
}

#[tool_router]
impl BashdServer {
    #[tool(
        description = "Run a shell command. Waits briefly (yield_ms, default 20s) for it to finish; if it's still running, hands back a session id and continues it in the background. Use stdin_mode=\"pty\" for interactive programs that need a real terminal; background=true to skip the wait entirely. Follow up on a running session with the `process` tool."
    )]
    async fn bash(
        &self,
        Parameters(params): Parameters<BashParams>,
    ) -> Result<CallToolResult, McpError> {
        tracing::info!(command = %params.command, "bash");

        let start_params = StartParams {
            command: params.command,
            workdir: params.workdir,
            env: params.env,
            yield_ms: params.yield_ms,
            background: params.background.unwrap_or(false),
            timeout: params.timeout,
            stdin_mode: params.stdin_mode.unwrap_or(StdinMode::Pipe),
        };

        let outcome = executor::start(
            start_params,
            CancellationToken::new(),
            executor::no_op_on_update(),
            self.registry.clone(),
        )
        .await;

        match outcome {
            ExecutorOutcome::Running { session_id, warning } => {
                let text = match warning {
                    Some(w) => format!("{w}\nStill running. Use process(action=\"poll\", session_id=\"{session_id}\") to check on it."),
                    None => format!(
                        "Still running. Use process(action=\"poll\", session_id=\"{session_id}\") to check on it."
                    ),
                };
                json_content(&ToolResponse {
                    text,
                    details: BashDetails {
                        status: "running",
                        session_id: Some(session_id),
                        exit_code: None,
                        exit_signal: None,
                    },
                })
            }
            ExecutorOutcome::Success { session_id, text, warning } => {
                let text = match warning {
                    Some(w) => format!("{w}\n{text}"),
                    None => text,
                };
                json_content(&ToolResponse {
                    text,
                    details: BashDetails {
                        status: "completed",
                        session_id: Some(session_id),
                        exit_code: Some(0),
                        exit_signal: None,
                    },
                })
            }
            ExecutorOutcome::Failed { session_id, reason } => json_content(&ToolResponse {
                text: reason,
                details: BashDetails {
                    status: "failed",
                    session_id,
                    exit_code: None,
                    exit_signal: None,
                },
            }),
        }
    }

    #[tool(
        description = "Follow up on a session started by `bash`: list sessions, poll for new output, read a log slice, write to stdin, kill, or remove/clear a finished session."
    )]
    async fn process(
        &self,
        Parameters(params): Parameters<ProcessParams>,
    ) -> Result<CallToolResult, McpError> {
        tracing::info!(action = %params.action, session_id = ?params.session_id, "process");

        match params.action.as_str() {
            "list" => {
                let entries = controller::list(&self.registry).await;
                json_content(&entries)
            }
            "poll" => {
                let Some(session_id) = params.session_id else {
                    return err_result("process(action=\"poll\") requires session_id");
                };
                match controller::poll(&self.registry, &session_id).await {
                    Ok(result) => json_content(&result),
                    Err(e) => err_result(e),
                }
            }
            "log" => {
                let Some(session_id) = params.session_id else {
                    return err_result("process(action=\"log\") requires session_id");
                };
                match controller::log(&self.registry, &session_id, params.offset, params.limit)
                    .await
                {
                    Ok(result) => json_content(&result),
                    Err(e) => err_result(e),
                }
            }
            "write" => {
                let Some(session_id) = params.session_id else {
                    return err_result("process(action=\"write\") requires session_id");
                };
                let data = params.data.unwrap_or_default();
                let eof = params.eof.unwrap_or(false);
                match controller::write(&self.registry, &session_id, &data, eof).await {
                    Ok(result) => json_content(&result),
                    Err(e) => err_result(e),
                }
            }
            "kill" => {
                let Some(session_id) = params.session_id else {
                    return err_result("process(action=\"kill\") requires session_id");
                };
                match controller::kill_session(&self.registry, &session_id).await {
                    Ok(result) => json_content(&result),
                    Err(e) => err_result(e),
                }
            }
            "clear" => {
                let Some(session_id) = params.session_id else {
                    return err_result("process(action=\"clear\") requires session_id");
                };
                match controller::clear(&self.registry, &session_id).await {
                    Ok(result) => json_content(&result),
                    Err(e) => err_result(e),
                }
            }
            "remove" => {
                let Some(session_id) = params.session_id else {
                    return err_result("process(action=\"remove\") requires session_id");
                };
                match controller::remove(&self.registry, &session_id).await {
                    Ok(result) => json_content(&result),
                    Err(e) => err_result(e),
                }
            }
            other => err_result(format!(
                "unknown action \"{other}\"; expected one of list, poll, log, write, kill, clear, remove"
            )),
        }
    }
}

#[tool_handler]
impl ServerHandler for BashdServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "bashd".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            },
            instructions: Some(
                "bashd runs shell commands for an agent.\n\n\
                 Call `bash` with a command. It waits briefly (yield_ms, default 20s) \
                 for the command to finish. If it finishes in time, you get the output \
                 directly. If not, you get a session_id and the command keeps running \
                 in the background.\n\n\
                 Use `process` to follow up on a backgrounded session: poll for new \
                 output, log to read a slice of the full transcript, write to send \
                 input to the process's stdin, kill to force-terminate it, and \
                 clear/remove to drop it from the registry once you're done.\n\n\
                 Set stdin_mode=\"pty\" on `bash` for interactive programs that need a \
                 real terminal (falls back to pipe mode with a warning if unavailable)."
                    .to_string(),
            ),
        }
    }
}
