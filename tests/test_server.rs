//! Integration tests for the MCP server tools via duplex transport.
//!
//! Uses `tokio::io::duplex` to create an in-process transport, connects a test
//! client to the bashd server, and exercises `bash`/`process` through the MCP
//! protocol end to end.

use bashd::server::BashdServer;
use rmcp::model::*;
use rmcp::{ClientHandler, ServiceExt};
use serde_json::Value;

#[derive(Default, Clone)]
struct TestClient;

impl ClientHandler for TestClient {}

async fn setup() -> rmcp::service::RunningService<
    rmcp::service::RoleClient,
    impl rmcp::service::Service<rmcp::service::RoleClient>,
> {
    let (server_transport, client_transport) = tokio::io::duplex(65536);

    let server = BashdServer::new();
    tokio::spawn(async move {
        let service = server.serve(server_transport).await.unwrap();
        let _ = service.waiting().await;
    });

    let client = TestClient::default();
    client.serve(client_transport).await.unwrap()
}

async fn call_tool(
    client: &rmcp::service::RunningService<
        rmcp::service::RoleClient,
        impl rmcp::service::Service<rmcp::service::RoleClient>,
    >,
    name: &str,
    args: Value,
) -> Value {
    let params = CallToolRequestParams {
        meta: None,
        name: name.to_string().into(),
        arguments: Some(serde_json::from_value(args).unwrap()),
        task: None,
    };
    let request = ClientRequest::CallToolRequest(Request::new(params));
    let response = client.send_request(request).await.unwrap();

    let ServerResult::CallToolResult(result) = response else {
        panic!("expected CallToolResult, got {response:?}");
    };

    let text = result
        .content
        .iter()
        .filter_map(|c| match &c.raw {
            RawContent::Text(t) => Some(t.text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("");

    serde_json::from_str(&text).unwrap_or(Value::String(text))
}

// ---------------------------------------------------------------------------
// Scenario 1: fast success.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn fast_command_completes_synchronously() {
    let client = setup().await;
    let result = call_tool(
        &client,
        "bash",
        serde_json::json!({"command": "echo hi", "yield_ms": 1000}),
    )
    .await;

    assert_eq!(result["details"]["status"], "completed");
    assert_eq!(result["details"]["exit_code"], 0);
    assert!(result["text"].as_str().unwrap().contains("hi"));

    let list = call_tool(&client, "process", serde_json::json!({"action": "list"})).await;
    let entries = list.as_array().unwrap();
    assert!(entries.iter().any(|e| e["status"] == "completed"));

    client.cancel().await.unwrap();
}

// ---------------------------------------------------------------------------
// Scenario 2: yield then poll.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn backgrounded_command_is_pollable_to_completion() {
    let client = setup().await;
    let result = call_tool(
        &client,
        "bash",
        serde_json::json!({"command": "sleep 1 && echo done", "yield_ms": 50}),
    )
    .await;

    assert_eq!(result["details"]["status"], "running");
    let session_id = result["details"]["session_id"].as_str().unwrap().to_string();

    let immediate = call_tool(
        &client,
        "process",
        serde_json::json!({"action": "poll", "session_id": session_id}),
    )
    .await;
    assert_eq!(immediate["status"], "running");

    tokio::time::sleep(std::time::Duration::from_millis(1500)).await;

    let after = call_tool(
        &client,
        "process",
        serde_json::json!({"action": "poll", "session_id": session_id}),
    )
    .await;
    assert_eq!(after["status"], "completed");
    assert!(after["text"].as_str().unwrap().contains("done"));

    client.cancel().await.unwrap();
}

// ---------------------------------------------------------------------------
// Scenario 3: timeout.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn long_command_is_killed_on_timeout() {
    let client = setup().await;
    let result = call_tool(
        &client,
        "bash",
        serde_json::json!({"command": "sleep 60", "timeout": 1, "yield_ms": 120_000}),
    )
    .await;

    assert_eq!(result["details"]["status"], "failed");
    assert!(result["text"]
        .as_str()
        .unwrap()
        .contains("timed out after 1 seconds"));

    client.cancel().await.unwrap();
}

// ---------------------------------------------------------------------------
// Scenario 5: write + EOF.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn write_then_eof_completes_a_filter_command() {
    let client = setup().await;
    let start = call_tool(
        &client,
        "bash",
        serde_json::json!({"command": "cat", "background": true, "stdin_mode": "pipe"}),
    )
    .await;
    let session_id = start["details"]["session_id"]
        .as_str()
        .unwrap()
        .to_string();

    call_tool(
        &client,
        "process",
        serde_json::json!({"action": "write", "session_id": session_id, "data": "line\n"}),
    )
    .await;

    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    let polled = call_tool(
        &client,
        "process",
        serde_json::json!({"action": "poll", "session_id": session_id}),
    )
    .await;
    assert!(polled["text"].as_str().unwrap().contains("line"));

    call_tool(
        &client,
        "process",
        serde_json::json!({"action": "write", "session_id": session_id, "data": "", "eof": true}),
    )
    .await;

    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    let final_poll = call_tool(
        &client,
        "process",
        serde_json::json!({"action": "poll", "session_id": session_id}),
    )
    .await;
    assert_eq!(final_poll["status"], "completed");
    assert_eq!(final_poll["exit_code"], 0);

    client.cancel().await.unwrap();
}

// ---------------------------------------------------------------------------
// Controller error paths.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unknown_action_fails_with_explanation() {
    let client = setup().await;
    let params = CallToolRequestParams {
        meta: None,
        name: "process".to_string().into(),
        arguments: Some(
            serde_json::from_value(serde_json::json!({"action": "bogus"})).unwrap(),
        ),
        task: None,
    };
    let request = ClientRequest::CallToolRequest(Request::new(params));
    let response = client.send_request(request).await.unwrap();
    let ServerResult::CallToolResult(result) = response else {
        panic!("expected CallToolResult");
    };
    assert_eq!(result.is_error, Some(true));

    client.cancel().await.unwrap();
}

#[tokio::test]
async fn clear_fails_before_session_finishes() {
    let client = setup().await;
    let start = call_tool(
        &client,
        "bash",
        serde_json::json!({"command": "sleep 5", "background": true}),
    )
    .await;
    let session_id = start["details"]["session_id"]
        .as_str()
        .unwrap()
        .to_string();

    let params = CallToolRequestParams {
        meta: None,
        name: "process".to_string().into(),
        arguments: Some(
            serde_json::from_value(
                serde_json::json!({"action": "clear", "session_id": session_id}),
            )
            .unwrap(),
        ),
        task: None,
    };
    let request = ClientRequest::CallToolRequest(Request::new(params));
    let response = client.send_request(request).await.unwrap();
    let ServerResult::CallToolResult(result) = response else {
        panic!("expected CallToolResult");
    };
    assert_eq!(result.is_error, Some(true));

    call_tool(
        &client,
        "process",
        serde_json::json!({"action": "remove", "session_id": session_id}),
    )
    .await;

    client.cancel().await.unwrap();
}
