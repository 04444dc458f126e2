//! Scenario 6 (output cap) gets its own test binary: `PI_BASH_MAX_OUTPUT_CHARS`
//! is read once into a process-wide cache, so it must be set before anything
//! else in this process touches it.

use bashd::server::BashdServer;
use rmcp::model::*;
use rmcp::{ClientHandler, ServiceExt};
use serde_json::Value;

#[derive(Default, Clone)]
struct TestClient;

impl ClientHandler for TestClient {}

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

#[tokio::test]
async fn oversized_output_is_capped_and_marked_truncated() {
    // Safety: single-threaded test binary, set before any other code reads it.
    unsafe {
        std::env::set_var("PI_BASH_MAX_OUTPUT_CHARS", "1000");
    }

    let (server_transport, client_transport) = tokio::io::duplex(65536);
    let server = BashdServer::new();
    tokio::spawn(async move {
        let service = server.serve(server_transport).await.unwrap();
        let _ = service.waiting().await;
    });
    let client = TestClient::default().serve(client_transport).await.unwrap();

    let result = call_tool(
        &client,
        "bash",
        serde_json::json!({"command": "yes x | head -c 200000", "yield_ms": 5000}),
    )
    .await;

    let session_id = result["details"]["session_id"]
        .as_str()
        .expect("command should still be running past the output cap")
        .to_string();

    let list = call_tool(&client, "process", serde_json::json!({"action": "list"})).await;
    let entry = list
        .as_array()
        .unwrap()
        .iter()
        .find(|e| e["id"] == session_id)
        .expect("session present in list");
    assert_eq!(entry["truncated"], true);

    client.cancel().await.unwrap();
}
