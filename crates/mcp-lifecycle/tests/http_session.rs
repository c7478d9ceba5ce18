//! The default JSON-RPC session against a mocked Streamable HTTP server

use mcp_lifecycle::session::RpcSession;
use mcp_lifecycle::{AuthConfig, LifecycleError, ServerConfig, ServerRegistry, Session, gen_client};
use pretty_assertions::assert_eq;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SESSION_ID: &str = "sess-42";

async fn mock_handshake(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(body_partial_json(json!({ "method": "initialize", "id": 1 })))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({
                    "jsonrpc": "2.0",
                    "id": 1,
                    "result": {
                        "protocolVersion": "2025-06-18",
                        "capabilities": { "tools": {} },
                        "serverInfo": { "name": "search-server", "version": "1.2.0" }
                    }
                }))
                .insert_header("Mcp-Session-Id", SESSION_ID),
        )
        .expect(1)
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(header("Mcp-Session-Id", SESSION_ID))
        .and(body_partial_json(json!({ "method": "notifications/initialized" })))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(server)
        .await;
}

async fn mock_termination(server: &MockServer) {
    Mock::given(method("DELETE"))
        .and(path("/mcp"))
        .and(header("Mcp-Session-Id", SESSION_ID))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(server)
        .await;
}

fn config(server: &MockServer) -> ServerConfig {
    ServerConfig::http(format!("{}/mcp", server.uri())).with_auth(AuthConfig::Bearer {
        token: "secret-token".to_string(),
    })
}

#[tokio::test]
async fn handshake_pagination_and_termination() {
    let server = MockServer::start().await;
    mock_handshake(&server).await;
    mock_termination(&server).await;

    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(header("authorization", "Bearer secret-token"))
        .and(header("Mcp-Session-Id", SESSION_ID))
        .and(body_partial_json(json!({ "method": "tools/list", "id": 2 })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 2,
            "result": {
                "tools": [{ "name": "search", "inputSchema": { "type": "object" } }],
                "nextCursor": "page-2"
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let second_page = json!({
        "jsonrpc": "2.0",
        "id": 3,
        "result": { "tools": [{ "name": "fetch", "description": "Fetch a URL" }] }
    });
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(body_partial_json(
            json!({ "method": "tools/list", "id": 3, "params": { "cursor": "page-2" } }),
        ))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            format!(
                "event: message\ndata: {{\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\",\"params\":{{}}}}\n\nevent: message\ndata: {second_page}\n\n"
            ),
            "text/event-stream",
        ))
        .expect(1)
        .mount(&server)
        .await;

    let registry = ServerRegistry::new();
    registry.add_server("search", config(&server)).unwrap();

    let tools = gen_client("search", &registry, None, None, |session| async move {
        session.get_tools().await
    })
    .await
    .unwrap();

    let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["search", "fetch"]);
    assert_eq!(tools[1].description.as_deref(), Some("Fetch a URL"));
}

#[tokio::test]
async fn server_error_surfaces_as_protocol_error() {
    let server = MockServer::start().await;
    mock_handshake(&server).await;
    mock_termination(&server).await;

    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(body_partial_json(json!({ "method": "prompts/list" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 2,
            "error": { "code": -32601, "message": "Method not found" }
        })))
        .mount(&server)
        .await;

    let session = RpcSession::new("search", None, "lifecycle-tests", "0.0.0");
    session.connect(&config(&server), "search").await.unwrap();
    assert!(session.is_connected().await);
    assert_eq!(session.server_info().unwrap()["serverInfo"]["name"], "search-server");

    match session.list_prompts().await.unwrap_err() {
        LifecycleError::Protocol { code, message, .. } => {
            assert_eq!(code, -32601);
            assert_eq!(message, "Method not found");
        }
        other => panic!("expected a protocol error, got {other}"),
    }

    session.disconnect().await.unwrap();
    assert!(!session.is_connected().await);
    session.disconnect().await.unwrap();
}

#[tokio::test]
async fn http_failure_during_handshake_is_a_connection_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let registry = ServerRegistry::new();
    registry.add_server("search", config(&server)).unwrap();

    let err = gen_client("search", &registry, None, None, |_| async { Ok(()) })
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::Connection { ref server, .. } if server == "search"));
    assert_eq!(registry.circuit_breaker("search").unwrap().failure_count(), 1);
}
