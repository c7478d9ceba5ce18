//! Default JSON-RPC session adapter
//!
//! [`RpcSession`] is the session the registry builds when the caller injects
//! no [`SessionFactory`]. It speaks just enough MCP for lifecycle management:
//! the `initialize` handshake, `ping`/`roots/list` replies, and the three
//! paginated list calls.
//!
//! | Transport   | Framing                                       |
//! |-------------|-----------------------------------------------|
//! | `stdio`     | newline-delimited JSON over child pipes       |
//! | `http`      | one POST per message, JSON or SSE-framed body |
//! | `websocket` | one text frame per message                    |
//!
//! SSE-only servers need an injected factory.
//!
//! Requests on one session are serialized; each is bounded by the server's
//! configured timeout.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::Mutex as TokioMutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, instrument, trace, warn};

use super::child_process::{ChildProcess, ChildProcessConfig};
use super::{PromptDescriptor, ResourceDescriptor, Session, SessionFactory, ToolDescriptor};
use crate::config::{AuthConfig, Root, ServerConfig, TransportConfig};
use crate::error::{LifecycleError, Result};

/// MCP protocol revision sent in `initialize`
pub const PROTOCOL_VERSION: &str = "2025-06-18";

const SESSION_HEADER: &str = "Mcp-Session-Id";
const METHOD_NOT_FOUND: i64 = -32601;
const INTERNAL_ERROR: i64 = -32603;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Builds [`RpcSession`]s
#[derive(Debug, Clone)]
pub struct RpcSessionFactory {
    client_name: String,
    client_version: String,
}

impl Default for RpcSessionFactory {
    fn default() -> Self {
        Self {
            client_name: env!("CARGO_PKG_NAME").to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl RpcSessionFactory {
    /// Factory announcing the given client identity in `initialize`
    pub fn with_client_info(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            client_name: name.into(),
            client_version: version.into(),
        }
    }
}

impl SessionFactory for RpcSessionFactory {
    fn create(&self, server_name: &str, session_id: Option<&str>) -> Result<Arc<dyn Session>> {
        Ok(Arc::new(RpcSession::new(
            server_name,
            session_id.map(str::to_string),
            &self.client_name,
            &self.client_version,
        )))
    }
}

struct HttpChannel {
    client: reqwest::Client,
    url: String,
    headers: HeaderMap,
    session_id: Option<String>,
}

enum Channel {
    Stdio(ChildProcess),
    Http(HttpChannel),
    WebSocket(Box<WsStream>),
}

enum Incoming {
    Response(Result<Value>),
    ServerRequest { id: Value, method: String },
    Ignored,
}

/// JSON-RPC 2.0 session over stdio, HTTP or WebSocket
pub struct RpcSession {
    server: String,
    session_id: Option<String>,
    client_name: String,
    client_version: String,
    next_id: AtomicU64,
    channel: TokioMutex<Option<Channel>>,
    request_timeout: parking_lot::Mutex<Duration>,
    roots: parking_lot::Mutex<Vec<Root>>,
    server_info: parking_lot::Mutex<Option<Value>>,
}

impl std::fmt::Debug for RpcSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcSession")
            .field("server", &self.server)
            .field("session_id", &self.session_id)
            .field("request_timeout", &*self.request_timeout.lock())
            .finish_non_exhaustive()
    }
}

impl RpcSession {
    /// Unconnected session for `server`
    pub fn new(
        server: &str,
        session_id: Option<String>,
        client_name: &str,
        client_version: &str,
    ) -> Self {
        Self {
            server: server.to_string(),
            session_id,
            client_name: client_name.to_string(),
            client_version: client_version.to_string(),
            next_id: AtomicU64::new(1),
            channel: TokioMutex::new(None),
            request_timeout: parking_lot::Mutex::new(Duration::from_millis(
                crate::config::DEFAULT_TIMEOUT_MS,
            )),
            roots: parking_lot::Mutex::new(Vec::new()),
            server_info: parking_lot::Mutex::new(None),
        }
    }

    /// `initialize` result returned by the server, once connected
    pub fn server_info(&self) -> Option<Value> {
        self.server_info.lock().clone()
    }

    /// Whether a transport is open
    pub async fn is_connected(&self) -> bool {
        self.channel.lock().await.is_some()
    }

    /// Send a request and wait for its response
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Session`] when not connected,
    /// [`LifecycleError::Protocol`] for a JSON-RPC error response,
    /// [`LifecycleError::OperationTimeout`] past the server timeout, and
    /// [`LifecycleError::Connection`] on transport failure.
    #[instrument(skip(self, params), fields(server = %self.server))]
    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        let timeout = *self.request_timeout.lock();

        let mut guard = self.channel.lock().await;
        let channel = guard
            .as_mut()
            .ok_or_else(|| LifecycleError::session(&self.server, "session is not connected"))?;

        trace!(id, "Sending request");
        tokio::time::timeout(timeout, self.exchange(channel, id, frame))
            .await
            .map_err(|_| LifecycleError::OperationTimeout {
                operation: method.to_string(),
                timeout,
            })?
    }

    /// Send a notification
    ///
    /// # Errors
    ///
    /// Same transport errors as [`request`](Self::request).
    pub async fn notify(&self, method: &str, params: Value) -> Result<()> {
        let frame = json!({ "jsonrpc": "2.0", "method": method, "params": params });
        let mut guard = self.channel.lock().await;
        let channel = guard
            .as_mut()
            .ok_or_else(|| LifecycleError::session(&self.server, "session is not connected"))?;
        self.send_frame(channel, &frame).await
    }

    async fn handshake(&self) -> Result<()> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": { "roots": { "listChanged": false } },
            "clientInfo": { "name": self.client_name, "version": self.client_version },
        });
        let result = self.request("initialize", params).await?;
        debug!(
            server = %self.server,
            protocol = ?result.get("protocolVersion"),
            server_info = ?result.get("serverInfo"),
            "Session initialized"
        );
        *self.server_info.lock() = Some(result);
        self.notify("notifications/initialized", json!({})).await
    }

    async fn open_channel(&self, config: &ServerConfig) -> Result<Channel> {
        match &config.transport {
            TransportConfig::Stdio {
                command,
                args,
                env,
                cwd,
            } => {
                let process_config = ChildProcessConfig {
                    environment: env.clone(),
                    working_directory: cwd.clone(),
                    ..ChildProcessConfig::new(command.clone(), args.clone())
                };
                Ok(Channel::Stdio(ChildProcess::spawn(&self.server, process_config)?))
            }
            TransportConfig::Http { url, headers } => {
                let headers = build_headers(&self.server, headers, config.auth.as_ref())?;
                let client = reqwest::Client::builder()
                    .build()
                    .map_err(|e| LifecycleError::connection(&self.server, e.to_string()))?;
                Ok(Channel::Http(HttpChannel {
                    client,
                    url: url.clone(),
                    headers,
                    session_id: self.session_id.clone(),
                }))
            }
            TransportConfig::Websocket { url, headers } => {
                let mut request = url
                    .as_str()
                    .into_client_request()
                    .map_err(|e| LifecycleError::connection(&self.server, e.to_string()))?;
                request
                    .headers_mut()
                    .extend(build_headers(&self.server, headers, config.auth.as_ref())?);
                let (stream, _) = tokio::time::timeout(config.timeout(), connect_async(request))
                    .await
                    .map_err(|_| LifecycleError::OperationTimeout {
                        operation: "websocket connect".to_string(),
                        timeout: config.timeout(),
                    })?
                    .map_err(|e| {
                        LifecycleError::connection(&self.server, format!("websocket connect to {url} failed: {e}"))
                    })?;
                Ok(Channel::WebSocket(Box::new(stream)))
            }
            TransportConfig::Sse { .. } => Err(LifecycleError::connection(
                &self.server,
                "the sse transport is not supported by the default session adapter; inject a SessionFactory",
            )),
        }
    }

    async fn exchange(&self, channel: &mut Channel, id: u64, frame: Value) -> Result<Value> {
        match channel {
            Channel::Stdio(process) => {
                process.send_line(frame.to_string()).await?;
                loop {
                    let line = process.recv_line().await?;
                    match self.classify(&line, id) {
                        Incoming::Response(result) => return result,
                        Incoming::ServerRequest { id, method } => {
                            process.send_line(self.reply_to(id, &method).to_string()).await?;
                        }
                        Incoming::Ignored => {}
                    }
                }
            }
            Channel::WebSocket(ws) => {
                ws.send(Message::Text(frame.to_string().into()))
                    .await
                    .map_err(|e| LifecycleError::connection(&self.server, e.to_string()))?;
                loop {
                    let text = match ws.next().await {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(_))) | None => {
                            return Err(LifecycleError::connection(&self.server, "websocket closed"));
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            return Err(LifecycleError::connection(&self.server, e.to_string()));
                        }
                    };
                    match self.classify(&text, id) {
                        Incoming::Response(result) => return result,
                        Incoming::ServerRequest { id, method } => {
                            let reply = self.reply_to(id, &method).to_string();
                            ws.send(Message::Text(reply.into()))
                                .await
                                .map_err(|e| LifecycleError::connection(&self.server, e.to_string()))?;
                        }
                        Incoming::Ignored => {}
                    }
                }
            }
            Channel::Http(http) => {
                for message in http.post(&self.server, &frame).await? {
                    match self.classify(&message, id) {
                        Incoming::Response(result) => return result,
                        Incoming::ServerRequest { method, .. } => {
                            debug!(server = %self.server, method = %method, "Ignoring server request on POST stream");
                        }
                        Incoming::Ignored => {}
                    }
                }
                Err(LifecycleError::session(
                    &self.server,
                    format!("no response for request {id}"),
                ))
            }
        }
    }

    async fn send_frame(&self, channel: &mut Channel, frame: &Value) -> Result<()> {
        match channel {
            Channel::Stdio(process) => process.send_line(frame.to_string()).await,
            Channel::WebSocket(ws) => ws
                .send(Message::Text(frame.to_string().into()))
                .await
                .map_err(|e| LifecycleError::connection(&self.server, e.to_string())),
            Channel::Http(http) => http.post(&self.server, frame).await.map(|_| ()),
        }
    }

    fn classify(&self, raw: &str, expected: u64) -> Incoming {
        let message: Value = match serde_json::from_str(raw) {
            Ok(message) => message,
            Err(e) => {
                debug!(server = %self.server, error = %e, "Skipping non-JSON line");
                return Incoming::Ignored;
            }
        };

        match (message.get("id"), message.get("method").and_then(Value::as_str)) {
            (Some(id), Some(method)) => Incoming::ServerRequest {
                id: id.clone(),
                method: method.to_string(),
            },
            (Some(id), None) if id.as_u64() == Some(expected) => {
                Incoming::Response(response_result(&self.server, &message))
            }
            (Some(id), None) => {
                warn!(server = %self.server, id = %id, expected, "Discarding response for unknown request");
                Incoming::Ignored
            }
            (None, method) => {
                trace!(server = %self.server, method = ?method, "Ignoring notification");
                Incoming::Ignored
            }
        }
    }

    fn reply_to(&self, id: Value, method: &str) -> Value {
        match method {
            "ping" => json!({ "jsonrpc": "2.0", "id": id, "result": {} }),
            "roots/list" => {
                let roots = self.roots.lock().clone();
                json!({ "jsonrpc": "2.0", "id": id, "result": { "roots": roots } })
            }
            _ => json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": METHOD_NOT_FOUND, "message": format!("method not found: {method}") }
            }),
        }
    }

    async fn list_all<T: DeserializeOwned>(&self, method: &str, key: &str) -> Result<Vec<T>> {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let params = match &cursor {
                Some(cursor) => json!({ "cursor": cursor }),
                None => json!({}),
            };
            let mut result = self.request(method, params).await?;

            let page = result.get_mut(key).map(Value::take).unwrap_or_else(|| json!([]));
            let mut batch: Vec<T> = serde_json::from_value(page).map_err(|e| {
                LifecycleError::session(&self.server, format!("invalid {method} result: {e}"))
            })?;
            items.append(&mut batch);

            match result.get("nextCursor").and_then(Value::as_str) {
                Some(next) if !next.is_empty() && cursor.as_deref() != Some(next) => {
                    cursor = Some(next.to_string());
                }
                _ => break,
            }
        }
        Ok(items)
    }
}

#[async_trait]
impl Session for RpcSession {
    #[instrument(skip(self, config), fields(transport = config.transport.kind()))]
    async fn connect(&self, config: &ServerConfig, server_name: &str) -> Result<()> {
        {
            let mut guard = self.channel.lock().await;
            if guard.is_some() {
                return Ok(());
            }
            *self.request_timeout.lock() = config.timeout();
            *self.roots.lock() = config.roots.clone();
            *guard = Some(self.open_channel(config).await?);
        }

        if let Err(e) = self.handshake().await {
            warn!(server = %server_name, error = %e, "Handshake failed, closing transport");
            self.disconnect().await?;
            return Err(e);
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let Some(channel) = self.channel.lock().await.take() else {
            return Ok(());
        };
        debug!(server = %self.server, "Closing session");

        match channel {
            Channel::Stdio(mut process) => process.stop().await,
            Channel::WebSocket(ws) => {
                let mut ws = *ws;
                if let Err(e) = ws.close(None).await {
                    debug!(server = %self.server, error = %e, "WebSocket close failed");
                }
            }
            Channel::Http(http) => http.terminate(&self.server).await,
        }
        Ok(())
    }

    async fn get_tools(&self) -> Result<Vec<ToolDescriptor>> {
        self.list_all("tools/list", "tools").await
    }

    async fn list_prompts(&self) -> Result<Vec<PromptDescriptor>> {
        self.list_all("prompts/list", "prompts").await
    }

    async fn list_resources(&self) -> Result<Vec<ResourceDescriptor>> {
        self.list_all("resources/list", "resources").await
    }
}

impl HttpChannel {
    /// POST one message; returns the JSON messages in the response body
    async fn post(&mut self, server: &str, frame: &Value) -> Result<Vec<String>> {
        let mut request = self
            .client
            .post(&self.url)
            .headers(self.headers.clone())
            .header(header::ACCEPT, "application/json, text/event-stream")
            .header("MCP-Protocol-Version", PROTOCOL_VERSION)
            .json(frame);
        if let Some(session_id) = &self.session_id {
            request = request.header(SESSION_HEADER, session_id);
        }

        let response = request
            .send()
            .await
            .map_err(|e| LifecycleError::connection(server, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(LifecycleError::connection(server, format!("POST failed: {status}")));
        }

        if let Some(session_id) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            self.session_id = Some(session_id.to_string());
        }

        if status == reqwest::StatusCode::ACCEPTED || status == reqwest::StatusCode::NO_CONTENT {
            return Ok(Vec::new());
        }

        let is_event_stream = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("text/event-stream"));

        let body = response
            .text()
            .await
            .map_err(|e| LifecycleError::connection(server, e.to_string()))?;

        if is_event_stream {
            Ok(sse_data_events(&body))
        } else if body.trim().is_empty() {
            Ok(Vec::new())
        } else {
            Ok(vec![body])
        }
    }

    /// End the server-side session, if one was assigned
    async fn terminate(self, server: &str) {
        let Some(session_id) = self.session_id else {
            return;
        };
        let result = self
            .client
            .delete(&self.url)
            .headers(self.headers)
            .header(SESSION_HEADER, session_id)
            .send()
            .await;
        if let Err(e) = result {
            debug!(server = %server, error = %e, "Session DELETE failed");
        }
    }
}

fn response_result(server: &str, message: &Value) -> Result<Value> {
    if let Some(error) = message.get("error") {
        return Err(LifecycleError::Protocol {
            server: server.to_string(),
            code: error.get("code").and_then(Value::as_i64).unwrap_or(INTERNAL_ERROR),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        });
    }
    Ok(message.get("result").cloned().unwrap_or(Value::Null))
}

fn build_headers(
    server: &str,
    extra: &std::collections::HashMap<String, String>,
    auth: Option<&AuthConfig>,
) -> Result<HeaderMap> {
    let invalid = |name: &str| LifecycleError::connection(server, format!("invalid header '{name}'"));

    let mut headers = HeaderMap::new();
    for (name, value) in extra {
        let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| invalid(name.as_str()))?;
        let header_value = HeaderValue::from_str(value).map_err(|_| invalid(name.as_str()))?;
        headers.insert(header_name, header_value);
    }
    if let Some(auth) = auth {
        let value = HeaderValue::from_str(&auth.header_value()).map_err(|_| invalid("authorization"))?;
        headers.insert(header::AUTHORIZATION, value);
    }
    Ok(headers)
}

/// Concatenated `data:` payloads of each event in an SSE body
fn sse_data_events(body: &str) -> Vec<String> {
    let normalized = body.replace("\r\n", "\n");
    normalized
        .split("\n\n")
        .filter_map(|event| {
            let data: Vec<&str> = event
                .lines()
                .filter_map(|line| line.strip_prefix("data:"))
                .map(|d| d.strip_prefix(' ').unwrap_or(d))
                .collect();
            (!data.is_empty()).then(|| data.join("\n"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn session() -> RpcSession {
        RpcSession::new("alpha", None, "test-client", "0.0.0")
    }

    #[test]
    fn test_classify_matching_response() {
        let s = session();
        match s.classify(r#"{"jsonrpc":"2.0","id":4,"result":{"tools":[]}}"#, 4) {
            Incoming::Response(Ok(result)) => assert_eq!(result, json!({ "tools": [] })),
            _ => panic!("expected a successful response"),
        }
    }

    #[test]
    fn test_classify_error_response() {
        let s = session();
        match s.classify(
            r#"{"jsonrpc":"2.0","id":2,"error":{"code":-32602,"message":"bad params"}}"#,
            2,
        ) {
            Incoming::Response(Err(LifecycleError::Protocol { code, message, .. })) => {
                assert_eq!(code, -32602);
                assert_eq!(message, "bad params");
            }
            _ => panic!("expected a protocol error"),
        }
    }

    #[test]
    fn test_classify_skips_noise() {
        let s = session();
        assert!(matches!(s.classify("server starting...", 1), Incoming::Ignored));
        assert!(matches!(
            s.classify(r#"{"jsonrpc":"2.0","method":"notifications/message","params":{}}"#, 1),
            Incoming::Ignored
        ));
        assert!(matches!(
            s.classify(r#"{"jsonrpc":"2.0","id":9,"result":{}}"#, 1),
            Incoming::Ignored
        ));
        assert!(matches!(
            s.classify(r#"{"jsonrpc":"2.0","id":"srv-1","method":"ping"}"#, 1),
            Incoming::ServerRequest { ref method, .. } if method == "ping"
        ));
    }

    #[test]
    fn test_replies_to_server_requests() {
        let s = session();
        *s.roots.lock() = vec![Root {
            uri: "file:///work".into(),
            name: Some("work".into()),
        }];

        let roots = s.reply_to(json!(7), "roots/list");
        assert_eq!(roots["result"]["roots"][0]["uri"], "file:///work");

        let unknown = s.reply_to(json!("x"), "sampling/createMessage");
        assert_eq!(unknown["error"]["code"], METHOD_NOT_FOUND);
    }

    #[test]
    fn test_sse_body_parsing() {
        let body = "event: message\r\ndata: {\"id\":1}\r\n\r\n: keepalive\n\ndata: {\"id\":\ndata: 2}\n\n";
        assert_eq!(sse_data_events(body), vec!["{\"id\":1}".to_string(), "{\"id\":\n2}".to_string()]);
    }

    #[tokio::test]
    async fn test_sse_transport_rejected() {
        let s = session();
        let err = s
            .connect(&ServerConfig::sse("https://example.com/sse"), "alpha")
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Connection { .. }));
        assert!(!s.is_connected().await);
    }

    #[tokio::test]
    async fn test_request_before_connect() {
        let err = session().request("tools/list", json!({})).await.unwrap_err();
        assert!(matches!(err, LifecycleError::Session { .. }));
    }

    #[tokio::test]
    async fn test_disconnect_without_connect_is_noop() {
        session().disconnect().await.unwrap();
    }
}
