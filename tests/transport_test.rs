//! Transport adapter behavior against real wires: a child process for
//! stdio and wiremock endpoints for the HTTP-based adapters.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use mcp_compose::core::protocol::{JsonRpcMessage, JsonRpcRequest, RequestId};
use mcp_compose::transport::{
    SseTransport, StdioTransport, StreamableHttpTransport, Transport,
};

#[tokio::test]
async fn stdio_transport_frames_roundtrip_through_child() {
    // `cat` echoes every line; the echoed request comes back as an inbound
    // request frame.
    let transport = StdioTransport::spawn(
        "cat",
        vec![],
        HashMap::new(),
        Duration::from_millis(2_000),
    )
    .await
    .unwrap();
    assert!(transport.is_connected().await);

    let request = JsonRpcRequest::with_id("ping", None, RequestId::Number(7));
    transport
        .send(JsonRpcMessage::Request(request))
        .await
        .unwrap();

    match tokio::time::timeout(Duration::from_secs(5), transport.receive())
        .await
        .unwrap()
        .unwrap()
    {
        JsonRpcMessage::Request(echoed) => {
            assert_eq!(echoed.method, "ping");
            assert_eq!(echoed.id, Some(RequestId::Number(7)));
        }
        other => panic!("unexpected frame: {:?}", other),
    }

    transport.close().await.unwrap();
    assert!(!transport.is_connected().await);
    // Close is idempotent.
    transport.close().await.unwrap();
}

#[tokio::test]
async fn stdio_transport_detects_child_exit() {
    let transport = StdioTransport::spawn(
        "true",
        vec![],
        HashMap::new(),
        Duration::from_millis(2_000),
    )
    .await
    .unwrap();

    // The child exits immediately; the inbound stream terminates.
    let frame = tokio::time::timeout(Duration::from_secs(5), transport.receive())
        .await
        .unwrap();
    assert!(frame.is_none());
}

#[tokio::test]
async fn sse_transport_parses_event_stream_in_order() {
    let server = MockServer::start().await;

    let body = concat!(
        ": heartbeat\n",
        "data: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{\"n\":1}}\n",
        "\n",
        "data: {\"jsonrpc\":\"2.0\",\"id\":2,\"result\":{\"n\":2}}\n",
        "\n",
    );
    Mock::given(method("GET"))
        .and(path("/sse"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/sse"))
        .respond_with(ResponseTemplate::new(202))
        .mount(&server)
        .await;

    let transport = SseTransport::connect(
        format!("{}/sse", server.uri()),
        Duration::from_millis(5_000),
    )
    .await
    .unwrap();

    for expected in 1..=2i64 {
        match tokio::time::timeout(Duration::from_secs(5), transport.receive())
            .await
            .unwrap()
            .unwrap()
        {
            JsonRpcMessage::Response(response) => {
                assert_eq!(response.id, Some(RequestId::Number(expected)));
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    // Outbound messages POST to the endpoint.
    transport
        .send(JsonRpcMessage::Request(JsonRpcRequest::with_id(
            "tools/list",
            None,
            RequestId::Number(3),
        )))
        .await
        .unwrap();

    // The mock body is exhausted, so the stream closes.
    let frame = tokio::time::timeout(Duration::from_secs(5), transport.receive())
        .await
        .unwrap();
    assert!(frame.is_none());

    transport.close().await.unwrap();
}

#[tokio::test]
async fn streamable_transport_reads_ndjson_response_stream() {
    let server = MockServer::start().await;

    let body = concat!(
        "{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{\"ok\":true}}\n",
        "{\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\",\"params\":{}}\n",
    );
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("mcp-session-id", "session-1")
                .set_body_raw(body, "application/x-ndjson"),
        )
        .mount(&server)
        .await;

    let transport = StreamableHttpTransport::new(
        format!("{}/mcp", server.uri()),
        Duration::from_millis(5_000),
    )
    .unwrap();

    transport
        .send(JsonRpcMessage::Request(JsonRpcRequest::with_id(
            "initialize",
            Some(json!({"protocolVersion": "2024-11-05"})),
            RequestId::Number(1),
        )))
        .await
        .unwrap();

    match tokio::time::timeout(Duration::from_secs(5), transport.receive())
        .await
        .unwrap()
        .unwrap()
    {
        JsonRpcMessage::Response(response) => {
            assert_eq!(response.id, Some(RequestId::Number(1)));
            assert_eq!(response.result.unwrap()["ok"], json!(true));
        }
        other => panic!("unexpected frame: {:?}", other),
    }

    // The trailing notification in the same body arrives next.
    match tokio::time::timeout(Duration::from_secs(5), transport.receive())
        .await
        .unwrap()
        .unwrap()
    {
        JsonRpcMessage::Request(notification) => {
            assert!(notification.is_notification());
            assert_eq!(notification.method, "notifications/progress");
        }
        other => panic!("unexpected frame: {:?}", other),
    }

    // Close drains the inbound channel shut.
    transport.close().await.unwrap();
    assert!(!transport.is_connected().await);
    let frame = tokio::time::timeout(Duration::from_secs(5), transport.receive())
        .await
        .unwrap();
    assert!(frame.is_none());
}

#[tokio::test]
async fn sse_transport_rejects_error_status() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/sse"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let result = SseTransport::connect(
        format!("{}/sse", server.uri()),
        Duration::from_millis(1_000),
    )
    .await;
    assert!(result.is_err());
}
