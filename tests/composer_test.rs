//! Routing and namespace behavior of the composer against in-process
//! backends.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use common::{composer_with_modules, embedded_spec, ToolServer};
use mcp_compose::config::ConflictResolution;
use mcp_compose::core::capability::CapabilityKind;
use mcp_compose::core::protocol::{JsonRpcRequest, RequestId};
use mcp_compose::core::server::ServerState;
use mcp_compose::utils::errors::ComposeError;

#[tokio::test]
async fn two_servers_compose_into_prefixed_namespace() {
    let composer = composer_with_modules(
        ConflictResolution::Prefix,
        vec![
            Arc::new(ToolServer::new("calc", &[("add", "3")])),
            Arc::new(ToolServer::new("echo", &[("reverse", "cba")])),
        ],
    );
    composer.add_server(embedded_spec("calc", "calc")).unwrap();
    composer.add_server(embedded_spec("echo", "echo")).unwrap();
    composer.start("calc").await.unwrap();
    composer.start("echo").await.unwrap();

    let names: Vec<String> = composer
        .list_capabilities(Some(CapabilityKind::Tool), None)
        .into_iter()
        .map(|d| d.qualified_name)
        .collect();
    assert_eq!(names, vec!["calc:add", "echo:reverse"]);

    // Both qualified names route to their owners.
    let response = composer
        .invoke(CapabilityKind::Tool, "calc:add", Some(json!({"a": 1, "b": 2})), None)
        .await
        .unwrap();
    assert_eq!(response.result.unwrap()["content"][0]["text"], json!("3"));

    let response = composer
        .invoke(CapabilityKind::Tool, "echo:reverse", None, None)
        .await
        .unwrap();
    assert_eq!(response.result.unwrap()["content"][0]["text"], json!("cba"));
}

#[tokio::test]
async fn unknown_name_is_not_found() {
    let composer = composer_with_modules(
        ConflictResolution::Prefix,
        vec![Arc::new(ToolServer::new("calc", &[("add", "3")]))],
    );
    composer.add_server(embedded_spec("calc", "calc")).unwrap();
    composer.start("calc").await.unwrap();

    let err = composer
        .invoke(CapabilityKind::Tool, "nope", None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ComposeError::NotFound(_)));
}

#[tokio::test]
async fn invoke_on_stopped_server_is_unavailable_without_io() {
    let composer = composer_with_modules(
        ConflictResolution::Ignore,
        vec![Arc::new(ToolServer::new("calc", &[("add", "3")]))],
    );
    composer.add_server(embedded_spec("calc", "calc")).unwrap();
    composer.start("calc").await.unwrap();

    // Resolution uses the registry from before the stop; keep a copy of the
    // descriptor name by leaving the ignore policy's plain name in place.
    composer.stop("calc").await.unwrap();
    assert_eq!(
        composer.get_server("calc").unwrap().state,
        ServerState::Stopped
    );

    // Leaving Running pruned the registry, so the name no longer resolves.
    let err = composer
        .invoke(CapabilityKind::Tool, "add", None, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ComposeError::NotFound(_) | ComposeError::ServerUnavailable(_)
    ));
}

#[tokio::test]
async fn ignore_policy_second_ping_never_invokable() {
    let first = ToolServer::new("first", &[("ping", "from-first")]);
    let second = ToolServer::new("second", &[("ping", "from-second")]);
    let composer = composer_with_modules(
        ConflictResolution::Ignore,
        vec![Arc::new(first), Arc::new(second)],
    );
    composer.add_server(embedded_spec("first", "first")).unwrap();
    composer.add_server(embedded_spec("second", "second")).unwrap();
    composer.start("first").await.unwrap();
    composer.start("second").await.unwrap();

    let entries = composer.list_capabilities(Some(CapabilityKind::Tool), None);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].owning_server_id, "first");

    let response = composer
        .invoke(CapabilityKind::Tool, "ping", None, None)
        .await
        .unwrap();
    assert_eq!(
        response.result.unwrap()["content"][0]["text"],
        json!("from-first")
    );
}

#[tokio::test]
async fn error_policy_fails_second_server_only() {
    let composer = composer_with_modules(
        ConflictResolution::Error,
        vec![
            Arc::new(ToolServer::new("first", &[("ping", "pong")])),
            Arc::new(ToolServer::new("second", &[("ping", "pong2")])),
        ],
    );
    composer.add_server(embedded_spec("first", "first")).unwrap();
    composer.add_server(embedded_spec("second", "second")).unwrap();

    composer.start("first").await.unwrap();
    let err = composer.start("second").await.unwrap_err();
    assert!(matches!(err, ComposeError::RegistrationConflict { .. }));

    // The collision prevented exactly the second server from running.
    assert_eq!(
        composer.get_server("first").unwrap().state,
        ServerState::Running
    );
    assert_ne!(
        composer.get_server("second").unwrap().state,
        ServerState::Running
    );

    // The first server's capability still works.
    let response = composer
        .invoke(CapabilityKind::Tool, "ping", None, None)
        .await
        .unwrap();
    assert_eq!(response.result.unwrap()["content"][0]["text"], json!("pong"));
}

#[tokio::test]
async fn stopping_one_server_leaves_other_in_flight_requests_alone() {
    let slow = ToolServer::new("slow", &[("work", "done")])
        .with_call_delay(Duration::from_millis(300));
    let composer = composer_with_modules(
        ConflictResolution::Prefix,
        vec![
            Arc::new(slow),
            Arc::new(ToolServer::new("other", &[("noop", "ok")])),
        ],
    );
    composer.add_server(embedded_spec("slow", "slow")).unwrap();
    composer.add_server(embedded_spec("other", "other")).unwrap();
    composer.start("slow").await.unwrap();
    composer.start("other").await.unwrap();

    let invoker = composer.clone();
    let pending = tokio::spawn(async move {
        invoker
            .invoke(CapabilityKind::Tool, "slow:work", None, None)
            .await
    });

    // Stop the unrelated server while the call is mid-flight.
    tokio::time::sleep(Duration::from_millis(50)).await;
    composer.stop("other").await.unwrap();

    let response = pending.await.unwrap().unwrap();
    assert_eq!(response.result.unwrap()["content"][0]["text"], json!("done"));
}

#[tokio::test]
async fn invocation_timeout_is_reported_and_late_response_dropped() {
    let slow = ToolServer::new("slow", &[("work", "done")])
        .with_call_delay(Duration::from_millis(500));
    let composer =
        composer_with_modules(ConflictResolution::Prefix, vec![Arc::new(slow)]);
    composer.add_server(embedded_spec("slow", "slow")).unwrap();
    composer.start("slow").await.unwrap();

    let err = composer
        .invoke(
            CapabilityKind::Tool,
            "slow:work",
            None,
            Some(Duration::from_millis(50)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ComposeError::Timeout(_)));

    // The backend finishes later; the composer stays healthy and the next
    // call succeeds.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(
        composer.get_server("slow").unwrap().state,
        ServerState::Running
    );
    let response = composer
        .invoke(CapabilityKind::Tool, "slow:work", None, None)
        .await
        .unwrap();
    assert!(response.result.is_some());
}

#[tokio::test]
async fn client_surface_lists_and_calls_through_qualified_names() {
    let composer = composer_with_modules(
        ConflictResolution::Prefix,
        vec![Arc::new(ToolServer::new("calc", &[("add", "3")]))],
    );
    composer.add_server(embedded_spec("calc", "calc")).unwrap();
    composer.start("calc").await.unwrap();

    let init = composer
        .handle_request(JsonRpcRequest::with_id(
            "initialize",
            Some(json!({"protocolVersion": "2024-11-05", "capabilities": {}})),
            RequestId::Number(1),
        ))
        .await
        .unwrap();
    assert_eq!(init.id, Some(RequestId::Number(1)));
    assert_eq!(
        init.result.unwrap()["serverInfo"]["name"],
        json!("test-composer")
    );

    let listed = composer
        .handle_request(JsonRpcRequest::with_id("tools/list", None, RequestId::Number(2)))
        .await
        .unwrap();
    let tools = listed.result.unwrap()["tools"].clone();
    assert_eq!(tools[0]["name"], json!("calc:add"));

    let called = composer
        .handle_request(JsonRpcRequest::with_id(
            "tools/call",
            Some(json!({"name": "calc:add", "arguments": {"a": 1, "b": 2}})),
            RequestId::String("client-7".into()),
        ))
        .await
        .unwrap();
    // The client's own id comes back, not the backend correlation id.
    assert_eq!(called.id, Some(RequestId::String("client-7".into())));
    assert_eq!(called.result.unwrap()["content"][0]["text"], json!("3"));

    // Notifications produce no response.
    assert!(composer
        .handle_request(JsonRpcRequest::notification("notifications/initialized", None))
        .await
        .is_none());

    let unknown = composer
        .handle_request(JsonRpcRequest::with_id("bogus/method", None, RequestId::Number(3)))
        .await
        .unwrap();
    assert_eq!(unknown.error.unwrap().code, -32601);
}

#[tokio::test]
async fn reload_diff_stops_removed_and_keeps_unchanged_running() {
    let composer = composer_with_modules(
        ConflictResolution::Prefix,
        vec![
            Arc::new(ToolServer::new("keep", &[("a", "1")])),
            Arc::new(ToolServer::new("drop", &[("b", "2")])),
            Arc::new(ToolServer::new("new", &[("c", "3")])),
        ],
    );
    composer.add_server(embedded_spec("keep", "keep")).unwrap();
    composer.add_server(embedded_spec("drop", "drop")).unwrap();
    composer.start("keep").await.unwrap();
    composer.start("drop").await.unwrap();

    let report = composer
        .reload(
            vec![embedded_spec("keep", "keep"), embedded_spec("new", "new")],
            vec![],
        )
        .await
        .unwrap();

    assert_eq!(report.unchanged, vec!["keep".to_string()]);
    assert_eq!(report.removed, vec!["drop".to_string()]);
    assert_eq!(report.added, vec!["new".to_string()]);

    assert!(composer.get_server("drop").is_none());
    assert_eq!(
        composer.get_server("keep").unwrap().state,
        ServerState::Running
    );
    assert_eq!(
        composer.get_server("new").unwrap().state,
        ServerState::Running
    );

    let names: Vec<String> = composer
        .list_capabilities(Some(CapabilityKind::Tool), None)
        .into_iter()
        .map(|d| d.qualified_name)
        .collect();
    assert_eq!(names, vec!["keep:a", "new:c"]);
}

#[tokio::test]
async fn summary_reports_totals_and_sources() {
    let composer = composer_with_modules(
        ConflictResolution::Override,
        vec![
            Arc::new(ToolServer::new("first", &[("ping", "1")])),
            Arc::new(ToolServer::new("second", &[("ping", "2")])),
        ],
    );
    composer.add_server(embedded_spec("first", "first")).unwrap();
    composer.add_server(embedded_spec("second", "second")).unwrap();
    composer.start("first").await.unwrap();
    composer.start("second").await.unwrap();

    let summary = composer.summary();
    assert_eq!(summary.total_tools, 1);
    assert_eq!(summary.conflicts_resolved.len(), 1);
    assert_eq!(summary.servers.len(), 2);
}
