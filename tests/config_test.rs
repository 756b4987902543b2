//! Configuration loading and validation.

use std::io::Write;

use mcp_compose::config::{
    ConfigManager, ConflictResolution, RestartPolicy, ServerKind, TranslatorKind,
};

fn write_config(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn full_config_loads_with_every_server_kind() {
    let file = write_config(
        r#"
[composer]
name = "gateway"
conflict_resolution = "ignore"
invoke_timeout_ms = 10000

[http]
host = "0.0.0.0"
port = 9100

[[servers]]
name = "calc"
kind = "stdio-process"
command = "python -m calc_server"
restart_policy = "on-failure"
max_restarts = 5
restart_delay_ms = 250

[[servers]]
name = "remote-sse"
kind = "sse-remote"
url = "http://localhost:9000/sse"

[[servers]]
name = "remote-http"
kind = "streamable-http-remote"
url = "http://localhost:9001/mcp"
health_check_interval_ms = 15000

[[servers]]
name = "local"
kind = "embedded"
module = "local_tools"
enabled = false

[[translators]]
name = "bridge"
kind = "stdio-to-sse"
command = "python -m old_server"
listen = "127.0.0.1:8900"
"#,
    );

    let config = ConfigManager::load(file.path()).unwrap();
    assert_eq!(config.composer.name, "gateway");
    assert_eq!(
        config.composer.conflict_resolution,
        ConflictResolution::Ignore
    );
    assert_eq!(config.composer.invoke_timeout_ms, 10_000);
    assert_eq!(config.http.port, 9100);

    assert_eq!(config.servers.len(), 4);
    let calc = &config.servers[0];
    assert_eq!(calc.kind, ServerKind::StdioProcess);
    assert_eq!(calc.restart_policy, RestartPolicy::OnFailure);
    assert_eq!(calc.max_restarts, 5);
    assert_eq!(calc.restart_delay_ms, 250);

    assert_eq!(config.servers[1].kind, ServerKind::SseRemote);
    assert_eq!(
        config.servers[2].health_check_interval_ms,
        Some(15_000)
    );
    assert!(!config.servers[3].enabled);

    assert_eq!(config.translators.len(), 1);
    assert_eq!(config.translators[0].kind, TranslatorKind::StdioToSse);
}

#[test]
fn defaults_fill_in_missing_sections() {
    let file = write_config(
        r#"
[[servers]]
name = "calc"
command = "calc-server"
"#,
    );

    let config = ConfigManager::load(file.path()).unwrap();
    assert_eq!(config.composer.name, "mcp-compose");
    assert_eq!(
        config.composer.conflict_resolution,
        ConflictResolution::Prefix
    );
    assert_eq!(config.http.host, "127.0.0.1");

    let calc = &config.servers[0];
    assert_eq!(calc.kind, ServerKind::StdioProcess);
    assert_eq!(calc.restart_policy, RestartPolicy::Never);
    assert!(calc.enabled);
    assert_eq!(calc.max_restarts, 3);
}

#[test]
fn stdio_server_without_command_is_rejected() {
    let file = write_config(
        r#"
[[servers]]
name = "broken"
kind = "stdio-process"
"#,
    );
    assert!(ConfigManager::load(file.path()).is_err());
}

#[test]
fn remote_server_with_bad_url_is_rejected() {
    let file = write_config(
        r#"
[[servers]]
name = "broken"
kind = "sse-remote"
url = "::not a url::"
"#,
    );
    assert!(ConfigManager::load(file.path()).is_err());
}

#[test]
fn duplicate_names_across_servers_and_translators_are_rejected() {
    let file = write_config(
        r#"
[[servers]]
name = "same"
command = "a-server"

[[translators]]
name = "same"
kind = "sse-to-stdio"
url = "http://localhost:9000/sse"
"#,
    );
    assert!(ConfigManager::load(file.path()).is_err());
}

#[test]
fn translator_missing_listen_is_rejected() {
    let file = write_config(
        r#"
[[translators]]
name = "bridge"
kind = "stdio-to-sse"
command = "a-server"
"#,
    );
    assert!(ConfigManager::load(file.path()).is_err());
}
