use std::collections::HashMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::utils::errors::{ComposeError, ComposeResult};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Validate, Default)]
pub struct ComposeConfig {
    #[serde(default)]
    pub composer: ComposerSettings,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub servers: Vec<ServerSpec>,
    #[serde(default)]
    pub translators: Vec<TranslatorSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ComposerSettings {
    /// Name advertised by the composed server.
    pub name: String,
    pub conflict_resolution: ConflictResolution,
    /// Deadline for a single capability invocation.
    pub invoke_timeout_ms: u64,
    /// Deadline for the initialize/discovery handshake on startup.
    pub handshake_timeout_ms: u64,
    /// Grace period before a stopping backend is hard-killed.
    pub stop_grace_ms: u64,
}

impl Default for ComposerSettings {
    fn default() -> Self {
        Self {
            name: "mcp-compose".to_string(),
            conflict_resolution: ConflictResolution::Prefix,
            invoke_timeout_ms: 30_000,
            handshake_timeout_ms: 30_000,
            stop_grace_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
        }
    }
}

/// How identically-named capabilities from different servers reconcile.
/// Global per composer, fixed at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Qualify every name as `server:name`.
    #[default]
    Prefix,
    /// Qualify every name as `name:server`.
    Suffix,
    /// Keep names as-is; first registration wins, later ones are dropped.
    Ignore,
    /// Keep names as-is; a collision fails the incoming server's startup.
    Error,
    /// Keep names as-is; last registration wins.
    Override,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ServerKind {
    Embedded,
    #[default]
    StdioProcess,
    SseRemote,
    StreamableHttpRemote,
}

impl std::fmt::Display for ServerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerKind::Embedded => write!(f, "embedded"),
            ServerKind::StdioProcess => write!(f, "stdio-process"),
            ServerKind::SseRemote => write!(f, "sse-remote"),
            ServerKind::StreamableHttpRemote => write!(f, "streamable-http-remote"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    #[default]
    Never,
    OnFailure,
    Always,
}

/// One backend server, as declared in configuration. Immutable at runtime;
/// a reload swaps the whole spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Validate)]
#[serde(default)]
pub struct ServerSpec {
    #[validate(length(min = 1))]
    pub name: String,
    pub kind: ServerKind,
    pub enabled: bool,
    /// Launch command for `stdio-process`, or the optional auto-start
    /// command for remote kinds.
    pub command: Option<String>,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    /// Endpoint for remote kinds.
    pub url: Option<String>,
    /// Registered embedded module name for the `embedded` kind.
    pub module: Option<String>,
    pub restart_policy: RestartPolicy,
    pub max_restarts: u32,
    pub restart_delay_ms: u64,
    /// Periodic liveness ping; disabled when absent.
    pub health_check_interval_ms: Option<u64>,
    /// Stdio write guard: a blocked child input longer than this is a crash.
    pub write_timeout_ms: u64,
    /// Remote streams with no data or heartbeat for this long count as
    /// silently disconnected.
    pub idle_timeout_ms: u64,
}

impl Default for ServerSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            kind: ServerKind::StdioProcess,
            enabled: true,
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            url: None,
            module: None,
            restart_policy: RestartPolicy::Never,
            max_restarts: 3,
            restart_delay_ms: 1_000,
            health_check_interval_ms: None,
            write_timeout_ms: 5_000,
            idle_timeout_ms: 60_000,
        }
    }
}

impl ServerSpec {
    /// Kind-specific launch data checks, beyond what derive validation covers.
    pub fn validate_kind(&self) -> ComposeResult<()> {
        match self.kind {
            ServerKind::StdioProcess => {
                if self.command.as_deref().map_or(true, str::is_empty) {
                    return Err(ComposeError::ConfigError(format!(
                        "server '{}': stdio-process requires a command",
                        self.name
                    )));
                }
            }
            ServerKind::SseRemote | ServerKind::StreamableHttpRemote => {
                let url = self.url.as_deref().ok_or_else(|| {
                    ComposeError::ConfigError(format!(
                        "server '{}': {} requires a url",
                        self.name, self.kind
                    ))
                })?;
                url::Url::parse(url).map_err(|e| {
                    ComposeError::ConfigError(format!("server '{}': invalid url: {}", self.name, e))
                })?;
            }
            ServerKind::Embedded => {
                if self.module.as_deref().map_or(true, str::is_empty) {
                    return Err(ComposeError::ConfigError(format!(
                        "server '{}': embedded requires a module name",
                        self.name
                    )));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum TranslatorKind {
    StdioToSse,
    SseToStdio,
}

impl std::fmt::Display for TranslatorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TranslatorKind::StdioToSse => write!(f, "stdio-to-sse"),
            TranslatorKind::SseToStdio => write!(f, "sse-to-stdio"),
        }
    }
}

/// A protocol bridge, registered alongside the managed servers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Validate)]
pub struct TranslatorSpec {
    #[validate(length(min = 1))]
    pub name: String,
    pub kind: TranslatorKind,
    /// Child command for `stdio-to-sse`.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Bind address for the `stdio-to-sse` listener, e.g. `127.0.0.1:8900`.
    #[serde(default)]
    pub listen: Option<String>,
    /// Remote SSE endpoint for `sse-to-stdio`.
    #[serde(default)]
    pub url: Option<String>,
}

impl TranslatorSpec {
    pub fn validate_kind(&self) -> ComposeResult<()> {
        match self.kind {
            TranslatorKind::StdioToSse => {
                if self.command.as_deref().map_or(true, str::is_empty) {
                    return Err(ComposeError::ConfigError(format!(
                        "translator '{}': stdio-to-sse requires a command",
                        self.name
                    )));
                }
                let listen = self.listen.as_deref().ok_or_else(|| {
                    ComposeError::ConfigError(format!(
                        "translator '{}': stdio-to-sse requires a listen address",
                        self.name
                    ))
                })?;
                listen.parse::<std::net::SocketAddr>().map_err(|e| {
                    ComposeError::ConfigError(format!(
                        "translator '{}': invalid listen address: {}",
                        self.name, e
                    ))
                })?;
            }
            TranslatorKind::SseToStdio => {
                let url = self.url.as_deref().ok_or_else(|| {
                    ComposeError::ConfigError(format!(
                        "translator '{}': sse-to-stdio requires a url",
                        self.name
                    ))
                })?;
                url::Url::parse(url).map_err(|e| {
                    ComposeError::ConfigError(format!(
                        "translator '{}': invalid url: {}",
                        self.name, e
                    ))
                })?;
            }
        }
        Ok(())
    }
}

impl ComposeConfig {
    /// Full structural validation: derive checks plus kind-specific launch
    /// data and name uniqueness across servers and translators.
    pub fn validate_all(&self) -> ComposeResult<()> {
        Validate::validate(self)
            .map_err(|e| ComposeError::ConfigError(format!("invalid configuration: {}", e)))?;

        let mut seen = std::collections::HashSet::new();
        for server in &self.servers {
            if server.name.is_empty() {
                return Err(ComposeError::ConfigError(
                    "server with empty name".to_string(),
                ));
            }
            if !seen.insert(server.name.clone()) {
                return Err(ComposeError::ConfigError(format!(
                    "duplicate server name: '{}'",
                    server.name
                )));
            }
            server.validate_kind()?;
        }
        for translator in &self.translators {
            if !seen.insert(translator.name.clone()) {
                return Err(ComposeError::ConfigError(format!(
                    "duplicate name: '{}'",
                    translator.name
                )));
            }
            translator.validate_kind()?;
        }
        Ok(())
    }

    /// Split a string-form command into program + args, appending any
    /// explicitly configured args.
    pub fn split_command(command: &str, extra_args: &[String]) -> ComposeResult<(String, Vec<String>)> {
        let mut parts = shell_words::split(command)
            .map_err(|e| ComposeError::ConfigError(format!("invalid command '{}': {}", command, e)))?;
        if parts.is_empty() {
            return Err(ComposeError::ConfigError("empty command".to_string()));
        }
        let program = parts.remove(0);
        parts.extend(extra_args.iter().cloned());
        Ok((program, parts))
    }
}
