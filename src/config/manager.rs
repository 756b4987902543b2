//! Configuration loading and hot-reload.
//!
//! TOML file merged with an `MCP_COMPOSE_` environment overlay, validated
//! before use. A filesystem watcher re-parses on change and broadcasts the
//! new config; subscribers decide what to do with it (the serve loop feeds
//! it to `Composer::reload`).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{error, info};

use crate::config::ComposeConfig;
use crate::utils::errors::{ComposeError, ComposeResult};

#[derive(Debug, Clone)]
pub enum ConfigEvent {
    Reloaded(ComposeConfig),
    Error(String),
}

pub struct ConfigManager {
    path: PathBuf,
    config: Arc<RwLock<ComposeConfig>>,
    event_tx: broadcast::Sender<ConfigEvent>,
    _watcher: Option<RecommendedWatcher>,
}

impl ConfigManager {
    /// Load and validate the config at `path`.
    pub fn load(path: impl AsRef<Path>) -> ComposeResult<ComposeConfig> {
        let config: ComposeConfig = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("MCP_COMPOSE_").split("__"))
            .extract()
            .map_err(|e| ComposeError::ConfigError(e.to_string()))?;
        config.validate_all()?;
        Ok(config)
    }

    /// Load the config and watch the file for changes.
    pub fn new(path: impl Into<PathBuf>) -> ComposeResult<Self> {
        let path = path.into();
        let config = Arc::new(RwLock::new(Self::load(&path)?));

        let (event_tx, _) = broadcast::channel(16);
        let watcher = Self::start_watcher(&path, config.clone(), event_tx.clone())?;

        Ok(Self {
            path,
            config,
            event_tx,
            _watcher: Some(watcher),
        })
    }

    /// Load without watching (one-shot CLI invocations).
    pub fn without_watcher(path: impl Into<PathBuf>) -> ComposeResult<Self> {
        let path = path.into();
        let config = Arc::new(RwLock::new(Self::load(&path)?));
        let (event_tx, _) = broadcast::channel(16);
        Ok(Self {
            path,
            config,
            event_tx,
            _watcher: None,
        })
    }

    fn start_watcher(
        path: &Path,
        config: Arc<RwLock<ComposeConfig>>,
        event_tx: broadcast::Sender<ConfigEvent>,
    ) -> ComposeResult<RecommendedWatcher> {
        let watch_path = path.to_path_buf();
        let reload_path = path.to_path_buf();

        let mut watcher =
            notify::recommended_watcher(move |res: Result<Event, notify::Error>| match res {
                Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                    info!("config file changed, reloading");
                    match Self::load(&reload_path) {
                        Ok(new_config) => {
                            *config.write() = new_config.clone();
                            let _ = event_tx.send(ConfigEvent::Reloaded(new_config));
                        }
                        Err(e) => {
                            error!("config reload failed: {}", e);
                            let _ = event_tx.send(ConfigEvent::Error(e.to_string()));
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => error!("config watcher error: {}", e),
            })
            .map_err(|e| ComposeError::ConfigError(e.to_string()))?;

        watcher
            .watch(&watch_path, RecursiveMode::NonRecursive)
            .map_err(|e| ComposeError::ConfigError(e.to_string()))?;

        Ok(watcher)
    }

    pub fn get_config(&self) -> ComposeConfig {
        self.config.read().clone()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConfigEvent> {
        self.event_tx.subscribe()
    }
}

/// Default config location: `$XDG_CONFIG_HOME/mcp-compose/config.toml`.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mcp-compose")
        .join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_minimal_config() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[composer]
name = "test-composer"
conflict_resolution = "prefix"

[[servers]]
name = "calc"
kind = "stdio-process"
command = "python calc.py"
"#
        )
        .unwrap();

        let config = ConfigManager::load(file.path()).unwrap();
        assert_eq!(config.composer.name, "test-composer");
        assert_eq!(config.servers.len(), 1);
        assert_eq!(config.servers[0].name, "calc");
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[[servers]]
name = "broken"
kind = "sse-remote"
"#
        )
        .unwrap();

        assert!(ConfigManager::load(file.path()).is_err());
    }
}
