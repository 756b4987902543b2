pub mod manager;
pub mod types;

pub use manager::{default_config_path, ConfigEvent, ConfigManager};
pub use types::{
    ComposeConfig, ComposerSettings, ConflictResolution, HttpConfig, RestartPolicy, ServerKind,
    ServerSpec, TranslatorKind, TranslatorSpec,
};
