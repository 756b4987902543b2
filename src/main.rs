use std::collections::HashMap;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info, warn};

use mcp_compose::config::{ConfigEvent, ConfigManager, TranslatorKind, TranslatorSpec};
use mcp_compose::core::Composer;
use mcp_compose::http_server::HttpServer;
use mcp_compose::transport::StandardTransportFactory;
use mcp_compose::translator;
use mcp_compose::utils::logging;
use mcp_compose::utils::shutdown::ShutdownCoordinator;

#[derive(Parser)]
#[command(name = "mcp-compose")]
#[command(about = "Compose multiple MCP servers into one unified namespace")]
#[command(version)]
enum Cli {
    /// Run the composed server
    Serve(ServeArgs),
    /// Run a standalone protocol bridge
    Translate(TranslateArgs),
    /// Validate a configuration file
    Check(CheckArgs),
}

#[derive(Parser)]
struct ServeArgs {
    /// Configuration file path
    #[arg(short, long, env = "MCP_COMPOSE_CONFIG")]
    config: Option<String>,
    /// Frontend transport for clients
    #[arg(short, long, value_enum, default_value_t = FrontendTransport::Http)]
    transport: FrontendTransport,
    /// Host to bind to (overrides config)
    #[arg(short = 'H', long)]
    host: Option<String>,
    /// Port to bind to (overrides config)
    #[arg(short, long)]
    port: Option<u16>,
    /// Log filter when RUST_LOG is unset
    #[arg(short, long, default_value = "info")]
    log_level: String,
    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum FrontendTransport {
    Http,
    Stdio,
}

#[derive(Parser)]
struct TranslateArgs {
    #[command(subcommand)]
    direction: TranslateCommand,
    /// Log filter when RUST_LOG is unset
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum TranslateCommand {
    /// Launch a stdio server and expose it over SSE
    StdioToSse {
        /// Command to launch (quoted, e.g. "python server.py")
        #[arg(long)]
        command: String,
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:8900")]
        listen: String,
    },
    /// Dial an SSE endpoint and expose it on this process's stdio
    SseToStdio {
        /// SSE endpoint URL
        #[arg(long)]
        url: String,
    },
}

#[derive(Parser)]
struct CheckArgs {
    /// Configuration file path
    #[arg(short, long)]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    match Cli::parse() {
        Cli::Serve(args) => serve(args).await,
        Cli::Translate(args) => translate(args).await,
        Cli::Check(args) => check(args),
    }
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    // The stdio frontend owns stdout; keep logs off it.
    match args.transport {
        FrontendTransport::Stdio => logging::init_stderr_tracing(&args.log_level),
        FrontendTransport::Http => logging::init_tracing(&args.log_level, args.log_json),
    }

    let config_path = args
        .config
        .map(|p| shellexpand::tilde(&p).to_string())
        .map(std::path::PathBuf::from)
        .unwrap_or_else(mcp_compose::config::default_config_path);
    info!("config file: {}", config_path.display());

    let config_manager = ConfigManager::new(&config_path)?;
    let mut config = config_manager.get_config();
    if let Some(host) = args.host {
        config.http.host = host;
    }
    if let Some(port) = args.port {
        config.http.port = port;
    }

    let factory = Arc::new(StandardTransportFactory::new());
    let composer = Composer::new(config.composer.clone(), factory);

    for (name, err) in composer.bootstrap(&config).await {
        error!(server = %name, "failed to start: {}", err);
    }

    let shutdown = Arc::new(ShutdownCoordinator::new());
    let signal_waiter = shutdown.clone();
    tokio::spawn(async move {
        signal_waiter.wait_for_shutdown_signal().await;
    });

    // Config hot-reload feeds the same diff path as the admin endpoint.
    let mut config_events = config_manager.subscribe();
    let reload_composer = composer.clone();
    tokio::spawn(async move {
        while let Ok(event) = config_events.recv().await {
            match event {
                ConfigEvent::Reloaded(new_config) => {
                    info!("applying reloaded configuration");
                    if let Err(e) = reload_composer
                        .reload(new_config.servers, new_config.translators)
                        .await
                    {
                        warn!("reload failed: {}", e);
                    }
                }
                ConfigEvent::Error(e) => warn!("config reload error: {}", e),
            }
        }
    });

    match args.transport {
        FrontendTransport::Http => {
            let http = HttpServer::new(config.http.clone(), composer.clone());
            http.run(&shutdown).await?;
        }
        FrontendTransport::Stdio => {
            mcp_compose::stdio_server::serve(composer.clone(), &shutdown).await?;
        }
    }

    composer.shutdown().await;
    Ok(())
}

async fn translate(args: TranslateArgs) -> anyhow::Result<()> {
    let spec = match args.direction {
        TranslateCommand::StdioToSse { command, listen } => {
            logging::init_tracing(&args.log_level, false);
            TranslatorSpec {
                name: "bridge".to_string(),
                kind: TranslatorKind::StdioToSse,
                command: Some(command),
                args: Vec::new(),
                env: HashMap::new(),
                listen: Some(listen),
                url: None,
            }
        }
        TranslateCommand::SseToStdio { url } => {
            // This bridge speaks on stdout; logs must not.
            logging::init_stderr_tracing(&args.log_level);
            TranslatorSpec {
                name: "bridge".to_string(),
                kind: TranslatorKind::SseToStdio,
                command: None,
                args: Vec::new(),
                env: HashMap::new(),
                listen: None,
                url: Some(url),
            }
        }
    };

    let bridge = translator::build(&spec)?;
    bridge.start().await?;

    let shutdown = ShutdownCoordinator::new();
    shutdown.wait_for_shutdown_signal().await;

    bridge.stop().await?;
    Ok(())
}

fn check(args: CheckArgs) -> anyhow::Result<()> {
    let path = shellexpand::tilde(&args.config).to_string();
    let config = ConfigManager::load(&path)?;
    println!(
        "{}: ok ({} servers, {} translators)",
        path,
        config.servers.len(),
        config.translators.len()
    );
    Ok(())
}
