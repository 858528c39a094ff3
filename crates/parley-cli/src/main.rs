mod config;

use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use config::{ParleyConfig, TransportKind};
use parley_agent::backend_from_config;
use parley_channels::{BridgeConfig, BridgeTransport, LoopbackTransport, Transport};
use parley_core::validate_connection_id;
use parley_gateway::{AppState, AuthConfig, GatewayServer, IngressConfig, MessageIngressPipeline};
use parley_session::{ConnectionController, ControllerConfig, SessionRegistry};
use parley_store::{CredentialStore, DocumentStore, FileCredentialStore, SqliteStore};
use parley_training::{TrainingMatchEngine, Transition};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "parley", about = "Parley: multi-tenant messaging gateway with trained auto-replies")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "parley.toml")]
    config: PathBuf,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Json,
    Pretty,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server
    Serve {
        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Inspect stored pairing credentials
    Credentials {
        #[command(subcommand)]
        action: CredentialsAction,
    },
    /// Inspect training rules
    Rules {
        #[command(subcommand)]
        action: RulesAction,
    },
}

#[derive(Subcommand)]
enum CredentialsAction {
    /// List connection ids with stored credentials
    List,
}

#[derive(Subcommand)]
enum RulesAction {
    /// Show which rule would answer `text` in a new conversation
    Check { connection_id: String, text: String },
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Json => tracing_subscriber::fmt().with_env_filter(filter).json().init(),
        LogFormat::Pretty => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("warning: failed to load .env: {e}");
        }
    }
    init_logging(cli.log_format);

    let config = ParleyConfig::load(&cli.config).await?;

    match cli.command {
        Commands::Serve { host, port } => serve(config, host, port).await?,
        Commands::Credentials { action } => match action {
            CredentialsAction::List => {
                let credentials = FileCredentialStore::new(config.credentials_dir()).await?;
                let ids = credentials.list().await?;
                if ids.is_empty() {
                    println!("No stored credentials in {}", config.credentials_dir().display());
                } else {
                    for id in &ids {
                        println!("{id}");
                    }
                    println!("\nTotal: {} connection(s)", ids.len());
                }
            }
        },
        Commands::Rules { action } => match action {
            RulesAction::Check {
                connection_id,
                text,
            } => {
                validate_connection_id(&connection_id)?;
                let store = SqliteStore::open(&config.db_path())?;
                let rules = store.list_training_rules(&connection_id).await?;
                let engine = TrainingMatchEngine::new(&rules);
                let resolution = engine.resolve(None, &text, Utc::now());
                match (resolution.transition, resolution.rule) {
                    (Transition::Activated, Some(rule)) => {
                        println!("{} (priority {}): {}", rule.id, rule.priority, rule.name);
                    }
                    _ => println!("No rule matches ({} active rule(s))", engine.ranked().len()),
                }
            }
        },
    }

    Ok(())
}

async fn serve(config: ParleyConfig, host: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    let host = host.unwrap_or_else(|| config.server.host.clone());
    let port = port.unwrap_or(config.server.port);
    info!("Starting Parley gateway on {}:{}", host, port);

    tokio::fs::create_dir_all(&config.data_dir).await.map_err(|e| {
        anyhow::anyhow!(
            "Failed to create data dir '{}': {}",
            config.data_dir.display(),
            e
        )
    })?;
    let store: Arc<dyn DocumentStore> = Arc::new(SqliteStore::open(&config.db_path())?);
    let credentials: Arc<dyn CredentialStore> =
        Arc::new(FileCredentialStore::new(config.credentials_dir()).await?);

    let transport: Arc<dyn Transport> = match config.transport.kind {
        TransportKind::Bridge => {
            info!(url = %config.transport.bridge_url, "Using bridge transport");
            Arc::new(BridgeTransport::new(
                BridgeConfig::new(config.transport.bridge_url.clone())
                    .with_send_timeout(config.send_timeout()),
            ))
        }
        TransportKind::Loopback => {
            warn!("Using loopback transport; no messages leave this process");
            Arc::new(LoopbackTransport::new().with_auto_pair())
        }
    };

    let llm = backend_from_config(config.model.clone())?;
    info!(provider = ?config.model.provider, model = %config.model.model_id, "LLM backend ready");

    let registry = Arc::new(SessionRegistry::new());
    let pipeline = MessageIngressPipeline::new(
        registry.clone(),
        store.clone(),
        llm,
        IngressConfig {
            history_window: config.ingress.history_window,
            handler_timeout: config.handler_timeout(),
            system_prompt: config.ingress.system_prompt.clone(),
        },
    );
    let controller = ConnectionController::new(
        registry,
        transport,
        credentials,
        store,
        Arc::new(pipeline.clone()),
        ControllerConfig {
            reconnect: config.reconnect,
            event_buffer: config.transport.event_buffer,
            open_timeout: config.open_timeout(),
        },
    );

    let report = controller.restore_all().await?;
    for (id, reason) in &report.failed {
        warn!(connection_id = %id, reason = %reason, "Connection not restored");
    }

    let auth_config = AuthConfig::new(config.security.api_keys.clone());
    if auth_config.is_enabled() {
        info!(keys = config.security.api_keys.len(), "API key auth enabled");
    }
    let app = GatewayServer::build(
        AppState {
            controller: controller.clone(),
            pipeline,
            restore_wait: config.restore_wait(),
        },
        auth_config,
    );

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Parley gateway listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    controller.shutdown();
    info!("Parley gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
