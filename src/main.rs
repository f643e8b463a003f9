use argo_gateway::config::config_search_paths;
use argo_gateway::{build_router, AppState, GatewayConfig};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_LEAK_LOG: &str = "argo-gateway-leaks.jsonl";

/// Refreshing more often than this only hammers the model list endpoint.
const MIN_REFRESH_SECS: u64 = 60;

#[derive(Parser)]
#[command(
    name = "argo-gateway",
    about = "OpenAI-compatible gateway for the Argo chat API",
    version
)]
struct Cli {
    /// Path to config file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Upstream user (overrides config)
    #[arg(long)]
    user: Option<String>,

    /// Relay the upstream text stream instead of pseudo-streaming
    #[arg(long)]
    real_stream: bool,

    /// Leaked tool-call diagnostics file (JSONL)
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Print config search paths and exit
    #[arg(long)]
    show_config_paths: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "argo_gateway=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if cli.show_config_paths {
        println!("Config search paths:");
        for (i, path) in config_search_paths().iter().enumerate() {
            println!("  {}. {}", i + 1, path.display());
        }
        return Ok(());
    }

    let mut config = GatewayConfig::find_and_load(cli.config.as_deref())?;

    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(user) = cli.user {
        config.user = user;
    }
    if cli.real_stream {
        config.streaming.real_stream = true;
    }
    let log_file = cli
        .log_file
        .or_else(|| config.leaked_tools.log_path.take())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_LEAK_LOG));
    config.leaked_tools.log_path = Some(log_file.clone());

    // CLI overrides can break what the file validated
    config.validate()?;

    info!("╔═══════════════════════════════════════════════════════╗");
    info!("║           argo-gateway v{}                         ║", env!("CARGO_PKG_VERSION"));
    info!("╚═══════════════════════════════════════════════════════╝");
    info!("  User:        {}", config.user);
    info!("  Chat URL:    {}", config.upstream.chat_url);
    info!("  Stream URL:  {}", config.upstream.stream_url);
    info!(
        "  Streaming:   {}",
        if config.streaming.real_stream { "real" } else { "pseudo" }
    );
    info!(
        "  Leak fix:    {}",
        if config.leaked_tools.enabled { "enabled" } else { "log only" }
    );
    info!("  Port:        {}", config.port);
    info!("  Overrides:   {} model aliases", config.models.len());
    info!("  Leak log:    {}", log_file.display());

    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(config.upstream.connect_timeout_secs))
        .build()?;

    let state = Arc::new(AppState::new(config.clone(), client.clone())?);

    if let Some(url) = config.upstream.models_url.clone() {
        let registry = state.registry.clone();
        let every = Duration::from_secs(config.upstream.models_refresh_secs.max(MIN_REFRESH_SECS));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                if let Err(e) = registry.refresh_from(&client, &url).await {
                    tracing::warn!(error = %e, url = %url, "Model registry refresh failed");
                }
            }
        });
    }

    let app = build_router(state);
    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    info!("Listening on http://{}", bind_addr);
    info!("");
    info!("  Point an OpenAI client at it:");
    info!("    OPENAI_BASE_URL=http://localhost:{}/v1", config.port);
    info!("");

    axum::serve(listener, app).await?;

    Ok(())
}
