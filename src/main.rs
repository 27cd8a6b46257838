use claude_bridge::config::config_search_paths;
use claude_bridge::{build_router, AppState, BridgeConfig, HttpTransport, SharedEventLog};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "claude-bridge",
    about = "Serve the Anthropic Messages API on top of any OpenAI-compatible provider",
    version
)]
struct Cli {
    /// Path to config file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to bind (overrides config and HOST)
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on (overrides config and PORT)
    #[arg(short, long)]
    port: Option<u16>,

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
                .unwrap_or_else(|_| "claude_bridge=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if cli.show_config_paths {
        println!("Config search paths (first match wins):");
        for (i, path) in config_search_paths().iter().enumerate() {
            println!("  {}. {}", i + 1, path.display());
        }
        return Ok(());
    }

    let mut config = BridgeConfig::find_and_load(cli.config.as_deref())?;
    config.apply_env();
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }

    let base_url = config.effective_base_url()?;
    let event_log = SharedEventLog::open(&config.event_log)?;

    info!("claude-bridge v{}", env!("CARGO_PKG_VERSION"));
    info!("  Upstream:  {}", base_url);
    info!(
        "  Models:    big={} middle={} small={} vision={}",
        config.models.big,
        config.models.middle(),
        config.models.small,
        config.models.vision
    );
    info!(
        "  Tokens:    min={} max={} context={}",
        config.limits.min_tokens, config.limits.max_tokens, config.limits.context.default
    );
    info!(
        "  Timeouts:  request={}s idle={}s retries={}",
        config.request_timeout().as_secs(),
        config.stream_idle_timeout().as_secs(),
        config.upstream.max_retries
    );
    info!("  Event log: {}", config.event_log.path.display());

    // Per-attempt deadlines are enforced by the upstream client
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()?;
    let transport = HttpTransport::from_config(&config, client)?;

    let bind_addr = format!("{}:{}", config.host, config.port);
    let state = Arc::new(AppState::new(config, transport, event_log));
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    info!("Listening on http://{}", bind_addr);
    info!("  ANTHROPIC_BASE_URL=http://localhost:{} claude", listener.local_addr()?.port());

    axum::serve(listener, app).await?;

    Ok(())
}
