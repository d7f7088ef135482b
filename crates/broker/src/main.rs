use anyhow::Context;
use livesync_broker::config::LogFormat;
use livesync_broker::{create_router, AppState, Config};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_LOG_FILTER: &str = "livesync_broker=info,tower_http=info";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::from_env().context("invalid broker configuration")?;
    init_tracing(config.log_format);

    let state = AppState::from_config(&config).context("failed to build identity verifier")?;
    let app = create_router(state);

    let listener = TcpListener::bind(&config.bind_address)
        .await
        .with_context(|| format!("failed to bind broker listener on {}", config.bind_address))?;

    info!(
        listen_addr = %config.bind_address,
        queue_capacity = config.live.queue_capacity,
        keepalive_secs = config.live.keepalive_interval.as_secs(),
        idle_timeout_secs = config.live.idle_timeout.as_secs(),
        publish_endpoint = config.publish_secret.is_some(),
        "starting live sync broker"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("broker exited unexpectedly")
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}
