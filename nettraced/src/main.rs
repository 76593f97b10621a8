use std::sync::Arc;

use clap::Parser;
use nettraced::api::{self, AppState};
use nettraced::clock::KernelClock;
use nettraced::config::Config;
use nettraced::probes::ProbeRegistry;
use nettraced::registry::TaskRegistry;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "nettraced", about = "Linux network-tracing daemon")]
struct Args {
    /// Path to configuration file.
    #[arg(short, long, default_value = "/etc/nettraced/config.toml")]
    config: String,
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config_path = std::env::var("NETTRACED_CONFIG").unwrap_or(args.config);
    let config = Config::load_file(&config_path);
    init_logging(&config.logging.level);

    tracing::info!(path = %config_path, "loaded configuration");

    let registry = Arc::new(TaskRegistry::new(
        Arc::new(ProbeRegistry::default()),
        Arc::new(KernelClock::new()),
    ));

    let app = api::router(Arc::new(AppState {
        registry: Arc::clone(&registry),
    }));

    let bind_addr = format!("{}:{}", config.api.host, config.api.port);
    let listener = TcpListener::bind(&bind_addr).await?;
    tracing::info!(%bind_addr, "API service listening");

    let server = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            tracing::error!(%err, "HTTP server error");
        }
    });

    wait_for_shutdown_signal().await;
    tracing::info!("gracefully shutting down");
    registry.shutdown();
    server.abort();

    Ok(())
}

/// Blocks until SIGINT or SIGTERM; ignores a second signal during shutdown
/// by simply not installing a second listener.
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::warn!(%err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
