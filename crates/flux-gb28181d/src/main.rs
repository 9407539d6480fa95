use clap::Parser;
use flux_gb28181::SipServer;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod api;
mod config;
mod shutdown;

use api::{router, AppState};
use config::{ConfigLoader, LogConfig};
use shutdown::wait_for_shutdown;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// 配置文件路径
    #[arg(long, default_value = "./config/gb28181d.toml")]
    config: PathBuf,

    #[arg(long)]
    sip_bind: Option<String>,

    #[arg(long)]
    http_bind: Option<String>,

    #[arg(long)]
    log_level: Option<String>,

    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = ConfigLoader::load(&args.config)?;
    if let Some(sip_bind) = args.sip_bind {
        config.sip.bind_addr = sip_bind;
    }
    if let Some(http_bind) = args.http_bind {
        config.http.bind = http_bind;
    }
    if let Some(level) = args.log_level {
        config.log.level = level;
    }
    if args.log_json {
        config.log.json = true;
    }

    init_tracing(&config.log);

    tracing::info!(
        target: "gb28181d",
        config = %args.config.display(),
        sip_bind = %config.sip.bind_addr,
        http_bind = %config.http.bind,
        "starting flux-gb28181d"
    );

    let sip = Arc::new(SipServer::new(config.sip.clone()).await?);
    let cancel = sip.cancellation_token();

    let sip_task = sip.clone();
    tokio::spawn(async move {
        if let Err(e) = sip_task.start().await {
            tracing::error!(target: "gb28181d", "sip server stopped: {}", e);
        }
    });

    let app = router(AppState { sip: sip.clone() });

    let addr: SocketAddr = config
        .http
        .bind
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid http bind {}: {}", config.http.bind, e))?;
    tracing::info!(target: "gb28181d", "http listening on {}", addr);

    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = wait_for_shutdown() => {}
                _ = cancel.cancelled() => {}
            }
        })
        .await?;

    sip.shutdown();
    tracing::info!(target: "gb28181d", "flux-gb28181d stopped");

    Ok(())
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.level));
    let registry = tracing_subscriber::registry().with(filter);

    if log.json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
