use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use judge_core::keys::RefreshOutcome;
use judge_core::telemetry::{init_tracing, parse_level};
use judge_core::{JudgeConfig, SystemClock, VERSION};
use tokio::net::TcpListener;
use tracing::{info, warn};

/// SLO judge daemon
#[derive(Parser, Debug)]
#[command(name = "judged")]
#[command(version, about, long_about = None)]
struct Args {
    /// Listen address
    #[arg(long, env = "JUDGE_BIND")]
    bind: Option<SocketAddr>,

    /// Replay backend: memory, embedded or shared
    #[arg(long, env = "JUDGE_REPLAY_BACKEND")]
    replay_backend: Option<String>,

    /// Directory for the embedded replay backend
    #[arg(long, env = "JUDGE_REPLAY_PATH")]
    replay_path: Option<PathBuf>,

    /// JSON key file
    #[arg(long, env = "JUDGE_KEYS_FILE")]
    keys_file: Option<PathBuf>,

    /// Remote key endpoint
    #[arg(long, env = "JUDGE_KEYS_URL")]
    keys_url: Option<String>,

    /// Log format
    #[arg(long, env = "JUDGE_LOG_FORMAT", value_parser = ["text", "json"])]
    log_format: Option<String>,

    /// Fallback log level when RUST_LOG is unset
    #[arg(long, env = "JUDGE_LOG_LEVEL")]
    log_level: Option<String>,
}

impl Args {
    fn apply(self, cfg: &mut JudgeConfig) {
        if let Some(bind) = self.bind {
            cfg.bind = bind;
        }
        if let Some(backend) = self.replay_backend {
            cfg.replay_backend = backend;
        }
        if let Some(path) = self.replay_path {
            cfg.replay_path = path;
        }
        if self.keys_file.is_some() {
            cfg.keys_file = self.keys_file;
        }
        if self.keys_url.is_some() {
            cfg.keys_url = self.keys_url;
        }
        if let Some(format) = self.log_format {
            cfg.log_json = format == "json";
        }
        if let Some(level) = self.log_level {
            cfg.log_level = level;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut cfg = JudgeConfig::from_env().context("reading JUDGE_* configuration")?;
    args.apply(&mut cfg);

    init_tracing(cfg.log_json, parse_level(&cfg.log_level));

    let service = cfg
        .build_service(Arc::new(SystemClock))
        .await
        .context("assembling judge service")?;

    match service.keys().refresh().await {
        RefreshOutcome::Degraded { reason } => {
            warn!(%reason, "starting with no usable signing keys; /judge will answer 503")
        }
        outcome => info!(?outcome, "signing keys loaded"),
    }
    let refresher = Arc::clone(service.keys()).spawn_refresh(Arc::clone(service.counters()));

    let listener = TcpListener::bind(cfg.bind)
        .await
        .with_context(|| format!("binding {}", cfg.bind))?;
    info!(
        addr = %cfg.bind,
        version = VERSION,
        replay_backend = %cfg.replay_backend,
        "judged listening"
    );

    let counters = Arc::clone(service.counters());
    judged::serve(listener, service, shutdown_signal())
        .await
        .context("serving http")?;

    refresher.abort();
    counters.flush();
    info!("judged stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = terminate => info!("received SIGTERM"),
    }
}
