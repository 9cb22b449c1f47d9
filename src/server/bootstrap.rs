use crate::config::GatewayConfig;
use crate::metrics::Metrics;
use crate::server::{self, GatewayState};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// CLI arguments forwarded from `main()`.
pub struct BootstrapArgs {
    pub config_path: std::path::PathBuf,
    pub listen: Option<String>,
}

/// Gateway lifecycle: init → build state → warm pools → serve → shutdown.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    init_tracing();

    let mut config = GatewayConfig::load(&args.config_path)?;
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    let listen = config.listen.clone();

    let _metrics = Metrics::install();
    let state = GatewayState::new(config)?;

    let shutdown = Arc::new(Notify::new());
    start_refresh_loops(&state, &shutdown);

    info!("server: starting gateway, listen={}", listen);
    let proxy_handle = tokio::spawn({
        let state = state.clone();
        let shutdown = shutdown.clone();
        async move { server::run_proxy_server(&listen, state, shutdown).await }
    });

    wait_for_shutdown(&shutdown).await;

    if let Err(e) = proxy_handle.await {
        error!("server: proxy task error: {}", e);
    }
    info!("server: shutdown complete");
    Ok(())
}

fn init_tracing() {
    let (non_blocking, _guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    std::mem::forget(_guard);
}

/// Per-cluster topology refresh loops. The metadata itself is published by
/// the external poller through `SharedTopology`; these loops only fold the
/// latest snapshot into the client pools at the configured interval.
fn start_refresh_loops(state: &GatewayState, shutdown: &Arc<Notify>) {
    for cluster_cfg in &state.config.clusters {
        if !cluster_cfg.refresh.enabled {
            continue;
        }
        let Some(proxy) = state.services.proxies.get(&cluster_cfg.name).cloned() else {
            continue;
        };
        let interval = Duration::from_secs(cluster_cfg.refresh.interval.max(1));
        let cluster = cluster_cfg.name.clone();
        let shutdown = shutdown.clone();
        info!(
            "upstream: refresh enabled, cluster={}, interval={}s",
            cluster,
            interval.as_secs()
        );
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = proxy.refresh(false) {
                            error!("upstream: refresh failed, cluster={}, error={}", cluster, e);
                        }
                    }
                    _ = shutdown.notified() => break,
                }
            }
        });
    }
}

async fn wait_for_shutdown(shutdown: &Arc<Notify>) {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("server: received SIGINT"),
            _ = sigterm.recv() => info!("server: received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        info!("server: received SIGINT");
    }
    shutdown.notify_waiters();
}
