use std::net::SocketAddr;
use std::time::Duration;

use favkit::config::Config;
use favkit::{cache, metrics, ratelimit, router, AppState};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio_util::sync::CancellationToken;

const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("favkit={level},tower_http=warn", level = config.log_level).into()
            }),
        )
        .init();

    let prometheus = PrometheusBuilder::new().install_recorder()?;
    metrics::describe();

    let mut state = AppState::new(config.clone())?;
    state.prometheus = Some(prometheus);
    state.cache.ensure_dirs().await?;

    let shutdown = CancellationToken::new();

    if !config.janitor_interval.is_zero() {
        tokio::spawn(cache::janitor::run(
            config.cache_dir.clone(),
            config.janitor_interval,
            config.cache_ttl,
            config.max_cache_bytes,
            shutdown.child_token(),
        ));
    }

    if let Some(limiter) = state.limiter.clone() {
        tracing::info!(
            global = config.rate_limit,
            per_ip = config.ip_rate_limit,
            "rate limiting enabled"
        );
        tokio::spawn(ratelimit::Limiter::run_sweeper(
            limiter,
            shutdown.child_token(),
        ));
    } else {
        tracing::info!("rate limiting disabled");
    }

    let addr = config.resolve_listen_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(
        %addr,
        cache_dir = %config.cache_dir.display(),
        ttl_secs = config.cache_ttl.as_secs(),
        "favicon service listening"
    );

    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();
    let drain = shutdown.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(drain.cancelled_owned())
            .await
    });

    shutdown_signal().await;
    tracing::info!("shutting down gracefully");
    // Stop the janitor and limiter sweeper, then start draining HTTP.
    shutdown.cancel();

    match tokio::time::timeout(SHUTDOWN_DRAIN, server).await {
        Ok(joined) => joined??,
        Err(_) => tracing::warn!("drain deadline exceeded, aborting in-flight requests"),
    }

    tracing::info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
