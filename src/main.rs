use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use quota_gateway::config::Args;
use quota_gateway::governor::Governor;
use quota_gateway::handlers::router;
use quota_gateway::state::AppState;
use quota_gateway::upstream::{BackendPool, UpstreamClient, health_checker};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    let config = args.governor_config()?;
    let pool = Arc::new(BackendPool::new(&args.backends)?);
    let client = reqwest::Client::new();

    // spawn the background health checker
    tokio::spawn(health_checker(
        pool.clone(),
        client.clone(),
        Duration::from_secs(args.health_interval),
    ));

    info!(
        rpm_limit = config.rpm_limit,
        rpd_limit = config.rpd_limit,
        max_retries = config.max_retries,
        base_backoff = ?config.base_backoff,
        max_admission_wait = ?config.max_admission_wait,
        "quota governor configured"
    );

    let state = Arc::new(AppState {
        governor: Governor::new(config),
        upstream: UpstreamClient::new(client, pool, Duration::from_secs(args.request_timeout)),
    });
    let app = router(state);

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    info!(port = args.port, "gateway listening");
    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
