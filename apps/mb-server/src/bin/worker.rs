use anyhow::Result;
use mb_server::{config, db, jobs, search};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = config::Config::from_env()?;
    let pool = db::connect_lazy(&config.database_url)?;
    db::ensure_schema(&pool).await?;

    let http = reqwest::Client::new();
    let elastic = Arc::new(search::ElasticService::new(
        config.elastic_url.clone(),
        http.clone(),
    ));
    if let Err(err) = elastic.ensure_index().await {
        tracing::warn!(error = format!("{err:#}"), "search index not ready yet");
    }

    let dispatcher = Arc::new(jobs::JobDispatcher::new(
        pool,
        config,
        elastic,
        http,
    ));

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_cancel.cancel();
        }
    });

    jobs::worker::Worker::new(dispatcher).run(cancel).await
}
