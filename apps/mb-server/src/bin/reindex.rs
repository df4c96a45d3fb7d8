//! Rebuild the search index from the record store. The index is eventually
//! consistent with the store; this sweep repairs any drift after an index
//! loss or mapping change.

use anyhow::{Context, Result};
use clap::Parser;
use mb_server::{config, db, search, store};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "mb-reindex", version, about = "Rebuild the search index from the store")]
struct Args {
    /// Records per bulk call.
    #[arg(long, default_value_t = 500)]
    batch_size: i64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = config::Config::from_env()?;
    let pool = db::connect_lazy(&config.database_url)?;

    let elastic = Arc::new(search::ElasticService::new(
        config.elastic_url.clone(),
        reqwest::Client::new(),
    ));
    elastic
        .ensure_index()
        .await
        .context("search index is not reachable")?;

    let mut after = None;
    let mut indexed = 0usize;
    loop {
        let records = store::page_by_id(&pool, after, args.batch_size).await?;
        let Some(last) = records.last() else {
            break;
        };
        after = Some(last.id);

        elastic
            .bulk_index(&records)
            .await
            .with_context(|| format!("bulk call failed after {indexed} records"))?;
        indexed += records.len();
        tracing::info!(indexed, "reindex progress");
    }

    tracing::info!(indexed, "reindex complete");
    Ok(())
}
