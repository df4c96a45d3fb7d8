mod cli;
mod client;

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;

use crate::cli::{Cli, Commands};
use crate::client::MbClient;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let mut client = MbClient::new(&args.host, args.concurrency);
    client.connect().await?;
    if let (Some(username), Some(password)) = (&args.username, &args.password) {
        client.login(username, password).await?;
    }
    let client = Arc::new(client);

    match args.command {
        Commands::Upload(upload) => {
            let records = client
                .upload(
                    &upload.region,
                    &upload.path,
                    upload.wait_for_result,
                    upload.overwrite_existing,
                )
                .await?;
            for record in &records {
                println!("{record}");
            }
            let tasks = client.pending_tasks().await;
            if upload.watch && !tasks.is_empty() {
                client.watch_tasks(&tasks).await?;
            } else {
                for task in tasks {
                    println!("task {task}");
                }
            }
        }
        Commands::Download(download) => {
            let records = client.download(&download.records).await?;
            println!("Downloaded {} records.", records.len());
            for record in &records {
                let samples = record.waveform.as_ref().map(Vec::len).unwrap_or(0);
                println!(
                    "{} {} ({samples} samples)",
                    record.id,
                    record.file_name.as_deref().unwrap_or("-"),
                );
            }
        }
        Commands::Search(search) => {
            let query = serde_json::from_str(&search.query).context("invalid query JSON")?;
            for record in client.search(&query).await? {
                println!("{record}");
            }
        }
        Commands::RetrieveAll(search) => {
            let query = serde_json::from_str(&search.query).context("invalid query JSON")?;
            let records = client.retrieve_all(&query).await?;
            println!("Retrieved {} records.", records.len());
            for record in &records {
                println!("{record}");
            }
        }
        Commands::Status(status) => {
            client.watch_tasks(&status.tasks).await?;
        }
        Commands::Jackpot => {
            let record = client.jackpot().await?;
            let samples = record.waveform.as_ref().map(Vec::len).unwrap_or(0);
            println!(
                "{} {} ({samples} samples at {} s)",
                record.id,
                record.file_name.as_deref().unwrap_or("-"),
                record.time_interval.unwrap_or(0.0),
            );
        }
    }

    Ok(())
}
