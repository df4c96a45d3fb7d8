use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "mbctl", version, about = "Strong motion record service client")]
pub struct Cli {
    /// Server base URL.
    #[arg(long, global = true, default_value = "http://localhost:8000")]
    pub host: String,
    #[arg(long, global = true)]
    pub username: Option<String>,
    #[arg(long, global = true)]
    pub password: Option<String>,
    /// Upper bound on in-flight requests.
    #[arg(long, global = true, default_value_t = 10)]
    pub concurrency: usize,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    Upload(UploadArgs),
    Download(DownloadArgs),
    Search(SearchArgs),
    RetrieveAll(SearchArgs),
    Status(StatusArgs),
    Jackpot,
}

#[derive(Args)]
pub struct UploadArgs {
    /// Target region, `jp` or `nz`.
    #[arg(long)]
    pub region: String,
    /// Archive file or directory to walk.
    pub path: PathBuf,
    #[arg(long, default_value_t = false)]
    pub wait_for_result: bool,
    #[arg(long, default_value_t = true)]
    pub overwrite_existing: bool,
    /// Keep polling the returned tasks until they finish.
    #[arg(long, default_value_t = false)]
    pub watch: bool,
}

#[derive(Args)]
pub struct DownloadArgs {
    /// Record ids.
    pub records: Vec<String>,
}

#[derive(Args)]
pub struct SearchArgs {
    /// Query config as a JSON document.
    #[arg(long, default_value = "{}")]
    pub query: String,
}

#[derive(Args)]
pub struct StatusArgs {
    /// Task ids to poll.
    pub tasks: Vec<String>,
}
