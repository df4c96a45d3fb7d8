use clap::Parser;

#[derive(Parser)]
#[command(name = "mb-server", version, about = "Strong motion record service")]
pub struct Args {
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,
    #[arg(long)]
    pub port: Option<u16>,
    #[arg(long, default_value_t = false)]
    pub print_openapi: bool,
}
