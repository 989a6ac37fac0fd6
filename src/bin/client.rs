use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use powgate::client::{fetch_quote, Solver, DEFAULT_WORKERS};

#[derive(Parser)]
#[command(name = "powgate-client", about = "Fetch one quote from a powgate server", version)]
struct Cli {
    /// Server address
    #[arg(default_value = "127.0.0.1:8080")]
    addr: String,

    /// Solver worker threads; 0 uses every core
    #[arg(short, long, default_value_t = DEFAULT_WORKERS)]
    workers: usize,

    /// Puzzle search deadline in seconds
    #[arg(long, default_value_t = 30)]
    timeout: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "powgate=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let solver = Solver::new(cli.workers, Duration::from_secs(cli.timeout));

    let quote = fetch_quote(&cli.addr, &solver).await?;
    println!("{quote}");

    Ok(())
}
