use anyhow::Result;
use clap::Parser;

use nurse_injector::{CliArgs, run};

fn main() -> Result<()> {
    let cli_args = CliArgs::parse();
    tracing_subscriber::fmt()
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .with_level(true)
        .with_max_level(match cli_args.verbose {
            0 => tracing::Level::INFO,
            1 => tracing::Level::DEBUG,
            _ => tracing::Level::TRACE,
        })
        .init();

    run(&cli_args)
}
