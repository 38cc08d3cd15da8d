#![deny(clippy::all)]

use clap::Parser;
use color_eyre::{eyre::eyre, Result};

mod cli;
mod dispatch;

use cli::XeCli;
use dispatch::dispatch_command;

fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = XeCli::parse();
    init_tracing(cli.trace, cli.verbose);
    dispatch_command(&cli.command).map_err(|err| eyre!("{err:#}"))
}

fn init_tracing(trace: bool, verbose: u8) {
    let level = if trace {
        "trace"
    } else {
        match verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    };

    let filter = format!("xe={level},xe_cli={level},xe_core={level},xe_domain={level}");
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .with_writer(std::io::stderr)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
