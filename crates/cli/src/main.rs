mod cli;
mod client;
mod commands;
mod terminal;

use clap::Parser;

use crate::cli::CliArgs;
use crate::terminal::Terminal;

#[tokio::main]
async fn main() {
    grab_core::config::load_dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = CliArgs::parse();
    let terminal = Terminal::new();

    if let Err(e) = commands::run(args, &terminal).await {
        terminal.print_error(&format!("{e:#}"));
        std::process::exit(1);
    }
}
