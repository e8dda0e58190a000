use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dregsy::sync::{config, Sync};

/// Continuously synchronize container images between Docker/OCI registries.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the sync configuration file
    #[arg(long)]
    config: PathBuf,

    /// Only run tasks whose name matches this expression
    #[arg(long, default_value = "")]
    task_filter: String,

    /// Log what would be synced without copying anything
    #[arg(long)]
    dry_run: bool,
}

fn init_logging() {
    let level = match std::env::var("LOG_LEVEL")
        .unwrap_or_default()
        .to_lowercase()
        .as_str()
    {
        // tracing has no levels above error
        "panic" | "fatal" | "error" => "error",
        "warn" => "warn",
        "debug" => "debug",
        "trace" => "trace",
        "info" | "" => "info",
        other => {
            eprintln!(
                "invalid log level: '{}'; valid levels are: panic, fatal, error, \
                 warn, info, debug, trace",
                other
            );
            "info"
        }
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let with_methods = std::env::var("LOG_METHODS")
        .map(|v| v.to_lowercase() == "true")
        .unwrap_or(false);
    let force_colors = std::env::var("LOG_FORCE_COLORS")
        .map(|v| v.to_lowercase() == "true")
        .unwrap_or(false);

    let format = std::env::var("LOG_FORMAT").unwrap_or_default().to_lowercase();
    match format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_file(with_methods)
                        .with_line_number(with_methods),
                )
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(force_colors || atty())
                        .with_file(with_methods)
                        .with_line_number(with_methods),
                )
                .init();
            if !format.is_empty() && format != "text" {
                error!("invalid log format: '{}'", format);
            }
        }
    }
}

fn atty() -> bool {
    use std::io::IsTerminal;
    std::io::stdout().is_terminal()
}

async fn run(cli: &Cli) -> Result<()> {
    loop {
        let mut conf = config::load_config(&cli.config)?;

        let mut sync = Sync::new(&conf, cli.dry_run)?;
        let res = sync.sync_from_config(&mut conf, &cli.task_filter).await;
        sync.dispose().await;

        if res? {
            info!("restarting with updated configuration");
        } else {
            return Ok(());
        }
    }
}

#[tokio::main]
async fn main() {
    init_logging();

    let cli = Cli::parse();
    info!("dregsy {}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run(&cli).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}
