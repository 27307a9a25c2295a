use std::path::PathBuf;

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::info;

use wxgate::agent::{config::Config, snapshot};
use wxgate::comms::local_api;
use wxgate::utils;

#[derive(Parser)]
#[command(name = "wxgate", version, about = "WeChat callback gateway and credential cache")]
struct AppCli {
    /// Verbose logging (ignored when RUST_LOG is set)
    #[arg(long, global = true)]
    debug: bool,

    /// Config file path
    #[arg(short, long, default_value = "config.json", global = true)]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the callback server
    Serve {
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
    /// Print the live entries of a credential snapshot
    Snapshot {
        /// Snapshot file; defaults to the config's cache_file
        #[arg(long)]
        file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = AppCli::parse();
    utils::logging::init(args.debug);

    match args.command {
        Commands::Serve { port } => {
            info!("Starting callback server on port {port}");
            let config = Config::from_file(&args.config)?;
            local_api::serve(config, port).await?;
        }
        Commands::Snapshot { file } => {
            let path = match file {
                Some(path) => path,
                None => PathBuf::from(Config::from_file(&args.config)?.cache_file),
            };
            let data = snapshot::read(&path)?;
            for (namespace, entry) in snapshot::live_entries(&data, Utc::now().timestamp()) {
                println!(
                    "{namespace}\t{}\t{}s remaining",
                    entry.key, entry.remaining_secs
                );
            }
        }
    }

    Ok(())
}
