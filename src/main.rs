use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ignition_hub::bus::Bus;
use ignition_hub::config::{Config, ConfigOverrides};
use ignition_hub::daemon::{self, DaemonOptions};
use ignition_hub::jar::SessionSnapshot;

#[derive(Parser, Debug)]
#[command(name = "ignition-hub", version)]
struct Cli {
    /// Path to config file
    #[arg(short = 'c', long = "config")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the hub until Ctrl+C
    Serve {
        /// Listen address for the hub and its control API
        #[arg(long = "listen")]
        listen: Option<String>,
        /// Bearer token for /v1 control routes
        #[arg(long = "token")]
        token: Option<String>,
    },
    /// Write the current slot's session snapshot as JSON
    Export {
        /// Output file (stdout when omitted)
        #[arg(long = "out")]
        out: Option<PathBuf>,
    },
    /// Merge a snapshot file into the store and make its slot current
    Import { path: PathBuf },
    /// List stored cookies matching a domain in the current slot
    Cookies { domain: String },
    /// Make another slot current
    SwitchSlot { slot: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { listen, token } => {
            let cfg = Config::load_with_overrides(
                &cli.config,
                ConfigOverrides {
                    listen_addr: listen,
                    control_token: token,
                    data_dir: None,
                },
            )?;
            serve(cfg).await
        }
        Commands::Export { out } => {
            let cfg = Config::load(&cli.config)?;
            let store = daemon::open_store(&cfg, Bus::new())?;
            let snapshot = store.export_snapshot()?;
            let json = serde_json::to_string_pretty(&snapshot)?;
            match out {
                Some(path) => std::fs::write(&path, json)
                    .with_context(|| format!("write {}", path.display()))?,
                None => println!("{json}"),
            }
            Ok(())
        }
        Commands::Import { path } => {
            let cfg = Config::load(&cli.config)?;
            let data = std::fs::read_to_string(&path)
                .with_context(|| format!("read {}", path.display()))?;
            let snapshot: SessionSnapshot =
                serde_json::from_str(&data).context("parse snapshot json")?;
            let store = daemon::open_store(&cfg, Bus::new())?;
            let n = store.import_snapshot(&snapshot)?;
            println!("imported {n} cookies into slot {}", snapshot.slot_id);
            Ok(())
        }
        Commands::Cookies { domain } => {
            let cfg = Config::load(&cli.config)?;
            let store = daemon::open_store(&cfg, Bus::new())?;
            for c in store.get_cookies(&domain)? {
                println!("{}\t{}\t{}={}", c.domain, c.path, c.name, c.value);
            }
            Ok(())
        }
        Commands::SwitchSlot { slot } => {
            let cfg = Config::load(&cli.config)?;
            let store = daemon::open_store(&cfg, Bus::new())?;
            store.switch_slot(&slot)?;
            println!("current slot: {slot}");
            Ok(())
        }
    }
}

async fn serve(cfg: Config) -> Result<()> {
    let shutdown = Arc::new(tokio::sync::Notify::new());
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal.notify_waiters();
        }
    });
    daemon::run_daemon_with_shutdown(cfg, DaemonOptions::default(), shutdown).await
}
