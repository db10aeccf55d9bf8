//! port-forwarder command line entry point

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;

use port_forwarder::config::{ConfigStorage, ConnectionStore};
use port_forwarder::notify::TracingNotifier;
use port_forwarder::process::{BinaryPaths, SystemSupervisor};
use port_forwarder::{init_logging, ForwarderError, ManagerOptions, PortForwardManager};

#[derive(Parser)]
#[command(name = "port-forwarder", version, about)]
struct Cli {
    /// Config file (defaults to ~/.port-forwarder/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Clone, Copy)]
enum Command {
    /// Start all enabled connections and keep them healthy until Ctrl-C
    ///
    /// This is the default; without an explicit subcommand it only runs
    /// when `auto_start` is set in the config.
    Run,
    /// Print the configured connections
    List,
    /// Force-kill every kubectl port-forward and socat process, then exit
    KillStuck,
}

#[tokio::main]
async fn main() -> Result<(), ForwarderError> {
    init_logging();
    let cli = Cli::parse();

    let storage = match cli.config {
        Some(path) => ConfigStorage::with_path(path),
        None => ConfigStorage::new()?,
    };
    let file = storage.load_file().await?;

    let command = match cli.command {
        Some(command) => command,
        None if file.settings.auto_start => Command::Run,
        None => {
            info!("auto_start is disabled in {}, use `port-forwarder run`", storage.path().display());
            return Ok(());
        }
    };

    if let Command::List = command {
        for c in &file.connections {
            println!(
                "{}  {:<20} {}/{} {}:{}{}{}",
                c.id,
                c.name,
                c.namespace,
                c.resource,
                c.local_port,
                c.remote_port,
                c.proxy_port
                    .map(|p| format!(" proxy:{}", p))
                    .unwrap_or_default(),
                if c.is_enabled { "" } else { " (disabled)" },
            );
        }
        return Ok(());
    }

    let supervisor = Arc::new(SystemSupervisor::new(BinaryPaths::from(&file.settings)));
    let store: Arc<dyn ConnectionStore> = Arc::new(storage);
    let manager = PortForwardManager::load(
        supervisor,
        store,
        Arc::new(TracingNotifier),
        ManagerOptions::from(&file.settings),
    )
    .await;

    match command {
        Command::KillStuck => {
            manager.kill_stuck_processes().await;
        }
        Command::Run => {
            manager.start_all();
            info!("Press Ctrl+C to stop");
            tokio::signal::ctrl_c().await?;

            info!("Shutting down, stopping {} connection(s)", manager.connections().len());
            manager.shutdown().await;
        }
        Command::List => {}
    }

    Ok(())
}
