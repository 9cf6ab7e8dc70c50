use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "calsync", version, about = "Sync local events to remote calendars")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run sync rounds and show sync status
    Sync {
        #[command(subcommand)]
        action: commands::sync::SyncAction,
    },
    /// Inspect the outbox and manage dead letters
    Queue {
        #[command(subcommand)]
        action: commands::queue::QueueAction,
    },
    /// Local events
    Events {
        #[command(subcommand)]
        action: commands::events::EventsAction,
    },
    /// Category to calendar mappings
    Map {
        #[command(subcommand)]
        action: commands::map::MapAction,
    },
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: commands::config::ConfigAction,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("CALSYNC_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    init_logging();
    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Sync { action } => commands::sync::run(action),
        Commands::Queue { action } => commands::queue::run(action),
        Commands::Events { action } => commands::events::run(action),
        Commands::Map { action } => commands::map::run(action),
        Commands::Config { action } => commands::config::run(action),
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
