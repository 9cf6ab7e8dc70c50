pub mod config;
pub mod events;
pub mod map;
pub mod queue;
pub mod sync;

use std::sync::Arc;

use calsync_core::storage::database::SharedDatabase;
use calsync_core::sync::{CalendarClient, StaticToken};
use calsync_core::{Config, Database, SyncEngine};

pub type CliResult = Result<(), Box<dyn std::error::Error>>;

/// Environment variable holding the Graph access token.
pub const TOKEN_ENV: &str = "CALSYNC_GRAPH_TOKEN";

/// Commands that talk to the remote calendar need a token; local ones
/// build the engine with an empty one and never send a request.
pub enum Access {
    Remote,
    LocalOnly,
}

pub struct Session {
    pub database: SharedDatabase,
    pub engine: SyncEngine,
}

pub fn open_session(access: Access) -> Result<Session, Box<dyn std::error::Error>> {
    let config = Config::load()?;
    let token = match access {
        Access::Remote => std::env::var(TOKEN_ENV)
            .ok()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| format!("{TOKEN_ENV} is not set"))?,
        Access::LocalOnly => String::new(),
    };

    let client = CalendarClient::new(
        &config.graph.base_url,
        Arc::new(StaticToken::new(token)),
        config.sync.request_timeout(),
    )?;
    let database = Database::open()?.shared();
    let engine = SyncEngine::open(
        database.clone(),
        config.router(),
        Arc::new(client),
        config.sync.clone(),
    )?;

    Ok(Session { database, engine })
}

pub fn runtime() -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
}
