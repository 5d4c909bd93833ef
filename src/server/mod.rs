//! v3kn server: HTTP adapter over the account, social, and storage engines.
//!
//! One request task per connection on the tokio pool; the presence sweeper is
//! the only long-lived background task.  See `state` for the lock taxonomy.

pub mod config;
pub mod handlers;
pub mod router;
pub mod state;
pub mod utils;

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;

use crate::presence;
use crate::store::Store;
use crate::vlog;

use config::{Cli, Config};
use state::{AppState, SharedState};

/// Entry point: parse CLI, seed the token cache, start the sweeper and serve.
pub async fn run() {
    let cli = Cli::parse();
    let config = Config::from_cli_and_env(cli);

    crate::logging::init(&config.data_dir);

    let store = Store::new(config.data_dir.clone());
    let state: SharedState = Arc::new(AppState::new(store));

    // Pre-load the token cache from the persisted index.
    match state.store.load_users() {
        Ok(db) => {
            let count = state.tokens.seed(&db.tokens);
            vlog!("Loaded {count} tokens into cache");
        }
        Err(e) => vlog!("Failed to load user database at startup: {e}"),
    }

    tokio::spawn(presence::sweeper_loop(
        Arc::clone(&state.presence),
        Arc::clone(&state.events),
    ));

    let app = router::build_router(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("failed to bind");
    vlog!("v3kn server running on {}", config.bind_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .expect("server error");
}
