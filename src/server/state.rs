//! Shared application state and the lock taxonomy.
//!
//! Lock order, outermost first: `request_lock` -> `account_lock` -> presence
//! tables -> event inboxes -> poll-signal registry.  Most handlers take
//! `request_lock` for their whole body; the two long-poll handlers and the
//! presence heartbeat never do, so a parked poll cannot starve the rest of
//! the server.

use std::sync::Arc;

use tokio::sync::{Mutex, Notify};

use crate::auth::TokenCache;
use crate::events::{EventBus, PollSignals};
use crate::presence::Presence;
use crate::store::Store;

pub struct AppState {
    pub store: Store,
    pub tokens: TokenCache,
    pub presence: Arc<Presence>,
    pub events: Arc<EventBus>,
    pub poll_signals: Arc<PollSignals>,
    /// Broadcast to every parked messages poll on any conversation mutation.
    pub messages_signal: Notify,
    /// Outer request-serialising lock.
    pub request_lock: Mutex<()>,
    /// Guards the user database file.
    pub account_lock: Mutex<()>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(store: Store) -> Self {
        let events = Arc::new(EventBus::open(store.events_path()));
        AppState {
            store,
            tokens: TokenCache::default(),
            presence: Arc::new(Presence::default()),
            events,
            poll_signals: Arc::new(PollSignals::default()),
            messages_signal: Notify::new(),
            request_lock: Mutex::new(()),
            account_lock: Mutex::new(()),
        }
    }
}
