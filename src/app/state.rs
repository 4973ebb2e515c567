//! Application state shared across routes

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::info;

use crate::config::{Config, LedgerBackendKind};
use crate::game::RoomRegistry;
use crate::matchmaking::Matchmaker;
use crate::store::{
    BackendError, LedgerBackend, MemoryBackend, ScoreLedger, SqliteBackend, SupabaseBackend,
    SupabaseClient,
};
use crate::ws::connection::Connection;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub ledger: Arc<ScoreLedger>,
    pub registry: Arc<RoomRegistry>,
    pub matchmaker: Arc<Matchmaker>,
    pub online: OnlinePlayers,
}

impl AppState {
    /// Wire the components together. The returned receiver carries room
    /// survivors and must be handed to [`Matchmaker::run`].
    pub fn new(
        config: Config,
        backend: Arc<dyn LedgerBackend>,
    ) -> (Self, mpsc::UnboundedReceiver<Connection>) {
        let config = Arc::new(config);

        let ledger = Arc::new(ScoreLedger::new(backend, config.ledger_settings()));

        let (requeue_tx, requeue_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(RoomRegistry::new(
            ledger.clone(),
            config.room_settings(),
            requeue_tx,
        ));

        let matchmaker = Arc::new(Matchmaker::new(registry.clone()));

        let state = Self {
            config,
            ledger,
            registry,
            matchmaker,
            online: OnlinePlayers::default(),
        };
        (state, requeue_rx)
    }
}

/// Open the persistence backend selected by the configuration
pub fn open_backend(config: &Config) -> Result<Arc<dyn LedgerBackend>, BackendError> {
    let backend: Arc<dyn LedgerBackend> = match config.ledger_backend {
        LedgerBackendKind::Sqlite => Arc::new(SqliteBackend::open(&config.database_path)?),
        LedgerBackendKind::Supabase => {
            let url = config.supabase_url.as_deref().unwrap_or_default();
            let key = config.supabase_service_role_key.as_deref().unwrap_or_default();
            Arc::new(SupabaseBackend::new(SupabaseClient::new(url, key)))
        }
        LedgerBackendKind::Memory => Arc::new(MemoryBackend::new()),
    };
    info!(backend = backend.name(), "Ledger backend ready");
    Ok(backend)
}

/// Player names with a live socket
#[derive(Clone, Default)]
pub struct OnlinePlayers {
    players: Arc<DashMap<String, ()>>,
}

impl OnlinePlayers {
    /// Mark a player online; `None` if it already is
    pub fn claim(&self, player: &str) -> Option<OnlineGuard> {
        use dashmap::mapref::entry::Entry;

        match self.players.entry(player.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(());
                Some(OnlineGuard {
                    players: self.players.clone(),
                    player: player.to_string(),
                })
            }
        }
    }

    pub fn count(&self) -> usize {
        self.players.len()
    }
}

/// Keeps a player marked online until dropped
pub struct OnlineGuard {
    players: Arc<DashMap<String, ()>>,
    player: String,
}

impl Drop for OnlineGuard {
    fn drop(&mut self) {
        self.players.remove(&self.player);
    }
}
