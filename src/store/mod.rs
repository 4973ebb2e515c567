//! Score ledger and its persistence backends

pub mod backend;
pub mod ledger;
pub mod memory;
pub mod sqlite;
pub mod supabase;

pub use backend::{BackendError, CommitOutcome, LedgerBackend, Player, ScoreRecord};
pub use ledger::{LedgerError, LedgerSettings, ScoreLedger, UnresolvedMatch};
pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;
pub use supabase::{SupabaseBackend, SupabaseClient};
