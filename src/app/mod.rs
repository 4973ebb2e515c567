//! Application wiring

pub mod state;

pub use state::{open_backend, AppState, OnlineGuard};
