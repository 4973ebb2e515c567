//! WebSocket transport: wire protocol, connections and socket pumps

pub mod connection;
pub mod handler;
pub mod protocol;
pub mod pump;
