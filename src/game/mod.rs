//! Rooms and the registry that owns them

pub mod registry;
pub mod room;

pub use registry::RoomRegistry;
pub use room::RoomSettings;
