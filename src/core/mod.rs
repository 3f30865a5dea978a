//! Core functionality for the signaling relay

pub mod broadcast;
pub mod clients;
pub mod dispatcher;
pub mod envelope;
pub mod room;
pub mod server;
pub mod session;

// Re-export main components for convenience
pub use broadcast::{BroadcastEngine, BroadcastStats, Recipients};
pub use clients::ClientRegistry;
pub use dispatcher::Dispatcher;
pub use envelope::{Envelope, MessageKind, RoomId, UserId};
pub use room::{Room, RoomInfo, RoomRegistry};
pub use server::{ServerManager, SharedServerManager};
pub use session::{Frame, Session};
