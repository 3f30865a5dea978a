//! Rusty Signal - A WebRTC signaling relay implemented in Rust
//!
//! Clients connect over WebSocket, join named rooms, and exchange offers,
//! answers and ICE candidates with the other members of their room. The
//! relay routes messages and tracks membership; it never reads payloads.

pub mod auth;
pub mod config;
pub mod constants;
pub mod core;
pub mod error;
pub mod handlers;

// Re-export main components
pub use config::*;
pub use constants::*;
