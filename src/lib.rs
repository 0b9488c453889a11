//! Shared real-time pixel canvas served over WebSocket.
//!
//! Every connected client can paint pixels on one in-memory RGB grid; each
//! accepted change is broadcast to all clients, the painter included.

pub mod broadcast;
pub mod canvas;
pub mod constants;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod registry;
pub mod socket;
pub mod state;
