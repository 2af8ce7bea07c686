//! Playdeck Web
//!
//! Thin HTTP boundary over the run controller, plus a WebSocket feed of run
//! events.

pub mod server;

pub use server::{router, serve, ApiError};
