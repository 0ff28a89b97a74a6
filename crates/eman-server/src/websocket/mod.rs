//! WebSocket connection management, group fan-out and session I/O.

pub mod connection;
pub mod groups;
pub mod session;
