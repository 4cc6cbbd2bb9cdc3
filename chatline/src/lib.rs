//! `Chatline`: conversation synchronization core with optimistic delivery.
//!
//! Keeps the messages shown for one active conversation consistent with a
//! persistence service (history and writes) and a push channel (live
//! messages), inserting outgoing messages optimistically and reconciling them
//! with the write outcome.

pub mod channel;
pub mod config;
pub mod history;
pub mod inbox;
pub mod message;
pub mod outbound;
pub mod persistence;
pub mod render;
pub mod session;
pub mod store;
