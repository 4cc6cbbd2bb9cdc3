//! `chatline-relay` push-channel hub library.
//!
//! Exposes the hub for use in tests and embedding. The hub accepts
//! WebSocket connections, registers participants, and routes live messages
//! between the ones that are online.

pub mod config;
pub mod hub;
