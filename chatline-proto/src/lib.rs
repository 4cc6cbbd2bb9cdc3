//! Shared protocol definitions for `Chatline`: identities, timestamps,
//! push-channel frames, and persistence records.

pub mod codec;
pub mod frame;
pub mod message;
pub mod record;
