//! Peer-to-peer session engine: perfect negotiation over a relay, media
//! fan-out to every connected peer, and a control channel that carries
//! messages and chunked file transfers.

pub mod core;
pub mod utils;

pub use crate::core::engine::Engine;
pub use crate::core::error::EngineError;
pub use crate::core::events::EngineEvent;
