pub mod aggregator;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod events;
pub mod media;
pub mod negotiation;
pub mod pipeline;
pub mod protocol;
pub mod session;
pub mod signaling;
pub mod types;
