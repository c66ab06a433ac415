//! Data-channel protocol: control frames and the file transfer record.

pub mod control;
pub mod transfer;

pub use control::ControlMessage;
pub use transfer::{now_ms, FileTransfer, TransferDirection};
