//! File transfer pipelines: chunked, flow-controlled sending and ordered
//! reassembly on the receiving side.

pub mod receiver;
pub mod sender;

pub use receiver::{IncomingTransfer, ReceiveProgress};
pub use sender::{FileSource, OutgoingStream};
