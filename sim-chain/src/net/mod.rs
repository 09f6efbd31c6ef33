//! Gossip transport: wire messages and the TCP framing/flood layer.

pub mod message;
pub mod transport;

pub use message::{Message, ScoreSummary};
pub use transport::{read_frame, write_frame, Transport};
