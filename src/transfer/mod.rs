//! Socket-to-frame bridge for a live terminal connection

mod channel;

pub use channel::{ChannelConfig, ChannelEnd, TransferChannel, TransferEvent};
