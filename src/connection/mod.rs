//! Connection management for the terminal link
//!
//! This module handles:
//! - The connection state and its transitions
//! - Scan-then-connect sequencing and superseding connections
//! - Command/reply exchange over the live channel
//! - The streams observers subscribe to

mod manager;
mod surface;

pub use manager::{ConnectionManager, LinkConfig};
