//! Device discovery
//!
//! Scanning, scan-for-name with a deadline, and the scanned and paired
//! device sets published to observers.

mod session;

pub use session::{DiscoverySession, NameScan, ScanOutcome};
