//! Database module for the signal monitor.
//!
//! Provides SQLite storage with embedded migrations: sources, channel status
//! records, the outage ledger, notification destinations and settings.

mod ledger;
mod models;
mod store;

pub use models::*;
pub use store::*;

#[cfg(test)]
pub(crate) use store::tests::{sample_source, temp_store};
