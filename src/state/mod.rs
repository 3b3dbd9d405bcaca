//! Durable state: versioned JSON snapshots shared by every coordinator
//! process working out of the same state directory.

mod store;

pub use store::{JsonStore, LoadReport, Quarantined, RawSnapshot, SNAPSHOT_VERSION};
