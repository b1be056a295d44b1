//! cube-core — shared types for the Cube gateway: configuration and the
//! routing envelope. All other Cube crates depend on this one.

pub mod config;
pub mod envelope;

pub use envelope::{DirectorRecord, Envelope, Inbound, PerformerRecord};
