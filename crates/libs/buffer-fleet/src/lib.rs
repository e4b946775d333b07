//! Fleet-wide admission, eviction, aggregate telemetry, and auto-tuning
//! over many [`callcore::buffer::FastStreamBuffer`]s.

pub mod error;
pub mod manager;

pub use error::{FleetError, FleetResult};
pub use manager::{AggregateStats, BufferManager, FleetConfig, FleetEntry};
