//! Threshold gating, descriptions and thumbnails for detected changes.
pub mod description;
pub mod gate;
pub mod thumbnail;

pub use description::{ChatDescriptionService, DescriptionError, DescriptionService, is_no_significant_change};
pub use gate::{AlertGate, AlertVerdict, GateSettings};
