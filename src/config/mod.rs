//! Configuration
//!
//! Shared types, the host configuration file, and per-instance parameters.

pub mod host;
pub mod params;
pub mod types;
