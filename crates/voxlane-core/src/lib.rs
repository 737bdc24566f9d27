//! Core types, config, errors, and wire protocol for Voxlane.

pub mod config;
pub mod error;
pub mod metrics;
pub mod preferences;
pub mod protocol;
pub mod types;
