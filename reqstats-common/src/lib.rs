//! Reqstats Common - Shared stats types and configuration

pub mod config;
pub mod stats;

pub use config::*;
pub use stats::*;
