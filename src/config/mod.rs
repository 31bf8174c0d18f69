//! Configuration Module
//!
//! Handles configuration loading, validation, and management.

pub mod manager;
pub mod types;

pub use manager::{parse_interval, AgentOverrides, ConfigManager, ServerOverrides};
pub use types::*;
