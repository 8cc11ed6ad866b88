//! Inspector configuration
//!
//! This module defines configuration types and default values:
//! - `inspector_config`: Configuration structure and file loading
//! - `defaults`: Default configuration values

pub mod defaults;
pub mod inspector_config;

// Re-export configuration types
pub use inspector_config::InspectorConfig;
