//! Strata Core - Foundational Types
//!
//! This crate provides the types shared by every strata component:
//! the structured build error and the platform directory table.

pub mod error;
pub mod paths;

// Re-export commonly used types
pub use error::{Result, StrataError};
pub use paths::{cache_home, config_home};

/// Strata version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
