//! ListRust Common - Shared types and utilities
//!
//! This crate provides common types, configuration, and utilities
//! shared across all ListRust components.

pub mod config;
pub mod error;
pub mod types;

pub use self::config::Config;
pub use self::error::{Error, ErrorCategory, Result};
