//! # Caseflow Common Library
//!
//! Shared code for the Caseflow crates including:
//! - Case record model types
//! - Database initialization and schema
//! - Configuration loading and root folder resolution
//! - Error types
//! - Timestamp helpers

pub mod config;
pub mod db;
pub mod error;
pub mod time;

pub use error::{Error, Result};
