//! Configuration module for the kiln cooker
//!
//! Provides types and parsing for `kiln.toml` project configuration.

pub mod loader;
pub mod schema;

pub use loader::*;
pub use schema::*;
