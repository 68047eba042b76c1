//! Configuration module for transcoderd
//!
//! Handles loading daemon configuration from TOML files and environment variable overrides.

pub mod config;

pub use config::*;
