//! Configuration loading and schema definitions for fleet.
//!
//! This module provides types and functions for loading fleet configuration
//! from TOML files or strings. Loading only checks the shape of the file;
//! [`Config::validate`] checks the values and is run by the scheduler before
//! any device work starts.

pub mod schema;

pub use schema::*;

use std::path::Path;

use anyhow::{Context, Result};

/// Errors raised by configuration validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A value is out of range or inconsistent with another.
    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: String, reason: String },

    /// A test matcher pattern is not a valid regex.
    #[error("Invalid test pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// Two devices share a serial.
    #[error("Duplicate device serial: {0}")]
    DuplicateSerial(String),
}

impl ConfigError {
    pub fn invalid(field: &str, reason: &str) -> Self {
        ConfigError::Invalid {
            field: field.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Loads fleet configuration from a TOML file.
///
/// Values are not validated here; see [`Config::validate`].
///
/// # Arguments
///
/// * `path` - Path to the TOML file, usually `fleet.toml`
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read (e.g., doesn't exist or permission denied)
/// - The file contains invalid TOML syntax
/// - The configuration doesn't match the expected schema
///
/// # Example
///
/// ```no_run
/// use fleet::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("fleet.toml"))?;
/// println!("Output: {}", config.fleet.output_dir.display());
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Loads fleet configuration from a TOML string.
///
/// # Arguments
///
/// * `content` - TOML text with at least a `[provider]` table
///
/// # Errors
///
/// Returns an error if the text is not valid TOML or doesn't match the
/// expected schema.
///
/// # Example
///
/// ```
/// use fleet::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [fleet]
///     batch_timeout_secs = 600
///
///     [provider]
///     type = "stub"
/// "#)?;
///
/// assert_eq!(config.fleet.batch_timeout_secs, 600);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    Ok(config)
}
