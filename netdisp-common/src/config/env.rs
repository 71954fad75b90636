//! Environment variable parsing with type safety.
//!
//! Provides a type-safe parser for `NETDISP_*` environment variables with
//! validation, error collection, and source tracking.

use super::source::Sourced;
use std::env;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during environment variable parsing.
#[derive(Debug, Error)]
pub enum EnvError {
    /// Invalid value for a variable.
    #[error("Invalid value for {var}: expected {expected}, got '{value}'")]
    InvalidValue {
        var: String,
        expected: String,
        value: String,
    },

    /// Value out of valid range.
    #[error("Value out of range for {var}: {value} (valid: {min}..={max})")]
    OutOfRange {
        var: String,
        value: String,
        min: String,
        max: String,
    },

    /// Path could not be expanded.
    #[error("Invalid path for {var}: {reason}")]
    InvalidPath { var: String, reason: String },

    /// Invalid log level.
    #[error("Invalid log level for {var}: {value}")]
    InvalidLogLevel { var: String, value: String },
}

/// Type-safe environment variable parser.
///
/// Collects errors during parsing so all issues can be reported at once.
pub struct EnvParser {
    prefix: &'static str,
    errors: Vec<EnvError>,
}

impl EnvParser {
    /// Create a new parser with the NETDISP_ prefix.
    pub fn new() -> Self {
        Self::with_prefix("NETDISP_")
    }

    pub fn with_prefix(prefix: &'static str) -> Self {
        Self {
            prefix,
            errors: Vec::new(),
        }
    }

    /// Get all accumulated errors.
    pub fn errors(&self) -> &[EnvError] {
        &self.errors
    }

    /// Check if any errors occurred.
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Take ownership of errors.
    pub fn take_errors(&mut self) -> Vec<EnvError> {
        std::mem::take(&mut self.errors)
    }

    /// Get the full variable name with prefix.
    fn var_name(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    /// Get one of a fixed set of lowercase keywords.
    pub fn get_choice(
        &mut self,
        name: &str,
        default: &'static str,
        choices: &[&'static str],
    ) -> Sourced<String> {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) => {
                let lower = value.trim().to_lowercase();
                if choices.contains(&lower.as_str()) {
                    Sourced::from_env(lower, var_name)
                } else {
                    self.errors.push(EnvError::InvalidValue {
                        var: var_name.clone(),
                        expected: format!("one of {}", choices.join("/")),
                        value,
                    });
                    Sourced::default_value(default.to_string())
                }
            }
            Err(_) => Sourced::default_value(default.to_string()),
        }
    }

    /// Get a u32 value with default and range validation.
    pub fn get_u32_range(&mut self, name: &str, default: u32, min: u32, max: u32) -> Sourced<u32> {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) => match value.trim().parse::<u32>() {
                Ok(n) if n >= min && n <= max => Sourced::from_env(n, var_name),
                Ok(n) => {
                    self.errors.push(EnvError::OutOfRange {
                        var: var_name.clone(),
                        value: n.to_string(),
                        min: min.to_string(),
                        max: max.to_string(),
                    });
                    Sourced::default_value(default)
                }
                Err(_) => {
                    self.errors.push(EnvError::InvalidValue {
                        var: var_name.clone(),
                        expected: "unsigned 32-bit integer".to_string(),
                        value,
                    });
                    Sourced::default_value(default)
                }
            },
            Err(_) => Sourced::default_value(default),
        }
    }

    /// Get a u64 value with default and range validation.
    pub fn get_u64_range(&mut self, name: &str, default: u64, min: u64, max: u64) -> Sourced<u64> {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) => match value.trim().parse::<u64>() {
                Ok(n) if n >= min && n <= max => Sourced::from_env(n, var_name),
                Ok(n) => {
                    self.errors.push(EnvError::OutOfRange {
                        var: var_name.clone(),
                        value: n.to_string(),
                        min: min.to_string(),
                        max: max.to_string(),
                    });
                    Sourced::default_value(default)
                }
                Err(_) => {
                    self.errors.push(EnvError::InvalidValue {
                        var: var_name.clone(),
                        expected: "unsigned 64-bit integer".to_string(),
                        value,
                    });
                    Sourced::default_value(default)
                }
            },
            Err(_) => Sourced::default_value(default),
        }
    }

    /// Get a path value with `~` and `$VAR` expansion.
    pub fn get_path(&mut self, name: &str, default: &str) -> Sourced<PathBuf> {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) => match shellexpand::full(&value) {
                Ok(expanded) => Sourced::from_env(PathBuf::from(expanded.into_owned()), var_name),
                Err(e) => {
                    self.errors.push(EnvError::InvalidPath {
                        var: var_name.clone(),
                        reason: e.to_string(),
                    });
                    Sourced::default_value(PathBuf::from(default))
                }
            },
            Err(_) => Sourced::default_value(PathBuf::from(default)),
        }
    }

    /// Get a log level value with validation.
    pub fn get_log_level(&mut self, name: &str, default: &str) -> Sourced<String> {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) => {
                let lower = value.to_lowercase();
                match lower.as_str() {
                    "trace" | "debug" | "info" | "warn" | "error" | "off" => {
                        Sourced::from_env(lower, var_name)
                    }
                    _ => {
                        self.errors.push(EnvError::InvalidLogLevel {
                            var: var_name.clone(),
                            value: value.clone(),
                        });
                        Sourced::default_value(default.to_string())
                    }
                }
            }
            Err(_) => Sourced::default_value(default.to_string()),
        }
    }

    /// Get a comma-separated list of u32 values, each within `min..=max`.
    ///
    /// An entry that fails to parse or falls outside the range is
    /// recorded as an error and dropped; the remaining entries are kept.
    pub fn get_u32_list(&mut self, name: &str, min: u32, max: u32) -> Sourced<Vec<u32>> {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) => {
                let mut items = Vec::new();
                for raw in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                    match raw.parse::<u32>() {
                        Ok(n) if n >= min && n <= max => items.push(n),
                        Ok(n) => self.errors.push(EnvError::OutOfRange {
                            var: var_name.clone(),
                            value: n.to_string(),
                            min: min.to_string(),
                            max: max.to_string(),
                        }),
                        Err(_) => self.errors.push(EnvError::InvalidValue {
                            var: var_name.clone(),
                            expected: "comma-separated unsigned integers".to_string(),
                            value: raw.to_string(),
                        }),
                    }
                }
                Sourced::from_env(items, var_name)
            }
            Err(_) => Sourced::default_value(Vec::new()),
        }
    }

    /// Get an optional string (None if not set or empty).
    pub fn get_optional_string(&mut self, name: &str) -> Sourced<Option<String>> {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) if value.is_empty() => Sourced::from_env(None, var_name),
            Ok(value) => Sourced::from_env(Some(value), var_name),
            Err(_) => Sourced::default_value(None),
        }
    }
}

impl Default for EnvParser {
    fn default() -> Self {
        Self::new()
    }
}
