//! Provenance tracking for configuration values.

use std::fmt;

/// Where a configuration value came from, lowest priority first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConfigSource {
    /// Built-in default.
    Default,
    /// A `NETDISP_*` environment variable.
    Environment,
    /// A command-line flag.
    CommandLine,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::Environment => write!(f, "environment"),
            Self::CommandLine => write!(f, "command line"),
        }
    }
}

/// A configuration value tagged with its source.
#[derive(Debug, Clone, PartialEq)]
pub struct Sourced<T> {
    pub value: T,
    pub source: ConfigSource,
    /// Variable or flag name when the value did not come from a default.
    pub origin: Option<String>,
}

impl<T> Sourced<T> {
    pub fn default_value(value: T) -> Self {
        Self {
            value,
            source: ConfigSource::Default,
            origin: None,
        }
    }

    pub fn from_env(value: T, var: impl Into<String>) -> Self {
        Self {
            value,
            source: ConfigSource::Environment,
            origin: Some(var.into()),
        }
    }

    pub fn from_cli(value: T, flag: impl Into<String>) -> Self {
        Self {
            value,
            source: ConfigSource::CommandLine,
            origin: Some(flag.into()),
        }
    }

    /// Replace the value when a higher-priority layer supplies one.
    pub fn override_with(self, value: Option<T>, flag: &str) -> Self {
        match value {
            Some(v) => Self::from_cli(v, flag),
            None => self,
        }
    }

    pub fn into_value(self) -> T {
        self.value
    }
}

impl<T: fmt::Display> fmt::Display for Sourced<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.origin {
            Some(origin) => write!(f, "{} (from {} {})", self.value, self.source, origin),
            None => write!(f, "{} ({})", self.value, self.source),
        }
    }
}
