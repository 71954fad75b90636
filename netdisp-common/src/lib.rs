//! Shared plumbing for the netdisp workspace.
//!
//! Holds the pieces every netdisp binary needs before it can do real work:
//! logging bootstrap and typed `NETDISP_*` environment parsing.

pub mod config;
pub mod logging;

pub use config::{ConfigSource, EnvError, EnvParser, Sourced};
pub use logging::{LogConfig, LogFormat, LoggingError, LoggingGuards, init_logging};
