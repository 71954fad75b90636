//! CPU load smoothing and switch port telemetry for the netdisp board display.
//!
//! `collect` holds the data sources and the state they feed, `monitor` runs
//! one refresh cycle over them and `display` shapes the result for the
//! renderer.

pub mod collect;
pub mod config;
pub mod display;
pub mod monitor;

pub use netdisp_common::{LogConfig, LogFormat, init_logging};
