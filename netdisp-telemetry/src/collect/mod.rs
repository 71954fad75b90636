//! Telemetry sources: per-core idle counters and the switch port feed.

pub mod cpu_idle;
pub mod feed;
pub mod ports;
