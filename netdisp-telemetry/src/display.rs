//! Values handed to the renderer once per cycle.

use crate::collect::ports::{PortTransition, PortUtilization};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// The dial widget cannot show a full 100%.
pub const DEFAULT_MAX_BUSY_PERCENT: u32 = 95;

/// Busy share of a sample period given the smoothed idle time in it.
///
/// Idle time longer than the period (possible right after a stall) reads as
/// 0% busy. The result never exceeds `max_percent`.
pub fn busy_percent(period_ms: u64, idle_ms: u64, max_percent: u32) -> u32 {
    if period_ms == 0 {
        return 0;
    }
    let busy = period_ms.saturating_sub(idle_ms).saturating_mul(100) / period_ms;
    u32::try_from(busy).unwrap_or(u32::MAX).min(max_percent)
}

/// Everything the renderer needs for one refresh.
#[derive(Debug, Clone, Serialize)]
pub struct DisplayFrame {
    pub timestamp: DateTime<Utc>,
    /// One entry per monitored core, in core order.
    pub cpu_busy_percent: Vec<u32>,
    pub transitions: Vec<PortTransition>,
    pub utilization: Vec<PortUtilization>,
}

impl DisplayFrame {
    pub fn new(
        cpu_busy_percent: Vec<u32>,
        transitions: Vec<PortTransition>,
        utilization: Vec<PortUtilization>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            cpu_busy_percent,
            transitions,
            utilization,
        }
    }

    /// Serialize to a single JSON line.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Serialize to pretty-printed JSON.
    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
