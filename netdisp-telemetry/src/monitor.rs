//! Per-cycle glue between the sources, the core state and the display frame.
//!
//! A failed cycle never tears anything down: the CPU dials keep their last
//! displayed value and the port table keeps its last committed state until
//! the next scheduled cycle succeeds.

use crate::collect::cpu_idle::{IdleCounterSource, IdleDecayEstimator};
use crate::collect::feed::{self, DrainSummary, PortFeed};
use crate::collect::ports::{PortTable, PortTransition, PortUtilization};
use crate::display::busy_percent;
use std::io::Read;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Deadline following `deadline` for a task repeating every `period`.
///
/// Stays on the original cadence after a short overrun. When the loop has
/// fallen more than one period behind, the cadence restarts from `now`
/// instead of replaying every missed cycle back to back.
pub fn next_deadline(deadline: Instant, period: Duration, now: Instant) -> Instant {
    let next = deadline + period;
    if next + period <= now {
        debug!(
            behind_ms = now.duration_since(next).as_millis() as u64,
            "Refresh fell behind, re-anchoring"
        );
        now + period
    } else {
        next
    }
}

/// Smoothing and display limits for the CPU dials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuSettings {
    pub cores: usize,
    pub decay_num: u32,
    pub decay_den: u32,
    pub period_ms: u64,
    pub max_busy_percent: u32,
}

/// Drives the idle estimator for each displayed core.
pub struct CpuMonitor<S> {
    estimator: IdleDecayEstimator,
    source: S,
    settings: CpuSettings,
    busy: Vec<u32>,
}

impl<S: IdleCounterSource> CpuMonitor<S> {
    pub fn new(source: S, settings: CpuSettings) -> Self {
        Self {
            estimator: IdleDecayEstimator::new(),
            source,
            busy: vec![0; settings.cores],
            settings,
        }
    }

    /// Sample every core once and return the busy percentages to display.
    ///
    /// A core whose sample fails, or that is only taking its baseline
    /// reading, keeps the value it showed last cycle.
    pub fn refresh(&mut self) -> &[u32] {
        let CpuSettings {
            decay_num,
            decay_den,
            period_ms,
            max_busy_percent,
            ..
        } = self.settings;

        for (core, shown) in self.busy.iter_mut().enumerate() {
            let calibrated = self.estimator.is_calibrated(core);
            match self
                .estimator
                .sample(&mut self.source, core, decay_num, decay_den)
            {
                // The calibration pass carries no idle time; 0 here is not "fully busy"
                Ok(_) if !calibrated => {
                    debug!(core = core, "CPU baseline taken");
                }
                Ok(idle_ms) => {
                    *shown = busy_percent(period_ms, idle_ms, max_busy_percent);
                    debug!(core = core, idle_ms = idle_ms, busy = *shown, "CPU sampled");
                }
                Err(e) => {
                    warn!(core = core, error = %e, "CPU sample failed, holding last value");
                }
            }
        }

        &self.busy
    }

    pub fn busy(&self) -> &[u32] {
        &self.busy
    }

    pub fn estimator(&self) -> &IdleDecayEstimator {
        &self.estimator
    }
}

/// Port changes produced by one port cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortCycle {
    pub transitions: Vec<PortTransition>,
    pub utilization: Vec<PortUtilization>,
    pub drained: DrainSummary,
}

/// Owns the port table and the feed that updates it.
pub struct PortMonitor<R> {
    table: PortTable,
    feed: Option<PortFeed<R>>,
    max_lines: usize,
}

impl<R: Read> PortMonitor<R> {
    pub fn new(table: PortTable, feed: Option<PortFeed<R>>, max_lines: usize) -> Self {
        Self {
            table,
            feed,
            max_lines,
        }
    }

    /// Stage an operator toggle; it shows up on the next refresh.
    pub fn toggle(&mut self, port: usize) {
        self.table.toggle(port);
    }

    /// Drain whatever the feed has, then commit and report changes.
    pub fn refresh(&mut self) -> PortCycle {
        let drained = match self.feed.as_mut() {
            Some(port_feed) => match feed::drain(port_feed, &mut self.table, self.max_lines) {
                Ok(summary) => summary,
                Err(e) => {
                    warn!(error = %e, "Port feed read failed, retrying next cycle");
                    DrainSummary::default()
                }
            },
            None => DrainSummary::default(),
        };

        PortCycle {
            transitions: self.table.reconcile(),
            utilization: self.table.utilization(),
            drained,
        }
    }

    pub fn table(&self) -> &PortTable {
        &self.table
    }
}
