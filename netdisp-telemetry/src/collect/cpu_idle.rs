//! Smoothed per-core idle time from the kernel's cumulative idle counter.
//!
//! The idle counter in /proc/stat advances in jiffies (10 ms), so sampling it
//! every 100 ms yields a delta of only a handful of ticks and the raw value is
//! far too coarse to drive a dial. The estimator keeps a decayed accumulator at
//! 1/64 ms resolution per core, which lets the caller sample as often as it
//! likes and still get a smooth idle figure for the nominal sample period.

use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, trace};

/// Upper bound on the number of cores tracked by one estimator.
pub const NR_CPU_CORES: usize = 8;

/// Duration of one kernel tick of the idle counter.
pub const JIFFY_MS: i64 = 10;

/// Width of the idle counter; a reading below the previous one has wrapped here.
pub const MAX_COUNTER: u64 = u64::MAX;

/// Fixed-point scale of the decayed accumulator (1/64 ms).
const RESOLUTION: i64 = 64;

/// Default location of the per-core counters.
pub const PROC_STAT_PATH: &str = "/proc/stat";

/// Errors raised by a sampling call. None of them mutate estimator state.
#[derive(Error, Debug)]
pub enum EstimatorError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("idle counter source {path} unavailable: {source}")]
    SourceUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed idle counter data: {0}")]
    MalformedCounter(String),
}

/// Supplies the cumulative idle counter for a core.
pub trait IdleCounterSource {
    fn read_idle(&mut self, core: usize) -> Result<u64, EstimatorError>;
}

impl<F> IdleCounterSource for F
where
    F: FnMut(usize) -> Result<u64, EstimatorError>,
{
    fn read_idle(&mut self, core: usize) -> Result<u64, EstimatorError> {
        self(core)
    }
}

/// Reads idle counters from a /proc/stat style file on every call.
#[derive(Debug, Clone)]
pub struct ProcStatSource {
    path: PathBuf,
}

impl ProcStatSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Default for ProcStatSource {
    fn default() -> Self {
        Self::new(PROC_STAT_PATH)
    }
}

impl IdleCounterSource for ProcStatSource {
    fn read_idle(&mut self, core: usize) -> Result<u64, EstimatorError> {
        let content = std::fs::read_to_string(&self.path).map_err(|source| {
            EstimatorError::SourceUnavailable {
                path: self.path.clone(),
                source,
            }
        })?;
        parse_idle_counter(&content, core)
    }
}

/// Extract the idle field of the `cpu<core>` line.
///
/// Format: `cpuN user nice system idle [iowait irq ...]`. Only the first four
/// numeric fields are required; anything after them is ignored.
pub fn parse_idle_counter(content: &str, core: usize) -> Result<u64, EstimatorError> {
    let label = format!("cpu{core}");

    let line = content
        .lines()
        .find(|line| line.split_whitespace().next() == Some(label.as_str()))
        .ok_or_else(|| EstimatorError::MalformedCounter(format!("no {label} line found")))?;

    let fields: Vec<&str> = line.split_whitespace().skip(1).take(4).collect();
    if fields.len() < 4 {
        return Err(EstimatorError::MalformedCounter(format!(
            "{label} line too short: expected 4 counters, got {}",
            fields.len()
        )));
    }

    let mut counters = [0u64; 4];
    for (slot, raw) in counters.iter_mut().zip(&fields) {
        *slot = raw.parse().map_err(|_| {
            EstimatorError::MalformedCounter(format!("{label}: invalid counter '{raw}'"))
        })?;
    }

    Ok(counters[3])
}

/// Ticks elapsed between two readings, allowing for one wrap of the counter.
pub fn wrapping_delta(last: u64, current: u64) -> u64 {
    if last > current {
        (MAX_COUNTER - last) + current
    } else {
        current - last
    }
}

/// Persistent state for one core.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EstimatorState {
    /// Last idle counter seen; 0 means the core has not been sampled yet.
    pub last_idle: u64,
    /// Decayed delta accumulator in 1/64 ms.
    pub last_delta: i64,
}

/// Exponentially decayed idle-time estimator for up to [`NR_CPU_CORES`] cores.
#[derive(Debug, Clone, Default)]
pub struct IdleDecayEstimator {
    cores: [EstimatorState; NR_CPU_CORES],
}

impl IdleDecayEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the counter for `core` from `source` and return smoothed idle ms.
    ///
    /// `decay_n / decay_d` is the weight kept from the previous accumulator;
    /// 3/4 keeps 75%. The first call for a core only calibrates and returns 0.
    pub fn sample<S>(
        &mut self,
        source: &mut S,
        core: usize,
        decay_n: u32,
        decay_d: u32,
    ) -> Result<u64, EstimatorError>
    where
        S: IdleCounterSource + ?Sized,
    {
        validate(core, decay_n, decay_d)?;
        let current = source.read_idle(core)?;
        Ok(self.apply(core, decay_n, decay_d, current))
    }

    /// Same as [`sample`](Self::sample) with a counter value the caller already read.
    pub fn sample_counter(
        &mut self,
        core: usize,
        decay_n: u32,
        decay_d: u32,
        current: u64,
    ) -> Result<u64, EstimatorError> {
        validate(core, decay_n, decay_d)?;
        Ok(self.apply(core, decay_n, decay_d, current))
    }

    /// Current state for `core`, or `None` when out of range.
    pub fn state(&self, core: usize) -> Option<EstimatorState> {
        self.cores.get(core).copied()
    }

    /// Whether `core` has a baseline reading, so the next sample yields idle time.
    pub fn is_calibrated(&self, core: usize) -> bool {
        self.cores.get(core).is_some_and(|state| state.last_idle != 0)
    }

    fn apply(&mut self, core: usize, decay_n: u32, decay_d: u32, current: u64) -> u64 {
        let state = &mut self.cores[core];

        // A cold start would report the whole uptime as one huge idle delta
        if state.last_idle == 0 {
            state.last_idle = current;
            debug!(core = core, counter = current, "Idle counter calibrated");
            return 0;
        }

        let ticks = wrapping_delta(state.last_idle, current);
        state.last_idle = current;

        let scaled = i64::try_from(ticks)
            .unwrap_or(i64::MAX)
            .saturating_mul(JIFFY_MS)
            .saturating_mul(RESOLUTION);

        let n = i64::from(decay_n);
        let d = i64::from(decay_d);
        state.last_delta = (state.last_delta.saturating_mul(n) / d).saturating_add(scaled);

        // Summing full-weight samples onto a decayed base has a steady-state
        // gain of n / (d - n) + 1; take it back out.
        let compensated = state.last_delta.saturating_mul(d - n) / d;
        let idle_ms = u64::try_from(compensated / RESOLUTION).unwrap_or(0);

        trace!(
            core = core,
            ticks = ticks,
            accumulator = state.last_delta,
            idle_ms = idle_ms,
            "Idle sample"
        );

        idle_ms
    }
}

fn validate(core: usize, decay_n: u32, decay_d: u32) -> Result<(), EstimatorError> {
    if core >= NR_CPU_CORES {
        return Err(EstimatorError::InvalidArgument(format!(
            "core {core} out of range (max {})",
            NR_CPU_CORES - 1
        )));
    }
    if decay_n >= decay_d {
        return Err(EstimatorError::InvalidArgument(format!(
            "decay fraction {decay_n}/{decay_d} must be below 1"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tracing::info;
    use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

    fn init_test_logging() {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
        let _ = tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_test_writer()
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_thread_ids(true)
                    .json(),
            )
            .with(filter)
            .try_init();
    }

    const SAMPLE: &str = r#"cpu  10132153 290696 3084719 46828483 16683 0 25195 0 0 0
cpu0 2503691 72712 771085 11706116 4178 0 6285 0 0 0
cpu1 2536866 73245 770462 11710849 4144 0 6252 0 0 0
intr 4287231 0 0 0 0 0 0 0
ctxt 1234567"#;

    #[test]
    fn test_parse_idle_counter_per_core() {
        init_test_logging();
        info!("TEST START: test_parse_idle_counter_per_core");

        assert_eq!(parse_idle_counter(SAMPLE, 0).unwrap(), 11706116);
        assert_eq!(parse_idle_counter(SAMPLE, 1).unwrap(), 11710849);

        info!("TEST PASS: test_parse_idle_counter_per_core");
    }

    #[test]
    fn test_parse_idle_counter_ignores_aggregate_line() {
        init_test_logging();
        info!("TEST START: test_parse_idle_counter_ignores_aggregate_line");

        let result = parse_idle_counter(SAMPLE, 2);
        assert!(matches!(result, Err(EstimatorError::MalformedCounter(_))));

        info!("TEST PASS: test_parse_idle_counter_ignores_aggregate_line");
    }

    #[test]
    fn test_parse_idle_counter_minimal_line() {
        init_test_logging();
        info!("TEST START: test_parse_idle_counter_minimal_line");

        assert_eq!(parse_idle_counter("cpu0 1 2 3 4", 0).unwrap(), 4);

        info!("TEST PASS: test_parse_idle_counter_minimal_line");
    }

    #[test]
    fn test_parse_idle_counter_rejects_short_or_garbled_lines() {
        init_test_logging();
        info!("TEST START: test_parse_idle_counter_rejects_short_or_garbled_lines");

        assert!(matches!(
            parse_idle_counter("cpu0 1 2 3", 0),
            Err(EstimatorError::MalformedCounter(_))
        ));
        assert!(matches!(
            parse_idle_counter("cpu0 1 2 x 4", 0),
            Err(EstimatorError::MalformedCounter(_))
        ));
        // cpu1 must not match a cpu10 line
        assert!(matches!(
            parse_idle_counter("cpu10 1 2 3 4", 1),
            Err(EstimatorError::MalformedCounter(_))
        ));

        info!("TEST PASS: test_parse_idle_counter_rejects_short_or_garbled_lines");
    }

    #[test]
    fn test_first_sample_calibrates() {
        init_test_logging();
        info!("TEST START: test_first_sample_calibrates");

        let mut estimator = IdleDecayEstimator::new();
        assert!(!estimator.is_calibrated(0));
        let idle = estimator.sample_counter(0, 3, 4, 11706116).unwrap();
        assert_eq!(idle, 0);
        assert!(estimator.is_calibrated(0));
        assert!(!estimator.is_calibrated(1));
        assert!(!estimator.is_calibrated(NR_CPU_CORES));
        assert_eq!(
            estimator.state(0),
            Some(EstimatorState {
                last_idle: 11706116,
                last_delta: 0
            })
        );

        info!("TEST PASS: test_first_sample_calibrates");
    }

    #[test]
    fn test_single_step_value() {
        init_test_logging();
        info!("TEST START: test_single_step_value");

        let mut estimator = IdleDecayEstimator::new();
        estimator.sample_counter(1, 3, 4, 1000).unwrap();

        // 5 ticks = 50 ms = 3200 units; 3200 * 1/4 = 800 units = 12 ms
        let idle = estimator.sample_counter(1, 3, 4, 1005).unwrap();
        info!(idle_ms = idle, "RESULT: first smoothed value");
        assert_eq!(idle, 12);
        assert_eq!(estimator.state(1).unwrap().last_delta, 3200);

        info!("TEST PASS: test_single_step_value");
    }

    #[test]
    fn test_steady_delta_converges() {
        init_test_logging();
        info!("TEST START: test_steady_delta_converges");

        let mut estimator = IdleDecayEstimator::new();
        let mut counter = 5000u64;
        estimator.sample_counter(0, 3, 4, counter).unwrap();

        let mut last = 0;
        for _ in 0..100 {
            counter += 5;
            last = estimator.sample_counter(0, 3, 4, counter).unwrap();
        }

        info!(idle_ms = last, "RESULT: converged idle");
        assert!((49..=50).contains(&last), "expected ~50 ms, got {last}");

        info!("TEST PASS: test_steady_delta_converges");
    }

    #[test]
    fn test_counter_wrap() {
        init_test_logging();
        info!("TEST START: test_counter_wrap");

        assert_eq!(wrapping_delta(MAX_COUNTER - 1, 1), 2);
        assert_eq!(wrapping_delta(10, 15), 5);

        let mut estimator = IdleDecayEstimator::new();
        estimator.sample_counter(0, 3, 4, MAX_COUNTER - 1).unwrap();
        let idle = estimator.sample_counter(0, 3, 4, 1).unwrap();

        // 2 ticks = 1280 units; 1280 / 4 = 320 units = 5 ms
        assert_eq!(idle, 5);
        assert_eq!(estimator.state(0).unwrap().last_idle, 1);

        info!("TEST PASS: test_counter_wrap");
    }

    #[test]
    fn test_invalid_arguments_leave_state_untouched() {
        init_test_logging();
        info!("TEST START: test_invalid_arguments_leave_state_untouched");

        let mut estimator = IdleDecayEstimator::new();
        estimator.sample_counter(0, 3, 4, 100).unwrap();
        let before = estimator.state(0);

        for core in 0..NR_CPU_CORES {
            assert!(matches!(
                estimator.sample_counter(core, 4, 4, 200),
                Err(EstimatorError::InvalidArgument(_))
            ));
            assert!(matches!(
                estimator.sample_counter(core, 5, 4, 200),
                Err(EstimatorError::InvalidArgument(_))
            ));
        }
        assert!(matches!(
            estimator.sample_counter(NR_CPU_CORES, 3, 4, 200),
            Err(EstimatorError::InvalidArgument(_))
        ));

        assert_eq!(estimator.state(0), before);
        assert!(estimator.state(NR_CPU_CORES).is_none());

        info!("TEST PASS: test_invalid_arguments_leave_state_untouched");
    }

    #[test]
    fn test_invalid_core_never_reads_source() {
        init_test_logging();
        info!("TEST START: test_invalid_core_never_reads_source");

        let mut reads = 0;
        let mut source = |_core: usize| -> Result<u64, EstimatorError> {
            reads += 1;
            Ok(42)
        };
        let mut estimator = IdleDecayEstimator::new();
        assert!(estimator.sample(&mut source, 9, 3, 4).is_err());
        assert!(estimator.sample(&mut source, 0, 1, 1).is_err());
        assert_eq!(reads, 0);

        info!("TEST PASS: test_invalid_core_never_reads_source");
    }

    #[test]
    fn test_source_failure_keeps_state() {
        init_test_logging();
        info!("TEST START: test_source_failure_keeps_state");

        let mut estimator = IdleDecayEstimator::new();
        estimator.sample_counter(0, 3, 4, 100).unwrap();
        estimator.sample_counter(0, 3, 4, 110).unwrap();
        let before = estimator.state(0);

        let mut broken = |_core: usize| -> Result<u64, EstimatorError> {
            Err(EstimatorError::MalformedCounter("truncated".to_string()))
        };
        assert!(estimator.sample(&mut broken, 0, 3, 4).is_err());
        assert_eq!(estimator.state(0), before);

        let mut missing = ProcStatSource::new("/nonexistent/netdisp/stat");
        assert!(matches!(
            estimator.sample(&mut missing, 0, 3, 4),
            Err(EstimatorError::SourceUnavailable { .. })
        ));
        assert_eq!(estimator.state(0), before);

        info!("TEST PASS: test_source_failure_keeps_state");
    }

    #[test]
    fn test_cores_are_independent() {
        init_test_logging();
        info!("TEST START: test_cores_are_independent");

        let mut estimator = IdleDecayEstimator::new();
        estimator.sample_counter(0, 3, 4, 100).unwrap();
        estimator.sample_counter(0, 3, 4, 110).unwrap();

        // Core 1 is still uncalibrated even though core 0 has history
        assert_eq!(estimator.sample_counter(1, 3, 4, 500).unwrap(), 0);
        assert_eq!(estimator.state(1).unwrap().last_delta, 0);

        info!("TEST PASS: test_cores_are_independent");
    }

    #[test]
    fn test_zero_decay_passes_delta_through() {
        init_test_logging();
        info!("TEST START: test_zero_decay_passes_delta_through");

        let mut estimator = IdleDecayEstimator::new();
        estimator.sample_counter(0, 0, 1, 100).unwrap();
        assert_eq!(estimator.sample_counter(0, 0, 1, 107).unwrap(), 70);
        assert_eq!(estimator.sample_counter(0, 0, 1, 109).unwrap(), 20);

        info!("TEST PASS: test_zero_decay_passes_delta_through");
    }

    proptest! {
        #[test]
        fn prop_first_sample_is_zero(counter in 1u64.., core in 0usize..NR_CPU_CORES) {
            let mut estimator = IdleDecayEstimator::new();
            prop_assert_eq!(estimator.sample_counter(core, 3, 4, counter).unwrap(), 0);
        }

        #[test]
        fn prop_steady_delta_reaches_fixed_point(
            d in 2u32..16,
            n_seed in 0u32..16,
            ticks in 1u64..50,
        ) {
            let n = n_seed % d;
            let mut estimator = IdleDecayEstimator::new();
            let mut counter = 1u64;
            estimator.sample_counter(0, n, d, counter).unwrap();

            let mut idle = 0;
            for _ in 0..400 {
                counter += ticks;
                idle = estimator.sample_counter(0, n, d, counter).unwrap();
            }

            let expected = ticks * JIFFY_MS as u64;
            prop_assert!(idle <= expected);
            prop_assert!(expected - idle <= 1, "n={} d={} expected={} got={}", n, d, expected, idle);
        }
    }
}
