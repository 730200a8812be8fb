//! Campaign tuning knobs.
//!
//! The compile-time constants mirror what we found to work in practice; the
//! runtime [`Config`] carries everything the CLI can override.

use std::{path::PathBuf, time::Duration};

// ****************
// ** Scheduling **

/// How long one worker keeps mutating a single seed before reporting back.
pub const ROUND_TIME: Duration = Duration::from_secs(5);
/// Per-seed execution budget (number of rounds) with the evolutionary
/// algorithm enabled.
pub const FUZZ_ROUND_N_BASE: usize = 5;

/// Default per-execution wall-clock timeout.
pub const RUN_TIMEOUT: Duration = Duration::from_millis(100);

// *****************************************
// ** PCA fitness initialization          **

/// How long the PCA fitness collects traces before trying to build a basis.
pub const PCA_INIT_TIME: Duration = Duration::from_secs(2);
/// Hard cap on the initialization queue.
pub const INIT_QUEUE_MAX: usize = 100;
/// Number of principal components kept per seed.
pub const PCA_INIT_DIM: usize = 10;

// ***************************
// ** Dynamic PCA constants **

/// Duration of the settling phase (before the first recentering).
pub const PHASE_SETTLE_DUR: Duration = Duration::from_secs(1);
/// Duration of the converging phase (before a rotation attempt).
pub const PHASE_CONVERGE_DUR: Duration = PHASE_SETTLE_DUR;
/// Rotation is only applied when the eigenvectors are at least this far from
/// axis-aligned.
pub const CONV_CRIT_FLOOR: f64 = 0.05;

/// How many histogram buckets per standard deviation.
pub const BUCKET_SENSITIVENESS: f64 = 5.0;

// *************************
// ** Basis merging       **

/// Cap on the number of basis vectors merged by one weighted PCA pass.
pub const MAX_PCA_DIM: usize = 60;

// *************
// ** Verbose **

/// Scheduler progress print period.
pub const PRINT_TICK: Duration = Duration::from_secs(3);
/// Global-fitness heartbeat period.
pub const HEARTBEAT_TICK: Duration = Duration::from_secs(1);

// ************************
// ** Distance parameter **

/// Regularizer of the logarithmic hit-count transform.
pub const REGULIZER: f64 = 0.1;

// ************
// ** System **

/// Skip odd-numbered CPUs so two workers never share a physical core.
pub const DEACTIVATE_HYPERTHREAD: bool = true;

/// Runtime configuration, mostly CLI-derived.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the instrumented target.
    pub bin_path: PathBuf,
    /// Arguments passed to the target; one of them may carry the `@@` input
    /// file marker.
    pub args: Vec<String>,
    /// Directory holding the initial seeds.
    pub in_dir: PathBuf,
    /// Output directory, recreated on startup.
    pub out_dir: PathBuf,
    /// Number of worker threads.
    pub thread_n: usize,
    /// Per-execution timeout.
    pub timeout: Duration,
    /// One fuzzing round per seed dispatch.
    pub round_time: Duration,
    /// Per-seed execution budget.
    pub fuzz_round_n: usize,
    /// Promote every coverage-extending run into a seed. When off, promotion
    /// stops once there is one seed per worker ("bootstrap" mode).
    pub use_evo: bool,
    /// Let the target's stdout/stderr through instead of /dev/null.
    pub debug_child: bool,
}

impl Config {
    /// Build a configuration from the CLI-level values, applying the
    /// budget multiplier used when the evolutionary algorithm is off.
    #[must_use]
    pub fn new(
        bin_path: PathBuf,
        args: Vec<String>,
        in_dir: PathBuf,
        out_dir: PathBuf,
        thread_n: usize,
        timeout: Duration,
        use_evo: bool,
        debug_child: bool,
    ) -> Self {
        let mut fuzz_round_n = FUZZ_ROUND_N_BASE;
        if !use_evo {
            // Without seed evolution the corpus stays small, so each seed
            // gets a larger share of the executions.
            fuzz_round_n *= 3;
        }
        Config {
            bin_path,
            args,
            in_dir,
            out_dir,
            thread_n,
            timeout,
            round_time: ROUND_TIME,
            fuzz_round_n,
            use_evo,
            debug_child,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_multiplier_applies_without_evolution() {
        let mk = |evo| {
            Config::new(
                PathBuf::from("/bin/true"),
                vec![],
                PathBuf::from("in"),
                PathBuf::from("out"),
                2,
                RUN_TIMEOUT,
                evo,
                false,
            )
        };
        assert_eq!(mk(true).fuzz_round_n, FUZZ_ROUND_N_BASE);
        assert_eq!(mk(false).fuzz_round_n, 3 * FUZZ_ROUND_N_BASE);
    }
}
