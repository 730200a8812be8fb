//! Per-seed streaming principal-component analysis.
//!
//! A `DynPca` is born from a queue of traces (batch SVD), then ingests every
//! subsequent trace of its seed. Its lifecycle is time-driven:
//!
//! - **Settling**: accumulate statistics in the initial basis.
//! - one recentering (centers := running mean, old covariance decayed), then
//! - **Converging**: accumulate in the recentered frame.
//! - one rotation attempt (eigendecompose the small covariance, align the
//!   basis with its eigenvectors), then
//! - **Steady**: the basis only drifts through recentering, it no longer
//!   rotates; per-axis histograms are collected.
//!
//! All samples pass through the regularized log transform first, so a branch
//! hit count of zero contributes exactly nothing.

use std::fmt;
use std::time::Instant;

use nalgebra::{DMatrix, DVector};

use crate::{
    config::{
        BUCKET_SENSITIVENESS, CONV_CRIT_FLOOR, PCA_INIT_DIM, PHASE_CONVERGE_DUR, PHASE_SETTLE_DUR,
    },
    trace::{log_vals, MAP_SIZE},
    Error,
};

/// Covariance and sample-count decay applied at recentering, so the
/// statistics gathered around the stale center are exponentially forgotten.
const RECENTER_DECAY: f64 = 0.1;

/// Iteration caps for the factorizations. Exceeding them is reported as a
/// numerical failure, not a panic.
const FACTO_EPS: f64 = 1.0e-12;
const FACTO_MAX_ITER: usize = 1_000;

/// Lifecycle of a `DynPca`. Strictly monotonic; `Converging` may re-arm its
/// own deadline but never falls back to `Settling`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Settling,
    Converging,
    Steady,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Settling => write!(f, "settling"),
            Phase::Converging => write!(f, "converging"),
            Phase::Steady => write!(f, "steady"),
        }
    }
}

/// Tunables, split out so tests can shrink the phase durations.
#[derive(Debug, Clone, Copy)]
pub struct DynPcaParams {
    pub settle_dur: std::time::Duration,
    pub converge_dur: std::time::Duration,
    pub conv_crit_floor: f64,
    pub dim: usize,
}

impl Default for DynPcaParams {
    fn default() -> Self {
        Self {
            settle_dur: PHASE_SETTLE_DUR,
            converge_dur: PHASE_CONVERGE_DUR,
            conv_crit_floor: CONV_CRIT_FLOOR,
            dim: PCA_INIT_DIM,
        }
    }
}

/// Optional per-axis statistics: histograms (steady state only) and raw
/// third/fourth moments for skewness and kurtosis reporting.
#[derive(Debug, Clone, Default)]
pub struct AxisStats {
    /// Histogram bucket width per axis; empty until the steady state.
    pub steps: Vec<f64>,
    /// Bucket counts per axis, indexed by `|proj| / step`.
    pub histos: Vec<Vec<u64>>,
    m3: Vec<f64>,
    m4: Vec<f64>,
}

impl AxisStats {
    fn new(dim: usize) -> Self {
        Self {
            steps: Vec::new(),
            histos: Vec::new(),
            m3: vec![0.0; dim],
            m4: vec![0.0; dim],
        }
    }

    /// Fix the bucket widths from the current axis variances.
    fn arm(&mut self, variances: &[f64]) {
        self.steps = variances
            .iter()
            .map(|v| (v.max(0.0).sqrt() / BUCKET_SENSITIVENESS).max(f64::MIN_POSITIVE))
            .collect();
        self.histos = vec![Vec::new(); variances.len()];
    }

    fn record(&mut self, proj: &DVector<f64>) {
        for (axis, &p) in proj.iter().enumerate() {
            self.m3[axis] += p * p * p;
            self.m4[axis] += p * p * p * p;
            if let Some(step) = self.steps.get(axis) {
                let bucket = (p.abs() / step) as usize;
                let histo = &mut self.histos[axis];
                if histo.len() <= bucket {
                    histo.resize(bucket + 1, 0);
                }
                histo[bucket] += 1;
            }
        }
    }

    fn third_moment(&self, axis: usize) -> f64 {
        self.m3[axis]
    }

    fn fourth_moment(&self, axis: usize) -> f64 {
        self.m4[axis]
    }
}

/// The streaming PCA state. `Y = (X - centers)ᵀ · basis`.
#[derive(Debug, Clone)]
pub struct DynPca {
    /// Per-dimension center of the log-transformed traces.
    centers: DVector<f64>,
    /// Column-orthonormal `MAP_SIZE × dim` projection basis.
    basis: DMatrix<f64>,

    /// Running per-dimension sum of raw (uncentered) log values.
    sums: DVector<f64>,
    /// Samples accumulated since the last decay.
    sample_n: usize,
    /// Cumulative squared deviation from the centers.
    sq_norm: f64,
    /// Cumulative covariance in basis coordinates (not divided by n).
    cov_mat: DMatrix<f64>,

    phase: Phase,
    start_t: Instant,
    recenter_t: Instant,

    stats: AxisStats,
    params: DynPcaParams,
}

impl DynPca {
    /// Batch-initialize from the collected trace queue.
    pub fn from_queue(queue: &[Vec<u8>]) -> Result<Self, Error> {
        Self::from_queue_with_params(queue, DynPcaParams::default())
    }

    pub fn from_queue_with_params(
        queue: &[Vec<u8>],
        params: DynPcaParams,
    ) -> Result<Self, Error> {
        let t = queue.len();
        if t < 2 {
            return Err(Error::illegal_argument(
                "need at least two traces to initialize a PCA",
            ));
        }
        let lv = log_vals();

        let mut sums = DVector::<f64>::zeros(MAP_SIZE);
        for trace in queue {
            for (j, &hits) in trace.iter().enumerate() {
                sums[j] += lv[hits as usize];
            }
        }
        let centers = &sums / t as f64;

        let mut samples = DMatrix::<f64>::zeros(t, MAP_SIZE);
        for (i, trace) in queue.iter().enumerate() {
            for (j, &hits) in trace.iter().enumerate() {
                samples[(i, j)] = lv[hits as usize] - centers[j];
            }
        }
        let sq_norm: f64 = samples.iter().map(|v| v * v).sum();

        let svd = samples
            .try_svd(false, true, FACTO_EPS, FACTO_MAX_ITER)
            .ok_or_else(|| Error::not_factorizable("initial SVD did not converge"))?;
        let v_t = svd
            .v_t
            .ok_or_else(|| Error::not_factorizable("SVD returned no right singular vectors"))?;

        let dim = params.dim.min(v_t.nrows());
        let mut basis = DMatrix::<f64>::zeros(MAP_SIZE, dim);
        let mut cov_mat = DMatrix::<f64>::zeros(dim, dim);
        for col in 0..dim {
            basis.set_column(col, &v_t.row(col).transpose());
            // Squared singular values are the eigenvalues scaled by the
            // sample count, which is exactly the cumulative convention.
            cov_mat[(col, col)] = svd.singular_values[col] * svd.singular_values[col];
        }

        let now = Instant::now();
        Ok(Self {
            centers,
            basis,
            sums,
            sample_n: t,
            sq_norm,
            cov_mat,
            phase: Phase::Settling,
            start_t: now,
            recenter_t: now,
            stats: AxisStats::new(dim),
            params,
        })
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    #[must_use]
    pub fn is_steady(&self) -> bool {
        self.phase == Phase::Steady
    }

    #[must_use]
    pub fn dim(&self) -> usize {
        self.basis.ncols()
    }

    #[must_use]
    pub fn sample_n(&self) -> usize {
        self.sample_n
    }

    #[must_use]
    pub fn centers(&self) -> &DVector<f64> {
        &self.centers
    }

    #[must_use]
    pub fn basis(&self) -> &DMatrix<f64> {
        &self.basis
    }

    #[must_use]
    pub fn stats(&self) -> &AxisStats {
        &self.stats
    }

    /// Covariance in basis coordinates, normalized by the sample count and
    /// symmetrized against floating-point drift.
    #[must_use]
    pub fn covariance(&self) -> DMatrix<f64> {
        let cov = &self.cov_mat / self.sample_n as f64;
        (&cov + cov.transpose()) * 0.5
    }

    /// Per-axis variances (diagonal of the normalized covariance).
    #[must_use]
    pub fn variances(&self) -> Vec<f64> {
        let n = self.sample_n as f64;
        (0..self.dim()).map(|i| self.cov_mat[(i, i)] / n).collect()
    }

    /// Nudge every center by a constant, to fabricate divergence scenarios.
    #[cfg(test)]
    pub(crate) fn shift_centers(&mut self, delta: f64) {
        for center in self.centers.iter_mut() {
            *center += delta;
        }
    }

    /// Ingest one trace.
    pub fn new_sample(&mut self, trace: &[u8]) {
        self.advance_phase(Instant::now());

        let lv = log_vals();
        let mut centered = DVector::<f64>::zeros(MAP_SIZE);
        for (j, &hits) in trace.iter().enumerate() {
            let y = lv[hits as usize];
            self.sums[j] += y;
            centered[j] = y - self.centers[j];
        }

        self.sq_norm += centered.norm_squared();
        let proj = self.basis.tr_mul(&centered);
        self.cov_mat += &proj * proj.transpose();
        self.sample_n += 1;
        self.stats.record(&proj);
    }

    fn advance_phase(&mut self, now: Instant) {
        match self.phase {
            Phase::Settling if now.duration_since(self.start_t) > self.params.settle_dur => {
                self.recenter();
                self.phase = Phase::Converging;
                self.recenter_t = now;
            }
            Phase::Converging
                if now.duration_since(self.recenter_t) > self.params.converge_dur =>
            {
                if self.try_rotate() {
                    self.phase = Phase::Steady;
                    self.stats.arm(&self.variances());
                } else {
                    log::debug!("covariance eigendecomposition failed, staying in converging");
                    self.recenter_t = now;
                }
            }
            _ => {}
        }
    }

    /// Move the centers onto the running mean and decay the history.
    fn recenter(&mut self) {
        let n = self.sample_n as f64;
        self.centers = &self.sums / n;

        self.cov_mat *= RECENTER_DECAY;
        self.sq_norm *= RECENTER_DECAY;
        self.sample_n = (self.sample_n / 10).max(1);
        self.sums = &self.centers * self.sample_n as f64;
    }

    /// Align the basis with the eigenvectors of the accumulated covariance.
    ///
    /// Returns `false` only when the factorization fails; an already
    /// axis-aligned covariance counts as success without touching the basis.
    fn try_rotate(&mut self) -> bool {
        let dim = self.dim();
        let Some(eigen) =
            nalgebra::SymmetricEigen::try_new(self.covariance(), FACTO_EPS, FACTO_MAX_ITER)
        else {
            return false;
        };

        let mut order: Vec<usize> = (0..dim).collect();
        order.sort_by(|&a, &b| {
            eigen.eigenvalues[b]
                .partial_cmp(&eigen.eigenvalues[a])
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut vecs = DMatrix::<f64>::zeros(dim, dim);
        let mut vals = DVector::<f64>::zeros(dim);
        for (new_i, &old_i) in order.iter().enumerate() {
            vecs.set_column(new_i, &eigen.eigenvectors.column(old_i));
            vals[new_i] = eigen.eigenvalues[old_i];
        }

        if convergence_criterion(&vecs) > self.params.conv_crit_floor {
            self.basis = &self.basis * &vecs;
            self.cov_mat = DMatrix::from_diagonal(&(vals * self.sample_n as f64));
        }
        true
    }
}

/// Mean over eigenvector columns of (sum of squares minus the largest
/// squared component). Zero iff the eigenvectors are axis-aligned, i.e. no
/// rotation would change anything.
fn convergence_criterion(vecs: &DMatrix<f64>) -> f64 {
    let mut total = 0.0;
    for col in vecs.column_iter() {
        let sq_sum: f64 = col.iter().map(|v| v * v).sum();
        let sq_max = col.iter().map(|v| v * v).fold(0.0, f64::max);
        total += sq_sum - sq_max;
    }
    total / vecs.ncols() as f64
}

impl fmt::Display for DynPca {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = self.sample_n as f64;
        write!(
            f,
            "phase={} n={} meanSqNorm={:.3}",
            self.phase,
            self.sample_n,
            self.sq_norm / n
        )?;
        write!(f, " vars=[")?;
        for (i, var) in self.variances().iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            let std = var.sqrt();
            let skew = if std > 0.0 {
                (self.stats.third_moment(i) / n) / (var * std)
            } else {
                0.0
            };
            let kurt = if *var > 0.0 {
                (self.stats.fourth_moment(i) / n) / (var * var)
            } else {
                0.0
            };
            write!(f, "{var:.3}({skew:+.1}/{kurt:.1})")?;
        }
        write!(f, "]")
    }
}
