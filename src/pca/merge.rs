//! Merging per-seed bases into one global, low-dimensional basis.
//!
//! Every steady-state `DynPca` contributes its (eigen-reduced) basis vectors
//! as weighted rows; a recursive weighted PCA boils them down to the target
//! dimensionality. Distances between seeds are then computable in one shared
//! frame.

use nalgebra::{DMatrix, DVector};

use crate::{
    config::{MAX_PCA_DIM, PCA_INIT_DIM},
    trace::MAP_SIZE,
    Error,
};

use super::dynpca::DynPca;

/// Axes with less variance than this carry no usable signal and are dropped
/// during the per-seed reduction.
const VAR_DROP_FLOOR: f64 = 1.0e-10;

const FACTO_EPS: f64 = 1.0e-12;
const FACTO_MAX_ITER: usize = 1_000;

/// One seed's basis after eigen-reduction: columns paired with variances.
#[derive(Debug, Clone)]
pub struct ReducedBasis {
    /// `MAP_SIZE × k`, column-orthonormal.
    pub basis: DMatrix<f64>,
    /// Variance along each column, used as merge weight.
    pub variances: Vec<f64>,
}

impl ReducedBasis {
    #[must_use]
    pub fn dim(&self) -> usize {
        self.basis.ncols()
    }

    fn total_variance(&self) -> f64 {
        self.variances.iter().sum()
    }
}

/// The shared frame all seeds are compared in.
#[derive(Debug, Clone)]
pub struct MergedBasis {
    /// Mean of the per-seed centers.
    pub centers: DVector<f64>,
    /// `MAP_SIZE × dim`, column-orthonormal.
    pub basis: DMatrix<f64>,
    /// Average per-axis variance of the seeds, measured in this basis.
    pub variances: Vec<f64>,
    pub dim: usize,
    /// Fraction of the seeds' variance the projection loses.
    pub projection_loss: f64,
}

impl MergedBasis {
    /// Project a full-length centered vector into the merged basis.
    #[must_use]
    pub fn project(&self, centered: &DVector<f64>) -> DVector<f64> {
        self.basis.tr_mul(centered)
    }

    /// Back-project basis coordinates into trace space.
    #[must_use]
    pub fn back_project(&self, coords: &DVector<f64>) -> DVector<f64> {
        &self.basis * coords
    }
}

/// Rotate a seed's basis onto the eigenvectors of its own covariance and
/// drop the degenerate axes.
pub fn reduce_local(pca: &DynPca) -> Result<ReducedBasis, Error> {
    let eigen = nalgebra::SymmetricEigen::try_new(pca.covariance(), FACTO_EPS, FACTO_MAX_ITER)
        .ok_or_else(|| Error::not_factorizable("local covariance eigendecomposition failed"))?;

    let mut order: Vec<usize> = (0..pca.dim()).collect();
    order.sort_by(|&a, &b| {
        eigen.eigenvalues[b]
            .partial_cmp(&eigen.eigenvalues[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let rotated = pca.basis() * &eigen.eigenvectors;
    let kept: Vec<usize> = order
        .into_iter()
        .filter(|&i| eigen.eigenvalues[i] >= VAR_DROP_FLOOR)
        .collect();
    if kept.is_empty() {
        return Err(Error::not_factorizable("every local axis is degenerate"));
    }

    let mut basis = DMatrix::<f64>::zeros(MAP_SIZE, kept.len());
    let mut variances = Vec::with_capacity(kept.len());
    for (col, &i) in kept.iter().enumerate() {
        basis.set_column(col, &rotated.column(i));
        variances.push(eigen.eigenvalues[i]);
    }

    Ok(ReducedBasis { basis, variances })
}

/// Build the global basis for a set of steady-state PCAs.
pub fn merge_bases(pcas: &[&DynPca]) -> Result<MergedBasis, Error> {
    if pcas.is_empty() {
        return Err(Error::illegal_argument("no PCA reached the steady state"));
    }

    // Step 1: the global center is the plain mean of the per-seed centers.
    let mut centers = DVector::<f64>::zeros(MAP_SIZE);
    for pca in pcas {
        centers += pca.centers();
    }
    centers /= pcas.len() as f64;

    // Step 2: per-seed eigen-reduction.
    let locals = pcas
        .iter()
        .map(|&pca| reduce_local(pca))
        .collect::<Result<Vec<_>, _>>()?;

    // Step 3: recursive weighted merge, first coarse, then down to the
    // target dimensionality.
    let rows: Vec<(DVector<f64>, f64)> = locals
        .iter()
        .flat_map(|local| {
            local
                .basis
                .column_iter()
                .zip(local.variances.iter())
                .map(|(col, &var)| (col.into_owned(), var))
                .collect::<Vec<_>>()
        })
        .collect();
    let (coarse, coarse_vars) = merge_rows(rows, MAX_PCA_DIM, MAX_PCA_DIM / 2)?;
    let coarse_rows: Vec<(DVector<f64>, f64)> = coarse
        .column_iter()
        .zip(coarse_vars.iter())
        .map(|(col, &var)| (col.into_owned(), var))
        .collect();
    let (basis, _) = weighted_pca(&coarse_rows, PCA_INIT_DIM.min(coarse_rows.len()))?;
    let dim = basis.ncols();

    let mut merged = MergedBasis {
        centers,
        basis,
        variances: vec![0.0; dim],
        dim,
        projection_loss: 0.0,
    };

    // Step 4: measure the per-axis variances and what the projection loses.
    evaluate_variances(&locals, &mut merged);

    Ok(merged)
}

/// Recursive weighted PCA over weighted basis vectors.
fn merge_rows(
    rows: Vec<(DVector<f64>, f64)>,
    cap: usize,
    out_dim: usize,
) -> Result<(DMatrix<f64>, Vec<f64>), Error> {
    if rows.len() <= cap {
        let dim = out_dim.min(rows.len());
        return weighted_pca(&rows, dim);
    }

    let mut next = Vec::new();
    for group in rows.chunks(cap) {
        let dim = out_dim.min(group.len());
        let (basis, vars) = weighted_pca(group, dim)?;
        for (col, &var) in basis.column_iter().zip(vars.iter()) {
            next.push((col.into_owned(), var));
        }
    }
    // Each group shrinks to at most `out_dim` rows, so this terminates as
    // long as out_dim < cap.
    merge_rows(next, cap, out_dim)
}

/// PCA of the given vectors, each scaled by the square root of its weight.
/// Returns the top `dim` components and their squared singular values.
fn weighted_pca(
    rows: &[(DVector<f64>, f64)],
    dim: usize,
) -> Result<(DMatrix<f64>, Vec<f64>), Error> {
    let n = rows
        .first()
        .map(|(v, _)| v.len())
        .ok_or_else(|| Error::illegal_argument("nothing to merge"))?;

    let mut samples = DMatrix::<f64>::zeros(rows.len(), n);
    for (i, (vector, weight)) in rows.iter().enumerate() {
        let scale = weight.max(0.0).sqrt();
        for j in 0..n {
            samples[(i, j)] = vector[j] * scale;
        }
    }

    let svd = samples
        .try_svd(false, true, FACTO_EPS, FACTO_MAX_ITER)
        .ok_or_else(|| Error::not_factorizable("weighted PCA did not converge"))?;
    let v_t = svd
        .v_t
        .ok_or_else(|| Error::not_factorizable("SVD returned no right singular vectors"))?;

    let dim = dim.min(v_t.nrows());
    let mut basis = DMatrix::<f64>::zeros(n, dim);
    let mut weights = Vec::with_capacity(dim);
    for col in 0..dim {
        basis.set_column(col, &v_t.row(col).transpose());
        weights.push(svd.singular_values[col] * svd.singular_values[col]);
    }
    Ok((basis, weights))
}

/// Project every local covariance through the change-of-basis matrix and
/// average the diagonals; record how much variance the projection loses.
fn evaluate_variances(locals: &[ReducedBasis], merged: &mut MergedBasis) {
    let mut captured_total = 0.0;
    let mut variance_total = 0.0;

    for local in locals {
        // k×D change of basis between the local and the global frame.
        let change = local.basis.tr_mul(&merged.basis);
        for d in 0..merged.dim {
            let mut captured = 0.0;
            for k in 0..local.dim() {
                captured += change[(k, d)] * change[(k, d)] * local.variances[k];
            }
            merged.variances[d] += captured;
            captured_total += captured;
        }
        variance_total += local.total_variance();
    }

    for var in &mut merged.variances {
        *var /= locals.len() as f64;
    }
    merged.projection_loss = if variance_total > 0.0 {
        (1.0 - captured_total / variance_total).max(0.0)
    } else {
        0.0
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pca::dynpca::DynPcaParams;
    use std::time::Duration;

    fn steady_pca(seed: u64) -> DynPca {
        let queue = test_traces(20, seed);
        let params = DynPcaParams {
            settle_dur: Duration::ZERO,
            converge_dur: Duration::ZERO,
            ..DynPcaParams::default()
        };
        let mut pca = DynPca::from_queue_with_params(&queue, params).unwrap();
        for trace in test_traces(4, seed ^ 0xffff) {
            std::thread::sleep(Duration::from_millis(1));
            pca.new_sample(&trace);
        }
        assert!(pca.is_steady());
        pca
    }

    fn test_traces(count: usize, seed: u64) -> Vec<Vec<u8>> {
        let mut state = seed.wrapping_add(1);
        let mut next = move || {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (state >> 33) as u8
        };
        (0..count)
            .map(|_| (0..MAP_SIZE).map(|_| next() % 6).collect())
            .collect()
    }

    fn assert_orthonormal(basis: &DMatrix<f64>) {
        let gram = basis.tr_mul(basis);
        for i in 0..gram.nrows() {
            for j in 0..gram.ncols() {
                let expect = if i == j { 1.0 } else { 0.0 };
                assert!((gram[(i, j)] - expect).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn reduction_keeps_orthonormality_and_sorted_variances() {
        let pca = steady_pca(5);
        let local = reduce_local(&pca).unwrap();
        assert!(local.dim() >= 1);
        assert_orthonormal(&local.basis);
        for w in local.variances.windows(2) {
            assert!(w[0] >= w[1] - 1e-12);
        }
    }

    #[test]
    fn merged_basis_is_orthonormal_and_bounded() {
        let a = steady_pca(1);
        let b = steady_pca(2);
        let merged = merge_bases(&[&a, &b]).unwrap();
        assert!(merged.dim <= PCA_INIT_DIM);
        assert_eq!(merged.basis.ncols(), merged.dim);
        assert_orthonormal(&merged.basis);
        assert!((0.0..=1.0).contains(&merged.projection_loss));
        assert!(merged.variances.iter().all(|v| *v >= 0.0));
    }

    #[test]
    fn in_span_vectors_survive_the_round_trip() {
        let a = steady_pca(3);
        let b = steady_pca(4);
        let merged = merge_bases(&[&a, &b]).unwrap();

        // A vector already inside the merged span projects losslessly.
        let mut coords = DVector::<f64>::zeros(merged.dim);
        for (i, c) in coords.iter_mut().enumerate() {
            *c = (i + 1) as f64;
        }
        let vector = merged.back_project(&coords);
        let round = merged.back_project(&merged.project(&vector));
        assert!((&vector - &round).norm() < 1e-6);
    }

    #[test]
    fn merge_rows_respects_the_cap() {
        // 150 weighted unit vectors in a 32-dim space, cap 60.
        let mut rows = Vec::new();
        for i in 0..150 {
            let mut v = DVector::<f64>::zeros(32);
            v[i % 32] = 1.0;
            rows.push((v, 1.0 + (i % 7) as f64));
        }
        let (basis, vars) = merge_rows(rows, 60, 30).unwrap();
        assert!(basis.ncols() <= 30);
        assert_eq!(vars.len(), basis.ncols());
        assert_orthonormal(&basis);
    }
}
