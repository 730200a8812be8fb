//! Distances and divergences between seeds in the merged frame.

use nalgebra::{DMatrix, DVector};

use crate::Error;

use super::dynpca::DynPca;

/// Axes whose covariance diagonal falls below this are sliced off before any
/// matrix inverse, keeping the divergences finite.
const DIAG_FLOOR: f64 = 1.0e-5;

/// Ridge added to both covariances so a rank-deficient projection still has
/// a meaningful determinant.
const RIDGE: f64 = 1.0e-10;

/// Plain L2 between two full-length centered vectors.
#[must_use]
pub fn euclidean_full(a: &DVector<f64>, b: &DVector<f64>) -> f64 {
    (a - b).norm()
}

/// L2 between two projections in the merged basis.
#[must_use]
pub fn euclidean_projected(a: &DVector<f64>, b: &DVector<f64>) -> f64 {
    (a - b).norm()
}

/// Variance-weighted L2 between two projections. Degenerate axes are
/// skipped rather than letting a 1/variance weight explode.
#[must_use]
pub fn mahalanobis(a: &DVector<f64>, b: &DVector<f64>, variances: &[f64]) -> f64 {
    let mut sum = 0.0;
    for (i, &var) in variances.iter().enumerate() {
        if var < DIAG_FLOOR {
            continue;
        }
        let diff = a[i] - b[i];
        sum += diff * diff / var;
    }
    sum.sqrt()
}

/// Kullback-Leibler divergence `KL(P ‖ Q)` between two seeds, each treated
/// as the multivariate Gaussian its steady-state PCA describes.
///
/// P's covariance is projected into Q's basis; Q's near-degenerate axes are
/// sliced off first and both covariances get the same tiny ridge, so
/// `KL(P ‖ P)` stays at zero.
pub fn kl_divergence(p: &DynPca, q: &DynPca) -> Result<f64, Error> {
    let cov_q = q.covariance();
    let keep: Vec<usize> = (0..q.dim())
        .filter(|&i| cov_q[(i, i)] >= DIAG_FLOOR)
        .collect();
    if keep.is_empty() {
        return Err(Error::not_factorizable(
            "every axis of Q is degenerate, KL is undefined",
        ));
    }
    let dim = keep.len();

    // P's covariance expressed in Q's coordinates.
    let change = p.basis().tr_mul(q.basis());
    let cov_p_in_q = change.tr_mul(&(p.covariance() * &change));

    let take = |mat: &DMatrix<f64>| {
        DMatrix::from_fn(dim, dim, |i, j| mat[(keep[i], keep[j])])
    };
    let mut sigma_p = take(&cov_p_in_q);
    let mut sigma_q = take(&cov_q);
    for i in 0..dim {
        sigma_p[(i, i)] += RIDGE;
        sigma_q[(i, i)] += RIDGE;
    }

    let det_p = sigma_p.determinant();
    let det_q = sigma_q.determinant();
    if det_p <= 0.0 || det_q <= 0.0 {
        return Err(Error::not_factorizable(
            "covariance determinant is not positive",
        ));
    }
    let inv_q = sigma_q
        .clone()
        .try_inverse()
        .ok_or_else(|| Error::not_factorizable("Q covariance is not invertible"))?;

    let mean_diff = p.centers() - q.centers();
    let proj_diff_full = q.basis().tr_mul(&mean_diff);
    let proj_diff = DVector::from_fn(dim, |i, _| proj_diff_full[keep[i]]);

    let trace_term = (&inv_q * &sigma_p).trace();
    let maha_term = (proj_diff.transpose() * &inv_q * &proj_diff)[(0, 0)];

    Ok(0.5 * (det_q.ln() - det_p.ln() + trace_term - dim as f64 + maha_term))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pca::dynpca::DynPcaParams;
    use crate::trace::MAP_SIZE;
    use std::time::Duration;

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

    fn steady_pca(seed: u64) -> DynPca {
        let params = DynPcaParams {
            settle_dur: Duration::ZERO,
            converge_dur: Duration::ZERO,
            ..DynPcaParams::default()
        };
        let mut pca = DynPca::from_queue_with_params(&test_traces(20, seed), params).unwrap();
        for trace in test_traces(4, seed ^ 0xabcd) {
            std::thread::sleep(Duration::from_millis(1));
            pca.new_sample(&trace);
        }
        assert!(pca.is_steady());
        pca
    }

    #[test]
    fn euclidean_is_symmetric() {
        let a = DVector::from_vec(vec![1.0, 2.0, 3.0]);
        let b = DVector::from_vec(vec![-1.0, 0.5, 9.0]);
        assert_eq!(euclidean_projected(&a, &b), euclidean_projected(&b, &a));
        assert_eq!(euclidean_full(&a, &b), euclidean_full(&b, &a));
        assert_eq!(euclidean_full(&a, &a), 0.0);
    }

    #[test]
    fn mahalanobis_is_symmetric_under_shared_variances() {
        let a = DVector::from_vec(vec![1.0, 2.0, 3.0]);
        let b = DVector::from_vec(vec![0.0, 1.0, -3.0]);
        let vars = [0.5, 2.0, 1.0];
        let d_ab = mahalanobis(&a, &b, &vars);
        let d_ba = mahalanobis(&b, &a, &vars);
        assert!((d_ab - d_ba).abs() < 1e-12);
        assert!(d_ab > 0.0);
    }

    #[test]
    fn mahalanobis_skips_degenerate_axes() {
        let a = DVector::from_vec(vec![1.0, 10.0]);
        let b = DVector::from_vec(vec![0.0, -10.0]);
        let d = mahalanobis(&a, &b, &[1.0, 1e-9]);
        // The second axis must not contribute, despite the huge difference.
        assert!((d - 1.0).abs() < 1e-12);
    }

    #[test]
    fn kl_of_a_pca_against_itself_is_zero() {
        let pca = steady_pca(17);
        let kl = kl_divergence(&pca, &pca).unwrap();
        assert!(kl.abs() < 1e-6, "self-KL was {kl}");
    }

    #[test]
    fn kl_grows_with_the_center_shift() {
        let base = steady_pca(29);
        let mut previous = kl_divergence(&base, &base).unwrap();
        for shift in [1.0, 2.0, 4.0] {
            let mut moved = base.clone();
            moved.shift_centers(shift);
            let kl = kl_divergence(&moved, &base).unwrap();
            assert!(
                kl > previous,
                "KL did not grow: shift={shift} kl={kl} previous={previous}"
            );
            previous = kl;
        }
    }
}
