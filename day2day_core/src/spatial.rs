//! Gaussian process generators for spatial and multivariate spatial effects.
//!
//! All outputs of the multivariate helpers use block layout: the `n` values
//! of process 1, then the `n` values of process 2, and so on.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::covariance::{CovarianceFamily, CovarianceModel};
use crate::error::{Result, SimError};
use crate::stream::RandomStream;

/// Pairwise Euclidean distances between the points `(s1[i], s2[i])`.
pub fn distance_matrix(s1: &[f64], s2: &[f64]) -> Result<DMatrix<f64>> {
    if s1.len() != s2.len() {
        return Err(SimError::reshape(format!(
            "coordinate lengths differ: s1 has {}, s2 has {}",
            s1.len(),
            s2.len()
        )));
    }
    let n = s1.len();
    Ok(DMatrix::from_fn(n, n, |i, j| {
        let dx = s1[i] - s1[j];
        let dy = s2[i] - s2[j];
        (dx * dx + dy * dy).sqrt()
    }))
}

/// Lower Cholesky factor of `matrix`, or a [`SimError::Numeric`] naming `what`.
fn cholesky_lower(matrix: DMatrix<f64>, what: &str) -> Result<DMatrix<f64>> {
    let dim = matrix.nrows();
    matrix
        .cholesky()
        .map(|c| c.l())
        .ok_or_else(|| SimError::numeric(format!("{what} ({dim}x{dim}) is not positive-definite")))
}

/// Draws one realization of a zero-mean Gaussian process at the given points.
///
/// Returns `L z` where `L L^T = C` is the Cholesky factorization of the model
/// covariance and `z` is a vector of standard normals taken from `stream`.
pub fn gp<M>(s1: &[f64], s2: &[f64], model: &M, stream: &mut RandomStream) -> Result<Vec<f64>>
where
    M: CovarianceModel + ?Sized,
{
    let distances = distance_matrix(s1, s2)?;
    let covariance = model.covariance(&distances);
    let lower = cholesky_lower(covariance, "covariance matrix")?;

    let z = DVector::from_vec(stream.standard_normals(s1.len()));
    let w = lower * z;
    Ok(w.iter().copied().collect())
}

/// Parameters of a linear model of coregionalization with `q` processes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coregionalization {
    /// Correlation family shared by the latent processes
    pub family: CovarianceFamily,

    /// Cross-process variance (`q x q`, positive-definite)
    pub variance: DMatrix<f64>,

    /// Non-spatial nugget (`q x q`), added at zero distance
    pub nugget: DMatrix<f64>,

    /// Decay per latent process (length `q`)
    pub phi: Vec<f64>,

    /// Matern shape per latent process (length `q`)
    pub kappa: Option<Vec<f64>>,
}

impl Coregionalization {
    /// Creates parameters with a zero nugget and no shape vector.
    pub fn new(family: CovarianceFamily, variance: DMatrix<f64>, phi: Vec<f64>) -> Self {
        let q = variance.nrows();
        Self {
            family,
            variance,
            nugget: DMatrix::zeros(q, q),
            phi,
            kappa: None,
        }
    }

    /// Sets the nugget matrix.
    pub fn with_nugget(mut self, nugget: DMatrix<f64>) -> Self {
        self.nugget = nugget;
        self
    }

    /// Sets the per-process Matern shapes.
    pub fn with_kappa(mut self, kappa: Vec<f64>) -> Self {
        self.kappa = Some(kappa);
        self
    }

    /// Number of processes `q`.
    pub fn processes(&self) -> usize {
        self.variance.nrows()
    }

    /// Checks that all dimensions agree with `q`.
    pub fn validate(&self) -> Result<()> {
        let q = self.processes();
        if q == 0 || !self.variance.is_square() {
            return Err(SimError::reshape(format!(
                "variance must be a non-empty square matrix, got {}x{}",
                self.variance.nrows(),
                self.variance.ncols()
            )));
        }
        if self.nugget.shape() != (q, q) {
            return Err(SimError::reshape(format!(
                "nugget must be {q}x{q}, got {}x{}",
                self.nugget.nrows(),
                self.nugget.ncols()
            )));
        }
        if self.phi.len() != q {
            return Err(SimError::reshape(format!(
                "phi must have {q} entries, got {}",
                self.phi.len()
            )));
        }
        if let Some(kappa) = &self.kappa {
            if kappa.len() != q {
                return Err(SimError::reshape(format!(
                    "kappa must have {q} entries, got {}",
                    kappa.len()
                )));
            }
        }
        Ok(())
    }
}

/// Builds the `nq x nq` covariance of a linear model of coregionalization.
///
/// Rows and columns are point-major with the process index varying fastest,
/// so entry `(i*q + a, j*q + b)` is the covariance of process `a` at point
/// `i` with process `b` at point `j`:
///
/// `sum_k A[a,k] rho_k(d_ij) A[b,k] + [i = j] nugget[a,b]`
///
/// where `A` is the lower Cholesky factor of the variance matrix.
pub fn lmc_covariance(distances: &DMatrix<f64>, params: &Coregionalization) -> Result<DMatrix<f64>> {
    params.validate()?;
    let q = params.processes();
    let n = distances.nrows();
    let a = cholesky_lower(params.variance.clone(), "variance matrix")?;

    let mut covariance = DMatrix::zeros(n * q, n * q);
    let mut rho = vec![0.0; q];
    for i in 0..n {
        for j in 0..n {
            let d = distances[(i, j)];
            for (k, r) in rho.iter_mut().enumerate() {
                let kappa = params.kappa.as_ref().map(|v| v[k]);
                *r = params.family.correlation(d, params.phi[k], kappa);
            }
            for p in 0..q {
                for s in 0..q {
                    let mut value: f64 = (0..q).map(|k| a[(p, k)] * rho[k] * a[(s, k)]).sum();
                    if i == j {
                        value += params.nugget[(p, s)];
                    }
                    covariance[(i * q + p, j * q + s)] = value;
                }
            }
        }
    }
    Ok(covariance)
}

/// Draws one realization of a `q`-variate spatial process at `n` points.
///
/// The result has length `n*q` in block layout.
pub fn mgp(
    s1: &[f64],
    s2: &[f64],
    params: &Coregionalization,
    stream: &mut RandomStream,
) -> Result<Vec<f64>> {
    let distances = distance_matrix(s1, s2)?;
    let covariance = lmc_covariance(&distances, params)?;
    let lower = cholesky_lower(covariance, "multivariate covariance matrix")?;

    let n = s1.len();
    let q = params.processes();
    debug!(n, q, family = %params.family, "drawing multivariate process");

    let z = DVector::from_vec(stream.standard_normals(n * q));
    let w = lower * z;

    let mut out = vec![0.0; n * q];
    for i in 0..n {
        for k in 0..q {
            out[k * n + i] = w[i * q + k];
        }
    }
    Ok(out)
}

/// Multivariate fixed effect: `x` scaled by each coefficient in turn.
///
/// `out[k*n + i] = x[i] * beta[k]`, the column-major flattening of `x beta^T`.
pub fn mfe(x: &[f64], beta: &[f64]) -> Result<Vec<f64>> {
    if beta.is_empty() {
        return Err(SimError::reshape("mfe: beta must not be empty"));
    }
    Ok(beta
        .iter()
        .flat_map(|b| x.iter().map(move |xi| xi * b))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::covariance::{exp_cov, Kernel};
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    fn grid() -> (Vec<f64>, Vec<f64>) {
        let mut s1 = Vec::new();
        let mut s2 = Vec::new();
        for i in 0..3 {
            for j in 0..3 {
                s1.push(i as f64 * 0.5);
                s2.push(j as f64 * 0.5);
            }
        }
        (s1, s2)
    }

    fn sample_correlation(a: &[f64], b: &[f64]) -> f64 {
        let n = a.len() as f64;
        let ma = a.iter().sum::<f64>() / n;
        let mb = b.iter().sum::<f64>() / n;
        let cov: f64 = a.iter().zip(b).map(|(x, y)| (x - ma) * (y - mb)).sum();
        let va: f64 = a.iter().map(|x| (x - ma).powi(2)).sum();
        let vb: f64 = b.iter().map(|y| (y - mb).powi(2)).sum();
        cov / (va * vb).sqrt()
    }

    #[test]
    fn test_distance_matrix() {
        let d = distance_matrix(&[0.0, 3.0], &[0.0, 4.0]).unwrap();
        assert_eq!(d[(0, 0)], 0.0);
        assert_relative_eq!(d[(0, 1)], 5.0);
        assert_relative_eq!(d[(1, 0)], 5.0);
    }

    #[test]
    fn test_unequal_coordinates_is_reshape_error() {
        let mut stream = RandomStream::from_seed(1);
        let kernel = Kernel::new(CovarianceFamily::Exponential, 1.0, 1.0);
        let result = gp(&[0.0, 1.0], &[0.0], &kernel, &mut stream);
        assert!(matches!(result, Err(SimError::Reshape(_))));
    }

    #[test]
    fn test_gp_empirical_covariance_matches_model() {
        let (s1, s2) = grid();
        let phi = 0.8;
        let model = |d: &DMatrix<f64>| exp_cov(d, phi, 1.0);
        let expected = exp_cov(&distance_matrix(&s1, &s2).unwrap(), phi, 1.0);

        let mut stream = RandomStream::from_seed(2024);
        let reps = 5000;
        let n = s1.len();
        let mut acc = DMatrix::<f64>::zeros(n, n);
        for _ in 0..reps {
            let w = DVector::from_vec(gp(&s1, &s2, &model, &mut stream).unwrap());
            acc += &w * w.transpose();
        }
        acc /= reps as f64;

        for i in 0..n {
            for j in 0..n {
                assert!(
                    (acc[(i, j)] - expected[(i, j)]).abs() < 0.25,
                    "entry ({i},{j}): empirical {} vs model {}",
                    acc[(i, j)],
                    expected[(i, j)]
                );
            }
        }
    }

    #[test]
    fn test_singular_covariance_is_numeric_error() {
        // Two coincident points under a pure exponential model are perfectly correlated.
        let mut stream = RandomStream::from_seed(3);
        let kernel = Kernel::new(CovarianceFamily::Exponential, 1.0, 1.0);
        let result = gp(&[0.5, 0.5], &[0.5, 0.5], &kernel, &mut stream);
        assert!(matches!(result, Err(SimError::Numeric(_))));
    }

    #[test]
    fn test_mgp_single_process_equals_gp() {
        let (s1, s2) = grid();
        let kernel = Kernel::new(CovarianceFamily::Exponential, 0.7, 2.0);
        let params = Coregionalization::new(
            CovarianceFamily::Exponential,
            DMatrix::from_element(1, 1, 2.0),
            vec![0.7],
        );

        let univariate = gp(&s1, &s2, &kernel, &mut RandomStream::from_seed(99)).unwrap();
        let multivariate = mgp(&s1, &s2, &params, &mut RandomStream::from_seed(99)).unwrap();

        assert_eq!(univariate.len(), multivariate.len());
        for (u, m) in univariate.iter().zip(&multivariate) {
            assert_relative_eq!(u, m, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_matern_single_process_equals_matern_gp() {
        let (s1, s2) = grid();
        let kernel = Kernel::new(CovarianceFamily::Matern, 0.6, 1.5).with_kappa(1.5);
        let params = Coregionalization::new(
            CovarianceFamily::Matern,
            DMatrix::from_element(1, 1, 1.5),
            vec![0.6],
        )
        .with_kappa(vec![1.5]);

        let univariate = gp(&s1, &s2, &kernel, &mut RandomStream::from_seed(21)).unwrap();
        let multivariate = mgp(&s1, &s2, &params, &mut RandomStream::from_seed(21)).unwrap();

        for (u, m) in univariate.iter().zip(&multivariate) {
            assert_relative_eq!(u, m, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_lmc_uses_per_process_kappa() {
        let params = Coregionalization::new(CovarianceFamily::Matern, DMatrix::identity(2, 2), vec![1.0, 1.0])
            .with_kappa(vec![0.5, 2.5]);
        let distances = distance_matrix(&[0.0, 0.8], &[0.0, 0.0]).unwrap();
        let c = lmc_covariance(&distances, &params).unwrap();

        // Identity variance keeps the latent processes apart, each with its own shape.
        let family = CovarianceFamily::Matern;
        assert_relative_eq!(c[(0, 2)], family.correlation(0.8, 1.0, Some(0.5)), epsilon = 1e-12);
        assert_relative_eq!(c[(1, 3)], family.correlation(0.8, 1.0, Some(2.5)), epsilon = 1e-12);
        assert_relative_eq!(c[(0, 3)], 0.0, epsilon = 1e-12);
        assert!(c[(1, 3)] > c[(0, 2)]);
    }

    #[test]
    fn test_mismatched_kappa_and_nugget_are_reshape_errors() {
        let distances = distance_matrix(&[0.0, 1.0], &[0.0, 1.0]).unwrap();
        let base = Coregionalization::new(CovarianceFamily::Matern, DMatrix::identity(2, 2), vec![1.0, 1.0]);

        let bad_kappa = base.clone().with_kappa(vec![0.5, 1.5, 2.5]);
        assert!(matches!(
            lmc_covariance(&distances, &bad_kappa),
            Err(SimError::Reshape(_))
        ));

        let bad_nugget = base.with_nugget(DMatrix::zeros(3, 3));
        assert!(matches!(
            lmc_covariance(&distances, &bad_nugget),
            Err(SimError::Reshape(_))
        ));
    }

    #[test]
    fn test_lmc_diagonal_block_is_variance_plus_nugget() {
        let variance = DMatrix::from_row_slice(2, 2, &[1.0, 0.4, 0.4, 2.0]);
        let nugget = DMatrix::from_row_slice(2, 2, &[0.1, 0.0, 0.0, 0.2]);
        let params = Coregionalization::new(CovarianceFamily::Gaussian, variance.clone(), vec![0.5, 1.5])
            .with_nugget(nugget.clone());

        let distances = distance_matrix(&[0.0, 1.0, 0.3], &[0.0, 0.2, 0.9]).unwrap();
        let c = lmc_covariance(&distances, &params).unwrap();

        assert_eq!(c.shape(), (6, 6));
        for i in 0..3 {
            for a in 0..2 {
                for b in 0..2 {
                    assert_relative_eq!(
                        c[(i * 2 + a, i * 2 + b)],
                        variance[(a, b)] + nugget[(a, b)],
                        epsilon = 1e-12
                    );
                }
            }
        }
        assert_relative_eq!(c.clone(), c.transpose(), epsilon = 1e-12);
    }

    #[test]
    fn test_mgp_block_layout() {
        // Points far apart decorrelate in space, leaving only the cross-process link.
        let s1 = [0.0, 100.0];
        let s2 = [0.0, 100.0];
        let variance = DMatrix::from_row_slice(2, 2, &[1.0, 0.9, 0.9, 1.0]);
        let params = Coregionalization::new(CovarianceFamily::Exponential, variance, vec![0.5, 0.5]);

        let mut stream = RandomStream::from_seed(11);
        let reps = 4000;
        let mut first = Vec::with_capacity(reps);
        let mut same_point_other_process = Vec::with_capacity(reps);
        let mut other_point_same_process = Vec::with_capacity(reps);
        for _ in 0..reps {
            let w = mgp(&s1, &s2, &params, &mut stream).unwrap();
            assert_eq!(w.len(), 4);
            first.push(w[0]);
            same_point_other_process.push(w[2]);
            other_point_same_process.push(w[1]);
        }

        assert!((sample_correlation(&first, &same_point_other_process) - 0.9).abs() < 0.05);
        assert!(sample_correlation(&first, &other_point_same_process).abs() < 0.07);
    }

    #[test]
    fn test_mismatched_phi_is_reshape_error() {
        let params = Coregionalization::new(CovarianceFamily::Exponential, DMatrix::identity(2, 2), vec![1.0]);
        let mut stream = RandomStream::from_seed(5);
        let result = mgp(&[0.0, 1.0], &[0.0, 1.0], &params, &mut stream);
        assert!(matches!(result, Err(SimError::Reshape(_))));
    }

    #[test]
    fn test_indefinite_variance_is_numeric_error() {
        let variance = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 1.0]);
        let params = Coregionalization::new(CovarianceFamily::Exponential, variance, vec![1.0, 1.0]);
        let distances = distance_matrix(&[0.0], &[0.0]).unwrap();
        assert!(matches!(
            lmc_covariance(&distances, &params),
            Err(SimError::Numeric(_))
        ));
    }

    #[test]
    fn test_mfe_layout() {
        let x = [1.0, 2.0, 3.0, 4.0, 5.0];
        let out = mfe(&x, &[1.0, 2.0]).unwrap();

        assert_eq!(out.len(), 10);
        assert_eq!(&out[..5], &x);
        assert_eq!(&out[5..], &[2.0, 4.0, 6.0, 8.0, 10.0]);
    }

    #[test]
    fn test_mfe_empty_beta_is_reshape_error() {
        assert!(matches!(mfe(&[1.0], &[]), Err(SimError::Reshape(_))));
    }

    proptest! {
        #[test]
        fn prop_mfe_length_is_n_times_q(
            x in prop::collection::vec(-10.0f64..10.0, 0..20),
            beta in prop::collection::vec(-3.0f64..3.0, 1..5),
        ) {
            let out = mfe(&x, &beta).unwrap();
            prop_assert_eq!(out.len(), x.len() * beta.len());
            for (k, b) in beta.iter().enumerate() {
                for (i, xi) in x.iter().enumerate() {
                    prop_assert_eq!(out[k * x.len() + i], xi * b);
                }
            }
        }
    }
}
