//! Covariance and correlation functions over distance matrices.
//!
//! Families follow the geoR parameterization with scaled distance `u = d / phi`:
//!
//! | family        | correlation                                   |
//! |---------------|-----------------------------------------------|
//! | `exponential` | `exp(-u)`                                     |
//! | `gaussian`    | `exp(-u^2)`                                   |
//! | `spherical`   | `1 - 1.5u + 0.5u^3` for `u < 1`, else `0`     |
//! | `matern`      | `u^k K_k(u) / (2^(k-1) Gamma(k))`             |

use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use statrs::function::gamma::gamma;

use crate::error::SimError;

/// Default Matern shape; reduces the family to the exponential.
pub const DEFAULT_KAPPA: f64 = 0.5;

/// Exponential correlation `exp(-d / phi)`, elementwise.
///
/// No argument checking: `phi <= 0` yields the degenerate values of the formula.
pub fn exp_cor(distance: &DMatrix<f64>, phi: f64) -> DMatrix<f64> {
    distance.map(|d| (-d / phi).exp())
}

/// Exponential covariance `sigma2 * exp(-d / phi)`, elementwise.
pub fn exp_cov(distance: &DMatrix<f64>, phi: f64, sigma2: f64) -> DMatrix<f64> {
    distance.map(|d| sigma2 * (-d / phi).exp())
}

/// Closed set of supported spatial correlation families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CovarianceFamily {
    /// `exp(-u)`
    Exponential,

    /// `exp(-u^2)`
    Gaussian,

    /// Compactly supported on `u < 1`
    Spherical,

    /// Shape-parameterized by `kappa`
    Matern,
}

impl CovarianceFamily {
    /// Returns the family name.
    pub fn name(&self) -> &'static str {
        match self {
            CovarianceFamily::Exponential => "exponential",
            CovarianceFamily::Gaussian => "gaussian",
            CovarianceFamily::Spherical => "spherical",
            CovarianceFamily::Matern => "matern",
        }
    }

    /// Correlation at distance `d` for decay `phi`.
    ///
    /// `kappa` is only read by [`CovarianceFamily::Matern`] and defaults to
    /// [`DEFAULT_KAPPA`].
    pub fn correlation(&self, d: f64, phi: f64, kappa: Option<f64>) -> f64 {
        let u = d / phi;
        match self {
            CovarianceFamily::Exponential => (-u).exp(),
            CovarianceFamily::Gaussian => (-u * u).exp(),
            CovarianceFamily::Spherical => {
                if u < 1.0 {
                    1.0 - 1.5 * u + 0.5 * u.powi(3)
                } else {
                    0.0
                }
            }
            CovarianceFamily::Matern => matern(u, kappa.unwrap_or(DEFAULT_KAPPA)),
        }
    }
}

impl fmt::Display for CovarianceFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for CovarianceFamily {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "exponential" | "exp" => Ok(CovarianceFamily::Exponential),
            "gaussian" | "gauss" => Ok(CovarianceFamily::Gaussian),
            "spherical" | "sph" => Ok(CovarianceFamily::Spherical),
            "matern" => Ok(CovarianceFamily::Matern),
            _ => Err(SimError::resolution(format!("unknown covariance model: '{s}'"))),
        }
    }
}

/// Maps a distance matrix to a covariance matrix.
///
/// Implemented by [`Kernel`] and by any `Fn(&DMatrix<f64>) -> DMatrix<f64>`,
/// so callers can plug in their own covariance function.
pub trait CovarianceModel {
    /// Covariance matrix for the given pairwise distances.
    fn covariance(&self, distances: &DMatrix<f64>) -> DMatrix<f64>;
}

impl<F> CovarianceModel for F
where
    F: Fn(&DMatrix<f64>) -> DMatrix<f64>,
{
    fn covariance(&self, distances: &DMatrix<f64>) -> DMatrix<f64> {
        self(distances)
    }
}

/// A covariance family with its scale and decay parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Kernel {
    /// Correlation family
    pub family: CovarianceFamily,

    /// Decay (range) parameter
    pub phi: f64,

    /// Partial sill
    pub sigma2: f64,

    /// Matern shape
    pub kappa: Option<f64>,
}

impl Kernel {
    /// Creates a kernel without a shape parameter.
    pub fn new(family: CovarianceFamily, phi: f64, sigma2: f64) -> Self {
        Self {
            family,
            phi,
            sigma2,
            kappa: None,
        }
    }

    /// Sets the Matern shape parameter.
    pub fn with_kappa(mut self, kappa: f64) -> Self {
        self.kappa = Some(kappa);
        self
    }
}

impl CovarianceModel for Kernel {
    fn covariance(&self, distances: &DMatrix<f64>) -> DMatrix<f64> {
        distances.map(|d| self.sigma2 * self.family.correlation(d, self.phi, self.kappa))
    }
}

fn matern(u: f64, kappa: f64) -> f64 {
    if u <= 0.0 {
        return 1.0;
    }
    u.powf(kappa) * bessel_k(kappa, u) / (2f64.powf(kappa - 1.0) * gamma(kappa))
}

/// Modified Bessel function of the second kind `K_nu(x)` for `x > 0`.
///
/// Half-integer orders use the closed form; everything else integrates
/// `K_nu(x) = int_0^inf exp(-x cosh t) cosh(nu t) dt` with the trapezoidal
/// rule, which converges geometrically for this integrand.
pub(crate) fn bessel_k(nu: f64, x: f64) -> f64 {
    let nu = nu.abs();
    let p = (nu - 0.5).round();
    if p >= 0.0 && (nu - 0.5 - p).abs() < 1e-12 {
        return bessel_k_half_integer(p as usize, x);
    }

    const STEP: f64 = 0.05;
    let mut sum = 0.5 * (-x).exp();
    for k in 1..40_000 {
        let t = k as f64 * STEP;
        let base = -x * t.cosh();
        let term = 0.5 * ((base + nu * t).exp() + (base - nu * t).exp());
        sum += term;
        if term <= sum * 1e-17 {
            break;
        }
    }
    sum * STEP
}

/// `K_{p+1/2}(x) = sqrt(pi / 2x) e^-x sum_k (p+k)! / (k! (p-k)!) (2x)^-k`
fn bessel_k_half_integer(p: usize, x: f64) -> f64 {
    let mut sum = 0.0;
    let mut coefficient = 1.0;
    for k in 0..=p {
        if k > 0 {
            // (p+k)! / (k! (p-k)!) from the previous term
            coefficient *= ((p + k) * (p - k + 1)) as f64 / k as f64;
        }
        sum += coefficient / (2.0 * x).powi(k as i32);
    }
    (PI / (2.0 * x)).sqrt() * (-x).exp() * sum
}
