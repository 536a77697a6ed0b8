//! Response generators: how observed values are drawn from evaluated parameters.

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;
use rand::Rng;
use rand_distr::{Binomial, Distribution, Exp, Gamma, Normal, Poisson};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SimError};
use crate::stream::RandomStream;

/// Poisson rates below this are drawn as a single Bernoulli trial.
const POISSON_MIN_LAMBDA: f64 = 1e-9;

/// Largest Poisson rate whose counts still fit in a `u64`.
const POISSON_MAX_LAMBDA: f64 = 1.844e19;

/// Evaluated parameter vectors keyed by parameter name, in formula order.
pub type Params = IndexMap<String, Vec<f64>>;

/// Draws `count` response values given named parameter vectors.
///
/// Parameter vectors may be shorter than `count`; generators recycle them.
/// Bad argument names or values are [`SimError::Invocation`] errors.
pub trait ResponseGenerator {
    fn generate(&self, count: usize, params: &Params, stream: &mut RandomStream) -> Result<Vec<f64>>;
}

impl<F> ResponseGenerator for F
where
    F: Fn(usize, &Params, &mut RandomStream) -> Result<Vec<f64>>,
{
    fn generate(&self, count: usize, params: &Params, stream: &mut RandomStream) -> Result<Vec<f64>> {
        self(count, params, stream)
    }
}

/// Built-in response distributions, named by their parameters:
///
/// | family        | parameters (default)         |
/// |---------------|------------------------------|
/// | `normal`      | `mean` (0), `sd` (1)         |
/// | `poisson`     | `lambda`                     |
/// | `binomial`    | `size`, `prob`               |
/// | `gamma`       | `shape`, `rate` (1)          |
/// | `exponential` | `rate` (1)                   |
/// | `uniform`     | `min` (0), `max` (1)         |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    #[default]
    Normal,
    Poisson,
    Binomial,
    Gamma,
    Exponential,
    Uniform,
}

impl Family {
    /// Returns all families.
    pub fn all() -> Vec<Family> {
        vec![
            Family::Normal,
            Family::Poisson,
            Family::Binomial,
            Family::Gamma,
            Family::Exponential,
            Family::Uniform,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            Family::Normal => "normal",
            Family::Poisson => "poisson",
            Family::Binomial => "binomial",
            Family::Gamma => "gamma",
            Family::Exponential => "exponential",
            Family::Uniform => "uniform",
        }
    }

    /// Parameter names with their defaults (`None` means required).
    pub fn formals(&self) -> &'static [(&'static str, Option<f64>)] {
        match self {
            Family::Normal => &[("mean", Some(0.0)), ("sd", Some(1.0))],
            Family::Poisson => &[("lambda", None)],
            Family::Binomial => &[("size", None), ("prob", None)],
            Family::Gamma => &[("shape", None), ("rate", Some(1.0))],
            Family::Exponential => &[("rate", Some(1.0))],
            Family::Uniform => &[("min", Some(0.0)), ("max", Some(1.0))],
        }
    }

    /// Resolves the formals against `params`, in formal order.
    fn bind<'p>(&self, params: &'p Params) -> Result<Vec<Cow<'p, [f64]>>> {
        let formals = self.formals();
        if let Some(unused) = params.keys().find(|k| !formals.iter().any(|(f, _)| *f == k.as_str())) {
            return Err(SimError::invocation(format!(
                "{}: unused argument ({unused})",
                self.name()
            )));
        }

        formals
            .iter()
            .map(|(formal, default)| match (params.get(*formal), default) {
                (Some(values), _) if values.is_empty() => Err(SimError::invocation(format!(
                    "{}: argument \"{formal}\" has length zero",
                    self.name()
                ))),
                (Some(values), _) => Ok(Cow::Borrowed(values.as_slice())),
                (None, Some(default)) => Ok(Cow::Owned(vec![*default])),
                (None, None) => Err(SimError::invocation(format!(
                    "{}: argument \"{formal}\" is missing, with no default",
                    self.name()
                ))),
            })
            .collect()
    }

    fn draw(&self, args: &[f64], stream: &mut RandomStream) -> Result<f64> {
        let invalid = |e: &dyn fmt::Display| SimError::invocation(format!("{}: {e}", self.name()));
        let value = match *self {
            Family::Normal => Normal::new(args[0], args[1])
                .map_err(|e| invalid(&e))?
                .sample(stream),
            Family::Poisson => {
                let lambda = args[0];
                if !(lambda.is_finite() && (0.0..=POISSON_MAX_LAMBDA).contains(&lambda)) {
                    return Err(invalid(&format!("invalid lambda {lambda}")));
                }
                if lambda < POISSON_MIN_LAMBDA {
                    // P(X >= 2) is below lambda^2 / 2 here, so one Bernoulli trial suffices.
                    if stream.gen::<f64>() < lambda {
                        1.0
                    } else {
                        0.0
                    }
                } else {
                    let count: f64 = Poisson::new(lambda).map_err(|e| invalid(&e))?.sample(stream);
                    count.max(0.0)
                }
            }
            Family::Binomial => {
                let size = args[0];
                if !(size.is_finite() && size >= 0.0 && size.fract() == 0.0) {
                    return Err(invalid(&format!("invalid size {size}")));
                }
                let successes: u64 = Binomial::new(size as u64, args[1])
                    .map_err(|e| invalid(&e))?
                    .sample(stream);
                successes as f64
            }
            Family::Gamma => Gamma::new(args[0], 1.0 / args[1])
                .map_err(|e| invalid(&e))?
                .sample(stream),
            Family::Exponential => Exp::new(args[0]).map_err(|e| invalid(&e))?.sample(stream),
            Family::Uniform => {
                let (min, max) = (args[0], args[1]);
                if !(min.is_finite() && max.is_finite() && min <= max) {
                    return Err(invalid(&format!("invalid range [{min}, {max}]")));
                }
                min + (max - min) * stream.gen::<f64>()
            }
        };
        Ok(value)
    }
}

impl ResponseGenerator for Family {
    fn generate(&self, count: usize, params: &Params, stream: &mut RandomStream) -> Result<Vec<f64>> {
        let columns = self.bind(params)?;
        let mut args = vec![0.0; columns.len()];
        let mut out = Vec::with_capacity(count);
        for i in 0..count {
            for (arg, column) in args.iter_mut().zip(&columns) {
                *arg = column[i % column.len()];
            }
            out.push(self.draw(&args, stream)?);
        }
        Ok(out)
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Family {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "normal" | "gaussian" | "rnorm" => Ok(Family::Normal),
            "poisson" | "rpois" => Ok(Family::Poisson),
            "binomial" | "rbinom" => Ok(Family::Binomial),
            "gamma" | "rgamma" => Ok(Family::Gamma),
            "exponential" | "exp" | "rexp" => Ok(Family::Exponential),
            "uniform" | "runif" => Ok(Family::Uniform),
            _ => Err(SimError::resolution(format!(
                "unknown response family: '{s}'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, Vec<f64>)]) -> Params {
        pairs
            .iter()
            .map(|(name, values)| (name.to_string(), values.clone()))
            .collect()
    }

    fn mean_sd(values: &[f64]) -> (f64, f64) {
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
        (mean, var.sqrt())
    }

    #[test]
    fn test_normal_moments() {
        let mut stream = RandomStream::from_seed(42);
        let draws = Family::Normal
            .generate(20_000, &params(&[("mean", vec![5.0]), ("sd", vec![2.0])]), &mut stream)
            .unwrap();
        let (mean, sd) = mean_sd(&draws);
        assert!((mean - 5.0).abs() < 0.1, "mean {mean}");
        assert!((sd - 2.0).abs() < 0.1, "sd {sd}");
    }

    #[test]
    fn test_parameters_are_recycled() {
        let mut stream = RandomStream::from_seed(1);
        let draws = Family::Normal
            .generate(6, &params(&[("mean", vec![1.0, 2.0, 3.0]), ("sd", vec![0.0])]), &mut stream)
            .unwrap();
        assert_eq!(draws, vec![1.0, 2.0, 3.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_defaults_apply() {
        let mut stream = RandomStream::from_seed(3);
        let draws = Family::Uniform.generate(500, &Params::new(), &mut stream).unwrap();
        assert!(draws.iter().all(|&u| (0.0..1.0).contains(&u)));
    }

    #[test]
    fn test_unknown_and_missing_arguments() {
        let mut stream = RandomStream::from_seed(1);
        let unknown = Family::Normal.generate(3, &params(&[("mu", vec![0.0])]), &mut stream);
        assert!(matches!(unknown, Err(SimError::Invocation(_))));

        let missing = Family::Poisson.generate(3, &Params::new(), &mut stream);
        assert!(matches!(missing, Err(SimError::Invocation(_))));
    }

    #[test]
    fn test_invalid_values() {
        let mut stream = RandomStream::from_seed(1);
        let bad_sd = Family::Normal.generate(1, &params(&[("sd", vec![-1.0])]), &mut stream);
        assert!(matches!(bad_sd, Err(SimError::Invocation(_))));

        let bad_prob = Family::Binomial.generate(
            1,
            &params(&[("size", vec![3.0]), ("prob", vec![1.5])]),
            &mut stream,
        );
        assert!(matches!(bad_prob, Err(SimError::Invocation(_))));
    }

    #[test]
    fn test_count_families() {
        let mut stream = RandomStream::from_seed(9);
        let zeros = Family::Poisson
            .generate(10, &params(&[("lambda", vec![0.0])]), &mut stream)
            .unwrap();
        assert!(zeros.iter().all(|&v| v == 0.0));

        let counts = Family::Poisson
            .generate(200, &params(&[("lambda", vec![3.0])]), &mut stream)
            .unwrap();
        assert!(counts.iter().all(|&v| v >= 0.0 && v.fract() == 0.0));

        let coins = Family::Binomial
            .generate(200, &params(&[("size", vec![1.0]), ("prob", vec![0.5])]), &mut stream)
            .unwrap();
        assert!(coins.iter().all(|&v| v == 0.0 || v == 1.0));
    }

    #[test]
    fn test_poisson_extreme_rates() {
        let mut stream = RandomStream::from_seed(17);
        for lambda in [1e-300, 1e-20, 1e-10, 1e-6] {
            let draws = Family::Poisson
                .generate(1000, &params(&[("lambda", vec![lambda])]), &mut stream)
                .unwrap();
            assert!(
                draws.iter().all(|&v| v >= 0.0 && v.fract() == 0.0),
                "lambda {lambda}: {draws:?}"
            );
        }

        for lambda in [f64::INFINITY, f64::NAN, -1.0, 1e20] {
            let result = Family::Poisson.generate(1, &params(&[("lambda", vec![lambda])]), &mut stream);
            assert!(matches!(result, Err(SimError::Invocation(_))), "lambda {lambda}");
        }
    }

    #[test]
    fn test_positive_families() {
        let mut stream = RandomStream::from_seed(4);
        let gamma = Family::Gamma
            .generate(100, &params(&[("shape", vec![2.0])]), &mut stream)
            .unwrap();
        let exp = Family::Exponential.generate(100, &Params::new(), &mut stream).unwrap();
        assert!(gamma.iter().chain(&exp).all(|&v| v >= 0.0));
    }

    #[test]
    fn test_same_seed_same_draws() {
        let p = params(&[("mean", vec![0.5])]);
        let a = Family::Normal.generate(8, &p, &mut RandomStream::from_seed(5)).unwrap();
        let b = Family::Normal.generate(8, &p, &mut RandomStream::from_seed(5)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_closure_generator() {
        let identity = |count: usize, params: &Params, _: &mut RandomStream| -> Result<Vec<f64>> {
            Ok(params["mean"].iter().cycle().take(count).copied().collect())
        };
        let mut stream = RandomStream::from_seed(0);
        let out = identity
            .generate(4, &params(&[("mean", vec![1.0, 2.0])]), &mut stream)
            .unwrap();
        assert_eq!(out, vec![1.0, 2.0, 1.0, 2.0]);
    }

    #[test]
    fn test_family_names() {
        for family in Family::all() {
            assert_eq!(family.name().parse::<Family>().unwrap(), family);
        }
        assert_eq!("rpois".parse::<Family>().unwrap(), Family::Poisson);
        assert!(matches!("cauchy".parse::<Family>(), Err(SimError::Resolution(_))));
    }
}
