//! day2day Core - Formula-Driven Simulation of Synthetic Datasets
//!
//! This library turns a model written as formula terms into a simulated
//! observation table:
//! 1. **Formulas**: `name ~ expression` terms parsed into expression trees
//! 2. **Spatial effects**: Gaussian processes (`gp`) and linear models of
//!    coregionalization (`mgp`, `mfe`) built from covariance families
//! 3. **Engines**: univariate (`SimModel`) and multivariate (`MultiSimModel`)
//!    simulation with pluggable response generators
//!
//! All randomness flows through one caller-owned [`RandomStream`].

pub mod covariance;
pub mod engine;
pub mod error;
pub mod formula;
pub mod response;
pub mod smoothing;
pub mod spatial;
pub mod stream;
pub mod summary;
pub mod table;

// Re-export key types for convenience
pub use covariance::{exp_cor, exp_cov, CovarianceFamily, CovarianceModel, Kernel};
pub use engine::{MultiSimModel, SimModel, DEFAULT_RESPONSE, ID_COLUMN};
pub use error::{Result, SimError};
pub use formula::{Expr, Formula, FunctionTable, Term, Value};
pub use response::{Family, Params, ResponseGenerator};
pub use smoothing::runmean;
pub use spatial::{distance_matrix, gp, lmc_covariance, mfe, mgp, Coregionalization};
pub use stream::RandomStream;
pub use summary::summarize_folder;
pub use table::{Table, TableBundle};
