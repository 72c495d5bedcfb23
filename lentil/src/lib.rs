//! Hierarchical Poisson Factorization (HPF) of sparse count matrices.
//!
//! A non-negative count matrix `Y` (rows x columns) is explained by
//! Gamma-distributed latent loadings on both sides,
//!
//! ```text
//! y[u,i]     ~ Poisson(sum_k theta[u,k] beta[i,k])
//! theta[u,k] ~ Gamma(a[k], xi[u]),   xi[u]  ~ Gamma(a', b')
//! beta[i,k]  ~ Gamma(c[k], eta[i]),  eta[i] ~ Gamma(c', d')
//! ```
//!
//! Inference is mean-field coordinate ascent. Each iteration refreshes
//! every row from the current columns, then every column from the new
//! rows, with the entities of a side split across a rayon pool.
//!
//! # Example
//!
//! ```no_run
//! use lentil::{DuplicatePolicy, HpfDriver, HpfOptions, SparseTriplets};
//!
//! # fn main() -> lentil::Result<()> {
//! let store = SparseTriplets::from_triplets(
//!     vec![(0, 0, 5.0_f64), (0, 1, 2.0), (1, 1, 3.0), (2, 2, 1.0)],
//!     DuplicatePolicy::Sum,
//! )?;
//! let mut driver = HpfDriver::new(&store, HpfOptions::with_flat_priors(2, 1.0, 1.0))?;
//! let model = driver.fit()?;
//! println!("E[y(0,0)] = {}", model.predict(0, 0)?);
//! # Ok(())
//! # }
//! ```
//!
//! # References
//!
//! Gopalan, Hofman & Blei (2015). "Scalable Recommendation with
//! Hierarchical Poisson Factorization." UAI.

#![deny(missing_docs)]

/// Options, priors and stopping rules
pub mod config;

/// Stopping rules, evidence lower bound, Poisson log-likelihood and the quality trace
pub mod convergence;

/// Parallel driver and its state machine
pub mod driver;

/// Variational state of the rows or the columns
pub mod entity;

/// Typed errors
pub mod error;

/// Fitted model and post-fit queries
pub mod model;

/// Multinomial responsibilities of one observation
pub mod responsibility;

/// Read-only sparse count matrix with row and column access
pub mod sparse_store;

/// Row and column update phases
pub mod update;

pub use config::{HpfOptions, Prior, ScalePrior, StopCriterion};
pub use convergence::StopReason;
pub use driver::{DriverState, HpfDriver, IterationSummary, StopHandle};
pub use entity::{FactorSide, Role};
pub use error::{HpfError, Result};
pub use model::FittedModel;
pub use sparse_store::{DuplicatePolicy, SparseTriplets};
