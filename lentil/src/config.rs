//! Options of a factorization run.

use crate::error::{HpfError, Result};
use matrix_param::ParamFloat;
use ndarray::Array1;

/// Gamma hyper parameter shared by all latent dimensions, or one per dimension
#[derive(Debug, Clone, PartialEq)]
pub enum Prior<T> {
    /// The same value for every dimension
    Scalar(T),
    /// One value per dimension (length must equal the rank)
    PerDimension(Vec<T>),
}

impl<T: ParamFloat> Prior<T> {
    /// Expand into a vector of length `rank`, checking that every value
    /// is a positive finite number
    pub fn resolve(&self, rank: usize, what: &str) -> Result<Array1<T>> {
        let values = match self {
            Prior::Scalar(x) => Array1::from_elem(rank, *x),
            Prior::PerDimension(xs) => {
                if xs.len() != rank {
                    return Err(HpfError::config(format!(
                        "{} has {} values but the rank is {}",
                        what,
                        xs.len(),
                        rank
                    )));
                }
                Array1::from_vec(xs.clone())
            }
        };
        if let Some(bad) = values.iter().find(|&&x| !(x.is_finite() && x > T::zero())) {
            return Err(HpfError::config(format!(
                "{} must be positive, found {}",
                what, bad
            )));
        }
        Ok(values)
    }
}

/// Gamma(shape, rate) prior of a hierarchical scale variable
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScalePrior<T> {
    /// a' (rows) or c' (columns)
    pub shape: T,
    /// b' (rows) or d' (columns)
    pub rate: T,
}

/// When to declare convergence
///
/// Every rule except `MaxIter` also requires the relative change of the
/// posterior means in the checked iteration to be below the tolerance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCriterion {
    /// Relative change of the evidence lower bound, which never
    /// decreases under coordinate ascent
    Elbo,
    /// Relative change of the training Poisson log-likelihood under the
    /// posterior means; it may fall for a while before it rises
    TrainLlk,
    /// Relative change of the posterior means of both sides
    DiffNorm,
    /// Always run `max_iter` iterations
    MaxIter,
}

/// Options for HPF inference.
#[derive(Debug, Clone)]
pub struct HpfOptions<T> {
    /// Number of latent dimensions K. Default: 30
    pub rank: usize,
    /// Shape of the row loadings prior. Default: 0.3
    pub row_shape: Prior<T>,
    /// Rate of the row loadings prior (unused with `row_scale`). Default: 1.0
    pub row_rate: Prior<T>,
    /// Shape of the column loadings prior. Default: 0.3
    pub column_shape: Prior<T>,
    /// Rate of the column loadings prior (unused with `column_scale`). Default: 1.0
    pub column_rate: Prior<T>,
    /// Row activity prior; `None` keeps the flat rate prior. Default: Gamma(0.3, 0.3)
    pub row_scale: Option<ScalePrior<T>>,
    /// Column popularity prior; `None` keeps the flat rate prior. Default: Gamma(0.3, 0.3)
    pub column_scale: Option<ScalePrior<T>>,
    /// Maximum number of iterations. Default: 100
    pub max_iter: usize,
    /// Convergence tolerance. Default: 1e-3
    pub tol: T,
    /// Stopping rule. Default: `Elbo`
    pub stop_criterion: StopCriterion,
    /// Evaluate the stopping rule every this many iterations. Default: 10
    pub check_every: usize,
    /// Number of worker threads. Default: all cores
    pub num_threads: usize,
    /// Random seed of the initialization. Default: 1
    pub seed: u64,
    /// Relative perturbation of the initial shapes. Default: 0.01
    pub init_perturbation: T,
    /// Show a progress bar. Default: false
    pub verbose: bool,
}

impl<T: ParamFloat> Default for HpfOptions<T> {
    fn default() -> Self {
        HpfOptions {
            rank: 30,
            row_shape: Prior::Scalar(T::cast(0.3)),
            row_rate: Prior::Scalar(T::one()),
            column_shape: Prior::Scalar(T::cast(0.3)),
            column_rate: Prior::Scalar(T::one()),
            row_scale: Some(ScalePrior {
                shape: T::cast(0.3),
                rate: T::cast(0.3),
            }),
            column_scale: Some(ScalePrior {
                shape: T::cast(0.3),
                rate: T::cast(0.3),
            }),
            max_iter: 100,
            tol: T::cast(1e-3),
            stop_criterion: StopCriterion::Elbo,
            check_every: 10,
            num_threads: num_cpus::get(),
            seed: 1,
            init_perturbation: T::cast(0.01),
            verbose: false,
        }
    }
}

/// Prior vectors after validation
#[derive(Debug, Clone)]
pub struct ResolvedPriors<T> {
    /// a[k]
    pub row_shape: Array1<T>,
    /// b[k]
    pub row_rate: Array1<T>,
    /// c[k]
    pub column_shape: Array1<T>,
    /// d[k]
    pub column_rate: Array1<T>,
}

impl<T: ParamFloat> HpfOptions<T> {
    /// Flat Gamma(shape, rate) priors on both sides, no hierarchy
    pub fn with_flat_priors(rank: usize, shape: T, rate: T) -> Self {
        HpfOptions {
            rank,
            row_shape: Prior::Scalar(shape),
            row_rate: Prior::Scalar(rate),
            column_shape: Prior::Scalar(shape),
            column_rate: Prior::Scalar(rate),
            row_scale: None,
            column_scale: None,
            ..Default::default()
        }
    }

    /// Reject options that cannot run
    pub fn validate(&self) -> Result<ResolvedPriors<T>> {
        if self.rank == 0 {
            return Err(HpfError::config("rank must be positive"));
        }
        if !(self.tol.is_finite() && self.tol > T::zero()) {
            return Err(HpfError::config(format!(
                "tolerance must be positive, found {}",
                self.tol
            )));
        }
        if self.max_iter == 0 {
            return Err(HpfError::config("max_iter must be positive"));
        }
        if self.check_every == 0 {
            return Err(HpfError::config("check_every must be positive"));
        }
        if self.num_threads == 0 {
            return Err(HpfError::config("num_threads must be positive"));
        }
        if !(self.init_perturbation.is_finite() && self.init_perturbation >= T::zero()) {
            return Err(HpfError::config(format!(
                "init_perturbation must be non-negative, found {}",
                self.init_perturbation
            )));
        }
        for (name, scale) in [("row_scale", &self.row_scale), ("column_scale", &self.column_scale)]
        {
            if let Some(s) = scale {
                let ok = |x: T| x.is_finite() && x > T::zero();
                if !(ok(s.shape) && ok(s.rate)) {
                    return Err(HpfError::config(format!(
                        "{} must have positive shape and rate",
                        name
                    )));
                }
            }
        }

        Ok(ResolvedPriors {
            row_shape: self.row_shape.resolve(self.rank, "row_shape")?,
            row_rate: self.row_rate.resolve(self.rank, "row_rate")?,
            column_shape: self.column_shape.resolve(self.rank, "column_shape")?,
            column_rate: self.column_rate.resolve(self.rank, "column_rate")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let options = HpfOptions::<f64>::default();
        let priors = options.validate().unwrap();
        assert_eq!(priors.row_shape.len(), 30);
        assert!(options.num_threads > 0);
        assert_eq!(options.stop_criterion, StopCriterion::Elbo);
    }

    #[test]
    fn test_zero_rank_rejected() {
        let options = HpfOptions::<f32> {
            rank: 0,
            ..Default::default()
        };
        assert!(matches!(
            options.validate(),
            Err(HpfError::ConfigurationError(_))
        ));
    }

    #[test]
    fn test_bad_tolerance_rejected() {
        for tol in [0.0, -1.0, f64::NAN] {
            let options = HpfOptions::<f64> {
                tol,
                ..Default::default()
            };
            assert!(options.validate().is_err());
        }
    }

    #[test]
    fn test_per_dimension_prior() {
        let mut options = HpfOptions::<f64>::with_flat_priors(3, 1.0, 1.0);
        options.row_shape = Prior::PerDimension(vec![0.1, 0.2, 0.3]);
        let priors = options.validate().unwrap();
        assert_eq!(priors.row_shape.to_vec(), vec![0.1, 0.2, 0.3]);

        options.row_shape = Prior::PerDimension(vec![0.1, 0.2]);
        assert!(options.validate().is_err());

        options.row_shape = Prior::PerDimension(vec![0.1, 0.0, 0.3]);
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_bad_scale_prior_rejected() {
        let options = HpfOptions::<f64> {
            column_scale: Some(ScalePrior {
                shape: 1.0,
                rate: -2.0,
            }),
            ..Default::default()
        };
        assert!(options.validate().is_err());
    }
}
