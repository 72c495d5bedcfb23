//! Variational state of one side (rows or columns) of the factorization.
//!
//! ```text
//! theta[u,k] ~ Gamma(a[k], xi[u])      (xi[u] = b[k] without a hierarchy)
//! xi[u]      ~ Gamma(a', b')
//! ```
//!
//! Rows and columns share this structure; only the [`Role`] differs.

use crate::config::ScalePrior;
use crate::error::{HpfError, Result};
use matrix_param::{GammaMatrix, Inference, ParamFloat, TwoStatParam};
use matrix_util::traits::SampleOps;
use ndarray::prelude::*;

/// Which side of the matrix an entity lives on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Rows (e.g. users)
    Row,
    /// Columns (e.g. items)
    Column,
}

impl Role {
    /// The opposite side
    pub fn partner(self) -> Role {
        match self {
            Role::Row => Role::Column,
            Role::Column => Role::Row,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Row => write!(f, "row"),
            Role::Column => write!(f, "column"),
        }
    }
}

/// Per-entity hierarchical scale (activity of a row, popularity of a column)
#[derive(Debug, Clone)]
pub struct HierarchicalScale<T> {
    prior: ScalePrior<T>,
    /// n x 1 Gamma posteriors
    param: GammaMatrix<T>,
    /// a' + sum_k a[k], the same for every entity
    shape_add: T,
}

impl<T: ParamFloat> HierarchicalScale<T> {
    /// Hyper parameters of the scale variables
    pub fn prior(&self) -> ScalePrior<T> {
        self.prior
    }

    /// Gamma posteriors of the scale variables (n x 1)
    pub fn param(&self) -> &GammaMatrix<T> {
        &self.param
    }

    /// E[xi] of one entity
    #[inline]
    pub fn mean(&self, index: usize) -> T {
        self.param.posterior_mean()[(index, 0)]
    }
}

/// Shape/rate state of every entity on one side
#[derive(Debug, Clone)]
pub struct FactorSide<T> {
    role: Role,
    loadings: GammaMatrix<T>,
    scale: Option<HierarchicalScale<T>>,
}

impl<T: ParamFloat> FactorSide<T> {
    /// New side with every loading at its prior
    ///
    /// * `role` - rows or columns
    /// * `len` - number of entities
    /// * `prior_shape` - a[k] for each latent dimension
    /// * `prior_rate` - b[k] for each latent dimension
    /// * `scale` - hyper parameters of the hierarchical scale, if modelled
    pub fn new(
        role: Role,
        len: usize,
        prior_shape: Array1<T>,
        prior_rate: Array1<T>,
        scale: Option<ScalePrior<T>>,
    ) -> Self {
        let shape_add = prior_shape.sum();
        let loadings = GammaMatrix::with_priors(len, prior_shape, prior_rate);
        let scale = scale.map(|prior| HierarchicalScale {
            prior,
            param: GammaMatrix::new((len, 1), prior.shape, prior.rate),
            shape_add,
        });
        let mut ret = FactorSide {
            role,
            loadings,
            scale,
        };
        ret.refresh_scale();
        ret
    }

    /// Perturb the prior shapes by `shape * perturbation * U(0,1)`.
    pub fn initialize(&mut self, perturbation: T, seed: u64) -> Result<()> {
        let (n, k) = (self.len(), self.rank());
        let noise = Array2::<T>::runif_seeded(n, k, seed)
            .map_err(|e| HpfError::config(format!("failed to initialize: {}", e)))?;
        let prior_shape = self.loadings.prior_shape().clone();
        let add_a = Array2::from_shape_fn((n, k), |(u, j)| {
            prior_shape[j] * perturbation * noise[(u, j)]
        });
        let add_b = Array2::zeros((n, k));
        self.loadings.update_stat(&add_a, &add_b);
        self.calibrate_moments();
        self.refresh_scale();
        Ok(())
    }

    /// Rows or columns
    pub fn role(&self) -> Role {
        self.role
    }

    /// Number of entities
    pub fn len(&self) -> usize {
        self.loadings.nrows()
    }

    /// No entities at all
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of latent dimensions
    pub fn rank(&self) -> usize {
        self.loadings.ncols()
    }

    /// Gamma posteriors of the loadings (n x K)
    pub fn loadings(&self) -> &GammaMatrix<T> {
        &self.loadings
    }

    /// Hierarchical scale, if modelled
    pub fn scale(&self) -> Option<&HierarchicalScale<T>> {
        self.scale.as_ref()
    }

    /// sum_u E[theta[u,k]] for each k, over all entities whether observed or not
    pub fn expected_totals(&self) -> Array1<T> {
        self.loadings.posterior_mean().sum_axis(Axis(0))
    }

    /// Prior rate entering the loading rate of entity `index`:
    /// E[xi] with a hierarchy, `None` to use b[k]
    #[inline]
    pub fn rate_offset(&self, index: usize) -> Option<T> {
        self.scale.as_ref().map(|s| s.mean(index))
    }

    /// Install freshly computed shapes and rates, then refresh E[x],
    /// E[ln x] and the hierarchical scale. The previous statistics land
    /// in `next_shape` and `next_rate`.
    ///
    /// Standard deviations are left as they were; see
    /// [`FactorSide::calibrate_all`].
    pub fn commit(&mut self, next_shape: &mut Array2<T>, next_rate: &mut Array2<T>) {
        self.loadings.swap_stat(next_shape, next_rate);
        self.calibrate_moments();
        self.refresh_scale();
    }

    /// Refresh every posterior summary, standard deviations included
    pub fn calibrate_all(&mut self) {
        self.loadings.calibrate();
        if let Some(scale) = self.scale.as_mut() {
            scale.param.calibrate();
        }
    }

    /// Prior and entropy part of the evidence lower bound,
    ///
    /// ```text
    /// sum_{u,k} E[ln p(theta[u,k] | a[k], rate)] - E[ln q(theta[u,k])]
    ///   + sum_u E[ln p(xi[u] | a', b')] - E[ln q(xi[u])]
    /// ```
    ///
    /// with `rate = xi[u]` under a hierarchy and `b[k]` otherwise.
    pub fn evidence(&self) -> T {
        let shape = self.loadings.shape_stat();
        let rate = self.loadings.rate_stat();
        let mean = self.loadings.posterior_mean();
        let log_mean = self.loadings.posterior_log_mean();
        let prior_shape = self.loadings.prior_shape();
        let prior_rate = self.loadings.prior_rate();

        let mut ret = T::zero();
        for u in 0..self.len() {
            let offset = self.scale.as_ref().map(|s| {
                let param = s.param();
                (param.posterior_log_mean()[(u, 0)], param.posterior_mean()[(u, 0)])
            });
            for k in 0..self.rank() {
                let (log_b, b) = offset.unwrap_or((prior_rate[k].ln(), prior_rate[k]));
                let (x, log_x) = (mean[(u, k)], log_mean[(u, k)]);
                let (alpha, lambda) = (shape[(u, k)], rate[(u, k)]);
                ret += gamma_log_density(prior_shape[k], log_b, b, log_x, x)
                    - gamma_log_density(alpha, lambda.ln(), lambda, log_x, x);
            }
        }

        if let Some(scale) = self.scale.as_ref() {
            let prior = scale.prior;
            let param = scale.param();
            let (mean, log_mean) = (param.posterior_mean(), param.posterior_log_mean());
            for u in 0..self.len() {
                let (x, log_x) = (mean[(u, 0)], log_mean[(u, 0)]);
                let (alpha, lambda) = (param.shape_stat()[(u, 0)], param.rate_stat()[(u, 0)]);
                ret += gamma_log_density(prior.shape, prior.rate.ln(), prior.rate, log_x, x)
                    - gamma_log_density(alpha, lambda.ln(), lambda, log_x, x);
            }
        }
        ret
    }

    fn calibrate_moments(&mut self) {
        self.loadings.map_calibrate_mean();
        self.loadings.map_calibrate_log_mean();
    }

    /// xi shape = a' + sum_k a[k], xi rate = b' + sum_k E[theta[u,k]]
    fn refresh_scale(&mut self) {
        if let Some(scale) = self.scale.as_mut() {
            let n = self.loadings.nrows();
            let add_a = Array1::from_elem(n, scale.shape_add);
            let add_b = self.loadings.posterior_mean().sum_axis(Axis(1));
            scale.param.update_stat_col(&add_a, &add_b, 0);
            scale.param.map_calibrate_mean();
            scale.param.map_calibrate_log_mean();
        }
    }
}

/// Expected Gamma(shape, rate) log density of `x` when only E[ln rate],
/// E[rate], E[ln x] and E[x] are known
#[inline]
fn gamma_log_density<T: ParamFloat>(shape: T, log_rate: T, rate: T, log_x: T, x: T) -> T {
    shape * log_rate - <T as special::Gamma>::ln_gamma(shape).0 + (shape - T::one()) * log_x
        - rate * x
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_new_side_sits_at_prior() {
        let side = FactorSide::<f64>::new(
            Role::Row,
            4,
            array![1.0, 2.0],
            array![3.0, 3.0],
            None,
        );
        assert_eq!(side.len(), 4);
        assert_eq!(side.rank(), 2);
        assert!(side.scale().is_none());
        assert_eq!(side.rate_offset(0), None);

        let totals = side.expected_totals();
        assert_abs_diff_eq!(totals[0], 4.0 / 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(totals[1], 8.0 / 3.0, epsilon = 1e-12);
    }

    #[test]
    fn test_initialize_is_seeded() -> Result<()> {
        let make = |seed| -> Result<FactorSide<f64>> {
            let mut side =
                FactorSide::new(Role::Column, 5, array![1.0, 1.0], array![1.0, 1.0], None);
            side.initialize(0.5, seed)?;
            Ok(side)
        };
        let x = make(7)?;
        let y = make(7)?;
        assert_eq!(x.loadings().shape_stat(), y.loadings().shape_stat());
        for &a in x.loadings().shape_stat().iter() {
            assert!((1.0..1.5).contains(&a));
        }
        Ok(())
    }

    #[test]
    fn test_hierarchical_scale_tracks_loadings() {
        let prior = ScalePrior {
            shape: 0.3,
            rate: 1.0,
        };
        let mut side =
            FactorSide::<f64>::new(Role::Row, 2, array![0.5, 0.5], array![1.0, 1.0], Some(prior));

        let scale = side.scale().unwrap();
        // shape = a' + sum_k a[k]
        assert_abs_diff_eq!(scale.param().shape_stat()[(0, 0)], 1.3, epsilon = 1e-12);
        // rate = b' + sum_k E[theta]
        assert_abs_diff_eq!(scale.param().rate_stat()[(0, 0)], 2.0, epsilon = 1e-12);

        let mut next_shape = array![[2.0, 2.0], [1.0, 1.0]];
        let mut next_rate = array![[1.0, 1.0], [1.0, 1.0]];
        side.commit(&mut next_shape, &mut next_rate);
        let scale = side.scale().unwrap();
        assert_abs_diff_eq!(scale.param().rate_stat()[(0, 0)], 5.0, epsilon = 1e-12);
        assert_abs_diff_eq!(side.rate_offset(0).unwrap(), 1.3 / 5.0, epsilon = 1e-12);
    }

    #[test]
    fn test_commit_refreshes_moments_only() {
        let mut side =
            FactorSide::<f64>::new(Role::Row, 1, array![1.0], array![1.0], None);
        let mut next_shape = array![[4.0]];
        let mut next_rate = array![[4.0]];
        side.commit(&mut next_shape, &mut next_rate);

        let param = side.loadings();
        assert_abs_diff_eq!(param.posterior_mean()[(0, 0)], 1.0, epsilon = 1e-12);
        let log_mean = <f64 as special::Gamma>::digamma(4.0) - 4.0_f64.ln();
        assert_abs_diff_eq!(param.posterior_log_mean()[(0, 0)], log_mean, epsilon = 1e-12);
        // sd still describes Gamma(1, 1)
        assert_abs_diff_eq!(param.posterior_sd()[(0, 0)], 1.0, epsilon = 1e-12);

        side.calibrate_all();
        assert_abs_diff_eq!(side.loadings().posterior_sd()[(0, 0)], 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(
            side.loadings().posterior_log_sd()[(0, 0)],
            1.0 / 3.0_f64.sqrt(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_evidence_vanishes_at_prior() {
        // q equal to the prior: every KL term is zero
        let side =
            FactorSide::<f64>::new(Role::Row, 3, array![0.5, 2.0], array![1.5, 1.0], None);
        assert_abs_diff_eq!(side.evidence(), 0.0, epsilon = 1e-12);

        let mut side = side;
        let mut next_shape = Array2::from_elem((3, 2), 3.0);
        let mut next_rate = Array2::from_elem((3, 2), 2.0);
        side.commit(&mut next_shape, &mut next_rate);
        // minus a KL divergence
        assert!(side.evidence() < 0.0);
    }

    #[test]
    fn test_evidence_with_scale_is_finite() {
        let prior = ScalePrior {
            shape: 0.3,
            rate: 0.3,
        };
        let side = FactorSide::<f64>::new(
            Role::Column,
            4,
            array![0.3, 0.3],
            array![1.0, 1.0],
            Some(prior),
        );
        assert!(side.evidence().is_finite());
    }

    #[test]
    fn test_role_display() {
        assert_eq!(Role::Row.to_string(), "row");
        assert_eq!(Role::Column.partner(), Role::Row);
    }
}
