extern crate special;

use crate::traits::*;
use ndarray::prelude::*;

/// A matrix of independent Gamma distributions, one per element,
/// sharing a pair of hyper parameters per column.
///
/// ```text
/// x[i,j] ~ Poisson(lambda[i,j])
/// lambda[i,j] ~ Gamma(a0[j], b0[j])
/// ```
///
/// The shape and rate of element `(i,j)` are kept as sufficient
/// statistics `a_stat[i,j]` and `b_stat[i,j]`; the posterior
/// summaries are refreshed by [`Inference::calibrate`].
#[derive(Debug, Clone)]
pub struct GammaMatrix<T> {
    num_rows: usize,
    num_columns: usize,
    //////////////////////
    // hyper parameters //
    //////////////////////
    a0: Array1<T>,
    b0: Array1<T>,
    ///////////////////////////
    // sufficient statistics //
    ///////////////////////////
    a_stat: Array2<T>,
    b_stat: Array2<T>,
    //////////////////////////
    // estimated parameters //
    //////////////////////////
    estimated_mean: Array2<T>,
    estimated_sd: Array2<T>,
    estimated_log_mean: Array2<T>,
    estimated_log_sd: Array2<T>,
}

impl<T: ParamFloat> GammaMatrix<T> {
    fn from_stat(a0: Array1<T>, b0: Array1<T>, a_stat: Array2<T>, b_stat: Array2<T>) -> Self {
        let dims = a_stat.dim();
        let mut ret = Self {
            num_rows: dims.0,
            num_columns: dims.1,
            a0,
            b0,
            a_stat,
            b_stat,
            estimated_mean: Array2::zeros(dims),
            estimated_sd: Array2::zeros(dims),
            estimated_log_mean: Array2::zeros(dims),
            estimated_log_sd: Array2::zeros(dims),
        };
        ret.calibrate();
        ret
    }
}

impl<T: ParamFloat> TwoStatParam for GammaMatrix<T> {
    type Mat = Array2<T>;
    type Vec = Array1<T>;
    type Scalar = T;

    /// New Poisson-Gamma parameter matrix
    ///
    /// #Arguments
    /// * `dims` - dimensions of the matrix (num of rows, num of columns)
    /// * `a` - hyper parameter a0 shared by all columns
    /// * `b` - hyper parameter b0 shared by all columns
    ///
    fn new(dims: (usize, usize), a: Self::Scalar, b: Self::Scalar) -> Self {
        Self::with_priors(
            dims.0,
            Array1::from_elem(dims.1, a),
            Array1::from_elem(dims.1, b),
        )
    }

    /// New parameter matrix with column-specific hyper parameters
    ///
    /// #Arguments
    /// * `nrows` - number of rows
    /// * `a0` - shape hyper parameter for each column
    /// * `b0` - rate hyper parameter for each column
    ///
    fn with_priors(nrows: usize, a0: Self::Vec, b0: Self::Vec) -> Self {
        debug_assert_eq!(a0.len(), b0.len());
        let a_stat = Array2::from_shape_fn((nrows, a0.len()), |(_, j)| a0[j]);
        let b_stat = Array2::from_shape_fn((nrows, b0.len()), |(_, j)| b0[j]);
        Self::from_stat(a0, b0, a_stat, b_stat)
    }

    fn add_stat(&mut self, add_a: &Self::Mat, add_b: &Self::Mat) {
        self.a_stat += add_a;
        self.b_stat += add_b;
    }

    fn update_stat(&mut self, add_a: &Self::Mat, add_b: &Self::Mat) {
        self.reset_stat();
        self.add_stat(add_a, add_b);
    }

    fn update_stat_col(&mut self, add_a: &Self::Vec, add_b: &Self::Vec, k: usize) {
        let (a0, b0) = (self.a0[k], self.b0[k]);
        self.a_stat
            .column_mut(k)
            .zip_mut_with(add_a, |x, &add_x| *x = a0 + add_x);
        self.b_stat
            .column_mut(k)
            .zip_mut_with(add_b, |x, &add_x| *x = b0 + add_x);
    }

    /// Take already-formed shape and rate matrices; the previous
    /// statistics are handed back through the same arguments
    fn swap_stat(&mut self, next_a: &mut Self::Mat, next_b: &mut Self::Mat) {
        debug_assert_eq!(next_a.dim(), self.a_stat.dim());
        debug_assert_eq!(next_b.dim(), self.b_stat.dim());
        std::mem::swap(&mut self.a_stat, next_a);
        std::mem::swap(&mut self.b_stat, next_b);
    }

    fn reset_stat(&mut self) {
        let a0 = &self.a0;
        let b0 = &self.b0;
        self.a_stat
            .axis_iter_mut(Axis(0))
            .for_each(|mut row| row.assign(a0));
        self.b_stat
            .axis_iter_mut(Axis(0))
            .for_each(|mut row| row.assign(b0));
    }

    fn shape_stat(&self) -> &Self::Mat {
        &self.a_stat
    }

    fn rate_stat(&self) -> &Self::Mat {
        &self.b_stat
    }

    fn prior_shape(&self) -> &Self::Vec {
        &self.a0
    }

    fn prior_rate(&self) -> &Self::Vec {
        &self.b0
    }
}

impl<T: ParamFloat> Inference for GammaMatrix<T> {
    type Mat = Array2<T>;
    type Scalar = T;

    fn posterior_mean(&self) -> &Self::Mat {
        &self.estimated_mean
    }

    fn posterior_sd(&self) -> &Self::Mat {
        &self.estimated_sd
    }

    fn posterior_log_mean(&self) -> &Self::Mat {
        &self.estimated_log_mean
    }

    fn posterior_log_sd(&self) -> &Self::Mat {
        &self.estimated_log_sd
    }

    fn calibrate(&mut self) {
        self.map_calibrate_mean();
        self.map_calibrate_log_mean();
        self.map_calibrate_sd();
        self.map_calibrate_log_sd();
    }

    fn map_calibrate_mean(&mut self) {
        self.estimated_mean = &self.a_stat / &self.b_stat;
    }

    fn map_calibrate_sd(&mut self) {
        self.estimated_sd = &self.a_stat.mapv(|x| x.sqrt()) / &self.b_stat;
    }

    /// E[ln x] = digamma(a) - ln(b)
    fn map_calibrate_log_mean(&mut self) {
        use special::Gamma;
        self.estimated_log_mean =
            &self.a_stat.mapv(|a| Gamma::digamma(a)) - &self.b_stat.mapv(|b| b.ln());
    }

    fn map_calibrate_log_sd(&mut self) {
        self.estimated_log_sd = self.a_stat.mapv(|a| -> T {
            if a > T::one() {
                T::one() / (a - T::one()).sqrt()
            } else {
                T::zero()
            }
        });
    }

    fn nrows(&self) -> usize {
        self.num_rows
    }

    fn ncols(&self) -> usize {
        self.num_columns
    }
}
