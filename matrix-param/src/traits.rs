use num_traits::Float;
use std::fmt::{Debug, Display};
use std::iter::Sum;
use std::ops::AddAssign;

/// Floating point precision of the parameter matrices (`f32` or `f64`)
pub trait ParamFloat:
    Float
    + special::Gamma
    + ndarray::ScalarOperand
    + AddAssign
    + Sum
    + Debug
    + Display
    + Send
    + Sync
    + 'static
{
    /// Convert a literal or a count into this precision
    fn cast(x: f64) -> Self;
}

impl ParamFloat for f32 {
    #[inline]
    fn cast(x: f64) -> Self {
        x as f32
    }
}

impl ParamFloat for f64 {
    #[inline]
    fn cast(x: f64) -> Self {
        x
    }
}

/// Posterior summaries of a parameter matrix
pub trait Inference {
    type Mat;
    type Scalar;

    fn posterior_mean(&self) -> &Self::Mat;
    fn posterior_sd(&self) -> &Self::Mat;
    fn posterior_log_mean(&self) -> &Self::Mat;
    fn posterior_log_sd(&self) -> &Self::Mat;

    fn calibrate(&mut self);
    fn map_calibrate_mean(&mut self);
    fn map_calibrate_sd(&mut self);
    fn map_calibrate_log_mean(&mut self);
    fn map_calibrate_log_sd(&mut self);

    fn nrows(&self) -> usize;
    fn ncols(&self) -> usize;
}

/// A parameter matrix with two types of statistics
/// with hyper parameters a0 and b0 (one pair per column)
pub trait TwoStatParam {
    type Mat;
    type Vec;
    type Scalar;

    fn new(dims: (usize, usize), a0: Self::Scalar, b0: Self::Scalar) -> Self;
    fn with_priors(nrows: usize, a0: Self::Vec, b0: Self::Vec) -> Self;

    fn add_stat(&mut self, add_a: &Self::Mat, add_b: &Self::Mat);
    fn update_stat(&mut self, update_a: &Self::Mat, update_b: &Self::Mat);
    fn update_stat_col(&mut self, update_a: &Self::Vec, update_b: &Self::Vec, k: usize);
    fn swap_stat(&mut self, next_a: &mut Self::Mat, next_b: &mut Self::Mat);
    fn reset_stat(&mut self);

    fn shape_stat(&self) -> &Self::Mat;
    fn rate_stat(&self) -> &Self::Mat;
    fn prior_shape(&self) -> &Self::Vec;
    fn prior_rate(&self) -> &Self::Vec;
}
