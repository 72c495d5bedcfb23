//! Variational parameter matrices for Poisson-Gamma models.

pub mod ndarray_gamma;
pub mod traits;

pub use ndarray_gamma::GammaMatrix;
pub use traits::{Inference, ParamFloat, TwoStatParam};
