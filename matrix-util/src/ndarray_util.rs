pub use ndarray::prelude::*;
pub use rand::rngs::SmallRng;
pub use rand::{Rng, SeedableRng};
pub use rand_distr::Uniform;
pub use rayon::prelude::*;

use crate::traits::*;
use num_traits::Float;

impl<T> SampleOps for ndarray::Array2<T>
where
    T: Float + Send,
{
    type Mat = Self;
    type Scalar = T;

    fn runif_seeded(dd: usize, nn: usize, seed: u64) -> anyhow::Result<Self::Mat> {
        let u01 = Uniform::new(0_f32, 1_f32)
            .map_err(|e| anyhow::anyhow!("failed to set up U(0,1): {:?}", e))?;

        let rvec: Vec<T> = (0..dd)
            .into_par_iter()
            .flat_map_iter(|i| {
                // deterministic per-row generator
                let row_seed = seed ^ (i as u64).wrapping_mul(2654435761);
                let mut rng = SmallRng::seed_from_u64(row_seed);
                let mut row = Vec::with_capacity(nn);
                for _ in 0..nn {
                    let x = rng.sample(&u01);
                    row.push(T::from(x).unwrap_or_else(T::zero));
                }
                row
            })
            .collect();

        Ok(Array2::from_shape_vec((dd, nn), rvec)?)
    }
}

impl<T> MatTriplets for ndarray::Array2<T>
where
    T: Float,
{
    type Mat = Self;
    type Scalar = T;

    fn from_nonzero_triplets<I>(
        nrow: usize,
        ncol: usize,
        triplets: Vec<(I, I, Self::Scalar)>,
    ) -> anyhow::Result<Self::Mat>
    where
        I: TryInto<usize> + Copy,
        <I as TryInto<usize>>::Error: std::fmt::Debug,
    {
        let mut array = ndarray::Array2::<T>::zeros((nrow, ncol));
        for (ii, jj, x_ij) in triplets {
            let ii: usize = ii
                .try_into()
                .map_err(|e| anyhow::anyhow!("invalid row index: {:?}", e))?;
            let jj: usize = jj
                .try_into()
                .map_err(|e| anyhow::anyhow!("invalid column index: {:?}", e))?;
            if ii >= nrow || jj >= ncol {
                anyhow::bail!("({}, {}) is outside of {} x {}", ii, jj, nrow, ncol);
            }
            array[(ii, jj)] = x_ij;
        }
        Ok(array)
    }

    fn to_nonzero_triplets(
        &self,
    ) -> anyhow::Result<(usize, usize, Vec<(usize, usize, Self::Scalar)>)> {
        if let Some(eps) = T::from(1e-6) {
            let (rows, cols) = self.dim();
            Ok((
                rows,
                cols,
                self.indexed_iter()
                    .filter_map(
                        |((i, j), &x)| {
                            if x.abs() > eps {
                                Some((i, j, x))
                            } else {
                                None
                            }
                        },
                    )
                    .collect(),
            ))
        } else {
            anyhow::bail!("eps is not defined")
        }
    }
}
