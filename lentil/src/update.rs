//! One half-sweep of coordinate ascent: refresh every entity of one side
//! while the other side is held fixed.
//!
//! For entity `u` of the target side and partner side `beta`,
//!
//! ```text
//! shape[u,k] = a[k] + sum_{i in obs(u)} phi[u,i,k]
//! rate[u,k]  = E[xi[u]] (or b[k]) + sum_{all i} E[beta[i,k]]
//! ```
//!
//! The second sum runs over every partner, observed or not, so it is
//! formed once per phase. New values are written into a staging
//! workspace; nothing is visible to the model until every partition has
//! succeeded and the caller commits.

use crate::entity::FactorSide;
use crate::error::{HpfError, Result};
use crate::responsibility::accumulate;
use crate::sparse_store::SparseTriplets;
use matrix_param::{Inference, ParamFloat, TwoStatParam};
use ndarray::parallel::prelude::*;
use ndarray::prelude::*;

/// Staging buffers for the shapes and rates of one side
#[derive(Debug, Clone)]
pub struct PhaseWorkspace<T> {
    /// next shape statistics (n x K)
    pub shape: Array2<T>,
    /// next rate statistics (n x K)
    pub rate: Array2<T>,
}

impl<T: ParamFloat> PhaseWorkspace<T> {
    /// Zeroed buffers for `len` entities and `rank` dimensions
    pub fn new(len: usize, rank: usize) -> Self {
        PhaseWorkspace {
            shape: Array2::zeros((len, rank)),
            rate: Array2::zeros((len, rank)),
        }
    }
}

/// Squared change of the posterior means produced by one phase
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseStat<T> {
    /// sum (new mean - old mean)^2
    pub sq_delta: T,
    /// sum (old mean)^2
    pub sq_norm: T,
}

impl<T: ParamFloat> PhaseStat<T> {
    /// Nothing changed, nothing measured
    pub fn zero() -> Self {
        PhaseStat {
            sq_delta: T::zero(),
            sq_norm: T::zero(),
        }
    }

    /// Add up the statistics of two blocks (or two phases)
    pub fn merge(self, other: Self) -> Self {
        PhaseStat {
            sq_delta: self.sq_delta + other.sq_delta,
            sq_norm: self.sq_norm + other.sq_norm,
        }
    }
}

/// Compute the next shapes and rates of `target` into `workspace`.
///
/// Entities are split into contiguous blocks of `chunk` that run on the
/// current rayon pool. Each block owns its scratch buffers and its slice
/// of the workspace. Block statistics are merged in block order so the
/// result does not depend on scheduling.
///
/// * `target` - side being updated
/// * `partner` - side held fixed
/// * `store` - observed counts
/// * `chunk` - number of entities per block
/// * `iteration` - completed iterations, reported on divergence
/// * `workspace` - receives the new statistics of every entity
///
/// Fails with [`HpfError::NumericalDivergence`] naming the first
/// offending entity (lowest block, then lowest index within it).
pub fn update_side<T: ParamFloat>(
    target: &FactorSide<T>,
    partner: &FactorSide<T>,
    store: &SparseTriplets<T>,
    chunk: usize,
    iteration: usize,
    workspace: &mut PhaseWorkspace<T>,
) -> Result<PhaseStat<T>> {
    let role = target.role();
    let rank = target.rank();
    debug_assert_eq!(partner.role(), role.partner());
    debug_assert_eq!(workspace.shape.dim(), (target.len(), rank));

    let partner_totals = partner.expected_totals();
    let log_self = target.loadings().posterior_log_mean();
    let log_partner = partner.loadings().posterior_log_mean();
    let old_mean = target.loadings().posterior_mean();
    let prior_shape = target.loadings().prior_shape();
    let prior_rate = target.loadings().prior_rate();

    let chunk = chunk.max(1);

    let block_stats: Vec<Result<PhaseStat<T>>> = workspace
        .shape
        .axis_chunks_iter_mut(Axis(0), chunk)
        .into_par_iter()
        .zip(workspace.rate.axis_chunks_iter_mut(Axis(0), chunk).into_par_iter())
        .enumerate()
        .map(|(block, (mut shape_block, mut rate_block))| {
            let mut phi = vec![T::zero(); rank];
            let mut acc = vec![T::zero(); rank];
            let mut stat = PhaseStat::zero();

            for (r, (mut shape_u, mut rate_u)) in shape_block
                .outer_iter_mut()
                .zip(rate_block.outer_iter_mut())
                .enumerate()
            {
                let u = block * chunk + r;
                acc.iter_mut().for_each(|a| *a = T::zero());

                let log_u = log_self.row(u);
                store.for_each_in_lane(role, u, |i, y| {
                    accumulate(log_u, log_partner.row(i), y, &mut phi, &mut acc);
                });

                let offset = target.rate_offset(u);

                for k in 0..rank {
                    let a = prior_shape[k] + acc[k];
                    let b = offset.unwrap_or(prior_rate[k]) + partner_totals[k];

                    if !(a.is_finite() && a > T::zero() && b.is_finite() && b > T::zero()) {
                        return Err(HpfError::NumericalDivergence {
                            role,
                            index: u,
                            iteration,
                        });
                    }

                    shape_u[k] = a;
                    rate_u[k] = b;

                    let prev = old_mean[(u, k)];
                    let delta = a / b - prev;
                    stat.sq_delta += delta * delta;
                    stat.sq_norm += prev * prev;
                }
            }
            Ok(stat)
        })
        .collect();

    let mut total = PhaseStat::zero();
    for stat in block_stats {
        total = total.merge(stat?);
    }
    Ok(total)
}
