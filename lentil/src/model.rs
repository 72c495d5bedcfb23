//! Fitted HPF model and the queries it answers.

use crate::convergence::{triplet_llk, StopReason};
use crate::entity::{FactorSide, HierarchicalScale, Role};
use crate::error::{HpfError, Result};
use crate::responsibility::accumulate;
use crate::sparse_store::SparseTriplets;
use matrix_param::{GammaMatrix, Inference, ParamFloat, TwoStatParam};
use ndarray::prelude::*;

/// Final variational state of both sides with the run summary
#[derive(Debug, Clone)]
pub struct FittedModel<T> {
    rows: FactorSide<T>,
    columns: FactorSide<T>,
    iterations: usize,
    stop_reason: StopReason,
    trace: Vec<(usize, T)>,
}

impl<T: ParamFloat> FittedModel<T> {
    /// Freeze both sides. Every posterior summary, standard deviations
    /// included, is refreshed here.
    pub fn new(
        mut rows: FactorSide<T>,
        mut columns: FactorSide<T>,
        iterations: usize,
        stop_reason: StopReason,
        trace: Vec<(usize, T)>,
    ) -> Self {
        rows.calibrate_all();
        columns.calibrate_all();
        FittedModel {
            rows,
            columns,
            iterations,
            stop_reason,
            trace,
        }
    }

    /// Number of rows
    pub fn nrows(&self) -> usize {
        self.rows.len()
    }

    /// Number of columns
    pub fn ncols(&self) -> usize {
        self.columns.len()
    }

    /// Number of latent dimensions K
    pub fn rank(&self) -> usize {
        self.rows.rank()
    }

    /// Completed iterations
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// Why the run ended
    pub fn stop_reason(&self) -> StopReason {
        self.stop_reason
    }

    /// Did the stopping metric fall below the tolerance?
    pub fn is_converged(&self) -> bool {
        self.stop_reason == StopReason::Converged
    }

    /// `(iteration, metric)` for every evaluation of the stopping metric
    pub fn trace(&self) -> &[(usize, T)] {
        &self.trace
    }

    /// Row side, loadings and activity
    pub fn rows(&self) -> &FactorSide<T> {
        &self.rows
    }

    /// Column side, loadings and popularity
    pub fn columns(&self) -> &FactorSide<T> {
        &self.columns
    }

    /// Gamma posteriors of the row loadings theta (nrows x K)
    pub fn row_params(&self) -> &GammaMatrix<T> {
        self.rows.loadings()
    }

    /// Gamma posteriors of the column loadings beta (ncols x K)
    pub fn column_params(&self) -> &GammaMatrix<T> {
        self.columns.loadings()
    }

    /// Row activity, when the model has one
    pub fn row_scale(&self) -> Option<&HierarchicalScale<T>> {
        self.rows.scale()
    }

    /// Column popularity, when the model has one
    pub fn column_scale(&self) -> Option<&HierarchicalScale<T>> {
        self.columns.scale()
    }

    fn check_index(&self, role: Role, index: usize) -> Result<()> {
        let bound = match role {
            Role::Row => self.nrows(),
            Role::Column => self.ncols(),
        };
        if index >= bound {
            return Err(HpfError::IndexOutOfRange { role, index, bound });
        }
        Ok(())
    }

    /// Expected count `sum_k E[theta[u,k]] E[beta[i,k]]`
    pub fn predict(&self, row: usize, column: usize) -> Result<T> {
        self.check_index(Role::Row, row)?;
        self.check_index(Role::Column, column)?;
        let theta = self.rows.loadings().posterior_mean();
        let beta = self.columns.loadings().posterior_mean();
        Ok(theta.row(row).dot(&beta.row(column)))
    }

    /// [`Self::predict`] for many `(row, column)` pairs
    pub fn predict_many(&self, pairs: &[(usize, usize)]) -> Result<Vec<T>> {
        pairs.iter().map(|&(u, i)| self.predict(u, i)).collect()
    }

    /// The `n` columns with the largest expected count in `row`, best
    /// first. Columns already observed for `row` in `exclude` are skipped.
    pub fn top_n(
        &self,
        row: usize,
        n: usize,
        exclude: Option<&SparseTriplets<T>>,
    ) -> Result<Vec<(usize, T)>> {
        self.check_index(Role::Row, row)?;
        let theta_u = self.rows.loadings().posterior_mean().row(row);
        let scores = self.columns.loadings().posterior_mean().dot(&theta_u);

        let seen: &[usize] = match exclude {
            Some(store) if row < store.nrows() => store.row_columns(row),
            _ => &[],
        };

        let mut ranked: Vec<(usize, T)> = scores
            .iter()
            .copied()
            .enumerate()
            .filter(|(i, _)| seen.binary_search(i).is_err())
            .collect();

        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        ranked.truncate(n);
        Ok(ranked)
    }

    /// Poisson log-likelihood of held-out `(row, column, value)` entries
    /// under the posterior means, `sum y ln(mu) - ln(y!) - mu`
    pub fn eval_llk(&self, triplets: &[(usize, usize, T)]) -> Result<T> {
        for &(u, i, y) in triplets {
            self.check_index(Role::Row, u)?;
            self.check_index(Role::Column, i)?;
            if !(y.is_finite() && y >= T::zero()) {
                return Err(HpfError::InvalidObservation {
                    row: u,
                    column: i,
                    reason: format!("invalid value {}", y),
                });
            }
        }
        let theta = self.rows.loadings().posterior_mean();
        let beta = self.columns.loadings().posterior_mean();
        let observed = triplet_llk(theta.view(), beta.view(), triplets);
        let expected = triplets
            .iter()
            .map(|&(u, i, _)| theta.row(u).dot(&beta.row(i)))
            .fold(T::zero(), |acc, x| acc + x);
        Ok(observed - expected)
    }

    /// Posterior mean of the loadings of a new row from its
    /// `(column, value)` observations, keeping the columns fixed.
    ///
    /// Runs the row update of a single entity until the relative change
    /// of its mean drops below `tol` or `max_iter` rounds are done.
    pub fn fold_in_row(
        &self,
        observations: &[(usize, T)],
        max_iter: usize,
        tol: T,
    ) -> Result<Array1<T>> {
        let new_row = self.nrows();
        for &(i, y) in observations {
            self.check_index(Role::Column, i)?;
            if !(y.is_finite() && y >= T::zero()) {
                return Err(HpfError::InvalidObservation {
                    row: new_row,
                    column: i,
                    reason: format!("invalid value {}", y),
                });
            }
        }

        let rank = self.rank();
        let prior_shape = self.rows.loadings().prior_shape();
        let prior_rate = self.rows.loadings().prior_rate();
        let scale_prior = self.rows.scale().map(|s| s.prior());
        let column_totals = self.columns.expected_totals();
        let log_beta = self.columns.loadings().posterior_log_mean();

        let mut shape = prior_shape.clone();
        let mut rate = prior_rate.clone();
        let mut xi_mean = scale_prior.map(|p| p.shape / p.rate);
        let mut mean = &shape / &rate;

        let mut phi = vec![T::zero(); rank];
        let mut acc = vec![T::zero(); rank];

        let mut rounds = 0;
        while rounds < max_iter.max(1) {
            rounds += 1;
            let log_theta = Array1::from_shape_fn(rank, |k| {
                <T as special::Gamma>::digamma(shape[k]) - rate[k].ln()
            });

            acc.iter_mut().for_each(|a| *a = T::zero());
            for &(i, y) in observations {
                accumulate(log_theta.view(), log_beta.row(i), y, &mut phi, &mut acc);
            }

            for k in 0..rank {
                shape[k] = prior_shape[k] + acc[k];
                rate[k] = xi_mean.unwrap_or(prior_rate[k]) + column_totals[k];
            }

            let next = &shape / &rate;
            if let Some(p) = scale_prior {
                let xi_shape = p.shape + prior_shape.sum();
                xi_mean = Some(xi_shape / (p.rate + next.sum()));
            }

            let delta = (&next - &mean).mapv(|x| x * x).sum().sqrt();
            let norm = mean.mapv(|x| x * x).sum().sqrt().max(T::min_positive_value());
            mean = next;
            if delta / norm < tol {
                break;
            }
        }

        if mean.iter().any(|x| !x.is_finite()) {
            return Err(HpfError::NumericalDivergence {
                role: Role::Row,
                index: new_row,
                iteration: rounds,
            });
        }
        Ok(mean)
    }
}
