//! Stopping rules and the quality trace of a run.

use crate::config::StopCriterion;
use crate::entity::FactorSide;
use crate::responsibility::log_normalizer;
use crate::sparse_store::SparseTriplets;
use crate::update::PhaseStat;
use matrix_param::{Inference, ParamFloat};
use ndarray::prelude::*;
use rayon::prelude::*;

/// Why a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The checked metric changed less than the tolerance
    Converged,
    /// `max_iter` iterations were completed
    MaxIterReached,
    /// The caller raised the stop signal
    Stopped,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::Converged => write!(f, "converged"),
            StopReason::MaxIterReached => write!(f, "maximum iterations reached"),
            StopReason::Stopped => write!(f, "stopped"),
        }
    }
}

/// Keeps the previous value of the stopping metric and the trace of
/// every evaluated value
#[derive(Debug, Clone)]
pub struct ConvergenceMonitor<T> {
    criterion: StopCriterion,
    tol: T,
    max_iter: usize,
    check_every: usize,
    previous: Option<T>,
    last_change: Option<T>,
    trace: Vec<(usize, T)>,
}

impl<T: ParamFloat> ConvergenceMonitor<T> {
    /// Monitor for `criterion`; `check_every` of zero is read as one
    pub fn new(criterion: StopCriterion, tol: T, max_iter: usize, check_every: usize) -> Self {
        ConvergenceMonitor {
            criterion,
            tol,
            max_iter,
            check_every: check_every.max(1),
            previous: None,
            last_change: None,
            trace: vec![],
        }
    }

    /// The stopping rule being monitored
    pub fn criterion(&self) -> StopCriterion {
        self.criterion
    }

    /// Is the metric due after `iteration` completed iterations?
    pub fn should_check(&self, iteration: usize) -> bool {
        iteration > 0 && (iteration % self.check_every == 0 || iteration == self.max_iter)
    }

    /// Record a metric value and tell whether the run has converged.
    ///
    /// `Elbo` and `TrainLlk` compare against the previous recorded value,
    /// `|m - prev| / |prev|`, and only count a step that did not make the
    /// metric worse. `DiffNorm` is already relative and is compared
    /// directly. Every rule also needs `diff_norm`, the change of the
    /// posterior means in this iteration, below the tolerance. `MaxIter`
    /// only records.
    pub fn observe(&mut self, iteration: usize, metric: T, diff_norm: T) -> Option<StopReason> {
        self.trace.push((iteration, metric));

        let (change, worse) = match self.criterion {
            StopCriterion::Elbo | StopCriterion::TrainLlk => match self.previous {
                Some(prev) => {
                    let denom = prev.abs().max(T::min_positive_value());
                    let slack = T::epsilon() * T::cast(64.0) * prev.abs();
                    (Some((metric - prev).abs() / denom), metric < prev - slack)
                }
                None => (None, false),
            },
            StopCriterion::DiffNorm | StopCriterion::MaxIter => (Some(metric), false),
        };

        self.previous = Some(metric);
        self.last_change = change;

        if self.criterion == StopCriterion::MaxIter || worse || !(diff_norm < self.tol) {
            return None;
        }
        match change {
            Some(c) if c.is_finite() && c < self.tol => Some(StopReason::Converged),
            _ => None,
        }
    }

    /// `MaxIterReached` once the iteration budget is used up
    pub fn check_budget(&self, iteration: usize) -> Option<StopReason> {
        (iteration >= self.max_iter).then_some(StopReason::MaxIterReached)
    }

    /// Most recent metric value
    pub fn progress(&self) -> Option<T> {
        self.trace.last().map(|&(_, m)| m)
    }

    /// Relative change behind the most recent decision
    pub fn last_change(&self) -> Option<T> {
        self.last_change
    }

    /// `(iteration, metric)` for every evaluation
    pub fn trace(&self) -> &[(usize, T)] {
        &self.trace
    }

    /// Forget the previous value and the trace
    pub fn reset(&mut self) {
        self.previous = None;
        self.last_change = None;
        self.trace.clear();
    }
}

/// Relative Frobenius change of both sides,
/// `sqrt((|dR|^2 + |dC|^2) / (|R|^2 + |C|^2))`
pub fn diff_norm<T: ParamFloat>(rows: PhaseStat<T>, columns: PhaseStat<T>) -> T {
    let total = rows.merge(columns);
    if total.sq_norm > T::zero() {
        (total.sq_delta / total.sq_norm).sqrt()
    } else {
        total.sq_delta.sqrt()
    }
}

/// `y ln(mu) - ln(y!)` with `mu` floored at the smallest positive value
#[inline]
pub fn observation_llk<T: ParamFloat>(y: T, mu: T) -> T {
    let mu = mu.max(T::min_positive_value());
    y * mu.ln() - <T as special::Gamma>::ln_gamma(y + T::one()).0
}

/// Poisson log-likelihood of the observed matrix under the posterior means
///
/// ```text
/// sum_{(u,i) observed} [ y ln(mu[u,i]) - ln(y!) ] - sum_k R[k] C[k]
/// ```
///
/// where `mu[u,i] = sum_k E[theta[u,k]] E[beta[i,k]]` and `R`, `C` are
/// the column sums of the row and column means. The observed part runs
/// over `intervals` of rows on the current rayon pool and is added up in
/// interval order.
pub fn poisson_llk<T: ParamFloat>(
    rows: &FactorSide<T>,
    columns: &FactorSide<T>,
    store: &SparseTriplets<T>,
    intervals: &[(usize, usize)],
) -> T {
    let theta = rows.loadings().posterior_mean();
    let beta = columns.loadings().posterior_mean();

    let partial: Vec<T> = intervals
        .par_iter()
        .map(|&(lb, ub)| {
            let mut llk = T::zero();
            for u in lb..ub {
                let theta_u = theta.row(u);
                for (i, y) in store.row(u) {
                    let mu = theta_u.dot(&beta.row(i));
                    llk += observation_llk(y, mu);
                }
            }
            llk
        })
        .collect();

    let observed = partial.into_iter().fold(T::zero(), |acc, x| acc + x);
    let expected = rows.expected_totals().dot(&columns.expected_totals());
    observed - expected
}

/// Evidence lower bound of the current variational state, with the
/// responsibilities at their optimum for that state
///
/// ```text
/// sum_{(u,i) observed} [ y ln sum_k exp(E[ln theta[u,k]] + E[ln beta[i,k]]) - ln(y!) ]
///   - sum_k R[k] C[k]
///   + prior and entropy terms of both sides (see FactorSide::evidence)
/// ```
///
/// Each half-sweep maximizes this bound over one block of variables, so
/// it does not decrease from one iteration to the next. Summed like
/// [`poisson_llk`].
pub fn elbo<T: ParamFloat>(
    rows: &FactorSide<T>,
    columns: &FactorSide<T>,
    store: &SparseTriplets<T>,
    intervals: &[(usize, usize)],
) -> T {
    let log_theta = rows.loadings().posterior_log_mean();
    let log_beta = columns.loadings().posterior_log_mean();

    let partial: Vec<T> = intervals
        .par_iter()
        .map(|&(lb, ub)| {
            let mut ret = T::zero();
            for u in lb..ub {
                let log_u = log_theta.row(u);
                for (i, y) in store.row(u) {
                    if y > T::zero() {
                        ret += y * log_normalizer(log_u, log_beta.row(i))
                            - <T as special::Gamma>::ln_gamma(y + T::one()).0;
                    }
                }
            }
            ret
        })
        .collect();

    let observed = partial.into_iter().fold(T::zero(), |acc, x| acc + x);
    let expected = rows.expected_totals().dot(&columns.expected_totals());
    observed - expected + rows.evidence() + columns.evidence()
}

/// Same as [`poisson_llk`] for a list of `(row, column, value)` entries,
/// without the expected-total term
pub fn triplet_llk<T: ParamFloat>(
    theta: ArrayView2<T>,
    beta: ArrayView2<T>,
    triplets: &[(usize, usize, T)],
) -> T {
    triplets
        .iter()
        .map(|&(u, i, y)| observation_llk(y, theta.row(u).dot(&beta.row(i))))
        .fold(T::zero(), |acc, x| acc + x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Role;
    use crate::sparse_store::DuplicatePolicy;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_llk_relative_change() {
        let mut monitor = ConvergenceMonitor::new(StopCriterion::TrainLlk, 1e-3, 100, 1);
        assert_eq!(monitor.observe(1, -100.0_f64, 0.0), None);
        assert_eq!(monitor.observe(2, -90.0, 0.0), None);
        assert_abs_diff_eq!(monitor.last_change().unwrap(), 0.1, epsilon = 1e-12);
        assert_eq!(monitor.observe(3, -89.99, 0.0), Some(StopReason::Converged));
        assert_eq!(monitor.trace().len(), 3);
        assert_eq!(monitor.progress(), Some(-89.99));
    }

    #[test]
    fn test_falling_metric_does_not_converge() {
        for criterion in [StopCriterion::TrainLlk, StopCriterion::Elbo] {
            let mut monitor = ConvergenceMonitor::new(criterion, 1e-3, 100, 1);
            monitor.observe(1, -12.374_f64, 0.0);
            // a small step, but downhill
            assert_eq!(monitor.observe(2, -12.375, 0.0), None);
            assert_eq!(monitor.observe(3, -12.375, 0.0), Some(StopReason::Converged));
        }
    }

    #[test]
    fn test_moving_parameters_do_not_converge() {
        let mut monitor = ConvergenceMonitor::new(StopCriterion::Elbo, 1e-4, 100, 1);
        monitor.observe(1, -19.9487_f64, 0.01);
        assert_eq!(monitor.observe(2, -19.9486, 6e-3), None);
        assert_eq!(monitor.observe(3, -19.9486, 5e-5), Some(StopReason::Converged));
    }

    #[test]
    fn test_diff_norm_criterion() {
        let mut monitor = ConvergenceMonitor::new(StopCriterion::DiffNorm, 1e-2, 100, 1);
        assert_eq!(monitor.observe(1, 0.5_f32, 0.5), None);
        assert_eq!(monitor.observe(2, 0.001, 0.001), Some(StopReason::Converged));
    }

    #[test]
    fn test_max_iter_never_converges() {
        let mut monitor = ConvergenceMonitor::new(StopCriterion::MaxIter, 1e-2, 3, 1);
        assert_eq!(monitor.observe(1, 0.0_f64, 0.0), None);
        assert_eq!(monitor.observe(2, 0.0, 0.0), None);
        assert_eq!(monitor.check_budget(2), None);
        assert_eq!(monitor.check_budget(3), Some(StopReason::MaxIterReached));
    }

    #[test]
    fn test_check_schedule() {
        let monitor = ConvergenceMonitor::<f64>::new(StopCriterion::TrainLlk, 1e-3, 25, 10);
        assert!(!monitor.should_check(0));
        assert!(!monitor.should_check(5));
        assert!(monitor.should_check(10));
        assert!(monitor.should_check(20));
        assert!(monitor.should_check(25));
    }

    #[test]
    fn test_reset() {
        let mut monitor = ConvergenceMonitor::new(StopCriterion::TrainLlk, 1e-3, 100, 1);
        monitor.observe(1, -1.0_f64, 0.0);
        monitor.reset();
        assert!(monitor.trace().is_empty());
        // no previous value after a reset
        assert_eq!(monitor.observe(1, -1.0, 0.0), None);
    }

    #[test]
    fn test_diff_norm() {
        let rows = PhaseStat {
            sq_delta: 1.0_f64,
            sq_norm: 3.0,
        };
        let columns = PhaseStat {
            sq_delta: 3.0,
            sq_norm: 13.0,
        };
        assert_abs_diff_eq!(diff_norm(rows, columns), 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(
            diff_norm(PhaseStat::<f64>::zero(), PhaseStat::zero()),
            0.0,
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_poisson_llk_by_hand() -> crate::error::Result<()> {
        // every mean is 1 with K = 1, so mu = 1 everywhere
        let store = SparseTriplets::from_triplets(
            vec![(0, 0, 2.0_f64), (1, 1, 1.0)],
            DuplicatePolicy::Sum,
        )?;
        let one = || array![1.0];
        let rows = FactorSide::new(Role::Row, 2, one(), one(), None);
        let columns = FactorSide::new(Role::Column, 2, one(), one(), None);

        // observed: -ln(2!) - ln(1!), expected: 2 * 2
        let expected = -(2.0_f64).ln() - 4.0;
        let llk = poisson_llk(&rows, &columns, &store, &[(0, 1), (1, 2)]);
        assert_abs_diff_eq!(llk, expected, epsilon = 1e-10);

        let single = poisson_llk(&rows, &columns, &store, &[(0, 2)]);
        assert_abs_diff_eq!(single, llk, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn test_elbo_by_hand() -> crate::error::Result<()> {
        // q at the Gamma(1, 1) prior, so only the data terms remain
        let store = SparseTriplets::from_triplets(
            vec![(0, 0, 2.0_f64), (1, 1, 1.0)],
            DuplicatePolicy::Sum,
        )?;
        let one = || array![1.0, 1.0];
        let rows = FactorSide::new(Role::Row, 2, one(), one(), None);
        let columns = FactorSide::new(Role::Column, 2, one(), one(), None);

        // E[ln x] = digamma(1) for every loading, K = 2
        let log_mean = <f64 as special::Gamma>::digamma(1.0);
        let norm = 2.0 * log_mean + 2.0_f64.ln();
        let expected = (2.0 * norm - 2.0_f64.ln()) + norm - 2.0 * 2.0 * 2.0;
        let x = elbo(&rows, &columns, &store, &[(0, 1), (1, 2)]);
        assert_abs_diff_eq!(x, expected, epsilon = 1e-10);

        // never above the plug-in log-likelihood here: Jensen on the observed terms
        assert!(x <= poisson_llk(&rows, &columns, &store, &[(0, 2)]));
        Ok(())
    }

    #[test]
    fn test_observation_llk_floor() {
        let x = observation_llk(3.0_f64, 0.0);
        assert!(x.is_finite());
        assert!(x < -1000.0);
        assert_abs_diff_eq!(observation_llk(0.0_f64, 0.0), 0.0, epsilon = 1e-12);
    }
}
