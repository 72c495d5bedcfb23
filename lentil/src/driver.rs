//! Parallel coordinate-ascent driver.
//!
//! ```text
//! Idle -> Running -> Converged | MaxIterReached | Stopped
//!                 -> Failed (numerical divergence, terminal until reset)
//! ```
//!
//! One iteration is a row phase followed by a column phase. Each phase
//! splits the entities of one side into contiguous blocks, runs them on
//! the driver's own rayon pool and commits the new statistics only after
//! every block has finished.

use crate::config::{HpfOptions, ResolvedPriors, StopCriterion};
use crate::convergence::{diff_norm, elbo, poisson_llk, ConvergenceMonitor, StopReason};
use crate::entity::{FactorSide, Role};
use crate::error::{HpfError, Result};
use crate::model::FittedModel;
use crate::sparse_store::SparseTriplets;
use crate::update::{update_side, PhaseStat, PhaseWorkspace};

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{debug, info, warn};
use matrix_param::ParamFloat;
use matrix_util::utils::{partition_block_size, partition_intervals};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Lifecycle of a driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    /// Initialized, no iteration yet
    Idle,
    /// Iterating
    Running,
    /// The stopping metric fell below the tolerance
    Converged,
    /// The iteration budget is used up
    MaxIterReached,
    /// Stopped through a [`StopHandle`]
    Stopped,
    /// A phase produced an invalid parameter
    Failed,
}

impl From<StopReason> for DriverState {
    fn from(reason: StopReason) -> Self {
        match reason {
            StopReason::Converged => DriverState::Converged,
            StopReason::MaxIterReached => DriverState::MaxIterReached,
            StopReason::Stopped => DriverState::Stopped,
        }
    }
}

/// Cooperative stop signal, checked before each phase
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
}

impl StopHandle {
    /// Ask the driver to stop at the next phase boundary
    pub fn stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Has a stop been requested?
    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    fn clear(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// What one call of [`HpfDriver::step`] did
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IterationSummary<T> {
    /// Completed iterations so far
    pub iteration: usize,
    /// Relative Frobenius change of the posterior means in this iteration
    pub diff_norm: T,
    /// Stopping metric, when it was evaluated in this iteration
    pub metric: Option<T>,
    /// Relative change of the metric behind the stopping decision
    pub relative_change: Option<T>,
    /// Set when the run should end here
    pub stop: Option<StopReason>,
}

/// Runs HPF inference on one sparse matrix
pub struct HpfDriver<'a, T> {
    store: &'a SparseTriplets<T>,
    options: HpfOptions<T>,
    priors: ResolvedPriors<T>,
    rows: FactorSide<T>,
    columns: FactorSide<T>,
    row_workspace: PhaseWorkspace<T>,
    column_workspace: PhaseWorkspace<T>,
    row_intervals: Vec<(usize, usize)>,
    monitor: ConvergenceMonitor<T>,
    pool: rayon::ThreadPool,
    state: DriverState,
    iteration: usize,
    stop: StopHandle,
}

impl<'a, T: ParamFloat> HpfDriver<'a, T> {
    /// Validate the options, initialize both sides and build the pool.
    ///
    /// Fails with `ConfigurationError` on invalid options or on a matrix
    /// without any observation.
    pub fn new(store: &'a SparseTriplets<T>, options: HpfOptions<T>) -> Result<Self> {
        let priors = options.validate()?;

        if store.nnz() == 0 {
            return Err(HpfError::config("no observations to factorize"));
        }

        let (rows, columns) = initial_sides(store, &options, &priors)?;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(options.num_threads)
            .build()?;

        let rank = options.rank;
        let monitor = ConvergenceMonitor::new(
            options.stop_criterion,
            options.tol,
            options.max_iter,
            options.check_every,
        );

        Ok(HpfDriver {
            store,
            row_workspace: PhaseWorkspace::new(store.nrows(), rank),
            column_workspace: PhaseWorkspace::new(store.ncols(), rank),
            row_intervals: partition_intervals(store.nrows(), options.num_threads),
            options,
            priors,
            rows,
            columns,
            monitor,
            pool,
            state: DriverState::Idle,
            iteration: 0,
            stop: StopHandle::default(),
        })
    }

    /// Current lifecycle state
    pub fn state(&self) -> DriverState {
        self.state
    }

    /// Completed iterations
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    /// Latest value of the stopping metric
    pub fn progress(&self) -> Option<T> {
        self.monitor.progress()
    }

    /// `(iteration, metric)` for every evaluation so far
    pub fn trace(&self) -> &[(usize, T)] {
        self.monitor.trace()
    }

    /// Handle that other threads can use to stop the run
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Options the driver was built with
    pub fn options(&self) -> &HpfOptions<T> {
        &self.options
    }

    /// Current row state
    pub fn rows(&self) -> &FactorSide<T> {
        &self.rows
    }

    /// Current column state
    pub fn columns(&self) -> &FactorSide<T> {
        &self.columns
    }

    /// Training log-likelihood under the current posterior means
    pub fn train_llk(&self) -> T {
        self.pool.install(|| {
            poisson_llk(&self.rows, &self.columns, self.store, &self.row_intervals)
        })
    }

    /// Evidence lower bound of the current state
    pub fn elbo(&self) -> T {
        self.pool
            .install(|| elbo(&self.rows, &self.columns, self.store, &self.row_intervals))
    }

    /// Run one iteration: the row phase, then the column phase.
    ///
    /// A raised stop signal ends the call before the next phase starts;
    /// whatever was committed so far stays. A numerical divergence moves
    /// the driver to `Failed` and leaves both sides as they were after
    /// the last successful phase.
    pub fn step(&mut self) -> Result<IterationSummary<T>> {
        if self.state == DriverState::Failed {
            return Err(HpfError::config("the driver has failed; reset it first"));
        }
        self.state = DriverState::Running;

        if let Some(summary) = self.check_stop() {
            return Ok(summary);
        }
        let row_stat = self.run_phase(Role::Row)?;

        if let Some(summary) = self.check_stop() {
            return Ok(summary);
        }
        let column_stat = self.run_phase(Role::Column)?;

        self.iteration += 1;
        let iteration = self.iteration;
        let change = diff_norm(row_stat, column_stat);

        let metric = if self.monitor.should_check(iteration) {
            Some(match self.monitor.criterion() {
                StopCriterion::Elbo => self.elbo(),
                StopCriterion::TrainLlk => self.train_llk(),
                StopCriterion::DiffNorm | StopCriterion::MaxIter => change,
            })
        } else {
            None
        };

        let mut stop = None;
        let mut relative_change = None;
        if let Some(m) = metric {
            stop = self.monitor.observe(iteration, m, change);
            relative_change = self.monitor.last_change();
            debug!(
                "[{}] metric: {}, relative change: {:?}, diff-norm: {}",
                iteration, m, relative_change, change
            );
        }
        let stop = stop.or_else(|| self.monitor.check_budget(iteration));

        if let Some(reason) = stop {
            self.state = reason.into();
        }

        Ok(IterationSummary {
            iteration,
            diff_norm: change,
            metric,
            relative_change,
            stop,
        })
    }

    /// Iterate until a stopping condition fires and return the fitted
    /// model. A driver that already converged or used up its budget
    /// returns its current state.
    pub fn fit(&mut self) -> Result<FittedModel<T>> {
        match self.state {
            DriverState::Converged => return Ok(self.snapshot(StopReason::Converged)),
            DriverState::MaxIterReached => {
                return Ok(self.snapshot(StopReason::MaxIterReached))
            }
            _ => {}
        }

        info!(
            "HPF: {} x {} matrix, {} observations, rank {}, {} threads",
            self.store.nrows(),
            self.store.ncols(),
            self.store.nnz(),
            self.options.rank,
            self.options.num_threads
        );

        let remaining = self.options.max_iter.saturating_sub(self.iteration);
        let pb = ProgressBar::new(remaining as u64);
        if self.options.verbose {
            if let Ok(style) =
                ProgressStyle::with_template("Fitting HPF {bar:40} {pos}/{len} iterations ({eta})")
            {
                pb.set_style(style.progress_chars("##-"));
            }
        } else {
            pb.set_draw_target(ProgressDrawTarget::hidden());
        }

        let reason = loop {
            let summary = match self.step() {
                Ok(summary) => summary,
                Err(err) => {
                    pb.abandon();
                    return Err(err);
                }
            };
            pb.inc(1);
            if let Some(reason) = summary.stop {
                break reason;
            }
        };
        pb.finish_and_clear();

        info!(
            "HPF {} after {} iterations (progress: {:?})",
            reason,
            self.iteration,
            self.progress()
        );

        Ok(self.snapshot(reason))
    }

    /// Back to the initial state with the same options and data
    pub fn reset(&mut self) -> Result<()> {
        let (rows, columns) = initial_sides(self.store, &self.options, &self.priors)?;
        self.rows = rows;
        self.columns = columns;
        self.monitor.reset();
        self.iteration = 0;
        self.state = DriverState::Idle;
        self.stop.clear();
        Ok(())
    }

    fn check_stop(&mut self) -> Option<IterationSummary<T>> {
        if !self.stop.is_stopped() {
            return None;
        }
        info!("HPF stop requested after {} iterations", self.iteration);
        self.state = DriverState::Stopped;
        Some(IterationSummary {
            iteration: self.iteration,
            diff_norm: T::zero(),
            metric: None,
            relative_change: None,
            stop: Some(StopReason::Stopped),
        })
    }

    fn run_phase(&mut self, role: Role) -> Result<PhaseStat<T>> {
        let num_threads = self.options.num_threads;
        let iteration = self.iteration;
        let store = self.store;

        let (target, partner, workspace) = match role {
            Role::Row => (&mut self.rows, &self.columns, &mut self.row_workspace),
            Role::Column => (&mut self.columns, &self.rows, &mut self.column_workspace),
        };

        let chunk = partition_block_size(target.len(), num_threads);
        let result = self
            .pool
            .install(|| update_side(&*target, partner, store, chunk, iteration, &mut *workspace));

        match result {
            Ok(stat) => {
                target.commit(&mut workspace.shape, &mut workspace.rate);
                Ok(stat)
            }
            Err(err) => {
                self.state = DriverState::Failed;
                warn!("HPF failed: {}", err);
                Err(err)
            }
        }
    }

    fn snapshot(&self, reason: StopReason) -> FittedModel<T> {
        FittedModel::new(
            self.rows.clone(),
            self.columns.clone(),
            self.iteration,
            reason,
            self.monitor.trace().to_vec(),
        )
    }
}

/// Rows and columns at their seeded starting point
fn initial_sides<T: ParamFloat>(
    store: &SparseTriplets<T>,
    options: &HpfOptions<T>,
    priors: &ResolvedPriors<T>,
) -> Result<(FactorSide<T>, FactorSide<T>)> {
    let mut rows = FactorSide::new(
        Role::Row,
        store.nrows(),
        priors.row_shape.clone(),
        priors.row_rate.clone(),
        options.row_scale,
    );
    let mut columns = FactorSide::new(
        Role::Column,
        store.ncols(),
        priors.column_shape.clone(),
        priors.column_rate.clone(),
        options.column_scale,
    );
    rows.initialize(options.init_perturbation, options.seed)?;
    columns.initialize(options.init_perturbation, options.seed.wrapping_add(1))?;
    Ok((rows, columns))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sparse_store::DuplicatePolicy;

    fn toy() -> SparseTriplets<f64> {
        SparseTriplets::from_triplets(
            vec![(0, 0, 5.0), (0, 1, 2.0), (1, 1, 3.0), (2, 2, 1.0)],
            DuplicatePolicy::Sum,
        )
        .unwrap()
    }

    fn options() -> HpfOptions<f64> {
        HpfOptions {
            num_threads: 2,
            check_every: 1,
            ..HpfOptions::with_flat_priors(2, 1.0, 1.0)
        }
    }

    #[test]
    fn test_state_transitions() -> Result<()> {
        let store = toy();
        let mut driver = HpfDriver::new(&store, options())?;
        assert_eq!(driver.state(), DriverState::Idle);

        let summary = driver.step()?;
        assert_eq!(summary.iteration, 1);
        assert_eq!(driver.state(), DriverState::Running);
        assert!(driver.progress().is_some());

        driver.reset()?;
        assert_eq!(driver.state(), DriverState::Idle);
        assert_eq!(driver.iteration(), 0);
        assert!(driver.trace().is_empty());
        Ok(())
    }

    #[test]
    fn test_stop_between_calls() -> Result<()> {
        let store = toy();
        let mut driver = HpfDriver::new(&store, options())?;
        driver.step()?;
        driver.stop_handle().stop();
        let summary = driver.step()?;
        assert_eq!(summary.stop, Some(StopReason::Stopped));
        assert_eq!(summary.iteration, 1);
        assert_eq!(driver.state(), DriverState::Stopped);

        // reset clears the signal
        driver.reset()?;
        assert!(!driver.stop_handle().is_stopped());
        Ok(())
    }

    #[test]
    fn test_budget() -> Result<()> {
        let store = toy();
        let opts = HpfOptions {
            max_iter: 3,
            stop_criterion: StopCriterion::MaxIter,
            ..options()
        };
        let mut driver = HpfDriver::new(&store, opts)?;
        let model = driver.fit()?;
        assert_eq!(model.iterations(), 3);
        assert_eq!(model.stop_reason(), StopReason::MaxIterReached);
        assert_eq!(driver.state(), DriverState::MaxIterReached);
        // the diff-norm is still traced
        assert_eq!(model.trace().len(), 3);
        Ok(())
    }

    #[test]
    fn test_empty_matrix_rejected() {
        let store =
            SparseTriplets::<f64>::from_triplets(Vec::new(), DuplicatePolicy::Sum).unwrap();
        assert!(matches!(
            HpfDriver::new(&store, options()),
            Err(HpfError::ConfigurationError(_))
        ));
    }
}
