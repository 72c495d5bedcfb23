//! Property-based tests: positivity of the variational state on random
//! sparse inputs, and conservation of counts by the responsibilities.

use lentil::responsibility::responsibilities;
use lentil::*;
use matrix_param::TwoStatParam;
use ndarray::Array1;
use proptest::prelude::*;

type Entries = (usize, usize, Vec<(usize, usize, u32)>);

/// Random matrix shape with up to 40 entries, zeros and duplicates included
fn sparse_counts_strategy() -> impl Strategy<Value = Entries> {
    (1usize..8, 1usize..8).prop_flat_map(|(nrows, ncols)| {
        (
            Just(nrows),
            Just(ncols),
            prop::collection::vec((0..nrows, 0..ncols, 0u32..50), 1..40),
        )
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Property: every shape and rate stays positive and finite
    #[test]
    fn prop_parameters_stay_positive(
        (nrows, ncols, entries) in sparse_counts_strategy(),
        rank in 1usize..5,
        hierarchical in any::<bool>(),
    ) {
        let triplets = entries.iter().map(|&(u, i, y)| (u, i, y as f64));
        let store = SparseTriplets::from_triplets_with_shape(
            nrows,
            ncols,
            triplets,
            DuplicatePolicy::Sum,
        ).unwrap();

        let mut options = HpfOptions::<f64>::with_flat_priors(rank, 0.3, 1.0);
        if hierarchical {
            let defaults = HpfOptions::<f64>::default();
            options.row_scale = defaults.row_scale;
            options.column_scale = defaults.column_scale;
        }
        options.num_threads = 2;
        options.max_iter = 5;
        options.stop_criterion = StopCriterion::MaxIter;

        let mut driver = HpfDriver::new(&store, options).unwrap();
        for _ in 0..5 {
            let summary = driver.step().unwrap();
            for side in [driver.rows(), driver.columns()] {
                let param = side.loadings();
                for &x in param.shape_stat().iter().chain(param.rate_stat().iter()) {
                    prop_assert!(
                        x.is_finite() && x > 0.0,
                        "invalid parameter {} after iteration {}",
                        x,
                        summary.iteration
                    );
                }
            }
        }
        prop_assert!(driver.train_llk().is_finite());
        prop_assert!(driver.elbo().is_finite());
    }

    /// Property: responsibilities are non-negative and add up to the count
    #[test]
    fn prop_responsibilities_sum_to_count(
        log_self in prop::collection::vec(-50.0..50.0f64, 1..8),
        shift in -20.0..20.0f64,
        value in 0.0..1e6f64,
    ) {
        let k = log_self.len();
        let log_self = Array1::from_vec(log_self);
        let log_partner = Array1::from_elem(k, shift);
        let mut phi = vec![0.0; k];
        responsibilities(log_self.view(), log_partner.view(), value, &mut phi);

        prop_assert!(phi.iter().all(|&p| p >= 0.0 && p.is_finite()));
        let total: f64 = phi.iter().sum();
        prop_assert!((total - value).abs() <= 1e-6 * value.max(1.0));
    }
}
