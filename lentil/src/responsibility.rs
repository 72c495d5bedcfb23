//! Multinomial responsibilities of the latent dimensions for one count.
//!
//! For an observation `y[u,i]`,
//!
//! ```text
//! phi[u,i,k] ∝ exp(E[ln theta[u,k]] + E[ln beta[i,k]])
//! sum_k phi[u,i,k] = y[u,i]
//! ```
//!
//! where `E[ln x] = digamma(shape) - ln(rate)`. The weights are formed
//! in log-space and shifted by their maximum before exponentiating.

use matrix_param::ParamFloat;
use ndarray::ArrayView1;

/// Write the responsibilities of `value` into `phi`.
///
/// * `log_self` - E[ln theta] of the entity being updated (length K)
/// * `log_partner` - E[ln beta] of the observed partner (length K)
/// * `value` - the observed count
/// * `phi` - output (length K), sums to `value`
///
/// Falls back to an even split of `value` when the weights are not
/// usable (all underflow, or a non-finite log-expectation).
#[inline]
pub fn responsibilities<T: ParamFloat>(
    log_self: ArrayView1<T>,
    log_partner: ArrayView1<T>,
    value: T,
    phi: &mut [T],
) {
    debug_assert_eq!(log_self.len(), phi.len());
    debug_assert_eq!(log_partner.len(), phi.len());

    if value == T::zero() {
        phi.iter_mut().for_each(|p| *p = T::zero());
        return;
    }

    let mut max_log = T::neg_infinity();
    for ((p, &a), &b) in phi.iter_mut().zip(log_self.iter()).zip(log_partner.iter()) {
        *p = a + b;
        if *p > max_log {
            max_log = *p;
        }
    }

    let mut denom = T::zero();
    if max_log.is_finite() {
        for p in phi.iter_mut() {
            *p = (*p - max_log).exp();
            denom += *p;
        }
    }

    if denom.is_finite() && denom > T::zero() {
        let scale = value / denom;
        phi.iter_mut().for_each(|p| *p = *p * scale);
    } else {
        let even = value / T::cast(phi.len() as f64);
        phi.iter_mut().for_each(|p| *p = even);
    }
}

/// `ln sum_k exp(E[ln theta[u,k]] + E[ln beta[i,k]])`, shifted by the
/// maximum. This is the log normalizer of the responsibilities.
#[inline]
pub fn log_normalizer<T: ParamFloat>(log_self: ArrayView1<T>, log_partner: ArrayView1<T>) -> T {
    let max_log = log_self
        .iter()
        .zip(log_partner.iter())
        .fold(T::neg_infinity(), |m, (&a, &b)| m.max(a + b));
    if !max_log.is_finite() {
        return max_log;
    }
    let sum = log_self
        .iter()
        .zip(log_partner.iter())
        .fold(T::zero(), |acc, (&a, &b)| acc + (a + b - max_log).exp());
    max_log + sum.ln()
}

/// Add the responsibilities of one observation to `acc`.
///
/// * `phi` - scratch of length K
/// * `acc` - running sum of responsibilities of the entity (length K)
#[inline]
pub fn accumulate<T: ParamFloat>(
    log_self: ArrayView1<T>,
    log_partner: ArrayView1<T>,
    value: T,
    phi: &mut [T],
    acc: &mut [T],
) {
    if value == T::zero() {
        return;
    }
    responsibilities(log_self, log_partner, value, phi);
    for (a, &p) in acc.iter_mut().zip(phi.iter()) {
        *a += p;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_sums_to_value() {
        let log_u = array![-0.3_f64, 0.2, -1.5];
        let log_i = array![0.1_f64, -0.7, 0.4];
        let mut phi = vec![0.0; 3];
        responsibilities(log_u.view(), log_i.view(), 7.0, &mut phi);
        assert_relative_eq!(phi.iter().sum::<f64>(), 7.0, max_relative = 1e-12);
        assert!(phi.iter().all(|&p| p > 0.0));
        // log-weights: -0.2, -0.5, -1.1
        assert!(phi[0] > phi[1] && phi[1] > phi[2]);
    }

    #[test]
    fn test_matches_softmax() {
        let log_u = array![1.0_f64, 2.0];
        let log_i = array![0.0_f64, 0.0];
        let mut phi = vec![0.0; 2];
        responsibilities(log_u.view(), log_i.view(), 1.0, &mut phi);
        let e = 1.0_f64.exp();
        assert_relative_eq!(phi[0], 1.0 / (1.0 + e), max_relative = 1e-12);
        assert_relative_eq!(phi[1], e / (1.0 + e), max_relative = 1e-12);
    }

    #[test]
    fn test_large_logs_do_not_overflow() {
        let log_u = array![800.0_f32, 799.0, 10.0];
        let log_i = array![0.0_f32, 0.0, 0.0];
        let mut phi = vec![0.0; 3];
        responsibilities(log_u.view(), log_i.view(), 3.0, &mut phi);
        assert!(phi.iter().all(|p| p.is_finite()));
        assert_relative_eq!(phi.iter().sum::<f32>(), 3.0, max_relative = 1e-5);
    }

    #[test]
    fn test_uniform_fallback() {
        let log_u = array![f64::NEG_INFINITY, f64::NEG_INFINITY];
        let log_i = array![0.0_f64, 0.0];
        let mut phi = vec![0.0; 2];
        responsibilities(log_u.view(), log_i.view(), 4.0, &mut phi);
        assert_eq!(phi, vec![2.0, 2.0]);
    }

    #[test]
    fn test_zero_value() {
        let log_u = array![0.5_f64, 0.1];
        let mut phi = vec![1.0; 2];
        responsibilities(log_u.view(), log_u.view(), 0.0, &mut phi);
        assert_eq!(phi, vec![0.0, 0.0]);
    }

    #[test]
    fn test_log_normalizer() {
        let log_u = array![1.0_f64, 2.0];
        let log_i = array![0.5_f64, 0.0];
        let expected = (1.5_f64.exp() + 2.0_f64.exp()).ln();
        let x = log_normalizer(log_u.view(), log_i.view());
        assert_relative_eq!(x, expected, max_relative = 1e-12);

        let big = array![900.0_f64, 900.0];
        let zero = array![0.0_f64, 0.0];
        let x = log_normalizer(big.view(), zero.view());
        assert_relative_eq!(x, 900.0 + 2.0_f64.ln(), max_relative = 1e-12);
    }

    #[test]
    fn test_accumulate() {
        let log_u = array![0.0_f64, 0.0];
        let log_i = array![0.0_f64, 0.0];
        let mut phi = vec![0.0; 2];
        let mut acc = vec![1.0; 2];
        accumulate(log_u.view(), log_i.view(), 4.0, &mut phi, &mut acc);
        accumulate(log_u.view(), log_i.view(), 0.0, &mut phi, &mut acc);
        assert_eq!(acc, vec![3.0, 3.0]);
    }
}
