/// Estimator for `q`, the expected relative set-difference density.
///
/// Before requesting a sketch, the initiator tells the responder how large it
/// expects the symmetric difference between the two announcement sets to be,
/// expressed as a fraction `q` of the smaller set. Undershooting wastes a
/// round trip on a sketch extension; overshooting wastes bandwidth on every
/// request. We track an exponential moving average of the densities observed
/// in completed rounds: with a new sample `x`, `q = alpha * x + (1 - alpha) * q_prev`.
///
/// Until the first round completes the estimator reports `default_q` (0.25
/// per BIP-330). Samples are clamped to `[0, 2]`: a difference can be at most
/// twice the smaller set, anything larger means the caller fed us garbage.
#[derive(Debug, Clone)]
pub struct DiffEstimator {
    /// Weight of the newest sample.
    alpha: f64,

    /// Density to report until a sample is recorded.
    default_q: f64,

    /// Current average, if any rounds completed.
    value: Option<f64>,
}

/// Largest meaningful density sample: the whole of both sets differing.
const MAX_Q_SAMPLE: f64 = 2.0;

impl DiffEstimator {
    /// Constructs an estimator reporting `default_q` until the first sample.
    ///
    /// `alpha` must be in (0, 1); out-of-range values are clamped to the
    /// nearest valid weight rather than rejected, since the estimator is
    /// built from caller-supplied configuration.
    pub fn new(default_q: f64, alpha: f64) -> Self {
        Self {
            alpha: alpha.clamp(f64::MIN_POSITIVE, 1.0 - f64::EPSILON),
            default_q,
            value: None,
        }
    }

    /// Records the outcome of one completed reconciliation round.
    ///
    /// `local_missing` and `remote_missing` together form the symmetric
    /// difference; the density is taken relative to the smaller of the two
    /// set sizes at request time.
    pub fn record_round(
        &mut self,
        local_set_size: usize,
        remote_set_size: usize,
        local_missing: usize,
        remote_missing: usize,
    ) {
        let smaller = local_set_size.min(remote_set_size).max(1);
        let sample = (local_missing + remote_missing) as f64 / smaller as f64;
        let sample = sample.clamp(0.0, MAX_Q_SAMPLE);

        self.value = Some(match self.value {
            None => sample, // first completed round
            Some(prev) => self.alpha * sample + (1.0 - self.alpha) * prev,
        });
    }

    /// Current density estimate.
    pub fn q(&self) -> f64 {
        self.value.unwrap_or(self.default_q)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_until_first_sample() {
        let est = DiffEstimator::new(0.25, 0.5);
        assert_eq!(est.q(), 0.25);
    }

    #[test]
    fn test_ema_update() {
        // alpha 0.5: q = 0.5*x + 0.5*q_prev
        let mut est = DiffEstimator::new(0.25, 0.5);

        // 10-element sets, 4 differing txs in total: sample = 0.4
        est.record_round(10, 12, 1, 3);
        assert_eq!(est.q(), 0.4);

        // 2 differing out of 10: sample = 0.2, average moves halfway
        est.record_round(10, 10, 2, 0);
        assert_eq!(est.q(), 0.30000000000000004);
    }

    #[test]
    fn test_sample_clamped() {
        let mut est = DiffEstimator::new(0.25, 0.5);

        // A tiny set with a huge reported difference saturates at 2.0
        est.record_round(1, 1, 50, 50);
        assert_eq!(est.q(), 2.0);
    }

    #[test]
    fn test_empty_sets_do_not_divide_by_zero() {
        let mut est = DiffEstimator::new(0.25, 0.5);

        est.record_round(0, 0, 0, 0);
        assert_eq!(est.q(), 0.0);
    }

    #[test]
    fn test_alpha_clamped() {
        let mut est = DiffEstimator::new(0.25, 7.0);

        est.record_round(10, 10, 5, 0);
        assert!(est.q() > 0.0 && est.q() <= 0.5);
    }
}
