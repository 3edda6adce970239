//! Aggregate scoring for one session.
//!
//! Metrics are pure functions of the classification log and the unclaimed
//! count. Nothing here accumulates across calls, so a recompute at any
//! point agrees with the log, and zero detections or zero ground truth
//! yields defined zeros rather than a division fault.

use serde::{Deserialize, Serialize};

use crate::{ClassificationResult, Outcome};

/// Confusion counts and derived rates for one session.
///
/// `true_positives + false_positives == total_detections` always;
/// `true_positives + false_negatives == total_ground_truth` once the
/// session has completed (while it is open, `false_negatives` is the
/// unmatched-so-far lower bound).
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct SessionMetrics {
    pub total_detections: u64,
    pub true_positives: u64,
    pub false_positives: u64,
    pub false_negatives: u64,
    pub total_ground_truth: u64,
    pub precision: f64,
    pub recall: f64,
    pub f1_score: f64,
    pub accuracy: f64,
}

impl SessionMetrics {
    /// Derive all rates from raw confusion counts. Every denominator of
    /// zero maps the rate to 0.0.
    pub fn from_counts(true_positives: u64, false_positives: u64, false_negatives: u64) -> Self {
        let tp = true_positives as f64;
        let total_detections = true_positives + false_positives;
        let total_ground_truth = true_positives + false_negatives;

        let precision = if total_detections > 0 {
            tp / total_detections as f64
        } else {
            0.0
        };
        let recall = if total_ground_truth > 0 {
            tp / total_ground_truth as f64
        } else {
            0.0
        };
        let f1_score = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };
        let confusion_total = true_positives + false_positives + false_negatives;
        let accuracy = if confusion_total > 0 {
            tp / confusion_total as f64
        } else {
            0.0
        };

        Self {
            total_detections,
            true_positives,
            false_positives,
            false_negatives,
            total_ground_truth,
            precision,
            recall,
            f1_score,
            accuracy,
        }
    }

    /// Recompute from the authoritative classification log plus the number
    /// of ground-truth objects never claimed.
    pub fn compute(log: &[ClassificationResult], unclaimed: usize) -> Self {
        let true_positives = log
            .iter()
            .filter(|r| r.outcome == Outcome::TruePositive)
            .count() as u64;
        let false_positives = log.len() as u64 - true_positives;
        Self::from_counts(true_positives, false_positives, unclaimed as u64)
    }

    /// All rates defined and inside [0, 1].
    pub fn rates_well_formed(&self) -> bool {
        [self.precision, self.recall, self.f1_score, self.accuracy]
            .iter()
            .all(|v| v.is_finite() && (0.0..=1.0).contains(v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(seq: u64, outcome: Outcome) -> ClassificationResult {
        ClassificationResult {
            seq,
            timestamp: seq as f64,
            class_label: "pedestrian".to_string(),
            confidence: 0.9,
            outcome,
            matched_ground_truth_id: match outcome {
                Outcome::TruePositive => Some(format!("gt-{}", seq)),
                Outcome::FalsePositive => None,
            },
        }
    }

    #[test]
    fn zero_detections_zero_ground_truth_yields_all_zeros() {
        let m = SessionMetrics::from_counts(0, 0, 0);
        assert_eq!(m.precision, 0.0);
        assert_eq!(m.recall, 0.0);
        assert_eq!(m.f1_score, 0.0);
        assert_eq!(m.accuracy, 0.0);
        assert_eq!(m.total_detections, 0);
        assert_eq!(m.total_ground_truth, 0);
    }

    #[test]
    fn detections_without_ground_truth() {
        let m = SessionMetrics::from_counts(0, 4, 0);
        assert_eq!(m.precision, 0.0);
        assert_eq!(m.recall, 0.0);
        assert_eq!(m.f1_score, 0.0);
        assert_eq!(m.accuracy, 0.0);
        assert_eq!(m.total_detections, 4);
    }

    #[test]
    fn ground_truth_without_detections() {
        let m = SessionMetrics::from_counts(0, 0, 3);
        assert_eq!(m.precision, 0.0);
        assert_eq!(m.recall, 0.0);
        assert_eq!(m.false_negatives, 3);
        assert_eq!(m.total_ground_truth, 3);
    }

    #[test]
    fn perfect_session_scores_ones() {
        let m = SessionMetrics::from_counts(5, 0, 0);
        assert_eq!(m.precision, 1.0);
        assert_eq!(m.recall, 1.0);
        assert_eq!(m.f1_score, 1.0);
        assert_eq!(m.accuracy, 1.0);
    }

    #[test]
    fn mixed_counts_produce_expected_rates() {
        let m = SessionMetrics::from_counts(3, 1, 2);
        assert_eq!(m.precision, 0.75);
        assert_eq!(m.recall, 0.6);
        assert!((m.f1_score - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(m.accuracy, 0.5);
        assert_eq!(m.total_detections, 4);
        assert_eq!(m.total_ground_truth, 5);
    }

    #[test]
    fn rates_never_nan_for_any_zero_combination() {
        for tp in [0u64, 2] {
            for fp in [0u64, 3] {
                for fn_ in [0u64, 4] {
                    let m = SessionMetrics::from_counts(tp, fp, fn_);
                    assert!(
                        m.rates_well_formed(),
                        "degenerate rates for tp={} fp={} fn={}: {:?}",
                        tp,
                        fp,
                        fn_,
                        m
                    );
                }
            }
        }
    }

    #[test]
    fn compute_counts_outcomes_from_log() {
        let log = vec![
            result(0, Outcome::TruePositive),
            result(1, Outcome::FalsePositive),
            result(2, Outcome::TruePositive),
        ];
        let m = SessionMetrics::compute(&log, 1);
        assert_eq!(m.true_positives, 2);
        assert_eq!(m.false_positives, 1);
        assert_eq!(m.false_negatives, 1);
        assert_eq!(m.total_detections, 3);
        assert_eq!(m.total_detections, m.true_positives + m.false_positives);
    }

    #[test]
    fn recompute_is_idempotent() {
        let log = vec![
            result(0, Outcome::TruePositive),
            result(1, Outcome::FalsePositive),
        ];
        let first = SessionMetrics::compute(&log, 2);
        let second = SessionMetrics::compute(&log, 2);
        assert_eq!(first, second);
    }

    #[test]
    fn empty_log_computes_without_fault() {
        let m = SessionMetrics::compute(&[], 0);
        assert_eq!(m.total_detections, 0);
        assert!(m.rates_well_formed());
    }
}
