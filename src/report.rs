//! Externally visible session reports.
//!
//! A report is a point-in-time compilation of one session: identity,
//! status, metrics, and optionally the full classification log. `metrics`
//! is `null` for failed sessions rather than a row of misleading zeros,
//! and `metrics_final` is true only once the session has completed and the
//! false-negative count can no longer change.

use serde::{Deserialize, Serialize};

use crate::metrics::SessionMetrics;
use crate::session::SessionValidator;
use crate::storage::SessionRecord;
use crate::{epoch_seconds, ClassificationResult, Outcome, SessionStatus};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionReport {
    pub session_id: String,
    pub video_id: String,
    pub status: SessionStatus,
    pub tolerance_seconds: f64,
    pub created_epoch_s: u64,
    pub completed_epoch_s: Option<u64>,
    pub ignored_detections: u64,
    /// `None` exactly when the session failed.
    pub metrics: Option<SessionMetrics>,
    /// False-negative counts are provisional until this is true.
    pub metrics_final: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classifications: Option<Vec<ClassificationResult>>,
}

impl SessionReport {
    /// Compile the current state of a session. The classification log is
    /// attached only when `include_log` is set; callers exporting summaries
    /// skip it.
    pub fn compile(session: &SessionValidator, include_log: bool) -> Self {
        let status = session.status();
        let metrics = match status {
            SessionStatus::Failed => None,
            _ => Some(session.metrics()),
        };
        Self {
            session_id: session.session_id().to_string(),
            video_id: session.video_id().to_string(),
            status,
            tolerance_seconds: session.config().tolerance_seconds,
            created_epoch_s: session.created_epoch_s(),
            completed_epoch_s: session.completed_epoch_s(),
            ignored_detections: session.ignored_detections(),
            metrics,
            metrics_final: status == SessionStatus::Completed,
            failure_reason: session.failure_reason().map(str::to_string),
            classifications: if include_log {
                Some(session.log().to_vec())
            } else {
                None
            },
        }
    }

    /// Compile a report from stored rows after the session left memory.
    ///
    /// Metrics are recomputed from the classification rows; false negatives
    /// come from the stored ground-truth total minus matched objects, which
    /// is exact because every true positive claimed a distinct object.
    pub fn from_stored(
        record: &SessionRecord,
        rows: &[ClassificationResult],
        include_log: bool,
    ) -> Self {
        let metrics = match record.status {
            SessionStatus::Failed => None,
            _ => {
                let true_positives = rows
                    .iter()
                    .filter(|r| r.outcome == Outcome::TruePositive)
                    .count() as u64;
                let false_positives = rows.len() as u64 - true_positives;
                let false_negatives = record.total_ground_truth.saturating_sub(true_positives);
                Some(SessionMetrics::from_counts(
                    true_positives,
                    false_positives,
                    false_negatives,
                ))
            }
        };
        Self {
            session_id: record.session_id.clone(),
            video_id: record.video_id.clone(),
            status: record.status,
            tolerance_seconds: record.tolerance_seconds,
            created_epoch_s: record.created_epoch_s,
            completed_epoch_s: record.completed_epoch_s,
            ignored_detections: record.ignored_detections,
            metrics,
            metrics_final: record.status == SessionStatus::Completed,
            failure_reason: record.failure_reason.clone(),
            classifications: if include_log {
                Some(rows.to_vec())
            } else {
                None
            },
        }
    }
}

/// Export envelope for compiled reports.
#[derive(Debug, Serialize, Deserialize)]
pub struct ResultsBundle {
    pub engine_version: String,
    pub generated_epoch_s: u64,
    pub sessions: Vec<SessionReport>,
}

impl ResultsBundle {
    pub fn new(sessions: Vec<SessionReport>) -> Self {
        Self {
            engine_version: env!("CARGO_PKG_VERSION").to_string(),
            generated_epoch_s: epoch_seconds(),
            sessions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::GroundTruthIndex;
    use crate::session::SessionConfig;
    use crate::{DetectionEvent, EventContract, GroundTruthObject};
    use std::sync::Arc;

    fn scored_session() -> SessionValidator {
        let index = GroundTruthIndex::build(vec![GroundTruthObject {
            id: "1".to_string(),
            timestamp: 10.0,
            class_label: "pedestrian".to_string(),
            confidence: 1.0,
            bbox: None,
        }])
        .expect("index");
        let mut session = SessionValidator::new(
            "run-1".to_string(),
            "video-1".to_string(),
            Arc::new(index),
            SessionConfig {
                tolerance_seconds: 0.1,
                class_labels: None,
            },
        );
        let event = EventContract::admit(DetectionEvent {
            session_id: "run-1".to_string(),
            timestamp: 10.05,
            confidence: 0.9,
            class_label: "pedestrian".to_string(),
        })
        .expect("admit");
        session.admit(&event).expect("score");
        session
    }

    #[test]
    fn running_report_is_provisional() {
        let session = scored_session();
        let report = SessionReport::compile(&session, false);
        assert_eq!(report.status, SessionStatus::Running);
        assert!(!report.metrics_final);
        assert!(report.metrics.is_some());
        assert!(report.classifications.is_none());
    }

    #[test]
    fn completed_report_marks_metrics_final() {
        let mut session = scored_session();
        session.complete();
        let report = SessionReport::compile(&session, true);
        assert!(report.metrics_final);
        let metrics = report.metrics.expect("metrics");
        assert_eq!(metrics.true_positives, 1);
        assert_eq!(report.classifications.map(|c| c.len()), Some(1));
    }

    #[test]
    fn failed_report_withholds_metrics() {
        let mut session = scored_session();
        session.fail("store vanished").expect("fail");
        let report = SessionReport::compile(&session, false);
        assert!(report.metrics.is_none());
        assert!(!report.metrics_final);
        assert_eq!(report.failure_reason.as_deref(), Some("store vanished"));

        let json = serde_json::to_value(&report).expect("serialize");
        assert!(json.get("metrics").map(|m| m.is_null()).unwrap_or(false));
    }

    #[test]
    fn stored_rows_recompile_to_the_live_report() {
        let mut session = scored_session();
        session.complete();
        let live = SessionReport::compile(&session, true);

        let record = SessionRecord {
            session_id: "run-1".to_string(),
            video_id: "video-1".to_string(),
            status: SessionStatus::Completed,
            tolerance_seconds: 0.1,
            total_ground_truth: 1,
            ignored_detections: 0,
            created_epoch_s: live.created_epoch_s,
            completed_epoch_s: live.completed_epoch_s,
            failure_reason: None,
        };
        let rows = live.classifications.clone().expect("log");
        let rebuilt = SessionReport::from_stored(&record, &rows, true);

        assert_eq!(rebuilt.status, SessionStatus::Completed);
        assert!(rebuilt.metrics_final);
        let live_metrics = live.metrics.expect("live metrics");
        let rebuilt_metrics = rebuilt.metrics.expect("rebuilt metrics");
        assert_eq!(rebuilt_metrics.true_positives, live_metrics.true_positives);
        assert_eq!(rebuilt_metrics.false_negatives, live_metrics.false_negatives);
        assert_eq!(rebuilt_metrics.precision, live_metrics.precision);
        assert_eq!(rebuilt.classifications.map(|c| c.len()), Some(1));
    }

    #[test]
    fn stored_failed_session_withholds_metrics() {
        let record = SessionRecord {
            session_id: "run-x".to_string(),
            video_id: "video-missing".to_string(),
            status: SessionStatus::Failed,
            tolerance_seconds: 0.1,
            total_ground_truth: 0,
            ignored_detections: 0,
            created_epoch_s: 1_700_000_000,
            completed_epoch_s: Some(1_700_000_001),
            failure_reason: Some("groundtruth.load: missing file".to_string()),
        };
        let report = SessionReport::from_stored(&record, &[], false);
        assert!(report.metrics.is_none());
        assert!(!report.metrics_final);
    }

    #[test]
    fn bundle_carries_engine_version() {
        let session = scored_session();
        let bundle = ResultsBundle::new(vec![SessionReport::compile(&session, false)]);
        assert_eq!(bundle.engine_version, env!("CARGO_PKG_VERSION"));
        assert_eq!(bundle.sessions.len(), 1);
    }
}
