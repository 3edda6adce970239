//! Per-session validation state.
//!
//! A `SessionValidator` owns everything mutable about one scoring run: the
//! claim overlay, the admission-ordered classification log, and the status
//! machine. It never performs I/O; callers serialize access (one mutex per
//! session) and persist results out of band.

use std::sync::Arc;

use anyhow::Result;
use log::{debug, info, warn};

use crate::index::{ClaimSet, GroundTruthIndex};
use crate::matcher;
use crate::metrics::SessionMetrics;
use crate::{
    epoch_seconds, AdmittedEvent, ClassificationResult, Outcome, Rejection, SessionStatus,
};

/// Matching parameters for one session.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Inclusive half-width of the matching window, in seconds.
    pub tolerance_seconds: f64,
    /// Labels this session scores. `None` scores every label; detections
    /// for labels outside the set are counted as ignored, never classified,
    /// and ground-truth objects outside the set are excluded from the
    /// false-negative universe.
    pub class_labels: Option<Vec<String>>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tolerance_seconds: crate::config::DEFAULT_TOLERANCE_SECONDS,
            class_labels: None,
        }
    }
}

/// Mutable scoring state for one session against one video's ground truth.
pub struct SessionValidator {
    session_id: String,
    video_id: String,
    index: Arc<GroundTruthIndex>,
    claims: ClaimSet,
    log: Vec<ClassificationResult>,
    status: SessionStatus,
    config: SessionConfig,
    ignored_detections: u64,
    next_seq: u64,
    created_epoch_s: u64,
    completed_epoch_s: Option<u64>,
    failure_reason: Option<String>,
}

impl SessionValidator {
    pub fn new(
        session_id: String,
        video_id: String,
        index: Arc<GroundTruthIndex>,
        config: SessionConfig,
    ) -> Self {
        let claims = index.new_claim_set();
        Self {
            session_id,
            video_id,
            index,
            claims,
            log: Vec::new(),
            status: SessionStatus::Created,
            config,
            ignored_detections: 0,
            next_seq: 0,
            created_epoch_s: epoch_seconds(),
            completed_epoch_s: None,
            failure_reason: None,
        }
    }

    /// A session whose ground truth could not be loaded: born `Failed`,
    /// admits nothing, reports the load error as its failure reason.
    pub fn failed(session_id: String, video_id: String, reason: String) -> Self {
        let mut session = Self::new(
            session_id,
            video_id,
            Arc::new(GroundTruthIndex::empty()),
            SessionConfig::default(),
        );
        session.status = SessionStatus::Failed;
        session.failure_reason = Some(reason);
        session.completed_epoch_s = Some(epoch_seconds());
        session
    }

    /// Score one admitted detection.
    ///
    /// Returns the appended classification, or `None` when the event's
    /// label is outside the configured set (counted as ignored). The only
    /// error is `session.not_accepting` once the session has closed;
    /// matching itself cannot fail, and a lost claim degrades to a false
    /// positive.
    pub fn admit(&mut self, event: &AdmittedEvent) -> Result<Option<ClassificationResult>> {
        if !self.status.accepting() {
            return Err(Rejection::new(
                "session.not_accepting",
                format!(
                    "session '{}' is {} and no longer accepts events",
                    self.session_id,
                    self.status.as_str()
                ),
            )
            .into());
        }
        if self.status == SessionStatus::Created {
            self.status = SessionStatus::Running;
            info!("session {}: running", self.session_id);
        }
        if !self.scores_label(event.class_label()) {
            self.ignored_detections += 1;
            debug!(
                "session {}: ignored detection for out-of-interest label '{}'",
                self.session_id,
                event.class_label()
            );
            return Ok(None);
        }

        let matched_id = matcher::best_match(
            &self.index,
            &self.claims,
            event.timestamp(),
            event.class_label(),
            self.config.tolerance_seconds,
        )
        .map(|obj| obj.id.clone());

        let (outcome, matched_ground_truth_id) = match matched_id {
            Some(id) => {
                if self.index.claim(&mut self.claims, &id) {
                    (Outcome::TruePositive, Some(id))
                } else {
                    // Lost claim: the object was taken between selection and
                    // claim. Scored as a false positive, never an error.
                    warn!(
                        "session {}: claim contention on ground-truth object '{}'",
                        self.session_id, id
                    );
                    (Outcome::FalsePositive, None)
                }
            }
            None => (Outcome::FalsePositive, None),
        };

        let result = ClassificationResult {
            seq: self.next_seq,
            timestamp: event.timestamp(),
            class_label: event.class_label().to_string(),
            confidence: event.confidence(),
            outcome,
            matched_ground_truth_id,
        };
        self.next_seq += 1;
        debug!(
            "session {}: seq {} '{}' at {:.3}s scored {}",
            self.session_id,
            result.seq,
            result.class_label,
            result.timestamp,
            result.outcome.as_str()
        );
        self.log.push(result.clone());
        Ok(Some(result))
    }

    /// Close the session normally. Idempotent; a failed session stays
    /// failed.
    pub fn complete(&mut self) {
        match self.status {
            SessionStatus::Completed | SessionStatus::Failed => {}
            SessionStatus::Created | SessionStatus::Running => {
                self.status = SessionStatus::Completed;
                self.completed_epoch_s = Some(epoch_seconds());
                let m = self.metrics();
                info!(
                    "session {}: completed (tp {} fp {} fn {}, {} ignored)",
                    self.session_id,
                    m.true_positives,
                    m.false_positives,
                    m.false_negatives,
                    self.ignored_detections
                );
            }
        }
    }

    /// Close the session abnormally. Rejected once the session completed;
    /// repeated failures keep the first reason.
    pub fn fail(&mut self, reason: &str) -> Result<()> {
        match self.status {
            SessionStatus::Completed => Err(Rejection::new(
                "session.not_accepting",
                format!("session '{}' already completed", self.session_id),
            )
            .into()),
            SessionStatus::Failed => Ok(()),
            SessionStatus::Created | SessionStatus::Running => {
                self.status = SessionStatus::Failed;
                self.failure_reason = Some(reason.to_string());
                self.completed_epoch_s = Some(epoch_seconds());
                warn!("session {}: failed: {}", self.session_id, reason);
                Ok(())
            }
        }
    }

    /// Current metrics, recomputed from the log and the claim overlay.
    /// False negatives are provisional until the session completes.
    pub fn metrics(&self) -> SessionMetrics {
        SessionMetrics::compute(&self.log, self.unmatched_ground_truth())
    }

    /// Ground-truth objects this session scores, restricted to the
    /// configured labels when set.
    pub fn total_ground_truth(&self) -> usize {
        match &self.config.class_labels {
            None => self.index.len(),
            Some(_) => self
                .index
                .objects()
                .iter()
                .filter(|obj| self.scores_label(&obj.class_label))
                .count(),
        }
    }

    fn unmatched_ground_truth(&self) -> usize {
        match &self.config.class_labels {
            None => self.index.unclaimed_count(&self.claims),
            Some(_) => self
                .index
                .unclaimed(&self.claims)
                .into_iter()
                .filter(|obj| self.scores_label(&obj.class_label))
                .count(),
        }
    }

    fn scores_label(&self, label: &str) -> bool {
        match &self.config.class_labels {
            Some(labels) => labels.iter().any(|l| l == label),
            None => true,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn video_id(&self) -> &str {
        &self.video_id
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The classification log, in admission order.
    pub fn log(&self) -> &[ClassificationResult] {
        &self.log
    }

    pub fn ignored_detections(&self) -> u64 {
        self.ignored_detections
    }

    pub fn created_epoch_s(&self) -> u64 {
        self.created_epoch_s
    }

    pub fn completed_epoch_s(&self) -> Option<u64> {
        self.completed_epoch_s
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }
}
