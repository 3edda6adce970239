//! Concurrent session table.
//!
//! The registry owns every resident session behind its own mutex, so one
//! session's scoring is serialized while distinct sessions run in parallel.
//! Ground-truth indexes are built once per video and shared read-only
//! across sessions. Store writes leave through an mpsc sender to the
//! writer thread; the admission path never waits on I/O.

use std::collections::HashMap;
use std::sync::{mpsc, Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::groundtruth::GroundTruthSource;
use crate::index::GroundTruthIndex;
use crate::report::SessionReport;
use crate::session::{SessionConfig, SessionValidator};
use crate::storage::{SessionRecord, StoreCommand};
use crate::{
    validate_class_label, validate_session_id, validate_video_id, ClassificationResult,
    DetectionEvent, EventContract, Rejection, SessionStatus,
};

/// Session creation request. Omitted matching parameters fall back to the
/// registry defaults.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateSession {
    pub session_id: String,
    pub video_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerance_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_labels: Option<Vec<String>>,
}

/// One row of the session listing.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub video_id: String,
    pub status: SessionStatus,
    pub total_detections: u64,
    pub created_epoch_s: u64,
}

pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<Mutex<SessionValidator>>>>,
    indexes: Mutex<HashMap<String, Arc<GroundTruthIndex>>>,
    source: Box<dyn GroundTruthSource + Send + Sync>,
    store_sink: Option<mpsc::Sender<StoreCommand>>,
    defaults: SessionConfig,
}

impl SessionRegistry {
    pub fn new(source: Box<dyn GroundTruthSource + Send + Sync>, defaults: SessionConfig) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            indexes: Mutex::new(HashMap::new()),
            source,
            store_sink: None,
            defaults,
        }
    }

    /// Attach the fire-and-forget channel to the store writer thread.
    pub fn with_store_sink(mut self, sink: mpsc::Sender<StoreCommand>) -> Self {
        self.store_sink = Some(sink);
        self
    }

    /// Create a session against one video's ground truth.
    ///
    /// A ground truth that cannot be loaded does not refuse creation: the
    /// session is registered as `Failed` with the load error as its failure
    /// reason, so the caller sees the failure through the normal report
    /// shape instead of a lost session id.
    pub fn create_session(&self, req: CreateSession) -> Result<SessionReport> {
        validate_session_id(&req.session_id)?;
        validate_video_id(&req.video_id)?;
        let config = self.session_config(&req)?;

        if self.lock_sessions()?.contains_key(&req.session_id) {
            return Err(self.exists(&req.session_id));
        }

        let validator = match self.index_for(&req.video_id) {
            Ok(index) => SessionValidator::new(
                req.session_id.clone(),
                req.video_id.clone(),
                index,
                config,
            ),
            Err(err) => {
                let reason = format!("groundtruth.load: {:#}", err);
                warn!(
                    "session {}: ground truth unavailable: {}",
                    req.session_id, reason
                );
                SessionValidator::failed(req.session_id.clone(), req.video_id.clone(), reason)
            }
        };

        let report = SessionReport::compile(&validator, false);
        let record = session_record(&validator);
        {
            let mut sessions = self.lock_sessions()?;
            if sessions.contains_key(&req.session_id) {
                return Err(self.exists(&req.session_id));
            }
            sessions.insert(req.session_id.clone(), Arc::new(Mutex::new(validator)));
        }
        info!(
            "session {} created for video {} (tolerance {}s, status {})",
            req.session_id,
            req.video_id,
            report.tolerance_seconds,
            report.status.as_str()
        );
        self.send_store(StoreCommand::UpsertSession(record));
        Ok(report)
    }

    /// Admit one detection into its session and score it.
    ///
    /// `Ok(None)` means the event's label is outside the session's
    /// configured set and was counted as ignored.
    pub fn submit(&self, event: DetectionEvent) -> Result<Option<ClassificationResult>> {
        let admitted = EventContract::admit(event)?;
        let session = self.session(admitted.session_id())?;
        let mut validator = session
            .lock()
            .map_err(|_| anyhow!("session lock poisoned"))?;
        let was_created = validator.status() == SessionStatus::Created;
        let result = validator.admit(&admitted)?;
        if was_created {
            self.send_store(StoreCommand::UpsertSession(session_record(&validator)));
        }
        match &result {
            Some(result) => self.send_store(StoreCommand::AppendClassification {
                session_id: admitted.session_id().to_string(),
                result: result.clone(),
            }),
            None => self.send_store(StoreCommand::UpsertSession(session_record(&validator))),
        }
        Ok(result)
    }

    /// Close a session normally and return its final report.
    pub fn complete(&self, session_id: &str) -> Result<SessionReport> {
        let session = self.session(session_id)?;
        let mut validator = session
            .lock()
            .map_err(|_| anyhow!("session lock poisoned"))?;
        validator.complete();
        self.send_store(StoreCommand::UpsertSession(session_record(&validator)));
        Ok(SessionReport::compile(&validator, false))
    }

    /// Close a session abnormally; its metrics become unavailable.
    pub fn fail(&self, session_id: &str, reason: &str) -> Result<SessionReport> {
        let session = self.session(session_id)?;
        let mut validator = session
            .lock()
            .map_err(|_| anyhow!("session lock poisoned"))?;
        validator.fail(reason)?;
        self.send_store(StoreCommand::UpsertSession(session_record(&validator)));
        Ok(SessionReport::compile(&validator, false))
    }

    /// Current report for one session.
    pub fn results(&self, session_id: &str, include_log: bool) -> Result<SessionReport> {
        let session = self.session(session_id)?;
        let validator = session
            .lock()
            .map_err(|_| anyhow!("session lock poisoned"))?;
        Ok(SessionReport::compile(&validator, include_log))
    }

    /// Summaries of every resident session, oldest first.
    pub fn list(&self) -> Result<Vec<SessionSummary>> {
        let handles: Vec<Arc<Mutex<SessionValidator>>> =
            self.lock_sessions()?.values().cloned().collect();
        let mut out = Vec::with_capacity(handles.len());
        for handle in handles {
            let validator = handle
                .lock()
                .map_err(|_| anyhow!("session lock poisoned"))?;
            out.push(SessionSummary {
                session_id: validator.session_id().to_string(),
                video_id: validator.video_id().to_string(),
                status: validator.status(),
                total_detections: validator.log().len() as u64,
                created_epoch_s: validator.created_epoch_s(),
            });
        }
        out.sort_by(|a, b| {
            a.created_epoch_s
                .cmp(&b.created_epoch_s)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        Ok(out)
    }

    /// Complete every session still accepting events. Used at shutdown;
    /// partial results stay valid and report as completed. Returns the
    /// number of sessions closed.
    pub fn stop_all(&self) -> Result<usize> {
        let handles: Vec<Arc<Mutex<SessionValidator>>> =
            self.lock_sessions()?.values().cloned().collect();
        let mut closed = 0;
        for handle in handles {
            let mut validator = handle
                .lock()
                .map_err(|_| anyhow!("session lock poisoned"))?;
            if validator.status().accepting() {
                validator.complete();
                self.send_store(StoreCommand::UpsertSession(session_record(&validator)));
                closed += 1;
            }
        }
        Ok(closed)
    }

    fn session(&self, session_id: &str) -> Result<Arc<Mutex<SessionValidator>>> {
        self.lock_sessions()?.get(session_id).cloned().ok_or_else(|| {
            Rejection::new("session.unknown", format!("no session '{}'", session_id)).into()
        })
    }

    fn lock_sessions(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, Arc<Mutex<SessionValidator>>>>> {
        self.sessions
            .lock()
            .map_err(|_| anyhow!("session table lock poisoned"))
    }

    fn index_for(&self, video_id: &str) -> Result<Arc<GroundTruthIndex>> {
        let mut cache = self
            .indexes
            .lock()
            .map_err(|_| anyhow!("index cache lock poisoned"))?;
        if let Some(index) = cache.get(video_id) {
            return Ok(index.clone());
        }
        let objects = self.source.load(video_id)?;
        let index = Arc::new(
            GroundTruthIndex::build(objects)
                .with_context(|| format!("index ground truth for video '{}'", video_id))?,
        );
        cache.insert(video_id.to_string(), index.clone());
        info!(
            "ground truth for video {} indexed ({} objects)",
            video_id,
            index.len()
        );
        Ok(index)
    }

    fn session_config(&self, req: &CreateSession) -> Result<SessionConfig> {
        let tolerance_seconds = match req.tolerance_seconds {
            Some(t) => {
                if !t.is_finite() || t < 0.0 {
                    return Err(Rejection::new(
                        "input.tolerance",
                        format!(
                            "tolerance_seconds {} violates constraint: finite and >= 0",
                            t
                        ),
                    )
                    .into());
                }
                t
            }
            None => self.defaults.tolerance_seconds,
        };
        let class_labels = match &req.class_labels {
            Some(labels) => {
                for label in labels {
                    validate_class_label(label)?;
                }
                Some(labels.clone())
            }
            None => self.defaults.class_labels.clone(),
        };
        Ok(SessionConfig {
            tolerance_seconds,
            class_labels,
        })
    }

    fn exists(&self, session_id: &str) -> anyhow::Error {
        Rejection::new(
            "session.exists",
            format!("session '{}' already exists", session_id),
        )
        .into()
    }

    fn send_store(&self, command: StoreCommand) {
        if let Some(sink) = &self.store_sink {
            if sink.send(command).is_err() {
                warn!("store writer unavailable; dropped audit write");
            }
        }
    }
}

fn session_record(validator: &SessionValidator) -> SessionRecord {
    SessionRecord {
        session_id: validator.session_id().to_string(),
        video_id: validator.video_id().to_string(),
        status: validator.status(),
        tolerance_seconds: validator.config().tolerance_seconds,
        total_ground_truth: validator.total_ground_truth() as u64,
        ignored_detections: validator.ignored_detections(),
        created_epoch_s: validator.created_epoch_s(),
        completed_epoch_s: validator.completed_epoch_s(),
        failure_reason: validator.failure_reason().map(str::to_string),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::groundtruth::StaticGroundTruthSource;
    use crate::{rejection_code, GroundTruthObject, Outcome};

    fn gt(id: &str, timestamp: f64, class_label: &str) -> GroundTruthObject {
        GroundTruthObject {
            id: id.to_string(),
            timestamp,
            class_label: class_label.to_string(),
            confidence: 1.0,
            bbox: None,
        }
    }

    fn registry() -> SessionRegistry {
        let mut source = StaticGroundTruthSource::new();
        source.insert("video-1", vec![gt("1", 10.0, "pedestrian")]);
        SessionRegistry::new(
            Box::new(source),
            SessionConfig {
                tolerance_seconds: 0.1,
                class_labels: None,
            },
        )
    }

    fn create(registry: &SessionRegistry, session_id: &str) -> SessionReport {
        registry
            .create_session(CreateSession {
                session_id: session_id.to_string(),
                video_id: "video-1".to_string(),
                tolerance_seconds: None,
                class_labels: None,
            })
            .expect("create")
    }

    fn detection(session_id: &str, timestamp: f64) -> DetectionEvent {
        DetectionEvent {
            session_id: session_id.to_string(),
            timestamp,
            confidence: 0.9,
            class_label: "pedestrian".to_string(),
        }
    }

    #[test]
    fn create_score_complete_roundtrip() {
        let registry = registry();
        let report = create(&registry, "run-1");
        assert_eq!(report.status, SessionStatus::Created);
        assert_eq!(report.tolerance_seconds, 0.1);

        let result = registry
            .submit(detection("run-1", 10.05))
            .expect("submit")
            .expect("classified");
        assert_eq!(result.outcome, Outcome::TruePositive);
        assert_eq!(result.matched_ground_truth_id.as_deref(), Some("1"));

        let report = registry.complete("run-1").expect("complete");
        assert_eq!(report.status, SessionStatus::Completed);
        assert!(report.metrics_final);
        let metrics = report.metrics.expect("metrics");
        assert_eq!(metrics.true_positives, 1);
        assert_eq!(metrics.false_negatives, 0);
    }

    #[test]
    fn duplicate_session_id_is_rejected() {
        let registry = registry();
        create(&registry, "run-1");
        let err = registry
            .create_session(CreateSession {
                session_id: "run-1".to_string(),
                video_id: "video-1".to_string(),
                tolerance_seconds: None,
                class_labels: None,
            })
            .unwrap_err();
        assert_eq!(rejection_code(&err), Some("session.exists"));
    }

    #[test]
    fn unknown_session_is_rejected() {
        let registry = registry();
        let err = registry.submit(detection("missing", 1.0)).unwrap_err();
        assert_eq!(rejection_code(&err), Some("session.unknown"));
        let err = registry.results("missing", false).unwrap_err();
        assert_eq!(rejection_code(&err), Some("session.unknown"));
    }

    #[test]
    fn malformed_event_is_rejected_at_the_boundary() {
        let registry = registry();
        create(&registry, "run-1");
        let mut event = detection("run-1", 10.0);
        event.confidence = 1.5;
        let err = registry.submit(event).unwrap_err();
        assert_eq!(rejection_code(&err), Some("input.confidence_range"));
        // No session state mutated by the rejection.
        let report = registry.results("run-1", true).expect("results");
        assert_eq!(report.classifications.map(|c| c.len()), Some(0));
    }

    #[test]
    fn ground_truth_load_failure_creates_failed_session() {
        let registry = registry();
        let report = registry
            .create_session(CreateSession {
                session_id: "run-x".to_string(),
                video_id: "video-missing".to_string(),
                tolerance_seconds: None,
                class_labels: None,
            })
            .expect("create");
        assert_eq!(report.status, SessionStatus::Failed);
        assert!(report.metrics.is_none());
        assert!(report
            .failure_reason
            .as_deref()
            .map(|r| r.starts_with("groundtruth.load"))
            .unwrap_or(false));

        let err = registry.submit(detection("run-x", 1.0)).unwrap_err();
        assert_eq!(rejection_code(&err), Some("session.not_accepting"));
    }

    #[test]
    fn invalid_tolerance_is_rejected() {
        let registry = registry();
        for bad in [-0.5, f64::NAN, f64::INFINITY] {
            let err = registry
                .create_session(CreateSession {
                    session_id: "run-bad".to_string(),
                    video_id: "video-1".to_string(),
                    tolerance_seconds: Some(bad),
                    class_labels: None,
                })
                .unwrap_err();
            assert_eq!(rejection_code(&err), Some("input.tolerance"));
        }
    }

    #[test]
    fn sessions_share_the_index_but_not_claims() {
        let registry = registry();
        create(&registry, "run-1");
        create(&registry, "run-2");

        let first = registry
            .submit(detection("run-1", 10.0))
            .expect("submit")
            .expect("classified");
        let second = registry
            .submit(detection("run-2", 10.0))
            .expect("submit")
            .expect("classified");
        // Both sessions claim the same object in their own overlays.
        assert_eq!(first.outcome, Outcome::TruePositive);
        assert_eq!(second.outcome, Outcome::TruePositive);
    }

    #[test]
    fn stop_all_completes_accepting_sessions() {
        let registry = registry();
        create(&registry, "run-1");
        create(&registry, "run-2");
        registry.complete("run-2").expect("complete");

        let closed = registry.stop_all().expect("stop all");
        assert_eq!(closed, 1);
        for id in ["run-1", "run-2"] {
            let report = registry.results(id, false).expect("results");
            assert_eq!(report.status, SessionStatus::Completed);
        }
    }

    #[test]
    fn list_orders_sessions_by_creation() {
        let registry = registry();
        create(&registry, "run-b");
        create(&registry, "run-a");
        let listed = registry.list().expect("list");
        assert_eq!(listed.len(), 2);
        // Same creation second resolves by id.
        assert!(listed[0].created_epoch_s <= listed[1].created_epoch_s);
    }

    #[test]
    fn store_sink_receives_the_audit_trail() {
        let (tx, rx) = mpsc::channel();
        let mut source = StaticGroundTruthSource::new();
        source.insert("video-1", vec![gt("1", 10.0, "pedestrian")]);
        let registry = SessionRegistry::new(
            Box::new(source),
            SessionConfig {
                tolerance_seconds: 0.1,
                class_labels: None,
            },
        )
        .with_store_sink(tx);

        create(&registry, "run-1");
        registry.submit(detection("run-1", 10.05)).expect("submit");
        registry.complete("run-1").expect("complete");
        drop(registry);

        let commands: Vec<StoreCommand> = rx.iter().collect();
        assert_eq!(commands.len(), 4);
        assert!(matches!(
            &commands[0],
            StoreCommand::UpsertSession(r) if r.status == SessionStatus::Created
        ));
        assert!(matches!(
            &commands[1],
            StoreCommand::UpsertSession(r) if r.status == SessionStatus::Running
        ));
        assert!(matches!(
            &commands[2],
            StoreCommand::AppendClassification { session_id, .. } if session_id == "run-1"
        ));
        assert!(matches!(
            &commands[3],
            StoreCommand::UpsertSession(r) if r.status == SessionStatus::Completed
        ));
    }
}
