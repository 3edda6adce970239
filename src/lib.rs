//! Detection Scoring Engine (DSE)
//!
//! This crate implements the core engine for validating real-time object
//! detections against fixed ground-truth annotations.
//!
//! # Architecture
//!
//! The engine enforces five invariants by construction:
//!
//! 1. **Boundary Validation**: Detection events are range-checked once, at
//!    admission; nothing downstream re-trusts raw input.
//! 2. **Single Claim**: A ground-truth object is matched by at most one
//!    detection per session.
//! 3. **Admission Order**: Classification results append in the order events
//!    are admitted; the log is never reordered.
//! 4. **Derived Metrics**: Metrics are recomputed from the classification
//!    log and claim state; no accumulator can drift from the log.
//! 5. **Total Scoring**: Matching and aggregation never fail; degenerate
//!    inputs yield defined values, claim races degrade to false positives.
//!
//! # Module Structure
//!
//! - `index`: time-sorted per-class ground-truth index + claim overlay
//! - `matcher`: nearest-in-time candidate selection (pure)
//! - `session`: per-session validation state and lifecycle
//! - `metrics`, `report`: aggregation and the externally visible report
//! - `registry`: concurrent session table and the admission path
//! - Core types: events, classifications, EventContract, Rejection

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod api;
pub mod config;
pub mod groundtruth;
pub mod index;
pub mod matcher;
pub mod metrics;
pub mod registry;
pub mod report;
pub mod session;
pub mod storage;
pub mod transport;

pub use groundtruth::{
    load_objects, DirGroundTruthSource, GroundTruthSource, StaticGroundTruthSource,
};
pub use index::{Candidate, ClaimSet, GroundTruthIndex};
pub use matcher::best_match;
pub use metrics::SessionMetrics;
pub use registry::{CreateSession, SessionRegistry, SessionSummary};
pub use report::{ResultsBundle, SessionReport};
pub use session::{SessionConfig, SessionValidator};
pub use storage::{
    shared_memory_uri, spawn_store_writer, InMemoryResultsStore, ResultsStore, SessionRecord,
    SqliteResultsStore, StoreCommand,
};

/// Wall-clock seconds since the epoch, for session lifecycle stamps.
/// Scoring itself never consults the clock; event timestamps are data.
pub fn epoch_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// -------------------- Data Model --------------------

/// One annotated occurrence of a class of interest in the source video.
///
/// Immutable once loaded; `timestamp` is seconds from the start of the
/// video. `confidence` is informational and plays no role in matching.
/// Spatial data, when present, is parsed and carried but unused by
/// validation.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct GroundTruthObject {
    pub id: String,
    pub timestamp: f64,
    pub class_label: String,
    #[serde(default = "default_gt_confidence")]
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<[f64; 4]>,
}

fn default_gt_confidence() -> f64 {
    1.0
}

/// One real-time detection reported against a session.
///
/// Must pass [`EventContract::admit`] before it can enter the engine.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DetectionEvent {
    pub session_id: String,
    pub timestamp: f64,
    pub confidence: f64,
    pub class_label: String,
}

/// Classification outcome for one admitted detection.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    TruePositive,
    FalsePositive,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::TruePositive => "true_positive",
            Outcome::FalsePositive => "false_positive",
        }
    }
}

impl std::str::FromStr for Outcome {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "true_positive" => Ok(Outcome::TruePositive),
            "false_positive" => Ok(Outcome::FalsePositive),
            other => Err(anyhow::anyhow!("unknown outcome '{}'", other)),
        }
    }
}

/// Lifecycle of one scoring session.
///
/// False-negative counts are provisional until `Completed`; a `Failed`
/// session reports no metrics at all.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Created,
    Running,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Created => "created",
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
        }
    }

    /// Whether new detections may still be admitted.
    pub fn accepting(&self) -> bool {
        matches!(self, SessionStatus::Created | SessionStatus::Running)
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "created" => Ok(SessionStatus::Created),
            "running" => Ok(SessionStatus::Running),
            "completed" => Ok(SessionStatus::Completed),
            "failed" => Ok(SessionStatus::Failed),
            other => Err(anyhow::anyhow!("unknown session status '{}'", other)),
        }
    }
}

/// The outcome of matching one detection, appended to the session log in
/// admission order. `seq` is the per-session admission sequence number and
/// doubles as the detection identifier. `matched_ground_truth_id` is present
/// exactly when `outcome` is `TruePositive`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ClassificationResult {
    pub seq: u64,
    pub timestamp: f64,
    pub class_label: String,
    pub confidence: f64,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_ground_truth_id: Option<String>,
}

// -------------------- Identifier Discipline --------------------

/// Session and video identifiers are opaque but must stay usable as
/// storage keys and URL path segments: 1..=64 of [A-Za-z0-9:_.-],
/// starting alphanumeric.
fn validate_identifier(kind: &'static str, code: &'static str, value: &str) -> Result<()> {
    // Compile once for hot paths.
    static IDENT_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re =
        IDENT_RE.get_or_init(|| regex::Regex::new(r"^[A-Za-z0-9][A-Za-z0-9:_.-]{0,63}$").unwrap());

    if !re.is_match(value) {
        return Err(Rejection::new(
            code,
            format!(
                "{} '{}' must match ^[A-Za-z0-9][A-Za-z0-9:_.-]{{1,64}}$",
                kind, value
            ),
        )
        .into());
    }
    Ok(())
}

pub fn validate_session_id(session_id: &str) -> Result<()> {
    validate_identifier("session_id", "input.session_id", session_id)
}

pub fn validate_video_id(video_id: &str) -> Result<()> {
    validate_identifier("video_id", "input.video_id", video_id)
}

/// Class labels are preserved verbatim end-to-end, so validation only
/// excludes strings that cannot round-trip: empty, oversized, non-printable,
/// or padded with whitespace.
pub fn validate_class_label(label: &str) -> Result<()> {
    if label.is_empty() || label.len() > 64 {
        return Err(Rejection::new(
            "input.label",
            format!("class_label must be 1..=64 bytes, got {} bytes", label.len()),
        )
        .into());
    }
    if label != label.trim() {
        return Err(Rejection::new(
            "input.label",
            "class_label must not have leading or trailing whitespace",
        )
        .into());
    }
    if !label.chars().all(|c| c.is_ascii_graphic() || c == ' ') {
        return Err(Rejection::new(
            "input.label",
            format!("class_label '{}' contains non-printable characters", label),
        )
        .into());
    }
    Ok(())
}

// -------------------- Event Contract --------------------

/// Boundary validation for inbound detections. `admit` is the only
/// constructor of [`AdmittedEvent`], so holding one is proof the checks
/// ran. Rejections carry the offending value and the violated constraint;
/// no session state is touched on rejection.
pub struct EventContract;

impl EventContract {
    pub fn admit(event: DetectionEvent) -> Result<AdmittedEvent> {
        if !event.timestamp.is_finite() || event.timestamp < 0.0 {
            return Err(Rejection::new(
                "input.timestamp_range",
                format!(
                    "timestamp {} violates constraint: finite and >= 0",
                    event.timestamp
                ),
            )
            .into());
        }
        if !event.confidence.is_finite() || !(0.0..=1.0).contains(&event.confidence) {
            return Err(Rejection::new(
                "input.confidence_range",
                format!(
                    "confidence {} violates constraint: within [0, 1]",
                    event.confidence
                ),
            )
            .into());
        }
        validate_session_id(&event.session_id)?;
        validate_class_label(&event.class_label)?;
        Ok(AdmittedEvent(event))
    }
}

/// A detection event that passed the admission contract.
///
/// Deliberately not `Deserialize` and not constructible outside this
/// module: the wrapped event can only exist post-validation.
#[derive(Clone, Debug)]
pub struct AdmittedEvent(DetectionEvent);

impl AdmittedEvent {
    pub fn session_id(&self) -> &str {
        &self.0.session_id
    }

    pub fn timestamp(&self) -> f64 {
        self.0.timestamp
    }

    pub fn confidence(&self) -> f64 {
        self.0.confidence
    }

    pub fn class_label(&self) -> &str {
        &self.0.class_label
    }
}

// -------------------- Rejections --------------------

/// A caller-visible refusal with a stable machine code.
///
/// Codes: `input.timestamp_range`, `input.confidence_range`, `input.label`,
/// `input.session_id`, `input.video_id`, `input.tolerance`,
/// `session.unknown`, `session.exists`, `session.not_accepting`,
/// `groundtruth.load`.
#[derive(Clone, Debug)]
pub struct Rejection {
    pub code: &'static str,
    pub message: String,
}

impl Rejection {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}
impl std::error::Error for Rejection {}

/// Extract the rejection code from an error chain, if the error is a
/// boundary rejection rather than an internal failure.
pub fn rejection_code(err: &anyhow::Error) -> Option<&'static str> {
    err.downcast_ref::<Rejection>().map(|r| r.code)
}
