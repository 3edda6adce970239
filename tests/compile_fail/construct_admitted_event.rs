// Rationale: admitted events exist only through boundary validation; the
// inner detection stays private so callers cannot forge one.
use scoring_engine::{AdmittedEvent, DetectionEvent};

fn main() {
    let event = DetectionEvent {
        session_id: "run-1".to_string(),
        timestamp: 1.0,
        confidence: 0.9,
        class_label: "pedestrian".to_string(),
    };
    let _admitted = AdmittedEvent(event);
}
