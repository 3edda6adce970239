// Rationale: admitted events must never deserialize straight off the wire;
// that would bypass range validation at the boundary.
use scoring_engine::AdmittedEvent;

fn main() {
    let _admitted: AdmittedEvent =
        serde_json::from_str(r#"{"session_id":"run-1","timestamp":1.0}"#).unwrap();
}
