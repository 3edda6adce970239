//! Tolerance matching: decide whether one detection matches an available
//! ground-truth object.
//!
//! Matching is greedy nearest-in-time: each event is scored at arrival
//! against the currently unclaimed objects of its class. Exact distance
//! ties break to the lexicographically smallest id so identical inputs
//! always produce identical matches. When same-class tolerance windows do
//! not overlap this is equal to optimal assignment; when they overlap, a
//! later event can pair with a worse candidate than an offline assignment
//! would pick. That loss is accepted to keep scoring immediate and
//! O(log n) per event against the class sub-index.
//!
//! Everything here is a total function over borrowed state; claim
//! mutation stays with the caller.

use crate::index::{Candidate, ClaimSet, GroundTruthIndex};
use crate::GroundTruthObject;

/// Pick the winning candidate: smallest time distance, ties by ascending
/// id. Robust to any candidate ordering.
pub fn select_candidate<'a>(candidates: &[Candidate<'a>]) -> Option<&'a GroundTruthObject> {
    candidates
        .iter()
        .min_by(|a, b| {
            a.distance
                .total_cmp(&b.distance)
                .then_with(|| a.object.id.cmp(&b.object.id))
        })
        .map(|c| c.object)
}

/// Match one detection against the index under the session's claim state.
/// `None` means no unclaimed same-class object lies within the window and
/// the event scores as a false positive.
pub fn best_match<'a>(
    index: &'a GroundTruthIndex,
    claims: &ClaimSet,
    timestamp: f64,
    class_label: &str,
    tolerance_seconds: f64,
) -> Option<&'a GroundTruthObject> {
    let candidates = index.find_candidates(claims, timestamp, class_label, tolerance_seconds);
    select_candidate(&candidates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GroundTruthObject;

    fn gt(id: &str, timestamp: f64, class_label: &str) -> GroundTruthObject {
        GroundTruthObject {
            id: id.to_string(),
            timestamp,
            class_label: class_label.to_string(),
            confidence: 1.0,
            bbox: None,
        }
    }

    fn index(objects: Vec<GroundTruthObject>) -> GroundTruthIndex {
        GroundTruthIndex::build(objects).expect("build index")
    }

    #[test]
    fn no_ground_truth_means_no_match() {
        let idx = index(Vec::new());
        let claims = idx.new_claim_set();
        assert!(best_match(&idx, &claims, 5.0, "cyclist", 0.1).is_none());
    }

    #[test]
    fn matches_single_object_inside_window() {
        let idx = index(vec![gt("1", 10.0, "pedestrian")]);
        let claims = idx.new_claim_set();
        let found = best_match(&idx, &claims, 10.05, "pedestrian", 0.1).expect("match");
        assert_eq!(found.id, "1");
    }

    #[test]
    fn no_match_outside_window() {
        let idx = index(vec![gt("1", 10.0, "pedestrian")]);
        let claims = idx.new_claim_set();
        assert!(best_match(&idx, &claims, 10.2, "pedestrian", 0.1).is_none());
    }

    #[test]
    fn window_boundary_matches_inclusively() {
        let idx = index(vec![gt("1", 10.0, "pedestrian")]);
        let claims = idx.new_claim_set();
        assert!(best_match(&idx, &claims, 10.25, "pedestrian", 0.25).is_some());
        assert!(best_match(&idx, &claims, 10.2500001, "pedestrian", 0.25).is_none());
    }

    #[test]
    fn picks_nearest_in_time() {
        let idx = index(vec![
            gt("early", 9.8, "pedestrian"),
            gt("close", 10.02, "pedestrian"),
            gt("late", 10.3, "pedestrian"),
        ]);
        let claims = idx.new_claim_set();
        let found = best_match(&idx, &claims, 10.0, "pedestrian", 0.5).expect("match");
        assert_eq!(found.id, "close");
    }

    #[test]
    fn exact_distance_tie_breaks_to_smallest_id() {
        let idx = index(vec![gt("b", 9.5, "pedestrian"), gt("a", 10.5, "pedestrian")]);
        let claims = idx.new_claim_set();
        let found = best_match(&idx, &claims, 10.0, "pedestrian", 0.5).expect("match");
        assert_eq!(found.id, "a");
    }

    #[test]
    fn midway_between_two_objects_matches_exactly_one() {
        // Two same-class objects exactly two tolerances apart; a detection
        // midway is on both windows' inclusive edge and must take one.
        let idx = index(vec![gt("1", 10.0, "pedestrian"), gt("2", 10.5, "pedestrian")]);
        let mut claims = idx.new_claim_set();
        let found = best_match(&idx, &claims, 10.25, "pedestrian", 0.25).expect("match");
        assert_eq!(found.id, "1");
        assert!(idx.claim(&mut claims, "1"));
        let second = best_match(&idx, &claims, 10.25, "pedestrian", 0.25).expect("second");
        assert_eq!(second.id, "2");
    }

    #[test]
    fn claimed_objects_are_not_rematched() {
        let idx = index(vec![gt("1", 10.0, "pedestrian")]);
        let mut claims = idx.new_claim_set();
        assert!(idx.claim(&mut claims, "1"));
        assert!(best_match(&idx, &claims, 10.0, "pedestrian", 0.1).is_none());
    }

    #[test]
    fn class_labels_never_cross_match() {
        let idx = index(vec![gt("1", 10.0, "vehicle")]);
        let claims = idx.new_claim_set();
        assert!(best_match(&idx, &claims, 10.0, "pedestrian", 0.1).is_none());
    }

    #[test]
    fn select_candidate_on_empty_slice_is_none() {
        assert!(select_candidate(&[]).is_none());
    }
}
