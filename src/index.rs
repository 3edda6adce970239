//! Ground-truth indexing and per-session claim state.
//!
//! A `GroundTruthIndex` is built once per video, is immutable afterward,
//! and is shared read-only across sessions (`Arc<GroundTruthIndex>`).
//! Which objects have been matched is session-local state, kept in a
//! `ClaimSet` overlay, so concurrent sessions against the same video never
//! contend on shared mutable state.

use anyhow::{anyhow, Result};
use std::collections::HashMap;

use crate::GroundTruthObject;

/// Immutable, time-ordered index of the ground-truth objects for one video.
///
/// Objects are sorted by timestamp (ties by id) and grouped into per-class
/// position lists, so a window query touches only objects of the queried
/// class.
#[derive(Debug)]
pub struct GroundTruthIndex {
    objects: Vec<GroundTruthObject>,
    by_class: HashMap<String, Vec<usize>>,
    by_id: HashMap<String, usize>,
}

/// One unclaimed object inside a tolerance window, with its time distance
/// from the queried timestamp.
#[derive(Debug)]
pub struct Candidate<'a> {
    pub object: &'a GroundTruthObject,
    pub distance: f64,
}

impl GroundTruthIndex {
    /// Validate and index a full list of ground-truth objects.
    ///
    /// Rejects non-finite or negative timestamps, out-of-range confidence,
    /// empty ids or labels, and duplicate ids. An empty list is valid and
    /// yields an index where every detection scores as a false positive.
    pub fn build(mut objects: Vec<GroundTruthObject>) -> Result<Self> {
        for obj in &objects {
            if obj.id.is_empty() {
                return Err(anyhow!("ground truth object with empty id"));
            }
            if !obj.timestamp.is_finite() || obj.timestamp < 0.0 {
                return Err(anyhow!(
                    "ground truth object '{}': timestamp {} violates constraint: finite and >= 0",
                    obj.id,
                    obj.timestamp
                ));
            }
            if !obj.confidence.is_finite() || !(0.0..=1.0).contains(&obj.confidence) {
                return Err(anyhow!(
                    "ground truth object '{}': confidence {} violates constraint: within [0, 1]",
                    obj.id,
                    obj.confidence
                ));
            }
            if obj.class_label.is_empty() {
                return Err(anyhow!("ground truth object '{}': empty class_label", obj.id));
            }
        }

        objects.sort_by(|a, b| {
            a.timestamp
                .total_cmp(&b.timestamp)
                .then_with(|| a.id.cmp(&b.id))
        });

        let mut by_class: HashMap<String, Vec<usize>> = HashMap::new();
        let mut by_id: HashMap<String, usize> = HashMap::with_capacity(objects.len());
        for (pos, obj) in objects.iter().enumerate() {
            if by_id.insert(obj.id.clone(), pos).is_some() {
                return Err(anyhow!("duplicate ground truth object id '{}'", obj.id));
            }
            by_class.entry(obj.class_label.clone()).or_default().push(pos);
        }

        Ok(Self {
            objects,
            by_class,
            by_id,
        })
    }

    /// Index over no objects, for sessions whose ground truth never loaded.
    pub fn empty() -> Self {
        Self {
            objects: Vec::new(),
            by_class: HashMap::new(),
            by_id: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// All objects, sorted by timestamp.
    pub fn objects(&self) -> &[GroundTruthObject] {
        &self.objects
    }

    /// A fresh claim overlay sized for this index.
    pub fn new_claim_set(&self) -> ClaimSet {
        ClaimSet {
            claimed: vec![false; self.objects.len()],
            count: 0,
        }
    }

    /// Every unclaimed object of `class_label` with
    /// `|timestamp - object.timestamp| <= tolerance_seconds` (inclusive),
    /// ordered by ascending time distance, ties by ascending id.
    ///
    /// Total: a query with an unknown class, an empty index, or a
    /// non-positive window returns an empty list rather than an error.
    pub fn find_candidates<'a>(
        &'a self,
        claims: &ClaimSet,
        timestamp: f64,
        class_label: &str,
        tolerance_seconds: f64,
    ) -> Vec<Candidate<'a>> {
        if !tolerance_seconds.is_finite() || tolerance_seconds < 0.0 || !timestamp.is_finite() {
            return Vec::new();
        }
        let positions = match self.by_class.get(class_label) {
            Some(positions) => positions,
            None => return Vec::new(),
        };

        let lo = timestamp - tolerance_seconds;
        let mut start = positions.partition_point(|&pos| self.objects[pos].timestamp < lo);
        // The partition bound is computed in floating point; step back while
        // the previous object is still within the window so the inclusive
        // distance check below stays authoritative.
        while start > 0 {
            let prev = &self.objects[positions[start - 1]];
            if (timestamp - prev.timestamp).abs() <= tolerance_seconds {
                start -= 1;
            } else {
                break;
            }
        }

        let mut out = Vec::new();
        for &pos in &positions[start..] {
            let obj = &self.objects[pos];
            let distance = (timestamp - obj.timestamp).abs();
            if obj.timestamp > timestamp && distance > tolerance_seconds {
                break;
            }
            if distance > tolerance_seconds || claims.claimed[pos] {
                continue;
            }
            out.push(Candidate {
                object: obj,
                distance,
            });
        }

        out.sort_by(|a, b| {
            a.distance
                .total_cmp(&b.distance)
                .then_with(|| a.object.id.cmp(&b.object.id))
        });
        out
    }

    /// Mark an object as matched in the session overlay. Returns false if
    /// the id is unknown or the object was already claimed; claiming never
    /// mutates state on failure.
    pub fn claim(&self, claims: &mut ClaimSet, object_id: &str) -> bool {
        let pos = match self.by_id.get(object_id) {
            Some(&pos) => pos,
            None => return false,
        };
        match claims.claimed.get_mut(pos) {
            Some(slot) if !*slot => {
                *slot = true;
                claims.count += 1;
                true
            }
            _ => false,
        }
    }

    pub fn is_claimed(&self, claims: &ClaimSet, object_id: &str) -> bool {
        self.by_id
            .get(object_id)
            .and_then(|&pos| claims.claimed.get(pos))
            .copied()
            .unwrap_or(false)
    }

    /// Objects never claimed in this session, in timestamp order. The size
    /// of this set is the session's false-negative count.
    pub fn unclaimed<'a>(&'a self, claims: &ClaimSet) -> Vec<&'a GroundTruthObject> {
        self.objects
            .iter()
            .enumerate()
            .filter(|(pos, _)| !claims.claimed.get(*pos).copied().unwrap_or(false))
            .map(|(_, obj)| obj)
            .collect()
    }

    pub fn unclaimed_count(&self, claims: &ClaimSet) -> usize {
        self.objects.len().saturating_sub(claims.count)
    }
}

/// Per-session record of which indexed objects have been claimed.
///
/// Positions mirror the owning index; a ClaimSet is only meaningful with
/// the index that created it.
#[derive(Clone, Debug)]
pub struct ClaimSet {
    claimed: Vec<bool>,
    count: usize,
}

impl ClaimSet {
    pub fn claimed_count(&self) -> usize {
        self.count
    }
}
