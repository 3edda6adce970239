//! Ground-truth supply.
//!
//! Annotations arrive as a JSON array of records, one file per video.
//! Records are parsed here and range-validated by `GroundTruthIndex::build`;
//! unknown fields are tolerated so richer annotation exports load as-is.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};

use crate::{validate_video_id, GroundTruthObject};

/// Parse one ground-truth file: a JSON array of
/// `{id, timestamp, class_label, confidence?, bbox?}` records.
pub fn load_objects(path: &Path) -> Result<Vec<GroundTruthObject>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read ground truth file {}", path.display()))?;
    let objects: Vec<GroundTruthObject> = serde_json::from_str(&raw)
        .with_context(|| format!("parse ground truth file {}", path.display()))?;
    Ok(objects)
}

/// Supplies the ground-truth record list for a video id.
pub trait GroundTruthSource {
    fn load(&self, video_id: &str) -> Result<Vec<GroundTruthObject>>;
}

/// Filesystem source: `<dir>/<video_id>.json`.
pub struct DirGroundTruthSource {
    dir: PathBuf,
}

impl DirGroundTruthSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl GroundTruthSource for DirGroundTruthSource {
    fn load(&self, video_id: &str) -> Result<Vec<GroundTruthObject>> {
        // The identifier charset has no path separators, so the join cannot
        // escape the configured directory.
        validate_video_id(video_id)?;
        let path = self.dir.join(format!("{}.json", video_id));
        load_objects(&path)
    }
}

/// In-memory source for tests and the demo binary.
#[derive(Default)]
pub struct StaticGroundTruthSource {
    videos: HashMap<String, Vec<GroundTruthObject>>,
}

impl StaticGroundTruthSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, video_id: impl Into<String>, objects: Vec<GroundTruthObject>) {
        self.videos.insert(video_id.into(), objects);
    }
}

impl GroundTruthSource for StaticGroundTruthSource {
    fn load(&self, video_id: &str) -> Result<Vec<GroundTruthObject>> {
        self.videos
            .get(video_id)
            .cloned()
            .ok_or_else(|| anyhow!("no ground truth registered for video '{}'", video_id))
    }
}
