use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::session::SessionConfig;
use crate::validate_class_label;

const DEFAULT_DB_PATH: &str = "scoring.db";
const DEFAULT_API_ADDR: &str = "127.0.0.1:8791";
const DEFAULT_GROUNDTRUTH_DIR: &str = "groundtruth";
/// Matching window applied when neither config nor session creation sets one.
pub const DEFAULT_TOLERANCE_SECONDS: f64 = 0.1;

#[derive(Debug, Deserialize, Default)]
struct ScoringdConfigFile {
    db_path: Option<String>,
    api: Option<ApiConfigFile>,
    groundtruth: Option<GroundTruthConfigFile>,
    matching: Option<MatchingConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
    token_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct GroundTruthConfigFile {
    dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct MatchingConfigFile {
    tolerance_seconds: Option<f64>,
    class_labels: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct ScoringdConfig {
    pub db_path: String,
    pub api_addr: String,
    pub api_token_path: Option<PathBuf>,
    pub groundtruth_dir: PathBuf,
    pub matching: MatchingSettings,
}

#[derive(Debug, Clone)]
pub struct MatchingSettings {
    pub tolerance_seconds: f64,
    /// Labels scored by default. `None` scores every label.
    pub class_labels: Option<Vec<String>>,
}

impl ScoringdConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("SCORING_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Per-session matching defaults derived from the daemon config.
    pub fn session_defaults(&self) -> SessionConfig {
        SessionConfig {
            tolerance_seconds: self.matching.tolerance_seconds,
            class_labels: self.matching.class_labels.clone(),
        }
    }

    fn from_file(file: ScoringdConfigFile) -> Self {
        let db_path = file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string());
        let api_addr = file
            .api
            .as_ref()
            .and_then(|api| api.addr.clone())
            .unwrap_or_else(|| DEFAULT_API_ADDR.to_string());
        let api_token_path = file.api.and_then(|api| api.token_path).or_else(|| {
            std::env::var("SCORING_API_TOKEN_PATH")
                .ok()
                .map(PathBuf::from)
        });
        let groundtruth_dir = file
            .groundtruth
            .and_then(|gt| gt.dir)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_GROUNDTRUTH_DIR));
        let matching = MatchingSettings {
            tolerance_seconds: file
                .matching
                .as_ref()
                .and_then(|m| m.tolerance_seconds)
                .unwrap_or(DEFAULT_TOLERANCE_SECONDS),
            class_labels: file.matching.and_then(|m| m.class_labels),
        };
        Self {
            db_path,
            api_addr,
            api_token_path,
            groundtruth_dir,
            matching,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("SCORING_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = path;
            }
        }
        if let Ok(addr) = std::env::var("SCORING_API_ADDR") {
            if !addr.trim().is_empty() {
                self.api_addr = addr;
            }
        }
        if let Ok(path) = std::env::var("SCORING_API_TOKEN_PATH") {
            if !path.trim().is_empty() {
                self.api_token_path = Some(PathBuf::from(path));
            }
        }
        if let Ok(dir) = std::env::var("SCORING_GROUNDTRUTH_DIR") {
            if !dir.trim().is_empty() {
                self.groundtruth_dir = PathBuf::from(dir);
            }
        }
        if let Ok(tolerance) = std::env::var("SCORING_TOLERANCE_SECS") {
            let seconds: f64 = tolerance
                .parse()
                .map_err(|_| anyhow!("SCORING_TOLERANCE_SECS must be a number of seconds"))?;
            self.matching.tolerance_seconds = seconds;
        }
        if let Ok(labels) = std::env::var("SCORING_CLASS_LABELS") {
            let parsed = split_csv(&labels);
            if !parsed.is_empty() {
                self.matching.class_labels = Some(parsed);
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.db_path.trim().is_empty() {
            return Err(anyhow!("db_path must not be empty"));
        }
        if self.groundtruth_dir.as_os_str().is_empty() {
            return Err(anyhow!("groundtruth dir must not be empty"));
        }
        if !self.matching.tolerance_seconds.is_finite() || self.matching.tolerance_seconds < 0.0 {
            return Err(anyhow!(
                "tolerance_seconds must be finite and >= 0, got {}",
                self.matching.tolerance_seconds
            ));
        }
        if let Some(labels) = &self.matching.class_labels {
            for label in labels {
                validate_class_label(label)?;
            }
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<ScoringdConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

pub(crate) fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
