use anyhow::{Context, Result};
use attend_core::types::{DEFAULT_EUCLIDEAN_TOLERANCE, DEFAULT_SIMILARITY_THRESHOLD};
use attend_core::{CosineMatcher, EuclideanMatcher, Matcher};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "attend.toml";

/// Embedding distance used to decide a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    #[default]
    Cosine,
    Euclidean,
}

impl std::str::FromStr for Metric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cosine" => Ok(Metric::Cosine),
            "euclidean" | "l2" => Ok(Metric::Euclidean),
            other => Err(format!("unknown metric {other:?}")),
        }
    }
}

/// Resolved configuration: defaults, then `attend.toml`, then `ATTEND_*`
/// environment variables. CLI flags are applied by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Root for photos, ledger and the config file.
    pub data_dir: PathBuf,
    /// Reference photo directory (default: `<data_dir>/photos`).
    pub photo_dir: Option<PathBuf>,
    /// Attendance CSV (default: `<data_dir>/attendance.csv`).
    pub ledger_path: Option<PathBuf>,
    /// ONNX models (default: `<data_dir>/models`).
    pub model_dir: Option<PathBuf>,
    /// Check model files against their pinned SHA-256 before loading.
    pub verify_models: bool,
    /// V4L2 device path.
    pub camera_device: String,
    pub metric: Metric,
    /// Minimum cosine similarity for a positive match.
    pub similarity_threshold: f32,
    /// Maximum L2 distance for a positive match.
    pub euclidean_tolerance: f32,
    /// Frames to try before giving up on a dark camera.
    pub capture_attempts: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            photo_dir: None,
            ledger_path: None,
            model_dir: None,
            verify_models: true,
            camera_device: "/dev/video0".to_string(),
            metric: Metric::Cosine,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            euclidean_tolerance: DEFAULT_EUCLIDEAN_TOLERANCE,
            capture_attempts: 5,
        }
    }
}

impl Config {
    /// Load from the config file (if any) and the process environment.
    pub fn load() -> Result<Self> {
        Self::load_with(|key| std::env::var(key).ok())
    }

    fn load_with(env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let explicit = env("ATTEND_CONFIG").map(PathBuf::from);
        let path = explicit.clone().unwrap_or_else(|| {
            env("ATTEND_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(default_data_dir)
                .join(CONFIG_FILE)
        });

        let mut config = if explicit.is_some() || path.exists() {
            Self::from_file(&path)?
        } else {
            Self::default()
        };
        config.apply_env(env);
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config = toml::from_str(&text)
            .with_context(|| format!("invalid config {}", path.display()))?;
        tracing::debug!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("ATTEND_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = env("ATTEND_PHOTO_DIR") {
            self.photo_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = env("ATTEND_LEDGER_PATH") {
            self.ledger_path = Some(PathBuf::from(v));
        }
        if let Some(v) = env("ATTEND_MODEL_DIR") {
            self.model_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = env("ATTEND_VERIFY_MODELS") {
            self.verify_models = v != "0";
        }
        if let Some(v) = env("ATTEND_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        env_parse(&env, "ATTEND_METRIC", &mut self.metric);
        env_parse(&env, "ATTEND_SIMILARITY_THRESHOLD", &mut self.similarity_threshold);
        env_parse(&env, "ATTEND_EUCLIDEAN_TOLERANCE", &mut self.euclidean_tolerance);
        env_parse(&env, "ATTEND_CAPTURE_ATTEMPTS", &mut self.capture_attempts);
    }

    pub fn photo_dir(&self) -> PathBuf {
        self.photo_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("photos"))
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.ledger_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("attendance.csv"))
    }

    pub fn model_dir(&self) -> PathBuf {
        self.model_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("models"))
    }

    /// The matcher selected by `metric`, with its configured threshold.
    pub fn matcher(&self) -> Box<dyn Matcher> {
        match self.metric {
            Metric::Cosine => Box::new(CosineMatcher {
                threshold: self.similarity_threshold,
            }),
            Metric::Euclidean => Box::new(EuclideanMatcher {
                tolerance: self.euclidean_tolerance,
            }),
        }
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("attend")
}

/// Overwrite `slot` when `key` is set and parses; a bad value keeps the
/// current setting.
fn env_parse<T: std::str::FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(raw) = env(key) else { return };
    match raw.parse() {
        Ok(value) => *slot = value,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparsable environment value"),
    }
}
