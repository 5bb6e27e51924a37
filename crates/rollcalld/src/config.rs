use rollcall_core::quality::{
    DEFAULT_MAX_BRIGHTNESS, DEFAULT_MIN_BRIGHTNESS, DEFAULT_MIN_HEIGHT, DEFAULT_MIN_WIDTH,
};
use rollcall_core::{QualityGate, ServiceConfig, DEFAULT_MATCH_THRESHOLD};
use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Which D-Bus bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bus {
    Session,
    System,
}

impl std::str::FromStr for Bus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "session" => Ok(Bus::Session),
            "system" => Ok(Bus::System),
            other => Err(format!("unknown bus '{other}' (expected session or system)")),
        }
    }
}

/// Daemon configuration: optional TOML file, then `ROLLCALL_*` environment overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Embedding model file name inside `model_dir`.
    pub embedding_model: String,
    /// Face detector model file name inside `model_dir`.
    pub detector_model: String,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Cosine similarity threshold for a positive match.
    pub similarity_threshold: f32,
    /// Augmented variants averaged per recognition embedding.
    pub stabilize_samples: usize,
    /// Fixed augmentation seed (reproducible runs); random when unset.
    pub augment_seed: Option<u64>,
    /// Minimum capture width and height in pixels.
    pub min_resolution: u32,
    pub min_brightness: f32,
    pub max_brightness: f32,
    /// Detector score above which a face counts as present.
    pub detection_confidence: f32,
    pub bus: Bus,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        Self {
            model_dir: rollcall_core::default_model_dir(),
            embedding_model: "mobilefacenet.onnx".to_string(),
            detector_model: "det_500m.onnx".to_string(),
            db_path: data_dir.join("identities.db"),
            similarity_threshold: DEFAULT_MATCH_THRESHOLD,
            stabilize_samples: rollcall_core::extractor::DEFAULT_STABILIZE_SAMPLES,
            augment_seed: None,
            min_resolution: DEFAULT_MIN_WIDTH.max(DEFAULT_MIN_HEIGHT),
            min_brightness: DEFAULT_MIN_BRIGHTNESS,
            max_brightness: DEFAULT_MAX_BRIGHTNESS,
            detection_confidence: rollcall_core::onnx::DEFAULT_DETECTION_CONFIDENCE,
            bus: Bus::Session,
        }
    }
}

impl Config {
    /// Load `ROLLCALL_CONFIG` (if set) and apply environment overrides.
    pub fn load() -> anyhow::Result<Self> {
        let mut config = match std::env::var("ROLLCALL_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config = Self::from_toml(&contents)
            .with_context(|| format!("parsing config {}", path.display()))?;
        tracing::info!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("ROLLCALL_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("ROLLCALL_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        override_parsed("ROLLCALL_SIMILARITY_THRESHOLD", &mut self.similarity_threshold);
        override_parsed("ROLLCALL_STABILIZE_SAMPLES", &mut self.stabilize_samples);
        override_parsed("ROLLCALL_MIN_RESOLUTION", &mut self.min_resolution);
        override_parsed("ROLLCALL_MIN_BRIGHTNESS", &mut self.min_brightness);
        override_parsed("ROLLCALL_MAX_BRIGHTNESS", &mut self.max_brightness);
        override_parsed("ROLLCALL_DETECTION_CONFIDENCE", &mut self.detection_confidence);
        override_parsed("ROLLCALL_BUS", &mut self.bus);
        if let Some(seed) = env_parsed::<u64>("ROLLCALL_AUGMENT_SEED") {
            self.augment_seed = Some(seed);
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !(-1.0..=1.0).contains(&self.similarity_threshold) {
            anyhow::bail!(
                "similarity threshold must be within [-1, 1], got {}",
                self.similarity_threshold
            );
        }
        if self.stabilize_samples == 0 {
            anyhow::bail!("stabilize_samples must be at least 1");
        }
        if self.min_resolution == 0 {
            anyhow::bail!("min_resolution must be at least 1 pixel");
        }
        if !(0.0..=1.0).contains(&self.detection_confidence) {
            anyhow::bail!(
                "detection confidence must be within [0, 1], got {}",
                self.detection_confidence
            );
        }
        if !(0.0..=1.0).contains(&self.min_brightness)
            || !(0.0..=1.0).contains(&self.max_brightness)
            || self.min_brightness > self.max_brightness
        {
            anyhow::bail!(
                "brightness band must satisfy 0 <= min <= max <= 1, got [{}, {}]",
                self.min_brightness,
                self.max_brightness
            );
        }
        Ok(())
    }

    /// Pipeline settings handed to the face service.
    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            match_threshold: self.similarity_threshold,
            stabilize_samples: self.stabilize_samples,
            augment_seed: self.augment_seed,
            quality: QualityGate {
                min_width: self.min_resolution,
                min_height: self.min_resolution,
                min_brightness: self.min_brightness,
                max_brightness: self.max_brightness,
            },
        }
    }

    pub fn embedding_model_path(&self) -> String {
        self.model_dir
            .join(&self.embedding_model)
            .to_string_lossy()
            .into_owned()
    }

    pub fn detector_model_path(&self) -> String {
        self.model_dir
            .join(&self.detector_model)
            .to_string_lossy()
            .into_owned()
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn override_parsed<T: std::str::FromStr>(key: &str, slot: &mut T) {
    if let Ok(raw) = std::env::var(key) {
        match raw.parse() {
            Ok(v) => *slot = v,
            Err(_) => tracing::warn!(key, value = %raw, "ignoring unparsable environment override"),
        }
    }
}
