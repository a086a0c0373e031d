use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use stressrs_vision::{DetectorConfig, NormalizerConfig};

pub static CONFIG_PATH: Lazy<&'static Path> = Lazy::new(|| {
    Path::new(option_env!("STRESSRS_CONFIG_PATH").unwrap_or("/usr/local/etc/stressrs/config.toml"))
});

pub static DATA_PREFIX: Lazy<&'static Path> = Lazy::new(|| {
    Path::new(option_env!("STRESSRS_DATA_PREFIX").unwrap_or("/usr/local/var/stressrs"))
});

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub media: MediaConfig,
    pub models: ModelsConfig,
    pub detector: DetectorConfig,
    pub normalizer: NormalizerConfig,
    pub labels: LabelsConfig,
    pub decision: DecisionConfig,
    pub runtime: RuntimeConfig,
    pub access: AccessConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root of the per-individual video folders.
    pub videos: PathBuf,
    /// Employee directory file.
    pub directory: PathBuf,
    pub extension: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            videos: DATA_PREFIX.join("videos"),
            directory: DATA_PREFIX.join("employees.bin"),
            extension: "webm".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub ffmpeg: String,
    pub ffprobe: String,
    pub frame_step: usize,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            ffmpeg: "ffmpeg".to_string(),
            ffprobe: "ffprobe".to_string(),
            frame_step: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    pub root: PathBuf,
    /// Classifier artifact name, resolved to `<root>/<version>.onnx`.
    pub version: String,
    pub detector: String,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            root: DATA_PREFIX.join("models"),
            version: "stressmodel".to_string(),
            detector: "face_detection_yunet_2023mar".to_string(),
        }
    }
}

impl ModelsConfig {
    pub fn artifact(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}.onnx", name))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LabelsConfig {
    /// The classifier's output labels, in output order.
    pub names: Vec<String>,
    /// Label indices that do not count as a stress signal.
    pub non_stress: Vec<usize>,
}

impl Default for LabelsConfig {
    fn default() -> Self {
        Self {
            names: ["angry", "disgust", "fear", "happy", "sad", "surprise", "neutral"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            non_stress: vec![0, 1, 2, 4],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionConfig {
    /// Composite scores strictly above this are `Stressed`.
    pub threshold: f64,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self { threshold: 10.0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Worker threads; 0 uses the available parallelism.
    pub workers: usize,
    /// Decoded frames allowed to wait for classification per video.
    pub max_pending_frames: usize,
    /// Per-run deadline in seconds; 0 disables it.
    pub timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            max_pending_frames: 16,
            timeout_secs: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessConfig {
    pub admins: Vec<String>,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            admins: vec!["root".to_string()],
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.labels.names.is_empty() {
            anyhow::bail!("labels.names must not be empty");
        }
        if let Some(bad) = self
            .labels
            .non_stress
            .iter()
            .find(|&&i| i >= self.labels.names.len())
        {
            anyhow::bail!(
                "labels.non_stress index {} outside the {} configured labels",
                bad,
                self.labels.names.len()
            );
        }
        if !(0.0..=100.0).contains(&self.decision.threshold) {
            anyhow::bail!(
                "decision.threshold {} must lie in [0, 100]",
                self.decision.threshold
            );
        }
        if self.runtime.max_pending_frames == 0 {
            anyhow::bail!("runtime.max_pending_frames must be at least 1");
        }
        if self.detector.scale_factor < 1.0 {
            anyhow::bail!("detector.scale_factor must be >= 1.0");
        }
        Ok(())
    }
}

pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = path.unwrap_or(&CONFIG_PATH);
    if !path.exists() {
        return Ok(Config::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config at {}", path.display()))?;
    let cfg: Config =
        toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

pub fn save_config(cfg: &Config, path: Option<&Path>) -> Result<()> {
    let path = path.unwrap_or(&CONFIG_PATH);
    let data = toml::to_string_pretty(cfg)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, data)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let cfg = load_config(Some(Path::new("/nonexistent/stressrs.toml"))).unwrap();
        assert_eq!(cfg.decision.threshold, 10.0);
        assert_eq!(cfg.labels.non_stress, vec![0, 1, 2, 4]);
        assert_eq!(cfg.normalizer.size, 48);
    }

    #[test]
    fn test_partial_file_overrides_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[decision]\nthreshold = 50.0\n\n[labels]\nnon_stress = [3, 6]\n\n[detector]\nmin_neighbors = 5\n",
        )
        .unwrap();

        let cfg = load_config(Some(path.as_path())).unwrap();
        assert_eq!(cfg.decision.threshold, 50.0);
        assert_eq!(cfg.labels.non_stress, vec![3, 6]);
        assert_eq!(cfg.labels.names.len(), 7);
        assert_eq!(cfg.detector.min_neighbors, 5);
        assert_eq!(cfg.detector.min_size, 30);
    }

    #[test]
    fn test_rejects_out_of_range_partition() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[labels]\nnon_stress = [9]\n").unwrap();
        assert!(load_config(Some(path.as_path())).is_err());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.toml");
        let mut cfg = Config::default();
        cfg.runtime.workers = 3;
        save_config(&cfg, Some(path.as_path())).unwrap();
        assert_eq!(load_config(Some(path.as_path())).unwrap().runtime.workers, 3);
    }

    #[test]
    fn test_artifact_path() {
        let models = ModelsConfig {
            root: PathBuf::from("/srv/models"),
            ..ModelsConfig::default()
        };
        assert_eq!(
            models.artifact("stressmodel"),
            PathBuf::from("/srv/models/stressmodel.onnx")
        );
    }
}
