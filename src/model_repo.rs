use anyhow::Result;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use stressrs_vision::{
    model::{load_session, SharedSession},
    DetectorConfig, FaceLocator, OnnxClassifier, StressClassifier, YuNetLocator,
};

use crate::config::ModelsConfig;

/// Source of loaded model handles.
///
/// Handles are loaded once and shared; callers never rebuild them per frame.
pub trait ModelRepository: Send + Sync {
    fn classifier(&self, version: &str) -> Result<Arc<dyn StressClassifier>>;
    fn face_locator(&self) -> Result<Arc<dyn FaceLocator>>;
}

// Only the ONNX sessions are process-wide. Handles wrap them with the
// calibration of the repository that asked, so two engines with different
// detector or label settings share weights but not settings.
static SESSIONS: Lazy<Mutex<HashMap<PathBuf, SharedSession>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Return the cached value for `path`, loading it on first use. Failed loads
/// are not cached.
fn shared<T>(
    cache: &Mutex<HashMap<PathBuf, Arc<T>>>,
    path: &Path,
    load: impl FnOnce(&Path) -> Result<T>,
) -> Result<Arc<T>> {
    let mut cache = cache
        .lock()
        .map_err(|_| anyhow::anyhow!("model cache lock poisoned"))?;
    if let Some(hit) = cache.get(path) {
        return Ok(hit.clone());
    }
    let value = Arc::new(load(path)?);
    cache.insert(path.to_path_buf(), value.clone());
    Ok(value)
}

/// Loads `.onnx` artifacts from the configured model directory.
pub struct OnnxRepository {
    models: ModelsConfig,
    detector: DetectorConfig,
    label_count: usize,
}

impl OnnxRepository {
    pub fn new(models: ModelsConfig, detector: DetectorConfig, label_count: usize) -> Self {
        Self {
            models,
            detector,
            label_count,
        }
    }

    fn session(&self, name: &str) -> Result<SharedSession> {
        shared(&SESSIONS, &self.models.artifact(name), |path| {
            log::info!("loading {} from {}", name, path.display());
            load_session(path).map(Mutex::new)
        })
    }

    fn onnx_classifier(&self, version: &str) -> Result<OnnxClassifier> {
        Ok(OnnxClassifier::with_session(
            self.session(version)?,
            self.label_count,
        ))
    }

    fn yunet(&self) -> Result<YuNetLocator> {
        Ok(YuNetLocator::with_session(
            self.session(&self.models.detector)?,
            self.detector.clone(),
        ))
    }
}

impl ModelRepository for OnnxRepository {
    fn classifier(&self, version: &str) -> Result<Arc<dyn StressClassifier>> {
        Ok(Arc::new(self.onnx_classifier(version)?))
    }

    fn face_locator(&self) -> Result<Arc<dyn FaceLocator>> {
        Ok(Arc::new(self.yunet()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_missing_artifacts_fail_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let repo = OnnxRepository::new(
            ModelsConfig {
                root: dir.path().to_path_buf(),
                ..ModelsConfig::default()
            },
            DetectorConfig::default(),
            7,
        );
        assert!(repo.classifier("stressmodel").is_err());
        assert!(repo.face_locator().is_err());
    }

    #[test]
    fn test_shared_loads_each_path_once() {
        let cache = Mutex::new(HashMap::new());
        let loads = AtomicUsize::new(0);
        let load = |p: &Path| -> Result<String> {
            loads.fetch_add(1, Ordering::SeqCst);
            if p.ends_with("broken.onnx") {
                anyhow::bail!("corrupt artifact");
            }
            Ok(p.display().to_string())
        };

        let a = shared(&cache, Path::new("m/a.onnx"), load).unwrap();
        let again = shared(&cache, Path::new("m/a.onnx"), load).unwrap();
        assert!(Arc::ptr_eq(&a, &again));
        assert_eq!(loads.load(Ordering::SeqCst), 1);

        shared(&cache, Path::new("m/b.onnx"), load).unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 2);

        assert!(shared(&cache, Path::new("m/broken.onnx"), load).is_err());
        assert!(shared(&cache, Path::new("m/broken.onnx"), load).is_err());
        assert_eq!(loads.load(Ordering::SeqCst), 4);
    }

    /// Two repositories over the same artifacts keep their own calibration.
    #[test]
    fn test_handles_follow_their_repository_config() {
        let models = ModelsConfig {
            root: PathBuf::from("models"),
            ..ModelsConfig::default()
        };
        if !models.artifact(&models.detector).exists() || !models.artifact(&models.version).exists()
        {
            eprintln!("Skipping: models not found under {}", models.root.display());
            return;
        }

        let strict = DetectorConfig {
            min_neighbors: 5,
            min_size: 60,
            ..DetectorConfig::default()
        };
        let a = OnnxRepository::new(models.clone(), DetectorConfig::default(), 7);
        let b = OnnxRepository::new(models.clone(), strict, 8);

        assert_eq!(a.yunet().unwrap().config().min_neighbors, 2);
        assert_eq!(b.yunet().unwrap().config().min_neighbors, 5);
        assert_eq!(b.yunet().unwrap().config().min_size, 60);
        assert_eq!(a.onnx_classifier(&models.version).unwrap().label_count(), 7);
        assert_eq!(b.onnx_classifier(&models.version).unwrap().label_count(), 8);
        assert!(Arc::ptr_eq(
            &a.session(&models.detector).unwrap(),
            &b.session(&models.detector).unwrap()
        ));
    }
}
