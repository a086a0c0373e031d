use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Location of one stored video blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MediaRef(pub PathBuf);

impl MediaRef {
    pub fn path(&self) -> &Path {
        &self.0
    }

    pub fn id(&self) -> String {
        self.0
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.0.display().to_string())
    }
}

/// One uploaded video of an individual. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoSegment {
    pub individual_id: String,
    pub sequence_index: u32,
    pub media: MediaRef,
}

pub trait MediaStore: Send + Sync {
    /// Videos of `individual_id` in sequence order.
    fn list(&self, individual_id: &str) -> Result<Vec<VideoSegment>>;
    fn store(&self, individual_id: &str, blob: &[u8]) -> Result<VideoSegment>;
}

/// `<root>/<individual>/video_<n>.<ext>`, numbered from 1.
pub struct FsMediaStore {
    root: PathBuf,
    extension: String,
    lock: Mutex<()>,
}

impl FsMediaStore {
    pub fn new(root: impl Into<PathBuf>, extension: &str) -> Self {
        Self {
            root: root.into(),
            extension: extension.trim_start_matches('.').to_string(),
            lock: Mutex::new(()),
        }
    }

    fn folder(&self, individual_id: &str) -> Result<PathBuf> {
        let valid = !individual_id.is_empty()
            && individual_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'))
            && individual_id != "."
            && individual_id != "..";
        if !valid {
            anyhow::bail!("invalid individual id {:?}", individual_id);
        }
        Ok(self.root.join(individual_id))
    }

    fn scan(&self, individual_id: &str) -> Result<Vec<VideoSegment>> {
        let folder = self.folder(individual_id)?;
        if !folder.exists() {
            return Ok(vec![]);
        }

        let mut segments = Vec::new();
        for entry in std::fs::read_dir(&folder)
            .with_context(|| format!("listing {}", folder.display()))?
        {
            let path = entry?.path();
            let Some(index) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(sequence_index)
            else {
                log::debug!("ignoring {} in media store", path.display());
                continue;
            };
            segments.push(VideoSegment {
                individual_id: individual_id.to_string(),
                sequence_index: index,
                media: MediaRef(path),
            });
        }
        segments.sort_by_key(|s| s.sequence_index);
        Ok(segments)
    }
}

impl MediaStore for FsMediaStore {
    fn list(&self, individual_id: &str) -> Result<Vec<VideoSegment>> {
        self.scan(individual_id)
    }

    fn store(&self, individual_id: &str, blob: &[u8]) -> Result<VideoSegment> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("media store lock poisoned"))?;
        let folder = self.folder(individual_id)?;
        std::fs::create_dir_all(&folder)
            .with_context(|| format!("creating {}", folder.display()))?;

        let next = self
            .scan(individual_id)?
            .last()
            .map_or(1, |s| s.sequence_index + 1);
        let path = folder.join(format!("video_{}.{}", next, self.extension));
        std::fs::write(&path, blob).with_context(|| format!("writing {}", path.display()))?;
        log::info!("stored {} ({} bytes)", path.display(), blob.len());

        Ok(VideoSegment {
            individual_id: individual_id.to_string(),
            sequence_index: next,
            media: MediaRef(path),
        })
    }
}

/// `video_12.webm` -> 12
fn sequence_index(file_name: &str) -> Option<u32> {
    let stem = file_name.strip_prefix("video_")?;
    let digits = stem.split('.').next()?;
    digits.parse().ok()
}
