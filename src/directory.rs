use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::decision::StressLevel;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmployeeRecord {
    pub id: String,
    pub name: String,
    pub department: String,
    pub email: String,
    pub stress_level: Option<StressLevel>,
    pub assessed_at: Option<DateTime<Utc>>,
}

impl EmployeeRecord {
    pub fn new(id: &str, name: &str, department: &str, email: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            department: department.to_string(),
            email: email.to_string(),
            stress_level: None,
            assessed_at: None,
        }
    }
}

/// Keyed employee record store the verdict is written to.
pub trait EmployeeDirectory: Send + Sync {
    fn get(&self, id: &str) -> Result<Option<EmployeeRecord>>;
    fn update_stress_level(&self, id: &str, level: StressLevel, at: DateTime<Utc>) -> Result<()>;
}

/// All records in one postcard file.
pub struct FileDirectory {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileDirectory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn list(&self) -> Result<Vec<EmployeeRecord>> {
        let _guard = self.guard()?;
        self.load()
    }

    /// Insert or replace a record by id.
    pub fn put(&self, record: EmployeeRecord) -> Result<()> {
        let _guard = self.guard()?;
        let mut records = self.load()?;
        match records.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => *existing = record,
            None => records.push(record),
        }
        self.save(&records)
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.lock
            .lock()
            .map_err(|_| anyhow::anyhow!("directory lock poisoned"))
    }

    fn load(&self) -> Result<Vec<EmployeeRecord>> {
        if !self.path.exists() {
            return Ok(vec![]);
        }
        let data = std::fs::read(&self.path)
            .with_context(|| format!("reading {}", self.path.display()))?;
        postcard::from_bytes(&data).with_context(|| format!("decoding {}", self.path.display()))
    }

    fn save(&self, records: &[EmployeeRecord]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = postcard::to_allocvec(records)?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, data).with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("replacing {}", self.path.display()))?;
        Ok(())
    }
}

impl EmployeeDirectory for FileDirectory {
    fn get(&self, id: &str) -> Result<Option<EmployeeRecord>> {
        let _guard = self.guard()?;
        Ok(self.load()?.into_iter().find(|r| r.id == id))
    }

    fn update_stress_level(&self, id: &str, level: StressLevel, at: DateTime<Utc>) -> Result<()> {
        let _guard = self.guard()?;
        let mut records = self.load()?;
        let record = records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| anyhow::anyhow!("no employee with id {}", id))?;
        record.stress_level = Some(level);
        record.assessed_at = Some(at);
        self.save(&records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_update() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileDirectory::new(dir.path().join("employees.bin"));
        assert!(store.get("1").unwrap().is_none());

        store
            .put(EmployeeRecord::new("1", "Ada", "Research", "ada@example.com"))
            .unwrap();
        store
            .put(EmployeeRecord::new("2", "Lin", "Ops", "lin@example.com"))
            .unwrap();

        let now = Utc::now();
        store.update_stress_level("1", StressLevel::Stressed, now).unwrap();
        let ada = store.get("1").unwrap().unwrap();
        assert_eq!(ada.stress_level, Some(StressLevel::Stressed));
        assert_eq!(ada.assessed_at, Some(now));

        // overwritten on every run
        store.update_stress_level("1", StressLevel::Normal, now).unwrap();
        assert_eq!(
            store.get("1").unwrap().unwrap().stress_level,
            Some(StressLevel::Normal)
        );
        assert_eq!(store.get("2").unwrap().unwrap().stress_level, None);
        assert_eq!(store.list().unwrap().len(), 2);
    }

    #[test]
    fn test_update_unknown_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileDirectory::new(dir.path().join("employees.bin"));
        assert!(store
            .update_stress_level("ghost", StressLevel::Normal, Utc::now())
            .is_err());
    }
}
