//! File-based storage driver
//!
//! Layout: `<base>/<namespace>/<name>/v<version>.release`, each file holding
//! one compressed JSON revision. Useful for development and for running the
//! engine without a cluster-side store.
//!
//! Records are written to a temporary file in the same directory and then
//! moved into place, so a failed write never leaves a partial record.
//! Conditional updates are serialized within one process only.

use async_trait::async_trait;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tempfile::NamedTempFile;

use super::{
    StorageConfig, StorageDriver, decode_release, encode_release, ensure_status, sort_history,
};
use crate::config::EngineConfig;
use crate::error::{KubeError, Result};
use crate::release::{ReleaseStatus, StoredRelease};

const EXTENSION: &str = "release";

/// File-based storage driver
#[derive(Debug, Clone)]
pub struct FileDriver {
    base_dir: PathBuf,
    config: StorageConfig,
    write_lock: Arc<Mutex<()>>,
}

impl FileDriver {
    /// Create a new file driver, creating `base_dir` if needed
    pub fn new(base_dir: impl Into<PathBuf>, config: StorageConfig) -> Result<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self {
            base_dir,
            config,
            write_lock: Arc::default(),
        })
    }

    /// Create a driver using the storage settings of an engine config
    pub fn from_config(base_dir: impl Into<PathBuf>, config: &EngineConfig) -> Result<Self> {
        Self::new(base_dir, config.storage.clone())
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn release_dir(&self, namespace: &str, name: &str) -> PathBuf {
        self.base_dir.join(namespace).join(name)
    }

    fn release_path(&self, namespace: &str, name: &str, version: u32) -> PathBuf {
        self.release_dir(namespace, name)
            .join(format!("v{}.{}", version, EXTENSION))
    }

    fn read_release(&self, path: &Path) -> Result<StoredRelease> {
        let data = std::fs::read(path)?;
        decode_release(&data, self.config.compression)
    }

    fn read_revision(&self, namespace: &str, name: &str, version: u32) -> Result<StoredRelease> {
        match self.read_release(&self.release_path(namespace, name, version)) {
            Err(KubeError::Io(e)) if e.kind() == ErrorKind::NotFound => {
                Err(KubeError::RevisionNotFound {
                    name: name.to_string(),
                    version,
                })
            }
            other => other,
        }
    }

    /// Encode a revision into a synced temporary file next to its final path
    ///
    /// The file is removed when the handle is dropped without being persisted.
    fn write_temp(&self, release: &StoredRelease) -> Result<NamedTempFile> {
        let dir = self.release_dir(&release.namespace, &release.name);
        std::fs::create_dir_all(&dir)?;

        let data = encode_release(release, self.config.compression)?;
        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(&data)?;
        tmp.as_file().sync_all()?;
        Ok(tmp)
    }

    /// Atomically replace the record of an existing revision
    fn replace(&self, release: &StoredRelease) -> Result<()> {
        let path = self.release_path(&release.namespace, &release.name, release.version);
        self.write_temp(release)?
            .persist(&path)
            .map_err(|e| KubeError::Io(e.error))?;
        Ok(())
    }

    /// Read every revision file in a release directory
    fn read_dir_releases(&self, dir: &Path) -> Result<Vec<StoredRelease>> {
        let mut releases = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == EXTENSION) {
                releases.push(self.read_release(&path)?);
            }
        }
        sort_history(&mut releases);
        Ok(releases)
    }

    fn subdirs(dir: &Path) -> Result<Vec<PathBuf>> {
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut dirs: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        dirs.sort();
        Ok(dirs)
    }

    /// Remove a directory if it became empty
    fn prune_empty_dir(dir: &Path) {
        if std::fs::read_dir(dir).is_ok_and(|mut d| d.next().is_none()) {
            let _ = std::fs::remove_dir(dir);
        }
    }
}

fn release_not_found(namespace: &str, name: &str) -> KubeError {
    KubeError::ReleaseNotFound {
        name: name.to_string(),
        namespace: namespace.to_string(),
    }
}

#[async_trait]
impl StorageDriver for FileDriver {
    async fn get(&self, namespace: &str, name: &str, version: u32) -> Result<StoredRelease> {
        self.read_revision(namespace, name, version)
    }

    async fn history(&self, namespace: &str, name: &str) -> Result<Vec<StoredRelease>> {
        let dir = self.release_dir(namespace, name);
        if !dir.is_dir() {
            return Err(release_not_found(namespace, name));
        }

        let releases = self.read_dir_releases(&dir)?;
        if releases.is_empty() {
            return Err(release_not_found(namespace, name));
        }
        Ok(releases)
    }

    async fn list(
        &self,
        namespace: Option<&str>,
        name: Option<&str>,
    ) -> Result<Vec<StoredRelease>> {
        let namespaces = match namespace {
            Some(ns) => vec![self.base_dir.join(ns)],
            None => Self::subdirs(&self.base_dir)?,
        };

        let mut releases = Vec::new();
        for ns_dir in namespaces {
            let names = match name {
                Some(n) => vec![ns_dir.join(n)],
                None => Self::subdirs(&ns_dir)?,
            };
            for name_dir in names.iter().filter(|d| d.is_dir()) {
                releases.extend(self.read_dir_releases(name_dir)?);
            }
        }
        Ok(releases)
    }

    async fn create(&self, release: &StoredRelease) -> Result<()> {
        let path = self.release_path(&release.namespace, &release.name, release.version);
        let tmp = self.write_temp(release)?;

        // persist_noclobber fails atomically if another writer got there first
        match tmp.persist_noclobber(&path) {
            Ok(_) => Ok(()),
            Err(e) if e.error.kind() == ErrorKind::AlreadyExists => Err(KubeError::RevisionExists {
                name: release.name.clone(),
                version: release.version,
            }),
            Err(e) => Err(e.error.into()),
        }
    }

    async fn update(&self, release: &StoredRelease) -> Result<()> {
        let _guard = self.lock();
        let path = self.release_path(&release.namespace, &release.name, release.version);
        if !path.is_file() {
            return Err(KubeError::RevisionNotFound {
                name: release.name.clone(),
                version: release.version,
            });
        }
        self.replace(release)
    }

    async fn update_if(&self, release: &StoredRelease, expected: ReleaseStatus) -> Result<()> {
        let _guard = self.lock();
        let stored = self.read_revision(&release.namespace, &release.name, release.version)?;
        ensure_status(&stored, expected)?;
        self.replace(release)
    }

    async fn delete(&self, namespace: &str, name: &str, version: u32) -> Result<StoredRelease> {
        let release = self.get(namespace, name, version).await?;
        std::fs::remove_file(self.release_path(namespace, name, version))?;

        Self::prune_empty_dir(&self.release_dir(namespace, name));
        Self::prune_empty_dir(&self.base_dir.join(namespace));
        Ok(release)
    }

    async fn delete_all(&self, namespace: &str, name: &str) -> Result<Vec<StoredRelease>> {
        let releases = self.history(namespace, name).await?;
        std::fs::remove_dir_all(self.release_dir(namespace, name))?;

        Self::prune_empty_dir(&self.base_dir.join(namespace));
        Ok(releases)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::release::tests::test_release;
    use crate::storage::CompressionMethod;
    use tempfile::TempDir;

    fn driver(tmp: &TempDir) -> FileDriver {
        FileDriver::new(tmp.path(), StorageConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let tmp = TempDir::new().unwrap();
        let driver = driver(&tmp);

        let release = test_release("myapp", 1);
        driver.create(&release).await.unwrap();

        assert_eq!(driver.get("default", "myapp", 1).await.unwrap(), release);
        assert!(tmp.path().join("default/myapp/v1.release").is_file());
    }

    #[tokio::test]
    async fn test_create_existing_version_fails() {
        let tmp = TempDir::new().unwrap();
        let driver = driver(&tmp);

        driver.create(&test_release("myapp", 1)).await.unwrap();
        let mut other = test_release("myapp", 1);
        other.manifest = "kind: Secret".to_string();

        let err = driver.create(&other).await.unwrap_err();
        assert!(matches!(err, KubeError::RevisionExists { version: 1, .. }));

        // Original record untouched
        let stored = driver.get("default", "myapp", 1).await.unwrap();
        assert_ne!(stored.manifest, "kind: Secret");
    }

    #[tokio::test]
    async fn test_update_requires_existing_record() {
        let tmp = TempDir::new().unwrap();
        let driver = driver(&tmp);

        let mut release = test_release("myapp", 1);
        assert!(driver.update(&release).await.unwrap_err().is_not_found());

        driver.create(&release).await.unwrap();
        release.status = ReleaseStatus::Superseded;
        driver.update(&release).await.unwrap();

        let stored = driver.get("default", "myapp", 1).await.unwrap();
        assert_eq!(stored.status, ReleaseStatus::Superseded);
    }

    #[tokio::test]
    async fn test_update_if_checks_stored_status() {
        let tmp = TempDir::new().unwrap();
        let driver = driver(&tmp);

        let mut release = test_release("myapp", 1);
        driver.create(&release).await.unwrap();

        release.mark_superseded();
        let err = driver
            .update_if(&release, ReleaseStatus::Failed)
            .await
            .unwrap_err();
        assert!(matches!(err, KubeError::StatusConflict { .. }));
        assert_eq!(
            driver.get("default", "myapp", 1).await.unwrap().status,
            ReleaseStatus::Deployed
        );

        driver
            .update_if(&release, ReleaseStatus::Deployed)
            .await
            .unwrap();
        assert_eq!(
            driver.get("default", "myapp", 1).await.unwrap().status,
            ReleaseStatus::Superseded
        );
    }

    #[tokio::test]
    async fn test_failed_create_removes_temporary_file() {
        let tmp = TempDir::new().unwrap();
        let driver = driver(&tmp);

        // A directory squatting on the record path makes the final move fail
        std::fs::create_dir_all(tmp.path().join("default/myapp/v1.release")).unwrap();
        assert!(driver.create(&test_release("myapp", 1)).await.is_err());

        let leftovers: Vec<_> = std::fs::read_dir(tmp.path().join("default/myapp"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers, vec![std::ffi::OsString::from("v1.release")]);
        assert!(tmp.path().join("default/myapp/v1.release").is_dir());
    }

    #[tokio::test]
    async fn test_writes_leave_no_temporary_files() {
        let tmp = TempDir::new().unwrap();
        let driver = driver(&tmp);

        let mut release = test_release("myapp", 1);
        driver.create(&release).await.unwrap();
        release.mark_superseded();
        driver.update(&release).await.unwrap();

        let files: Vec<_> = std::fs::read_dir(tmp.path().join("default/myapp"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(files, vec![std::ffi::OsString::from("v1.release")]);
    }

    #[tokio::test]
    async fn test_from_engine_config() {
        let tmp = TempDir::new().unwrap();
        let config = EngineConfig::from_yaml("storage:\n  compression:\n    method: none\n").unwrap();
        let driver = FileDriver::from_config(tmp.path(), &config).unwrap();

        driver.create(&test_release("plain", 1)).await.unwrap();
        let raw = std::fs::read_to_string(tmp.path().join("default/plain/v1.release")).unwrap();
        assert!(raw.contains("\"name\":\"plain\""));
    }

    #[tokio::test]
    async fn test_history_ascending() {
        let tmp = TempDir::new().unwrap();
        let driver = driver(&tmp);

        for v in [2, 10, 1] {
            driver.create(&test_release("myapp", v)).await.unwrap();
        }

        let versions: Vec<u32> = driver
            .history("default", "myapp")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.version)
            .collect();
        assert_eq!(versions, vec![1, 2, 10]);
    }

    #[tokio::test]
    async fn test_list_and_missing_namespace() {
        let tmp = TempDir::new().unwrap();
        let driver = driver(&tmp);

        driver.create(&test_release("app1", 1)).await.unwrap();
        driver.create(&test_release("app1", 2)).await.unwrap();
        driver.create(&test_release("app2", 1)).await.unwrap();

        assert_eq!(driver.list(Some("default"), None).await.unwrap().len(), 3);
        assert_eq!(driver.list(None, Some("app2")).await.unwrap().len(), 1);
        assert!(driver.list(Some("nowhere"), None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_prunes_directories() {
        let tmp = TempDir::new().unwrap();
        let driver = driver(&tmp);

        driver.create(&test_release("myapp", 1)).await.unwrap();
        driver.delete("default", "myapp", 1).await.unwrap();

        assert!(driver.get("default", "myapp", 1).await.unwrap_err().is_not_found());
        assert!(!tmp.path().join("default").exists());
    }

    #[tokio::test]
    async fn test_uncompressed_records() {
        let tmp = TempDir::new().unwrap();
        let config = StorageConfig {
            compression: CompressionMethod::None,
        };
        let driver = FileDriver::new(tmp.path(), config).unwrap();

        driver.create(&test_release("plain", 1)).await.unwrap();
        let raw = std::fs::read_to_string(tmp.path().join("default/plain/v1.release")).unwrap();
        assert!(raw.contains("\"name\":\"plain\""));

        let purged = driver.delete_all("default", "plain").await.unwrap();
        assert_eq!(purged.len(), 1);
    }
}
