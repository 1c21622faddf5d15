//! Storage collaborator
//!
//! A run records into one collection directory:
//!
//! ```text
//! <export_dir>/<name>_<timestamp>/
//!   manifest.json
//!   <module>/<purpose>/...
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use contracts::{CollectionManifest, ContractError, DatasetRecord};
use parking_lot::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

/// File name of the collection manifest
pub const MANIFEST_FILE: &str = "manifest.json";

/// Collection created for one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collection {
    pub id: Uuid,
    pub name: String,
    pub root: PathBuf,
}

/// Where runs store their data
pub trait StorageBackend: Send + Sync {
    /// Create the collection of a new run
    fn create_collection(&self, name: &str) -> Result<Collection, ContractError>;

    /// Directory for the dataset `(module, purpose)`, created on demand
    fn dataset_dir(
        &self,
        collection: &Collection,
        module: &str,
        purpose: &str,
    ) -> Result<PathBuf, ContractError>;

    /// Persist run metadata; may be called several times per run
    fn save_manifest(
        &self,
        collection: &Collection,
        manifest: &CollectionManifest,
    ) -> Result<(), ContractError>;
}

/// Plain directory tree below an export directory
#[derive(Debug, Clone)]
pub struct DirectoryStorage {
    base: PathBuf,
}

impl DirectoryStorage {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Read back the manifest of a collection directory
    pub fn load_manifest(root: &Path) -> Result<CollectionManifest, ContractError> {
        let raw = fs::read(root.join(MANIFEST_FILE))?;
        serde_json::from_slice(&raw)
            .map_err(|e| ContractError::storage(format!("corrupt manifest: {e}")))
    }
}

impl StorageBackend for DirectoryStorage {
    fn create_collection(&self, name: &str) -> Result<Collection, ContractError> {
        let invalid = |e: std::io::Error| {
            ContractError::invalid_export_dir(self.base.display().to_string(), e.to_string())
        };
        fs::create_dir_all(&self.base).map_err(invalid)?;

        let stem = format!(
            "{}_{}",
            sanitize(name),
            Utc::now().format("%Y-%m-%d_%H-%M-%S")
        );
        let mut root = self.base.join(&stem);
        let mut suffix = 1;
        while root.exists() {
            suffix += 1;
            root = self.base.join(format!("{stem}_{suffix}"));
        }
        fs::create_dir(&root).map_err(invalid)?;

        let collection = Collection {
            id: Uuid::new_v4(),
            name: name.to_string(),
            root,
        };
        info!(id = %collection.id, root = %collection.root.display(), "collection created");
        Ok(collection)
    }

    fn dataset_dir(
        &self,
        collection: &Collection,
        module: &str,
        purpose: &str,
    ) -> Result<PathBuf, ContractError> {
        let dir = collection
            .root
            .join(sanitize(module))
            .join(sanitize(purpose));
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    fn save_manifest(
        &self,
        collection: &Collection,
        manifest: &CollectionManifest,
    ) -> Result<(), ContractError> {
        let json = serde_json::to_vec_pretty(manifest)
            .map_err(|e| ContractError::storage(format!("manifest encoding failed: {e}")))?;
        let target = collection.root.join(MANIFEST_FILE);
        let tmp = collection.root.join(format!("{MANIFEST_FILE}.tmp"));
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &target)?;
        debug!(path = %target.display(), success = manifest.success, "manifest saved");
        Ok(())
    }
}

/// Storage binding of one run, shared by every module context
#[derive(Clone)]
pub struct StorageGroup {
    backend: Arc<dyn StorageBackend>,
    collection: Collection,
    datasets: Arc<Mutex<Vec<DatasetRecord>>>,
}

impl StorageGroup {
    pub(crate) fn new(backend: Arc<dyn StorageBackend>, collection: Collection) -> Self {
        Self {
            backend,
            collection,
            datasets: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn collection(&self) -> &Collection {
        &self.collection
    }

    /// Dataset directory for `(module, purpose)`, recorded in the manifest
    pub fn dataset_dir(&self, module: &str, purpose: &str) -> Result<PathBuf, ContractError> {
        let dir = self
            .backend
            .dataset_dir(&self.collection, module, purpose)?;
        let relative = dir
            .strip_prefix(&self.collection.root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| dir.clone());

        let mut datasets = self.datasets.lock();
        if !datasets
            .iter()
            .any(|d| d.module == module && d.purpose == purpose)
        {
            datasets.push(DatasetRecord {
                module: module.to_string(),
                purpose: purpose.to_string(),
                path: relative,
            });
        }
        Ok(dir)
    }

    pub fn datasets(&self) -> Vec<DatasetRecord> {
        self.datasets.lock().clone()
    }

    pub(crate) fn save_manifest(&self, manifest: &CollectionManifest) -> Result<(), ContractError> {
        self.backend.save_manifest(&self.collection, manifest)
    }
}

impl std::fmt::Debug for StorageGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageGroup")
            .field("collection", &self.collection)
            .finish_non_exhaustive()
    }
}

/// Keep path components to a portable character set
fn sanitize(component: &str) -> String {
    let cleaned: String = component
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    match cleaned.trim_matches('.') {
        "" => "_".to_string(),
        trimmed => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::TestSubject;

    #[test]
    fn test_collection_directories_are_unique() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = DirectoryStorage::new(tmp.path());

        let first = storage.create_collection("session").unwrap();
        let second = storage.create_collection("session").unwrap();
        assert_ne!(first.root, second.root);
        assert_ne!(first.id, second.id);
        assert!(first.root.is_dir() && second.root.is_dir());
    }

    #[test]
    fn test_dataset_dirs_are_recorded_once() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = Arc::new(DirectoryStorage::new(tmp.path()));
        let collection = backend.create_collection("run").unwrap();
        let group = StorageGroup::new(backend, collection.clone());

        let dir = group.dataset_dir("amp/1", "samples").unwrap();
        assert!(dir.is_dir());
        assert_eq!(dir, collection.root.join("amp_1").join("samples"));
        group.dataset_dir("amp/1", "samples").unwrap();

        let datasets = group.datasets();
        assert_eq!(datasets.len(), 1);
        assert_eq!(datasets[0].path, PathBuf::from("amp_1").join("samples"));
    }

    #[test]
    fn test_manifest_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = DirectoryStorage::new(tmp.path());
        let collection = storage.create_collection("run").unwrap();

        let mut manifest = CollectionManifest::new("run", TestSubject::default());
        manifest.collection_id = collection.id;
        manifest.finish(true, None, 1.5);
        storage.save_manifest(&collection, &manifest).unwrap();

        let loaded = DirectoryStorage::load_manifest(&collection.root).unwrap();
        assert_eq!(loaded, manifest);
        assert!(!collection.root.join("manifest.json.tmp").exists());
    }

    #[test]
    fn test_unusable_export_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("occupied");
        fs::write(&file, b"x").unwrap();

        let err = DirectoryStorage::new(&file)
            .create_collection("run")
            .unwrap_err();
        assert!(err.is_configuration_error());
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("cam 1/left"), "cam_1_left");
        assert_eq!(sanitize(".."), "_");
        assert_eq!(sanitize("eeg-amp_2"), "eeg-amp_2");
    }
}
