//! Collection manifest
//!
//! Metadata written next to the recorded datasets of one run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use crate::{ModuleDriver, TestSubject};

/// Participating module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleRecord {
    pub name: String,
    pub id: String,
    pub driver: ModuleDriver,
}

/// One dataset handed out to a module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetRecord {
    /// Owning module
    pub module: String,
    /// Dataset purpose (e.g. "samples", "tsync")
    pub purpose: String,
    /// Directory relative to the collection root
    pub path: PathBuf,
}

/// Run-level metadata of a recorded collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionManifest {
    /// Collection identifier, also written into every TimeSyncFile header
    pub collection_id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    /// False until the run completed cleanly
    pub success: bool,
    #[serde(default)]
    pub failure_reason: Option<String>,
    /// Wall time between start and stop (seconds)
    #[serde(default)]
    pub elapsed_s: f64,
    #[serde(default)]
    pub test_subject: TestSubject,
    #[serde(default)]
    pub modules: Vec<ModuleRecord>,
    #[serde(default)]
    pub datasets: Vec<DatasetRecord>,
}

impl CollectionManifest {
    /// Fresh manifest for a starting run
    pub fn new(name: impl Into<String>, test_subject: TestSubject) -> Self {
        Self {
            collection_id: Uuid::new_v4(),
            name: name.into(),
            created_at: Utc::now(),
            finished_at: None,
            success: false,
            failure_reason: None,
            elapsed_s: 0.0,
            test_subject,
            modules: Vec::new(),
            datasets: Vec::new(),
        }
    }

    /// Record the outcome of the run
    pub fn finish(&mut self, success: bool, failure_reason: Option<String>, elapsed_s: f64) {
        self.finished_at = Some(Utc::now());
        self.success = success;
        self.failure_reason = failure_reason;
        self.elapsed_s = elapsed_s;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_manifest_is_unsuccessful() {
        let manifest = CollectionManifest::new("session", TestSubject::default());
        assert!(!manifest.success);
        assert!(manifest.finished_at.is_none());
        assert!(manifest.modules.is_empty());
    }

    #[test]
    fn test_finish_records_outcome() {
        let mut manifest = CollectionManifest::new("session", TestSubject::default());
        manifest.finish(false, Some("module 'cam' failed".into()), 2.5);
        assert!(!manifest.success);
        assert_eq!(manifest.failure_reason.as_deref(), Some("module 'cam' failed"));
        assert!(manifest.finished_at.is_some());

        let json = serde_json::to_string(&manifest).unwrap();
        let back: CollectionManifest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.collection_id, manifest.collection_id);
        assert_eq!(back.elapsed_s, 2.5);
    }
}
