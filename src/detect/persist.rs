//! On-disk model artifacts: one JSON file per machine.
//!
//! Files are written to a temporary sibling and renamed into place, so a
//! reader never observes a half-written model and concurrent writers for
//! different machines never touch the same path.

use crate::detect::{DetectError, IsolationForest};
use crate::telemetry::{FeatureExtractor, Sensor};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const MODEL_SUFFIX: &str = ".model.json";
const TMP_SUFFIX: &str = ".model.tmp";

/// Serialized form of one machine's trained forest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedModel {
    pub machine_id: String,
    pub layout: Vec<Sensor>,
    pub training_samples: usize,
    pub trained_at: DateTime<Utc>,
    pub forest: IsolationForest,
}

impl PersistedModel {
    pub fn to_json(&self) -> Result<Vec<u8>, DetectError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, DetectError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Read a model artifact from an explicit path.
    pub fn read(path: &Path) -> Result<Self, DetectError> {
        Self::from_json(&fs::read(path)?)
    }
}

impl IsolationForest {
    /// Capture a trained forest as a [`PersistedModel`].
    pub fn serialize(
        &self,
        machine_id: &str,
        layout: &[Sensor],
        training_samples: usize,
        trained_at: DateTime<Utc>,
    ) -> Result<PersistedModel, DetectError> {
        let dimensions = self.dimensions().ok_or(DetectError::ModelNotTrained)?;
        if dimensions != layout.len() {
            return Err(DetectError::DimensionMismatch {
                expected: layout.len(),
                found: dimensions,
            });
        }
        Ok(PersistedModel {
            machine_id: machine_id.to_string(),
            layout: layout.to_vec(),
            training_samples,
            trained_at,
            forest: self.clone(),
        })
    }

    /// Restore a forest, refusing it unless it was trained on exactly the
    /// layout `extractor` produces.
    pub fn deserialize(
        persisted: PersistedModel,
        extractor: &FeatureExtractor,
    ) -> Result<Self, DetectError> {
        let dimensions = persisted
            .forest
            .dimensions()
            .ok_or_else(|| DetectError::CorruptModel("artifact holds an unfitted forest".into()))?;
        if dimensions != persisted.layout.len() {
            return Err(DetectError::CorruptModel(format!(
                "forest has {} dimensions but layout lists {} sensors",
                dimensions,
                persisted.layout.len()
            )));
        }
        if persisted.layout != extractor.layout() {
            return Err(DetectError::ModelSchemaMismatch {
                expected: extractor.layout().to_vec(),
                found: persisted.layout,
            });
        }
        Ok(persisted.forest)
    }
}

/// Directory of persisted models, keyed by machine id.
#[derive(Debug, Clone)]
pub struct ModelStore {
    dir: PathBuf,
}

impl ModelStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Artifact path for `machine_id`. Bytes outside `[A-Za-z0-9_-]` are
    /// percent-encoded, so distinct ids always get distinct files.
    pub fn path_for(&self, machine_id: &str) -> PathBuf {
        self.dir.join(format!("{}{}", file_stem(machine_id), MODEL_SUFFIX))
    }

    fn tmp_path_for(&self, machine_id: &str) -> PathBuf {
        self.dir.join(format!("{}{}", file_stem(machine_id), TMP_SUFFIX))
    }

    pub fn save(&self, model: &PersistedModel) -> Result<PathBuf, DetectError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(&model.machine_id);
        let tmp = self.tmp_path_for(&model.machine_id);
        fs::write(&tmp, model.to_json()?)?;
        fs::rename(&tmp, &path)?;
        debug!(path = %path.display(), machine = %model.machine_id, "model persisted");
        Ok(path)
    }

    /// Load the artifact for `machine_id`, if one exists.
    pub fn load(&self, machine_id: &str) -> Result<Option<PersistedModel>, DetectError> {
        let path = self.path_for(machine_id);
        if !path.exists() {
            return Ok(None);
        }
        let model = PersistedModel::read(&path)?;
        if model.machine_id != machine_id {
            return Err(DetectError::CorruptModel(format!(
                "{} belongs to machine '{}'",
                path.display(),
                model.machine_id
            )));
        }
        Ok(Some(model))
    }

    /// Machine ids with a readable artifact in the store.
    pub fn list(&self) -> Result<Vec<String>, DetectError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut machines = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let is_model = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(MODEL_SUFFIX));
            if !is_model {
                continue;
            }
            match PersistedModel::read(&path) {
                Ok(model) => machines.push(model.machine_id),
                Err(e) => warn!(
                    path = %path.display(),
                    error = %e,
                    "skipping unreadable model artifact"
                ),
            }
        }
        machines.sort();
        Ok(machines)
    }
}

fn file_stem(machine_id: &str) -> String {
    let mut stem = String::with_capacity(machine_id.len());
    for b in machine_id.bytes() {
        if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' {
            stem.push(char::from(b));
        } else {
            stem.push_str(&format!("%{:02X}", b));
        }
    }
    stem
}
