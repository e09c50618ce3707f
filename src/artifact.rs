//! Trained model artifacts and their stores.
//!
//! An artifact is immutable once assembled. Stores never rewrite an existing
//! artifact file; a new run writes a new file and repoints `current.json`.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::calibration::Metrics;
use crate::config::TrainConfig;
use crate::error::{ForecastError, Result};
use crate::features::{FeatureBuilder, FeatureSchema};
use crate::trainer::{FittedModel, ModelParams};

pub const ARTIFACT_FORMAT_VERSION: u32 = 1;

const CURRENT_POINTER: &str = "current.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingMetadata {
    /// Content hash, filled in by `ModelArtifact::assemble`.
    #[serde(default)]
    pub version_id: String,
    pub trained_at: DateTime<Utc>,
    /// Latest match date in the training data.
    pub reference_date: NaiveDate,
    /// Set when the run started from raw sources; `None` for prepared vectors.
    pub fusion: Option<FusionProvenance>,
    pub training_rows: usize,
    pub train_rows: usize,
    pub validation_rows: usize,
    pub seed: u64,
    pub train_ratio: f64,
    pub iterations: usize,
    pub validation: Metrics,
    pub uncalibrated_validation: Metrics,
    /// Validation score of always predicting the training class frequencies.
    pub base_rate_validation: Metrics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FusionProvenance {
    pub source_matches: usize,
    pub dropped_rows: usize,
    pub warnings: usize,
}

impl TrainingMetadata {
    pub fn from_fit(
        fitted: &FittedModel,
        features: &FeatureBuilder,
        cfg: &TrainConfig,
        trained_at: DateTime<Utc>,
        training_rows: usize,
    ) -> Self {
        Self {
            version_id: String::new(),
            trained_at,
            reference_date: features.reference_date(),
            fusion: None,
            training_rows,
            train_rows: fitted.split.train.len(),
            validation_rows: fitted.split.validation.len(),
            seed: cfg.seed,
            train_ratio: cfg.train_ratio,
            iterations: fitted.iterations,
            validation: fitted.validation.clone(),
            uncalibrated_validation: fitted.uncalibrated_validation.clone(),
            base_rate_validation: fitted.base_rate_validation.clone(),
        }
    }
}

/// Encoders, parameters and metadata of one training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub format_version: u32,
    pub schema: FeatureSchema,
    pub features: FeatureBuilder,
    pub params: ModelParams,
    pub metadata: TrainingMetadata,
}

impl ModelArtifact {
    pub fn assemble(
        features: FeatureBuilder,
        params: ModelParams,
        mut metadata: TrainingMetadata,
    ) -> Result<Self> {
        metadata.version_id = String::new();
        let mut artifact = Self {
            format_version: ARTIFACT_FORMAT_VERSION,
            schema: FeatureSchema::current(),
            features,
            params,
            metadata,
        };
        artifact.metadata.version_id = artifact.content_hash()?;
        artifact.validate()?;
        Ok(artifact)
    }

    pub fn version_id(&self) -> &str {
        &self.metadata.version_id
    }

    fn content_hash(&self) -> Result<String> {
        let body = serde_json::to_vec(&(
            self.format_version,
            &self.schema.fingerprint,
            &self.features,
            &self.params,
            &self.metadata.trained_at,
        ))?;
        let digest = Sha256::digest(&body);
        let hex = format!("{digest:x}");
        Ok(hex[..16].to_string())
    }

    /// Rejects artifacts whose layout does not match this build.
    pub fn validate(&self) -> Result<()> {
        check_header(self.format_version, &self.schema)?;

        let encoders = self.features.encoders();
        if !encoders.is_well_formed() || !self.features.head_to_head().is_well_formed() {
            return Err(layout_mismatch("encoder tables are not sorted and normalised"));
        }
        if !self.params.matches_encoders(encoders) {
            return Err(layout_mismatch(format!(
                "parameter slots (teams {}, venues {}, eras {}, stages {}) do not match encoder slots (teams {}, venues {}, eras {}, stages {})",
                self.params.team_strength.len(),
                self.params.venue_draw.len(),
                self.params.era_draw.len(),
                self.params.stage_draw.len(),
                encoders.teams.slots(),
                encoders.venues.slots(),
                encoders.eras.slots(),
                encoders.stages.slots(),
            )));
        }
        if !self.params.is_finite() {
            return Err(layout_mismatch("non-finite model parameter"));
        }
        Ok(())
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Decodes and validates an artifact. The format version and feature schema are
    /// checked before the body, whose array shapes depend on the schema.
    pub fn from_json(raw: &str) -> Result<Self> {
        let header: ArtifactHeader = serde_json::from_str(raw)?;
        check_header(header.format_version, &header.schema)?;
        let artifact: Self = serde_json::from_str(raw)?;
        artifact.validate()?;
        Ok(artifact)
    }

    /// Reads and validates an artifact file. The handle is closed on every path.
    pub fn load_path(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| ForecastError::artifact_io(path, e))?;
        let artifact = Self::from_json(&raw)?;
        debug!(path = %path.display(), version = artifact.version_id(), "artifact loaded");
        Ok(artifact)
    }
}

/// Leading fields of a stored artifact, readable whatever the body looks like.
#[derive(Debug, Deserialize)]
struct ArtifactHeader {
    format_version: u32,
    schema: FeatureSchema,
}

fn check_header(format_version: u32, schema: &FeatureSchema) -> Result<()> {
    if format_version != ARTIFACT_FORMAT_VERSION {
        return Err(ForecastError::SchemaMismatch {
            expected: format!("artifact format v{ARTIFACT_FORMAT_VERSION}"),
            found: format!("artifact format v{format_version}"),
            detail: "artifact written by an incompatible build".to_string(),
        });
    }
    FeatureSchema::current().check(schema)
}

fn layout_mismatch(detail: impl Into<String>) -> ForecastError {
    ForecastError::SchemaMismatch {
        expected: FeatureSchema::current().fingerprint,
        found: "inconsistent artifact".to_string(),
        detail: detail.into(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactHandle(pub String);

impl ArtifactHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

pub trait ArtifactStore {
    fn save(&self, artifact: &ModelArtifact) -> Result<ArtifactHandle>;
    fn load(&self, handle: &ArtifactHandle) -> Result<ModelArtifact>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CurrentPointer {
    version_id: String,
    file: String,
}

/// Directory of `model-<version>.json` files plus a `current.json` pointer.
#[derive(Debug, Clone)]
pub struct FileArtifactStore {
    root: PathBuf,
}

impl FileArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, handle: &ArtifactHandle) -> PathBuf {
        self.root.join(format!("model-{}.json", handle.as_str()))
    }

    pub fn current_handle(&self) -> Result<ArtifactHandle> {
        let path = self.root.join(CURRENT_POINTER);
        let file = File::open(&path).map_err(|e| ForecastError::artifact_io(&path, e))?;
        let pointer: CurrentPointer = serde_json::from_reader(BufReader::new(file))?;
        Ok(ArtifactHandle(pointer.version_id))
    }

    pub fn load_current(&self) -> Result<ModelArtifact> {
        let handle = self.current_handle()?;
        self.load(&handle)
    }

    fn write_atomic(
        &self,
        path: &Path,
        write: impl FnOnce(&mut BufWriter<File>) -> Result<()>,
    ) -> Result<()> {
        let tmp = path.with_extension("json.tmp");
        let result = (|| {
            let file = File::create(&tmp).map_err(|e| ForecastError::artifact_io(&tmp, e))?;
            let mut out = BufWriter::new(file);
            write(&mut out)?;
            out.flush().map_err(|e| ForecastError::artifact_io(&tmp, e))?;
            fs::rename(&tmp, path).map_err(|e| ForecastError::artifact_io(path, e))
        })();
        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        result
    }
}

impl ArtifactStore for FileArtifactStore {
    fn save(&self, artifact: &ModelArtifact) -> Result<ArtifactHandle> {
        artifact.validate()?;
        fs::create_dir_all(&self.root).map_err(|e| ForecastError::artifact_io(&self.root, e))?;

        let handle = ArtifactHandle(artifact.version_id().to_string());
        let path = self.path_for(&handle);
        self.write_atomic(&path, |out| Ok(serde_json::to_writer(out, artifact)?))?;

        let pointer = CurrentPointer {
            version_id: handle.0.clone(),
            file: format!("model-{}.json", handle.as_str()),
        };
        let pointer_path = self.root.join(CURRENT_POINTER);
        self.write_atomic(&pointer_path, |out| {
            Ok(serde_json::to_writer_pretty(out, &pointer)?)
        })?;

        info!(path = %path.display(), version = handle.as_str(), "artifact saved");
        Ok(handle)
    }

    fn load(&self, handle: &ArtifactHandle) -> Result<ModelArtifact> {
        ModelArtifact::load_path(&self.path_for(handle))
    }
}

/// Keeps serialized artifacts in memory. Loads go through the same decode and
/// validation as the file store.
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl ArtifactStore for MemoryArtifactStore {
    fn save(&self, artifact: &ModelArtifact) -> Result<ArtifactHandle> {
        artifact.validate()?;
        let json = serde_json::to_string(artifact)?;
        let handle = ArtifactHandle(artifact.version_id().to_string());
        self.entries.lock().insert(handle.0.clone(), json);
        Ok(handle)
    }

    fn load(&self, handle: &ArtifactHandle) -> Result<ModelArtifact> {
        let json = self.entries.lock().get(handle.as_str()).cloned().ok_or_else(|| {
            ForecastError::artifact_io(
                handle.as_str(),
                std::io::Error::new(std::io::ErrorKind::NotFound, "no artifact with this handle"),
            )
        })?;
        ModelArtifact::from_json(&json)
    }
}
