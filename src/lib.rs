pub mod artifact;
pub mod calibration;
pub mod cli_args;
pub mod config;
pub mod error;
pub mod features;
pub mod fusion;
pub mod inference;
pub mod logging;
pub mod lookup;
pub mod records;
pub mod source_loader;
pub mod trainer;

pub use artifact::{
    ArtifactHandle, ArtifactStore, FileArtifactStore, MemoryArtifactStore, ModelArtifact,
};
pub use config::{EraPolicy, FeatureConfig, PipelineConfig, TrainConfig};
pub use error::{ForecastError, Result};
pub use features::{FeatureBuilder, FeatureSchema, FeatureVector};
pub use fusion::{CanonicalMatchRow, FusionOutput, FusionWarning, fuse, fuse_sources};
pub use inference::{InferenceService, PredictionRequest, PredictionResponse, predict};
pub use records::{OutcomeLabel, SourceTables};
pub use trainer::{CancelToken, train, train_pipeline};
