//! Rating regressor: standardisation, MLP and the persisted model artifact.

/// Model description, trained artifact and persistence.
pub mod artifact;
/// Multi-layer perceptron regressor.
pub mod mlp;
/// Feature standardisation.
pub mod standardiser;

use thiserror::Error;

use crate::features::FeatureError;

pub use artifact::{FittedModel, RatingModelSpec, ReviewRatingModel};
pub use mlp::{MlpConfig, MlpRegressor};
pub use standardiser::Standardiser;

/// Errors raised while training, applying or persisting a model.
#[derive(Debug, Error)]
pub enum ModelError {
    /// No row produced features.
    #[error("training set is empty")]
    EmptyTrainingSet,
    /// Feature and target counts differ.
    #[error("{features} feature rows but {targets} targets")]
    LengthMismatch {
        /// Feature rows.
        features: usize,
        /// Targets.
        targets: usize,
    },
    /// Feature matrix width does not match the model.
    #[error("expected {expected} features, got {found}")]
    DimensionMismatch {
        /// Width the model was built for.
        expected: usize,
        /// Width supplied.
        found: usize,
    },
    /// Prediction features differ from the training layout.
    #[error("feature layout changed: trained on {expected} columns, generated {found}")]
    FeatureLayout {
        /// Trained column count.
        expected: usize,
        /// Generated column count.
        found: usize,
    },
    /// Loss became NaN or infinite.
    #[error("training diverged at epoch {epoch}")]
    Diverged {
        /// Zero-based epoch.
        epoch: usize,
    },
    /// Feature generation failed.
    #[error(transparent)]
    Features(#[from] FeatureError),
    /// Artifact I/O failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Artifact (de)serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
