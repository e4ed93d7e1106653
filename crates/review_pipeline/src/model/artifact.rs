use std::{
    fs::{self, File},
    io::{BufReader, BufWriter},
    path::Path,
};

use chrono::{DateTime, Utc};
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    features::{collector::CollectedFeatures, generator::FeatureColumn, FeatureConfig},
    model::{
        mlp::{MlpConfig, MlpRegressor},
        standardiser::Standardiser,
        ModelError,
    },
    table::Table,
};

/// Untrained model description: feature pipeline plus regressor settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RatingModelSpec {
    /// Feature pipeline.
    pub features: FeatureConfig,
    /// Regressor hyperparameters.
    pub mlp: MlpConfig,
}

/// Outcome of fitting a [`RatingModelSpec`].
#[derive(Debug, Clone)]
pub struct FittedModel {
    /// Trained model.
    pub model: ReviewRatingModel,
    /// Mean training loss per epoch.
    pub loss_history: Vec<f32>,
    /// Input rows left out because they had no features.
    pub skipped_rows: Vec<usize>,
}

impl RatingModelSpec {
    /// Generates features for `inputs` and trains on the rows that have them.
    ///
    /// `targets` must be aligned with `inputs`. With `persist_cache` newly
    /// computed encodings are appended to the cache store.
    pub fn fit(
        &self,
        inputs: &Table,
        targets: &[f32],
        persist_cache: bool,
    ) -> Result<FittedModel, ModelError> {
        if targets.len() != inputs.len() {
            return Err(ModelError::LengthMismatch {
                features: inputs.len(),
                targets: targets.len(),
            });
        }
        let CollectedFeatures {
            matrix,
            columns,
            row_indices,
            missing,
        } = self.features.collector(persist_cache)?.collect(inputs)?;
        if row_indices.is_empty() {
            return Err(ModelError::EmptyTrainingSet);
        }
        let y: Array1<f32> = row_indices.iter().map(|&row| targets[row]).collect();

        let standardiser = Standardiser::fit(&matrix, &columns)?;
        let scaled = standardiser.transform(&matrix)?;
        let mut mlp = MlpRegressor::new(self.mlp.clone(), scaled.ncols());
        let loss_history = mlp.fit(&scaled, &y)?;

        Ok(FittedModel {
            model: ReviewRatingModel {
                id: Uuid::new_v4(),
                trained_at: Utc::now(),
                features: self.features.clone(),
                columns,
                training_samples: row_indices.len(),
                standardiser,
                mlp,
            },
            loss_history,
            skipped_rows: missing,
        })
    }
}

/// Trained rating model, persisted as a single JSON artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewRatingModel {
    /// Artifact identifier.
    pub id: Uuid,
    /// Training completion time.
    pub trained_at: DateTime<Utc>,
    /// Feature pipeline used for training and prediction.
    pub features: FeatureConfig,
    /// Feature layout the regressor was trained on.
    pub columns: Vec<FeatureColumn>,
    /// Number of training rows.
    pub training_samples: usize,
    standardiser: Standardiser,
    mlp: MlpRegressor,
}

impl ReviewRatingModel {
    /// Underlying regressor.
    #[must_use]
    pub const fn regressor(&self) -> &MlpRegressor {
        &self.mlp
    }

    /// Predicts a rating per input row; rows without features yield `None`.
    ///
    /// The cache is consulted but never written.
    pub fn predict(&self, table: &Table) -> Result<Vec<Option<f32>>, ModelError> {
        let collected = self.features.collector(false)?.collect(table)?;
        if collected.columns != self.columns {
            return Err(ModelError::FeatureLayout {
                expected: self.columns.len(),
                found: collected.columns.len(),
            });
        }
        let scaled = self.standardiser.transform(&collected.matrix)?;
        let values = self.mlp.predict(&scaled)?;

        let mut predictions = vec![None; table.len()];
        for (&row, &value) in collected.row_indices.iter().zip(values.iter()) {
            predictions[row] = Some(value);
        }
        Ok(predictions)
    }

    /// Writes the artifact as pretty JSON, creating parent directories.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ModelError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, self)?;
        tracing::info!("saved rating model {} to {}", self.id, path.display());
        Ok(())
    }

    /// Reads an artifact written by [`ReviewRatingModel::save`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ModelError> {
        let reader = BufReader::new(File::open(path.as_ref())?);
        let model: Self = serde_json::from_reader(reader)?;
        if model.standardiser.width() != model.mlp.input_dim() {
            return Err(ModelError::DimensionMismatch {
                expected: model.mlp.input_dim(),
                found: model.standardiser.width(),
            });
        }
        Ok(model)
    }
}
