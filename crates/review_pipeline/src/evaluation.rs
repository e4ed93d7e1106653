//! Held-out evaluation of the rating model.

use std::{collections::BTreeMap, fmt::Write as _};

use rand::{rngs::SmallRng, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use shared_logging::LogLevel;
use thiserror::Error;
use uuid::Uuid;

use crate::{
    model::{ModelError, RatingModelSpec, ReviewRatingModel},
    schema::SchemaError,
    table::Table,
    telemetry::{self, PipelineTelemetry},
};

/// Errors raised while preparing data for or running an evaluation.
#[derive(Debug, Error)]
pub enum EvaluationError {
    /// Target column lookup failed.
    #[error(transparent)]
    Schema(#[from] SchemaError),
    /// Training failed.
    #[error(transparent)]
    Model(#[from] ModelError),
    /// Fewer than two usable samples.
    #[error("need at least 2 samples to split, got {0}")]
    NotEnoughSamples(usize),
    /// Test fraction outside `(0, 1)`.
    #[error("test fraction must lie in (0, 1), got {0}")]
    InvalidFraction(f64),
    /// No test row produced a prediction.
    #[error("no test row could be scored")]
    NoTestPredictions,
}

/// Model inputs with an aligned numeric target.
#[derive(Debug, Clone)]
pub struct InputOutputData {
    /// Input columns (target removed).
    pub inputs: Table,
    /// One target per input row.
    pub targets: Vec<f32>,
}

impl InputOutputData {
    /// Splits `target` off `table`; rows whose target is not numeric are dropped.
    pub fn from_table(table: Table, target: &str) -> Result<Self, EvaluationError> {
        let (inputs, values) = table.take_column(target)?;
        let mut keep = Vec::with_capacity(values.len());
        let mut targets = Vec::with_capacity(values.len());
        for (idx, value) in values.iter().enumerate() {
            if let Some(number) = value.as_f64() {
                #[allow(clippy::cast_possible_truncation)]
                let number = number as f32;
                keep.push(idx);
                targets.push(number);
            }
        }
        if keep.len() < values.len() {
            tracing::warn!(
                "dropped {} rows without a numeric `{target}`",
                values.len() - keep.len()
            );
        }
        let inputs = if keep.len() == inputs.len() {
            inputs
        } else {
            inputs.select_rows(&keep)
        };
        Ok(Self { inputs, targets })
    }

    /// Number of samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// Whether there are no samples.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    fn select(&self, indices: &[usize]) -> Self {
        Self {
            inputs: self.inputs.select_rows(indices),
            targets: indices.iter().map(|&idx| self.targets[idx]).collect(),
        }
    }

    /// Shuffled `(train, test)` split.
    ///
    /// The test side holds `round(len * test_fraction)` samples, clamped so
    /// that each side keeps at least one.
    pub fn split(&self, test_fraction: f64, seed: u64) -> Result<(Self, Self), EvaluationError> {
        if !(test_fraction > 0.0 && test_fraction < 1.0) {
            return Err(EvaluationError::InvalidFraction(test_fraction));
        }
        let len = self.len();
        if len < 2 {
            return Err(EvaluationError::NotEnoughSamples(len));
        }
        let mut order: Vec<usize> = (0..len).collect();
        order.shuffle(&mut SmallRng::seed_from_u64(seed));
        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            clippy::cast_precision_loss
        )]
        let test_len = ((len as f64) * test_fraction).round() as usize;
        let test_len = test_len.clamp(1, len - 1);
        let (test, train) = order.split_at(test_len);
        Ok((self.select(train), self.select(test)))
    }
}

/// Standard regression metrics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegressionMetrics {
    /// Mean squared error.
    pub mse: f64,
    /// Root mean squared error.
    pub rmse: f64,
    /// Mean absolute error.
    pub mae: f64,
    /// Coefficient of determination.
    pub r2: f64,
    /// Scored samples.
    pub samples: usize,
}

impl RegressionMetrics {
    /// Scores `predicted` against `actual`; extra values on either side are ignored.
    #[must_use]
    pub fn compute(predicted: &[f32], actual: &[f32]) -> Self {
        let pairs: Vec<(f64, f64)> = predicted
            .iter()
            .zip(actual)
            .map(|(&p, &a)| (f64::from(p), f64::from(a)))
            .collect();
        if pairs.is_empty() {
            return Self {
                mse: 0.0,
                rmse: 0.0,
                mae: 0.0,
                r2: 0.0,
                samples: 0,
            };
        }
        #[allow(clippy::cast_precision_loss)]
        let n = pairs.len() as f64;
        let mean = pairs.iter().map(|(_, a)| a).sum::<f64>() / n;
        let ss_res: f64 = pairs.iter().map(|(p, a)| (a - p).powi(2)).sum();
        let ss_tot: f64 = pairs.iter().map(|(_, a)| (a - mean).powi(2)).sum();
        let mae = pairs.iter().map(|(p, a)| (a - p).abs()).sum::<f64>() / n;
        let mse = ss_res / n;
        let r2 = if ss_tot > 0.0 {
            1.0 - ss_res / ss_tot
        } else if ss_res == 0.0 {
            1.0
        } else {
            0.0
        };
        Self {
            mse,
            rmse: mse.sqrt(),
            mae,
            r2,
            samples: pairs.len(),
        }
    }
}

/// Count of values per rounded bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetDistribution {
    /// Rounded value to occurrences.
    pub counts: BTreeMap<i64, usize>,
}

impl TargetDistribution {
    /// Buckets every finite value by rounding to the nearest integer.
    #[must_use]
    pub fn from_values(values: &[f32]) -> Self {
        let mut counts = BTreeMap::new();
        for value in values.iter().filter(|v| v.is_finite()) {
            #[allow(clippy::cast_possible_truncation)]
            let bucket = value.round() as i64;
            *counts.entry(bucket).or_insert(0) += 1;
        }
        Self { counts }
    }

    /// Total number of counted values.
    #[must_use]
    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }

    fn to_json(&self) -> Value {
        self.counts
            .iter()
            .map(|(bucket, count)| (bucket.to_string(), json!(count)))
            .collect::<serde_json::Map<_, _>>()
            .into()
    }
}

/// Outcome of [`evaluate_model`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationReport {
    /// Identifier of the trained model.
    pub model_id: Uuid,
    /// Rows used for training.
    pub train_samples: usize,
    /// Test rows that were scored.
    pub test_samples: usize,
    /// Training rows without features.
    pub skipped_train_rows: usize,
    /// Test rows without features.
    pub skipped_test_rows: usize,
    /// Loss of the last epoch.
    pub final_loss: Option<f32>,
    /// Test-set metrics.
    pub metrics: RegressionMetrics,
    /// Training targets per rounded rating.
    pub train_distribution: TargetDistribution,
    /// Test targets per rounded rating.
    pub test_distribution: TargetDistribution,
    /// Test predictions per rounded rating.
    pub prediction_distribution: TargetDistribution,
}

impl EvaluationReport {
    /// Multi-line human-readable summary.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "model {}", self.model_id);
        let _ = writeln!(
            out,
            "train {} (skipped {}), test {} (skipped {})",
            self.train_samples, self.skipped_train_rows, self.test_samples, self.skipped_test_rows
        );
        if let Some(loss) = self.final_loss {
            let _ = writeln!(out, "final training loss {loss:.4}");
        }
        let m = &self.metrics;
        let _ = writeln!(
            out,
            "mse {:.4}  rmse {:.4}  mae {:.4}  r2 {:.4}",
            m.mse, m.rmse, m.mae, m.r2
        );
        for (label, dist) in [
            ("train targets", &self.train_distribution),
            ("test targets", &self.test_distribution),
            ("predictions", &self.prediction_distribution),
        ] {
            let buckets: Vec<String> = dist
                .counts
                .iter()
                .map(|(bucket, count)| format!("{bucket}:{count}"))
                .collect();
            let _ = writeln!(out, "{label}: {}", buckets.join(" "));
        }
        out
    }
}

/// Splits `data`, fits `spec` on the training side and scores the test side.
///
/// Test rows without features are left out of the metrics. Returns the report
/// together with the trained model.
pub fn evaluate_model(
    spec: &RatingModelSpec,
    data: &InputOutputData,
    test_fraction: f64,
    seed: u64,
    persist_cache: bool,
    telemetry: Option<&PipelineTelemetry>,
) -> Result<(EvaluationReport, ReviewRatingModel), EvaluationError> {
    let (train, test) = data.split(test_fraction, seed)?;
    telemetry::log(
        telemetry,
        LogLevel::Info,
        "train.start",
        json!({
            "train_rows": train.len(),
            "test_rows": test.len(),
            "hidden_dims": spec.mlp.hidden_dims,
            "epochs": spec.mlp.epochs,
        }),
    );

    let fitted = spec.fit(&train.inputs, &train.targets, persist_cache)?;
    let predictions = fitted.model.predict(&test.inputs)?;
    let (predicted, actual): (Vec<f32>, Vec<f32>) = predictions
        .iter()
        .zip(&test.targets)
        .filter_map(|(&prediction, &target)| prediction.map(|p| (p, target)))
        .unzip();
    if predicted.is_empty() {
        return Err(EvaluationError::NoTestPredictions);
    }

    let report = EvaluationReport {
        model_id: fitted.model.id,
        train_samples: fitted.model.training_samples,
        test_samples: predicted.len(),
        skipped_train_rows: fitted.skipped_rows.len(),
        skipped_test_rows: test.len() - predicted.len(),
        final_loss: fitted.loss_history.last().copied(),
        metrics: RegressionMetrics::compute(&predicted, &actual),
        train_distribution: TargetDistribution::from_values(&train.targets),
        test_distribution: TargetDistribution::from_values(&actual),
        prediction_distribution: TargetDistribution::from_values(&predicted),
    };
    telemetry::log(
        telemetry,
        LogLevel::Info,
        "train.evaluated",
        json!({
            "model_id": report.model_id.to_string(),
            "mse": report.metrics.mse,
            "rmse": report.metrics.rmse,
            "mae": report.metrics.mae,
            "r2": report.metrics.r2,
            "test_distribution": report.test_distribution.to_json(),
            "prediction_distribution": report.prediction_distribution.to_json(),
        }),
    );
    Ok((report, fitted.model))
}
