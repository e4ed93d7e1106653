//! Pipeline configuration document.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::{
    context::ExecutionContext,
    features::FeatureConfig,
    flatten::{RewritePath, RATING_COLUMN},
    model::{MlpConfig, RatingModelSpec},
};

/// Paths, columns and hyperparameters for every pipeline stage.
///
/// Every field has a default, so a config file only lists what it overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Raw line-delimited JSON reviews (optionally `.gz`).
    pub input: PathBuf,
    /// Flattened CSV export.
    pub flattened_csv: PathBuf,
    /// Trained model artifact.
    pub model_path: PathBuf,
    /// Rewrite path used to clean the gift amount.
    pub rewrite_path: RewritePath,
    /// Regression target column.
    pub target_column: String,
    /// Feature pipeline (text column, encoder, cache store).
    pub features: FeatureConfig,
    /// Regressor hyperparameters.
    pub mlp: MlpConfig,
    /// Share of rows held out for evaluation.
    pub test_fraction: f64,
    /// Split seed.
    pub seed: u64,
    /// Persist encodings computed during cache warm-up to the store.
    pub persist_cache_on_warmup: bool,
    /// Persist encodings computed during training to the store.
    pub persist_cache_on_training: bool,
    /// Worker threads for row-level work; all cores when absent.
    pub workers: Option<usize>,
    /// Structured run log.
    pub log_file: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            input: PathBuf::from("Gift_Cards.json.gz"),
            flattened_csv: PathBuf::from("Gift_Cards_flattened.csv"),
            model_path: PathBuf::from("reviewClassifier-v1.json"),
            rewrite_path: RewritePath::Expression,
            target_column: RATING_COLUMN.to_string(),
            features: FeatureConfig::default(),
            mlp: MlpConfig::default(),
            test_fraction: 0.01,
            seed: 42,
            persist_cache_on_warmup: true,
            persist_cache_on_training: false,
            workers: None,
            log_file: None,
        }
    }
}

impl PipelineConfig {
    /// Loads a JSON config; relative paths resolve against its directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading pipeline config {}", path.display()))?;
        let mut config: Self =
            serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        config.validate()?;
        let base = path
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        config.resolve_paths(&base);
        Ok(config)
    }

    /// Rejects values no stage can run with.
    pub fn validate(&self) -> Result<()> {
        if !(self.test_fraction > 0.0 && self.test_fraction < 1.0) {
            bail!("test_fraction must lie in (0, 1), got {}", self.test_fraction);
        }
        if self.mlp.epochs == 0 {
            bail!("mlp.epochs must be positive");
        }
        if self.workers == Some(0) {
            bail!("workers must be positive when set");
        }
        if self.target_column.is_empty() || self.features.text_column.is_empty() {
            bail!("target and text columns must be named");
        }
        Ok(())
    }

    fn resolve_paths(&mut self, base: &Path) {
        let resolve = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        };
        resolve(&mut self.input);
        resolve(&mut self.flattened_csv);
        resolve(&mut self.model_path);
        if let Some(cache) = self.features.cache_path.as_mut() {
            resolve(cache);
        }
        if let Some(log) = self.log_file.as_mut() {
            resolve(log);
        }
    }

    /// Untrained model description.
    #[must_use]
    pub fn model_spec(&self) -> RatingModelSpec {
        RatingModelSpec {
            features: self.features.clone(),
            mlp: self.mlp.clone(),
        }
    }

    /// Execution context sized by `workers`.
    pub fn context(&self) -> Result<ExecutionContext> {
        let ctx = match self.workers {
            Some(workers) => ExecutionContext::new(workers),
            None => ExecutionContext::local(),
        };
        ctx.context("building worker pool")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn partial_file_keeps_defaults_and_resolves_paths() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        fs::write(
            &path,
            r#"{"flattened_csv": "data/flat.csv", "mlp": {"epochs": 5}, "rewrite_path": "row_level"}"#,
        )
        .unwrap();
        let config = PipelineConfig::load(&path).unwrap();
        assert_eq!(config.flattened_csv, dir.path().join("data/flat.csv"));
        assert_eq!(config.model_path, dir.path().join("reviewClassifier-v1.json"));
        assert_eq!(
            config.features.cache_path,
            Some(dir.path().join("sentenceCache.sqlite"))
        );
        assert_eq!(config.mlp.epochs, 5);
        assert_eq!(config.mlp.hidden_dims, vec![50, 50, 20]);
        assert_eq!(config.rewrite_path, RewritePath::RowLevel);
        assert!(config.persist_cache_on_warmup);
        assert!(!config.persist_cache_on_training);
        assert!((config.test_fraction - 0.01).abs() < f64::EPSILON);
    }

    #[test]
    fn invalid_fraction_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        fs::write(&path, r#"{"test_fraction": 1.5}"#).unwrap();
        let err = PipelineConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("test_fraction"));
    }

    #[test]
    fn absolute_paths_are_kept() {
        let dir = tempdir().unwrap();
        let model = dir.path().join("elsewhere/model.json");
        let path = dir.path().join("pipeline.json");
        fs::write(
            &path,
            serde_json::to_string(&serde_json::json!({ "model_path": model })).unwrap(),
        )
        .unwrap();
        assert_eq!(PipelineConfig::load(&path).unwrap().model_path, model);
    }
}
