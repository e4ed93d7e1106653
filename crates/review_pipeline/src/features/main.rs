//! Sentence-encoding features: provider, cache, generators and collector.

/// Persistent embedding cache.
pub mod cache;
/// Feature matrix assembly and cache warm-up.
pub mod collector;
/// Text encoding providers.
pub mod encoder;
/// Column and feature generators.
pub mod generator;

use std::{path::PathBuf, sync::Arc};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use cache::{CacheError, EmbeddingCache};
use collector::FeatureCollector;
use encoder::EncoderConfig;
use generator::{
    EncodingFeatureGenerator, FlattenedFeatureGenerator, NormalisationRule,
    SentenceEncodingColumnGenerator,
};

use crate::flatten::{IDENTIFIER_COLUMN, REVIEW_TEXT_COLUMN};

/// Errors raised while generating features.
#[derive(Debug, Error)]
pub enum FeatureError {
    /// Cache read/write failure.
    #[error(transparent)]
    Cache(#[from] CacheError),
    /// Provider returned a vector of the wrong length.
    #[error("provider {provider} returned {found} values, expected {expected}")]
    DimensionMismatch {
        /// Provider name.
        provider: String,
        /// Declared dimension.
        expected: usize,
        /// Actual length.
        found: usize,
    },
    /// Provider failed to encode a text.
    #[error("provider {provider} failed: {message}")]
    Provider {
        /// Provider name.
        provider: String,
        /// Failure description.
        message: String,
    },
    /// A generator returned a block not aligned with its input.
    #[error("generator {generator} produced {found} rows for {expected} input rows")]
    RowCountMismatch {
        /// Generator position in the collector.
        generator: usize,
        /// Input rows.
        expected: usize,
        /// Generated rows.
        found: usize,
    },
    /// Column with [`NormalisationRule::Unsupported`] reached the collector.
    #[error("column `{0}` has no supported normalisation; flatten it first")]
    UnsupportedColumn(String),
    /// Matrix assembly failure.
    #[error("feature matrix shape error: {0}")]
    Shape(String),
}

/// Serializable description of the review feature pipeline.
///
/// Stored inside model artifacts so a reloaded model rebuilds the exact
/// generators it was trained with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    /// Column holding the review text.
    pub text_column: String,
    /// Column used as cache key.
    pub identifier_column: String,
    /// Encoding provider.
    pub encoder: EncoderConfig,
    /// Persistent cache store; in-memory when absent.
    pub cache_path: Option<PathBuf>,
    /// Rule applied to every flattened encoding column.
    pub flattened_rule: NormalisationRule,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            text_column: REVIEW_TEXT_COLUMN.into(),
            identifier_column: IDENTIFIER_COLUMN.into(),
            encoder: EncoderConfig::default(),
            cache_path: Some(PathBuf::from("sentenceCache.sqlite")),
            flattened_rule: NormalisationRule::Skip,
        }
    }
}

impl FeatureConfig {
    /// Opens the configured cache.
    pub fn open_cache(&self) -> Result<EmbeddingCache, FeatureError> {
        Ok(match &self.cache_path {
            Some(path) => EmbeddingCache::open(path)?,
            None => EmbeddingCache::in_memory(),
        })
    }

    /// Sentence-encoding column generator over a freshly opened cache.
    pub fn column_generator(
        &self,
        persist_cache: bool,
    ) -> Result<SentenceEncodingColumnGenerator, FeatureError> {
        Ok(SentenceEncodingColumnGenerator::new(
            self.text_column.clone(),
            self.encoder.build(),
            Arc::new(self.open_cache()?),
            persist_cache,
        )
        .with_identifier_column(self.identifier_column.clone()))
    }

    /// Collector over the flattened sentence encodings.
    pub fn collector(&self, persist_cache: bool) -> Result<FeatureCollector, FeatureError> {
        let encodings = EncodingFeatureGenerator::new(self.column_generator(persist_cache)?);
        Ok(FeatureCollector::new(Box::new(
            FlattenedFeatureGenerator::new(Box::new(encodings), self.flattened_rule),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::Table;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn config_round_trips_through_json() {
        let config = FeatureConfig::default();
        let text = serde_json::to_string(&config).unwrap();
        assert!(text.contains("\"kind\":\"hashing_mean\""));
        let back: FeatureConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn collector_from_config_uses_persistent_cache() {
        let dir = tempdir().unwrap();
        let config = FeatureConfig {
            cache_path: Some(dir.path().join("cache.sqlite")),
            encoder: EncoderConfig::HashingMean {
                dimension: 5,
                seed: 1,
            },
            ..FeatureConfig::default()
        };
        let table = Table::from_rows(vec![[
            ("identifier".to_string(), json!("id-1")),
            ("reviewText".to_string(), json!("works")),
        ]
        .into_iter()
        .collect()]);

        let features = config.collector(true).unwrap().collect(&table).unwrap();
        assert_eq!(features.matrix.dim(), (1, 5));
        assert_eq!(config.open_cache().unwrap().len(), 1);
    }
}
