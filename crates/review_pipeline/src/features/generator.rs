use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    features::{cache::EmbeddingCache, encoder::EncodingProvider, FeatureError},
    table::{render_cell, Row, Table},
};

/// How a generated column is normalised before it reaches a model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormalisationRule {
    /// Cannot be normalised or fed to a model as is (vector-valued).
    Unsupported,
    /// Passed through unchanged.
    #[default]
    Skip,
    /// Standardised to zero mean and unit variance.
    Standardise,
}

/// One generated column; `width > 1` means vector-valued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureColumn {
    /// Column name.
    pub name: String,
    /// Number of values per row.
    pub width: usize,
    /// Normalisation rule.
    pub rule: NormalisationRule,
}

/// Output of a feature generator, aligned with the input table's rows.
#[derive(Debug, Clone, Default)]
pub struct FeatureBlock {
    /// Generated columns, in value order.
    pub columns: Vec<FeatureColumn>,
    /// Concatenated column values per row; `None` when the row has no features.
    pub rows: Vec<Option<Vec<f32>>>,
}

impl FeatureBlock {
    /// Values per row across all columns.
    #[must_use]
    pub fn width(&self) -> usize {
        self.columns.iter().map(|column| column.width).sum()
    }
}

/// Derives numeric columns from a table.
pub trait FeatureGenerator: Send + Sync {
    /// Generates one block, row-aligned with `table`.
    fn generate(&self, table: &Table) -> Result<FeatureBlock, FeatureError>;
}

/// Result of looking up one row's encoding.
#[derive(Debug, Clone, PartialEq)]
pub enum EncodingLookup {
    /// Served from the cache.
    Cached(Vec<f32>),
    /// Computed by the provider and cached.
    Computed(Vec<f32>),
    /// Row has no text; no feature emitted.
    Skipped,
}

impl EncodingLookup {
    /// The vector, if any.
    #[must_use]
    pub fn into_vector(self) -> Option<Vec<f32>> {
        match self {
            Self::Cached(vector) | Self::Computed(vector) => Some(vector),
            Self::Skipped => None,
        }
    }
}

/// Cache-backed sentence encodings of one text column.
///
/// The cache key is the row identifier; rows without one fall back to the
/// text itself. Non-text values are skipped without error.
#[derive(Clone)]
pub struct SentenceEncodingColumnGenerator {
    text_column: String,
    identifier_column: String,
    provider: Arc<dyn EncodingProvider>,
    cache: Arc<EmbeddingCache>,
    persist_cache: bool,
}

impl std::fmt::Debug for SentenceEncodingColumnGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SentenceEncodingColumnGenerator")
            .field("text_column", &self.text_column)
            .field("identifier_column", &self.identifier_column)
            .field("provider", &self.provider.name())
            .field("cache", &self.cache.path())
            .field("persist_cache", &self.persist_cache)
            .finish()
    }
}

impl SentenceEncodingColumnGenerator {
    /// Creates a generator keyed by the `identifier` column.
    #[must_use]
    pub fn new(
        text_column: impl Into<String>,
        provider: Arc<dyn EncodingProvider>,
        cache: Arc<EmbeddingCache>,
        persist_cache: bool,
    ) -> Self {
        Self {
            text_column: text_column.into(),
            identifier_column: crate::flatten::IDENTIFIER_COLUMN.to_string(),
            provider,
            cache,
            persist_cache,
        }
    }

    /// Uses a different column as cache key.
    #[must_use]
    pub fn with_identifier_column(mut self, column: impl Into<String>) -> Self {
        self.identifier_column = column.into();
        self
    }

    /// Name of the generated column.
    #[must_use]
    pub fn generated_column_name(&self) -> String {
        format!("{}_encoding", self.text_column)
    }

    /// Length of every generated vector.
    #[must_use]
    pub fn dimension(&self) -> usize {
        self.provider.dimension()
    }

    /// Shared cache.
    #[must_use]
    pub fn cache(&self) -> &EmbeddingCache {
        &self.cache
    }

    /// Cache key of a row, if it has text to encode.
    #[must_use]
    pub fn cache_key(&self, row: &Row) -> Option<String> {
        let text = row.get(&self.text_column).and_then(Value::as_str)?;
        let key = row
            .get(&self.identifier_column)
            .map(render_cell)
            .filter(|key| !key.is_empty());
        Some(key.unwrap_or_else(|| text.to_string()))
    }

    /// Looks up or computes the encoding of one row.
    ///
    /// Cached vectors whose length no longer matches the provider are
    /// recomputed and overwritten.
    pub fn lookup(&self, row: &Row) -> Result<EncodingLookup, FeatureError> {
        let Some(text) = row.get(&self.text_column).and_then(Value::as_str) else {
            return Ok(EncodingLookup::Skipped);
        };
        let Some(key) = self.cache_key(row) else {
            return Ok(EncodingLookup::Skipped);
        };
        if let Some(vector) = self.cache.get(&key) {
            if vector.len() == self.provider.dimension() {
                return Ok(EncodingLookup::Cached(vector));
            }
            tracing::warn!(
                "stale cache entry {key}: {} values, provider {} yields {}",
                vector.len(),
                self.provider.name(),
                self.provider.dimension()
            );
        }
        let vector = self.provider.encode(text)?;
        if vector.len() != self.provider.dimension() {
            return Err(FeatureError::DimensionMismatch {
                provider: self.provider.name().to_string(),
                expected: self.provider.dimension(),
                found: vector.len(),
            });
        }
        self.cache.insert(&key, vector.clone(), self.persist_cache)?;
        Ok(EncodingLookup::Computed(vector))
    }
}

/// Feature generator wrapping a sentence-encoding column generator.
///
/// Emits one vector-valued column whose rule defaults to
/// [`NormalisationRule::Unsupported`].
#[derive(Debug, Clone)]
pub struct EncodingFeatureGenerator {
    column_gen: SentenceEncodingColumnGenerator,
    rule: NormalisationRule,
}

impl EncodingFeatureGenerator {
    /// Wraps a column generator.
    #[must_use]
    pub fn new(column_gen: SentenceEncodingColumnGenerator) -> Self {
        Self {
            column_gen,
            rule: NormalisationRule::Unsupported,
        }
    }

    /// Overrides the column's normalisation rule.
    #[must_use]
    pub fn with_rule(mut self, rule: NormalisationRule) -> Self {
        self.rule = rule;
        self
    }

    /// Underlying column generator.
    #[must_use]
    pub fn column_gen(&self) -> &SentenceEncodingColumnGenerator {
        &self.column_gen
    }
}

impl FeatureGenerator for EncodingFeatureGenerator {
    fn generate(&self, table: &Table) -> Result<FeatureBlock, FeatureError> {
        let rows = table
            .rows()
            .iter()
            .map(|row| {
                self.column_gen
                    .lookup(row)
                    .map(EncodingLookup::into_vector)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(FeatureBlock {
            columns: vec![FeatureColumn {
                name: self.column_gen.generated_column_name(),
                width: self.column_gen.dimension(),
                rule: self.rule,
            }],
            rows,
        })
    }
}

/// Expands vector-valued columns into scalar columns `{name}_{i}`.
pub struct FlattenedFeatureGenerator {
    inner: Box<dyn FeatureGenerator>,
    rule: NormalisationRule,
}

impl std::fmt::Debug for FlattenedFeatureGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlattenedFeatureGenerator")
            .field("rule", &self.rule)
            .finish_non_exhaustive()
    }
}

impl FlattenedFeatureGenerator {
    /// Flattens `inner`, giving every scalar column `rule`.
    #[must_use]
    pub fn new(inner: Box<dyn FeatureGenerator>, rule: NormalisationRule) -> Self {
        Self { inner, rule }
    }
}

impl FeatureGenerator for FlattenedFeatureGenerator {
    fn generate(&self, table: &Table) -> Result<FeatureBlock, FeatureError> {
        let block = self.inner.generate(table)?;
        let columns = block
            .columns
            .iter()
            .flat_map(|column| {
                let rule = self.rule;
                (0..column.width).map(move |idx| FeatureColumn {
                    name: if column.width == 1 {
                        column.name.clone()
                    } else {
                        format!("{}_{idx}", column.name)
                    },
                    width: 1,
                    rule,
                })
            })
            .collect();
        Ok(FeatureBlock {
            columns,
            rows: block.rows,
        })
    }
}
