use ndarray::Array2;
use rayon::prelude::*;
use serde_json::json;
use shared_logging::LogLevel;

use crate::{
    context::ExecutionContext,
    features::{
        generator::{
            EncodingLookup, FeatureColumn, FeatureGenerator, NormalisationRule,
            SentenceEncodingColumnGenerator,
        },
        FeatureError,
    },
    table::Table,
    telemetry,
};

/// Feature matrix assembled from one or more generators.
#[derive(Debug, Clone)]
pub struct CollectedFeatures {
    /// One row per input row that received every feature.
    pub matrix: Array2<f32>,
    /// Scalar columns, in matrix column order.
    pub columns: Vec<FeatureColumn>,
    /// Input row index of each matrix row.
    pub row_indices: Vec<usize>,
    /// Input rows lacking at least one feature.
    pub missing: Vec<usize>,
}

/// Concatenates generator outputs into a model-ready matrix.
///
/// Columns still marked [`NormalisationRule::Unsupported`] are rejected; wrap
/// vector-valued generators in a flattening generator first.
#[derive(Default)]
pub struct FeatureCollector {
    generators: Vec<Box<dyn FeatureGenerator>>,
}

impl std::fmt::Debug for FeatureCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureCollector")
            .field("generators", &self.generators.len())
            .finish()
    }
}

impl FeatureCollector {
    /// Collector over a single generator.
    #[must_use]
    pub fn new(generator: Box<dyn FeatureGenerator>) -> Self {
        Self {
            generators: vec![generator],
        }
    }

    /// Adds another generator; its columns follow the existing ones.
    #[must_use]
    pub fn with_generator(mut self, generator: Box<dyn FeatureGenerator>) -> Self {
        self.generators.push(generator);
        self
    }

    /// Runs every generator and assembles the matrix.
    pub fn collect(&self, table: &Table) -> Result<CollectedFeatures, FeatureError> {
        let mut blocks = Vec::with_capacity(self.generators.len());
        for (idx, generator) in self.generators.iter().enumerate() {
            let block = generator.generate(table)?;
            if block.rows.len() != table.len() {
                return Err(FeatureError::RowCountMismatch {
                    generator: idx,
                    expected: table.len(),
                    found: block.rows.len(),
                });
            }
            if let Some(column) = block
                .columns
                .iter()
                .find(|column| column.rule == NormalisationRule::Unsupported)
            {
                return Err(FeatureError::UnsupportedColumn(column.name.clone()));
            }
            blocks.push(block);
        }

        let columns: Vec<FeatureColumn> = blocks
            .iter()
            .flat_map(|block| block.columns.iter().cloned())
            .collect();
        let width: usize = columns.iter().map(|column| column.width).sum();

        let mut values = Vec::with_capacity(table.len() * width);
        let mut row_indices = Vec::with_capacity(table.len());
        let mut missing = Vec::new();
        for row in 0..table.len() {
            let parts: Option<Vec<&Vec<f32>>> =
                blocks.iter().map(|block| block.rows[row].as_ref()).collect();
            match parts {
                Some(parts) => {
                    for part in parts {
                        values.extend_from_slice(part);
                    }
                    row_indices.push(row);
                }
                None => missing.push(row),
            }
        }
        let matrix = Array2::from_shape_vec((row_indices.len(), width), values)
            .map_err(|err| FeatureError::Shape(err.to_string()))?;
        Ok(CollectedFeatures {
            matrix,
            columns,
            row_indices,
            missing,
        })
    }
}

/// Counts from a cache warm-up pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WarmupSummary {
    /// Rows whose encoding was computed now.
    pub computed: usize,
    /// Rows already cached.
    pub cached: usize,
    /// Rows without text.
    pub skipped: usize,
}

/// Computes (and caches) the encoding of every row with text.
///
/// Rows are processed on the context's worker pool; the first provider or
/// cache error aborts the pass.
pub fn warm_cache(
    ctx: &ExecutionContext,
    table: &Table,
    generator: &SentenceEncodingColumnGenerator,
) -> Result<WarmupSummary, FeatureError> {
    let lookups: Vec<EncodingLookup> = ctx.install(|| {
        table
            .rows()
            .par_iter()
            .map(|row| -> Result<EncodingLookup, FeatureError> {
                let lookup = generator.lookup(row)?;
                if matches!(lookup, EncodingLookup::Computed(_)) {
                    let id = generator.cache_key(row).unwrap_or_default();
                    tracing::info!("Computing entry for {id}");
                }
                Ok(lookup)
            })
            .collect::<Result<Vec<_>, FeatureError>>()
    })?;

    let summary = lookups
        .iter()
        .fold(WarmupSummary::default(), |mut summary, lookup| {
            match lookup {
                EncodingLookup::Computed(_) => summary.computed += 1,
                EncodingLookup::Cached(_) => summary.cached += 1,
                EncodingLookup::Skipped => summary.skipped += 1,
            }
            summary
        });
    telemetry::log(
        ctx.telemetry(),
        LogLevel::Info,
        "features.cache_warmed",
        json!({
            "computed": summary.computed,
            "cached": summary.cached,
            "skipped": summary.skipped,
            "entries": generator.cache().len(),
        }),
    );
    Ok(summary)
}
