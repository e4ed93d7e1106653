//! Stage orchestration shared by the CLI and integration tests.

use std::path::Path;

use anyhow::{Context, Result};
use serde_json::json;
use shared_logging::LogLevel;

use crate::{
    config::PipelineConfig,
    context::ExecutionContext,
    evaluation::{evaluate_model, EvaluationReport, InputOutputData},
    features::collector::{warm_cache, WarmupSummary},
    flatten::{
        clean_gift_amount, flatten_reviews, read_flattened_csv, RewritePath, IDENTIFIER_COLUMN,
    },
    model::ReviewRatingModel,
    table::{render_cell, Table},
    telemetry,
};

/// Result of the flatten stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlattenSummary {
    /// Rows written.
    pub rows: usize,
    /// Columns written, in order.
    pub columns: Vec<String>,
}

/// Cleans raw reviews and writes the flattened CSV.
pub fn run_flatten(
    ctx: &ExecutionContext,
    input: &Path,
    output: &Path,
    path: RewritePath,
) -> Result<FlattenSummary> {
    let raw = Table::read_json_lines(input)
        .with_context(|| format!("reading reviews from {}", input.display()))?;
    tracing::debug!("raw schema: {}", raw.schema().simple_string());
    let cleaned = clean_gift_amount(ctx, &raw, path).context("cleaning gift amount")?;
    let flat = flatten_reviews(&cleaned).context("flattening reviews")?;
    flat.write_csv(output)
        .with_context(|| format!("writing {}", output.display()))?;

    let summary = FlattenSummary {
        rows: flat.len(),
        columns: flat.schema().names().map(str::to_string).collect(),
    };
    telemetry::log(
        ctx.telemetry(),
        LogLevel::Info,
        "flatten.completed",
        json!({
            "input": input.display().to_string(),
            "output": output.display().to_string(),
            "rows": summary.rows,
            "columns": summary.columns,
            "rewrite_path": path,
        }),
    );
    Ok(summary)
}

/// Runs [`run_flatten`] on the configured input, output and rewrite path.
pub fn run_flatten_configured(
    ctx: &ExecutionContext,
    config: &PipelineConfig,
) -> Result<FlattenSummary> {
    run_flatten(ctx, &config.input, &config.flattened_csv, config.rewrite_path)
}

fn read_training_table(config: &PipelineConfig) -> Result<Table> {
    let flat = read_flattened_csv(&config.flattened_csv)
        .with_context(|| format!("reading {}", config.flattened_csv.display()))?;
    Ok(flat.drop_incomplete().into_table())
}

/// Computes and persists the encoding of every complete flattened review.
pub fn run_warm_cache(ctx: &ExecutionContext, config: &PipelineConfig) -> Result<WarmupSummary> {
    let table = read_training_table(config)?;
    let generator = config
        .features
        .column_generator(config.persist_cache_on_warmup)
        .context("opening sentence cache")?;
    let summary = warm_cache(ctx, &table, &generator).context("warming sentence cache")?;
    tracing::info!(
        "cache warm-up: {} computed, {} cached, {} skipped",
        summary.computed,
        summary.cached,
        summary.skipped
    );
    Ok(summary)
}

/// Trains and evaluates the rating model, then saves the artifact.
pub fn run_training(ctx: &ExecutionContext, config: &PipelineConfig) -> Result<EvaluationReport> {
    let table = read_training_table(config)?;
    let data = InputOutputData::from_table(table, &config.target_column)
        .context("separating target column")?;
    let (report, model) = evaluate_model(
        &config.model_spec(),
        &data,
        config.test_fraction,
        config.seed,
        config.persist_cache_on_training,
        ctx.telemetry(),
    )
    .context("evaluating rating model")?;
    model
        .save(&config.model_path)
        .with_context(|| format!("saving model to {}", config.model_path.display()))?;
    telemetry::log(
        ctx.telemetry(),
        LogLevel::Info,
        "train.saved",
        json!({
            "model_id": model.id.to_string(),
            "path": config.model_path.display().to_string(),
        }),
    );
    Ok(report)
}

/// One scored row of [`run_predict`].
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    /// Row identifier (empty when the row has none).
    pub identifier: String,
    /// Predicted rating; `None` for rows without review text.
    pub rating: Option<f32>,
}

/// Scores every row of a flattened CSV with a saved model.
pub fn run_predict(
    ctx: &ExecutionContext,
    model_path: &Path,
    input: &Path,
) -> Result<Vec<Prediction>> {
    let model = ReviewRatingModel::load(model_path)
        .with_context(|| format!("loading model {}", model_path.display()))?;
    let flat = read_flattened_csv(input)
        .with_context(|| format!("reading {}", input.display()))?;
    let ratings = model.predict(flat.table()).context("scoring reviews")?;
    let predictions: Vec<Prediction> = flat
        .table()
        .rows()
        .iter()
        .zip(ratings)
        .map(|(row, rating)| Prediction {
            identifier: row.get(IDENTIFIER_COLUMN).map(render_cell).unwrap_or_default(),
            rating,
        })
        .collect();
    telemetry::log(
        ctx.telemetry(),
        LogLevel::Info,
        "predict.completed",
        json!({
            "model_id": model.id.to_string(),
            "rows": predictions.len(),
            "scored": predictions.iter().filter(|p| p.rating.is_some()).count(),
        }),
    );
    Ok(predictions)
}
