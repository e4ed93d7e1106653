#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Gift-card review pipeline: nested-column rewriting, flattening, cached
//! sentence-encoding features and a rating regressor with held-out evaluation.

/// Table schemas and Spark-style type rendering.
pub mod schema;

/// In-memory tables with JSON-lines and CSV I/O.
pub mod table;

/// Nested struct child rewrites.
pub mod rewrite;

/// Gift-amount cleaning and flattening of review records.
pub mod flatten;

/// Feature orchestration.
#[path = "features/main.rs"]
pub mod features;

/// Rating model.
#[path = "model/main.rs"]
pub mod model;

/// Train/test evaluation.
pub mod evaluation;

/// Worker pool and telemetry carried through every stage.
pub mod context;

/// Telemetry helpers for structured run logs.
pub mod telemetry;

/// Pipeline configuration.
pub mod config;

/// Stage runners.
pub mod runner;

pub use config::PipelineConfig;
pub use context::ExecutionContext;
pub use evaluation::{evaluate_model, EvaluationReport, InputOutputData};
pub use features::{collector::warm_cache, FeatureConfig};
pub use flatten::{clean_gift_amount, flatten_reviews, read_flattened_csv, RewritePath};
pub use model::{RatingModelSpec, ReviewRatingModel};
pub use rewrite::{rewrite_child, rewrite_child_rowwise, rewrite_children, ChildRewrite, Mappings};
pub use table::Table;
pub use telemetry::PipelineTelemetry;
