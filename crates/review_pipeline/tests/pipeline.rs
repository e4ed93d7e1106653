use std::{fs, io::Write, path::Path};

use flate2::{write::GzEncoder, Compression};
use review_pipeline::{
    config::PipelineConfig,
    features::encoder::EncoderConfig,
    flatten::{GIFT_AMOUNT_CHILD, GIFT_AMOUNT_COLUMN, STYLE_COLUMN},
    model::MlpConfig,
    runner::{run_flatten_configured, run_predict, run_training, run_warm_cache},
    ExecutionContext, PipelineTelemetry, RewritePath, ReviewRatingModel, Table,
};
use serde_json::json;
use shared_logging::LogLevel;
use tempfile::tempdir;

const TEXTS: [&str; 6] = [
    "Great gift, my sister loved it",
    "Card arrived late and the code did not work",
    "Perfect last minute present",
    "Terrible customer service",
    "Easy to send by email",
    "Never received the card",
];

fn write_reviews(path: &Path, rows: usize) {
    let file = fs::File::create(path).unwrap();
    let mut encoder = GzEncoder::new(file, Compression::default());
    for idx in 0..rows {
        let mut record = json!({
            "overall": (idx % 5 + 1) as f64,
            "reviewerID": format!("A{idx}"),
            "asin": format!("B{}", idx % 3),
            "unixReviewTime": 1_376_352_000 + idx,
            "style": { "Gift Amount:": format!(" {} ", 25 * (idx % 4 + 1)) },
            "reviewText": TEXTS[idx % TEXTS.len()],
        });
        if idx == 3 {
            record["reviewText"] = json!(null);
        }
        writeln!(encoder, "{record}").unwrap();
    }
    encoder.finish().unwrap();
}

#[test]
fn gift_amount_is_cleaned_to_an_integer() {
    let table = Table::from_json_lines(std::io::Cursor::new(
        r#"{"style": {"Gift Amount:": " 25 "}, "reviewText": "Great", "overall": 5}"#,
    ))
    .unwrap();
    let ctx = ExecutionContext::new(1).unwrap();
    let cleaned =
        review_pipeline::clean_gift_amount(&ctx, &table, RewritePath::Expression).unwrap();
    let style = &cleaned.rows()[0][STYLE_COLUMN];
    assert_eq!(style[GIFT_AMOUNT_COLUMN], json!(25));
    assert!(style.get(GIFT_AMOUNT_CHILD).is_none());
    assert_eq!(cleaned.rows()[0]["reviewText"], json!("Great"));
}

#[test]
fn end_to_end_flatten_warm_train_predict() {
    let dir = tempdir().unwrap();
    let raw = dir.path().join("Gift_Cards.json.gz");
    write_reviews(&raw, 40);

    let config = PipelineConfig {
        input: raw.clone(),
        flattened_csv: dir.path().join("flattenedGifts.csv"),
        model_path: dir.path().join("models/reviewClassifier-v1.json"),
        rewrite_path: RewritePath::RowLevel,
        test_fraction: 0.1,
        features: review_pipeline::FeatureConfig {
            encoder: EncoderConfig::HashingMean {
                dimension: 16,
                seed: 5,
            },
            cache_path: Some(dir.path().join("sentenceCache.sqlite")),
            ..Default::default()
        },
        mlp: MlpConfig {
            hidden_dims: vec![8, 4],
            epochs: 15,
            learning_rate: 0.01,
            batch_size: 8,
            seed: 3,
        },
        log_file: Some(dir.path().join("run.log")),
        ..PipelineConfig::default()
    };
    config.validate().unwrap();
    let telemetry = PipelineTelemetry::builder("pipeline")
        .log_path(config.log_file.clone().unwrap())
        .min_level(LogLevel::Info)
        .build()
        .unwrap();
    let ctx = ExecutionContext::new(2).unwrap().with_telemetry(telemetry);

    let flattened = run_flatten_configured(&ctx, &config).unwrap();
    assert_eq!(flattened.rows, 40);
    assert_eq!(
        flattened.columns,
        vec!["identifier", "Gift_Amount", "overall", "reviewText"]
    );

    let warmed = run_warm_cache(&ctx, &config).unwrap();
    assert_eq!(warmed.computed, 39);
    assert_eq!(warmed.skipped, 0);
    let rewarmed = run_warm_cache(&ctx, &config).unwrap();
    assert_eq!(rewarmed.cached, 39);
    assert_eq!(rewarmed.computed, 0);

    let report = run_training(&ctx, &config).unwrap();
    assert_eq!(report.test_samples, 4);
    assert_eq!(report.train_samples, 35);
    assert!(report.metrics.mse.is_finite());

    let predictions = run_predict(&ctx, &config.model_path, &config.flattened_csv).unwrap();
    assert_eq!(predictions.len(), 40);
    assert_eq!(predictions[0].identifier, "B0_A0_1376352000");
    assert!(predictions[3].rating.is_none());
    assert_eq!(predictions.iter().filter(|p| p.rating.is_some()).count(), 39);

    let again = run_predict(&ctx, &config.model_path, &config.flattened_csv).unwrap();
    assert_eq!(predictions, again);
    let model = ReviewRatingModel::load(&config.model_path).unwrap();
    assert_eq!(model.regressor().input_dim(), 16);

    let records = shared_logging::read_records(config.log_file.as_ref().unwrap()).unwrap();
    let messages: Vec<_> = records.iter().map(|r| r.message.as_str()).collect();
    for expected in [
        "flatten.completed",
        "features.cache_warmed",
        "train.start",
        "train.evaluated",
        "train.saved",
        "predict.completed",
    ] {
        assert!(messages.contains(&expected), "missing {expected}");
    }
    let flatten_record = records
        .iter()
        .find(|r| r.message == "flatten.completed")
        .unwrap();
    assert_eq!(flatten_record.metadata["rewrite_path"], json!("row_level"));
    assert_eq!(
        flatten_record.metadata["input"],
        json!(raw.display().to_string())
    );
}
