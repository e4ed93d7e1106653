use std::{fmt, path::PathBuf, sync::Arc};

use anyhow::Result;
use serde_json::Value;
use shared_logging::{JsonLogger, LogLevel, LogRecord};
use uuid::Uuid;

/// Builder for pipeline telemetry sinks.
pub struct PipelineTelemetryBuilder {
    stage: String,
    run_id: Option<String>,
    log_path: Option<PathBuf>,
    min_level: LogLevel,
}

impl PipelineTelemetryBuilder {
    /// Creates the builder.
    #[must_use]
    pub fn new(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            run_id: None,
            log_path: None,
            min_level: LogLevel::Debug,
        }
    }

    /// Sets the log path.
    #[must_use]
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Reuses an existing run id instead of generating one.
    #[must_use]
    pub fn run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    /// Drops records below `level`.
    #[must_use]
    pub fn min_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    /// Builds the telemetry handle.
    pub fn build(self) -> Result<PipelineTelemetry> {
        let logger = match self.log_path {
            Some(path) => Some(JsonLogger::new(path)?.with_min_level(self.min_level)),
            None => None,
        };
        Ok(PipelineTelemetry {
            inner: Arc::new(TelemetryInner {
                stage: self.stage,
                run_id: self
                    .run_id
                    .unwrap_or_else(|| format!("run-{}", Uuid::new_v4())),
                logger,
            }),
        })
    }
}

/// Telemetry handle shared across pipeline stages.
#[derive(Clone)]
pub struct PipelineTelemetry {
    inner: Arc<TelemetryInner>,
}

impl fmt::Debug for PipelineTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineTelemetry")
            .field("stage", &self.inner.stage)
            .field("run_id", &self.inner.run_id)
            .finish()
    }
}

struct TelemetryInner {
    stage: String,
    run_id: String,
    logger: Option<JsonLogger>,
}

impl PipelineTelemetry {
    /// Returns a builder.
    #[must_use]
    pub fn builder(stage: impl Into<String>) -> PipelineTelemetryBuilder {
        PipelineTelemetryBuilder::new(stage)
    }

    /// Identifier attached to every record of this run.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.inner.run_id
    }

    /// Logs structured metadata.
    pub fn log(&self, level: LogLevel, message: &str, metadata: Value) -> Result<()> {
        if let Some(logger) = &self.inner.logger {
            let record = LogRecord::new(&self.inner.stage, level, message)
                .with_run_id(&self.inner.run_id)
                .with_metadata(metadata);
            logger.log(&record)?;
        }
        Ok(())
    }
}

/// Logs through an optional telemetry handle, ignoring sink failures.
pub(crate) fn log(
    telemetry: Option<&PipelineTelemetry>,
    level: LogLevel,
    message: &str,
    metadata: Value,
) {
    if let Some(tel) = telemetry {
        if let Err(err) = tel.log(level, message, metadata) {
            tracing::warn!("run log write failed: {err:?}");
        }
    }
}
