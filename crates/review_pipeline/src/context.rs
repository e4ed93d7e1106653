use std::num::NonZeroUsize;

use rayon::{ThreadPool, ThreadPoolBuildError, ThreadPoolBuilder};

use crate::telemetry::PipelineTelemetry;

/// Execution context passed explicitly to every stage that fans out work.
///
/// Owns the worker pool used for row-level transforms and the optional run
/// telemetry, so nothing in the pipeline reaches for process-wide state.
#[derive(Debug)]
pub struct ExecutionContext {
    pool: ThreadPool,
    telemetry: Option<PipelineTelemetry>,
}

impl ExecutionContext {
    /// Creates a context with a fixed number of workers (at least one).
    pub fn new(workers: usize) -> Result<Self, ThreadPoolBuildError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .thread_name(|idx| format!("gcr-worker-{idx}"))
            .build()?;
        Ok(Self {
            pool,
            telemetry: None,
        })
    }

    /// Creates a context sized to the machine's available parallelism.
    pub fn local() -> Result<Self, ThreadPoolBuildError> {
        Self::new(
            std::thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1),
        )
    }

    /// Attaches run telemetry.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: PipelineTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Number of worker threads.
    #[must_use]
    pub fn workers(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Run telemetry, if attached.
    #[must_use]
    pub fn telemetry(&self) -> Option<&PipelineTelemetry> {
        self.telemetry.as_ref()
    }

    /// Runs `op` inside the worker pool.
    pub fn install<R: Send>(&self, op: impl FnOnce() -> R + Send) -> R {
        self.pool.install(op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rayon::prelude::*;

    #[test]
    fn runs_parallel_work_in_own_pool() {
        let ctx = ExecutionContext::new(2).unwrap();
        assert_eq!(ctx.workers(), 2);
        let total: u64 = ctx.install(|| (1..=100u64).into_par_iter().sum());
        assert_eq!(total, 5050);
        assert!(ctx.telemetry().is_none());
    }

    #[test]
    fn zero_workers_clamps_to_one() {
        let ctx = ExecutionContext::new(0).unwrap();
        assert_eq!(ctx.workers(), 1);
    }
}
