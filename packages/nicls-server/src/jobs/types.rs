use crate::classifier::model::LogisticModel;
use crate::classifier::stats::NormalizationStats;
use crate::config::ExperimentConfig;
use crate::signal_processing::{
    classify, compute_features, Classification, PipelineError, PipelineResult,
};
use chrono::{DateTime, Utc};
use ndarray::{Array1, Array2};
use serde::Serialize;
use std::sync::Arc;

/// What a job does with its window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Features feed the baseline statistics
    Baseline,
    /// Features are normalized and classified
    Classify,
}

/// Immutable snapshot handed to the worker pool
#[derive(Debug, Clone)]
pub struct ClassificationJob {
    pub window_id: u64,
    pub kind: JobKind,
    /// (channels, samples), oldest sample first
    pub window: Array2<f64>,
    pub config: Arc<ExperimentConfig>,
    pub model: Arc<LogisticModel>,
    /// Baseline frozen at submission time
    pub stats: Option<Arc<NormalizationStats>>,
    pub submitted_at: DateTime<Utc>,
}

/// Worker output
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutput {
    Baseline(Array1<f64>),
    Classified(Classification),
}

impl ClassificationJob {
    /// Pipeline body, run on a worker thread
    pub fn run(&self) -> PipelineResult<JobOutput> {
        let features = compute_features(&self.window, &self.config)?;
        match self.kind {
            JobKind::Baseline => Ok(JobOutput::Baseline(features)),
            JobKind::Classify => classify(&features, self.stats.as_deref(), &self.model)
                .map(JobOutput::Classified),
        }
    }
}

/// Published on the classifier's result topic
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ClassificationResult {
    pub result: bool,
    pub probability: f64,
    pub window_id: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Worker pool is closed")]
    PoolClosed,

    #[error("Worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}
