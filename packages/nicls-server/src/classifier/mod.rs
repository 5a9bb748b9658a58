//! Windowing, cadence and mode control for one classification session.
//!
//! The classifier subscribes to an acquisition reader's frames, keeps the
//! most recent window in a ring buffer and, once the buffer is full, turns
//! every `classify_interval` frames into a job for the shared worker pool.
//! A pending `encoding` request turns the next full window into a baseline
//! update instead.
//!
//! Jobs carry a snapshot of the window, the configuration and the baseline
//! statistics as they were at submission. Each job gets a monotonic window
//! id; a result older than one already published is dropped.

pub mod model;
pub mod ring_buffer;
pub mod stats;

use crate::acquisition::{Frame, FrameTopic};
use crate::bus::{EventBus, PublisherId, SubscriptionId, Topic};
use crate::config::ExperimentConfig;
use crate::jobs::{ClassificationJob, ClassificationResult, JobError, JobKind, JobOutput, WorkerPool};
use chrono::Utc;
use model::LogisticModel;
use parking_lot::Mutex;
use ring_buffer::{BufferMetrics, FrameRingBuffer};
use serde::Serialize;
use stats::{NormalizationStats, OnlineStatistics, StatsError};
use std::sync::{Arc, Weak};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};

/// Results produced by a [`Classifier`]
pub struct ClassifierTopic;

impl Topic for ClassifierTopic {
    const NAME: &'static str = "classifier.result";
    type Message = ClassificationResult;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ModeFlags {
    /// Classification armed
    pub enabled: bool,
    /// Next full window updates the baseline
    pub encoding: bool,
    /// Baseline collection session open
    pub read_only: bool,
}

/// Point-in-time view of a classifier, for logs and tests
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassifierStatus {
    pub mode: ModeFlags,
    pub buffer: BufferMetrics,
    /// Full-buffer frames seen while enabled
    pub counter: u64,
    pub classify_jobs: u64,
    pub baseline_jobs: u64,
    pub baseline_count: u64,
    pub has_baseline: bool,
}

struct ClassifierState {
    buffer: FrameRingBuffer,
    mode: ModeFlags,
    counter: u64,
    classify_jobs: u64,
    baseline_jobs: u64,
    baseline: OnlineStatistics,
    // Bumped on reset so in-flight baseline jobs from before are ignored
    baseline_epoch: u64,
    normalization: Option<Arc<NormalizationStats>>,
}

struct ClassifierInner {
    id: PublisherId,
    config: Arc<ExperimentConfig>,
    model: Arc<LogisticModel>,
    pool: WorkerPool,
    bus: EventBus,
    interval: u64,
    state: Mutex<ClassifierState>,
    next_window: Mutex<u64>,
    // One past the newest published window id; 0 before the first result
    newest_published: Mutex<u64>,
    subscription: Mutex<Option<SubscriptionId>>,
    tracker: TaskTracker,
}

pub struct Classifier {
    inner: Arc<ClassifierInner>,
}

impl Classifier {
    /// Create a classifier fed by frames that `source` publishes
    pub fn new(
        config: Arc<ExperimentConfig>,
        model: Arc<LogisticModel>,
        pool: WorkerPool,
        bus: EventBus,
        source: &PublisherId,
    ) -> Self {
        let capacity = config.buffer_capacity();
        let interval = config.classify_interval() as u64;

        let inner = Arc::new(ClassifierInner {
            id: PublisherId::new(),
            config,
            model,
            pool,
            bus: bus.clone(),
            interval,
            state: Mutex::new(ClassifierState {
                buffer: FrameRingBuffer::new(capacity),
                mode: ModeFlags {
                    enabled: true,
                    encoding: false,
                    read_only: false,
                },
                counter: 0,
                classify_jobs: 0,
                baseline_jobs: 0,
                baseline: OnlineStatistics::new(),
                baseline_epoch: 0,
                normalization: None,
            }),
            next_window: Mutex::new(0),
            newest_published: Mutex::new(0),
            subscription: Mutex::new(None),
            tracker: TaskTracker::new(),
        });

        let weak: Weak<ClassifierInner> = Arc::downgrade(&inner);
        let subscription = bus.subscribe::<FrameTopic, _>(source, move |frame| {
            if let Some(inner) = weak.upgrade() {
                inner.on_frame(Arc::clone(frame));
            }
            Ok(())
        });
        *inner.subscription.lock() = Some(subscription);

        info!(
            classifier = %inner.id,
            source = %source,
            capacity,
            interval,
            "Classifier created"
        );

        Self { inner }
    }

    /// Identity results are published under
    pub fn id(&self) -> &PublisherId {
        &self.inner.id
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.inner.config
    }

    /// Feed one frame directly, as the frame subscription does
    pub fn on_frame(&self, frame: Arc<Frame>) {
        self.inner.on_frame(frame);
    }

    pub fn enable(&self) {
        self.inner.state.lock().mode.enabled = true;
        info!(classifier = %self.inner.id, "Classification enabled");
    }

    /// Stop firing new jobs. Jobs already dispatched still complete and
    /// publish.
    pub fn disable(&self) {
        self.inner.state.lock().mode.enabled = false;
        info!(classifier = %self.inner.id, "Classification disabled");
    }

    pub fn set_encoding(&self, encoding: bool) {
        self.inner.state.lock().mode.encoding = encoding;
        debug!(classifier = %self.inner.id, encoding, "Encoding flag set");
    }

    /// Open (`true`) or close (`false`) a baseline collection session.
    ///
    /// Opening clears the running statistics. Closing freezes them into
    /// the normalization used by later classifications and returns them.
    pub fn set_read_only(
        &self,
        enable: bool,
    ) -> Result<Option<Arc<NormalizationStats>>, StatsError> {
        let mut state = self.inner.state.lock();
        if enable {
            state.baseline.reset();
            state.baseline_epoch += 1;
            state.mode.read_only = true;
            info!(classifier = %self.inner.id, "Baseline collection started");
            return Ok(None);
        }

        let finalized = Arc::new(state.baseline.finalize()?);
        state.normalization = Some(Arc::clone(&finalized));
        state.mode.read_only = false;
        info!(
            classifier = %self.inner.id,
            windows = finalized.count,
            "Baseline statistics finalized"
        );
        Ok(Some(finalized))
    }

    pub fn mode(&self) -> ModeFlags {
        self.inner.state.lock().mode
    }

    pub fn normalization(&self) -> Option<Arc<NormalizationStats>> {
        self.inner.state.lock().normalization.clone()
    }

    pub fn status(&self) -> ClassifierStatus {
        let state = self.inner.state.lock();
        ClassifierStatus {
            mode: state.mode,
            buffer: state.buffer.metrics(),
            counter: state.counter,
            classify_jobs: state.classify_jobs,
            baseline_jobs: state.baseline_jobs,
            baseline_count: state.baseline.count(),
            has_baseline: state.normalization.is_some(),
        }
    }

    /// Jobs dispatched and not yet finished
    pub fn pending_jobs(&self) -> usize {
        self.inner.tracker.len()
    }

    /// Wait until every dispatched job has finished
    pub async fn flush(&self) {
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.inner.tracker.reopen();
    }

    /// Stop receiving frames and wait for outstanding jobs
    pub async fn shutdown(&self) {
        self.inner.detach();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        info!(classifier = %self.inner.id, status = ?self.status(), "Classifier shut down");
    }
}

impl Drop for Classifier {
    fn drop(&mut self) {
        self.inner.detach();
    }
}

impl ClassifierInner {
    fn detach(&self) {
        if let Some(subscription) = self.subscription.lock().take() {
            self.bus.unsubscribe(subscription);
        }
    }

    fn on_frame(self: &Arc<Self>, frame: Arc<Frame>) {
        let (job, epoch) = {
            let mut state = self.state.lock();
            state.buffer.push(frame);

            if !state.buffer.is_full() {
                trace!(
                    classifier = %self.id,
                    buffered = state.buffer.len(),
                    "Not enough data yet"
                );
                return;
            }

            let kind = if state.mode.encoding {
                state.mode.encoding = false;
                state.baseline_jobs += 1;
                JobKind::Baseline
            } else if state.mode.enabled {
                state.counter += 1;
                if state.counter % self.interval != 0 {
                    return;
                }
                state.classify_jobs += 1;
                JobKind::Classify
            } else {
                return;
            };

            let Some(window) = state.buffer.snapshot() else {
                error!(classifier = %self.id, "Buffered frames have inconsistent shapes");
                return;
            };

            let job = ClassificationJob {
                window_id: self.next_window_id(),
                kind,
                window,
                config: Arc::clone(&self.config),
                model: Arc::clone(&self.model),
                stats: state.normalization.clone(),
                submitted_at: Utc::now(),
            };
            (job, state.baseline_epoch)
        };

        debug!(
            classifier = %self.id,
            window_id = job.window_id,
            kind = ?job.kind,
            "Dispatching job"
        );
        let inner = Arc::clone(self);
        self.tracker.spawn(async move { inner.complete(job, epoch).await });
    }

    fn next_window_id(&self) -> u64 {
        let mut next = self.next_window.lock();
        let id = *next;
        *next += 1;
        id
    }

    async fn complete(&self, job: ClassificationJob, epoch: u64) {
        let window_id = job.window_id;
        let submitted_at = job.submitted_at;

        let output = self
            .pool
            .execute(move || job.run())
            .await
            .and_then(|result| result.map_err(JobError::from));

        let elapsed_ms = (Utc::now() - submitted_at).num_milliseconds();
        match output {
            Ok(JobOutput::Classified(outcome)) => {
                debug!(classifier = %self.id, window_id, elapsed_ms, "Classification finished");
                self.publish_result(ClassificationResult {
                    result: outcome.result,
                    probability: outcome.probability,
                    window_id,
                });
            }
            Ok(JobOutput::Baseline(features)) => {
                let mut state = self.state.lock();
                if state.baseline_epoch != epoch {
                    warn!(classifier = %self.id, window_id, "Discarding baseline window from a reset session");
                    return;
                }
                match state.baseline.update(&features) {
                    Ok(()) => info!(
                        classifier = %self.id,
                        window_id,
                        count = state.baseline.count(),
                        "Baseline updated"
                    ),
                    Err(e) => error!(classifier = %self.id, window_id, "Baseline update failed: {}", e),
                }
            }
            Err(e) => {
                error!(classifier = %self.id, window_id, "Job failed: {}", e);
            }
        }
    }

    fn publish_result(&self, result: ClassificationResult) {
        let mut newest = self.newest_published.lock();
        if result.window_id < *newest {
            warn!(
                classifier = %self.id,
                window_id = result.window_id,
                newest = *newest - 1,
                "Dropping stale classification result"
            );
            return;
        }
        *newest = result.window_id + 1;

        if let Err(e) = self.bus.publish::<ClassifierTopic>(&self.id, &result) {
            error!(classifier = %self.id, "Failed to publish result: {}", e);
        }
    }
}
