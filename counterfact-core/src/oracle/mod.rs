//! Prediction oracle adapter.
//!
//! Wraps the caller-supplied [`Predictor`] with batching, a bounded worker
//! pool, per-call timeouts, per-instance failure isolation and retries.
//! Outputs are always returned in input order, one per input. Predictors
//! that can fail single rows report them through
//! [`Predictor::predict_partial`]; only the failed rows are retried.

pub mod retry;

use crate::config::OracleConfig;
use crate::error::OracleError;
use crate::goal::panic_message;
use crate::instance::{Instance, Output};
use async_trait::async_trait;
use futures::FutureExt;
use futures::future::join_all;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

pub use retry::{compute_backoff, worst_case_duration};

/// The black-box model being explained.
///
/// `predict` must return one output per input, in input order. It may be
/// slow, remote, or fail; the adapter absorbs all of that.
#[async_trait]
pub trait Predictor: Send + Sync {
    async fn predict(&self, inputs: &[Instance]) -> Result<Vec<Output>, OracleError>;

    /// One result per input, in input order, so single rows can fail
    /// without failing the call. An `Err` fails every row of the call.
    ///
    /// The adapter always calls this method; the default succeeds or fails
    /// as a whole through [`predict`](Self::predict).
    async fn predict_partial(&self, inputs: &[Instance]) -> Result<Vec<Prediction>, OracleError> {
        let outputs = self.predict(inputs).await?;
        Ok(outputs.into_iter().map(Ok).collect())
    }

    /// Name used in logs.
    fn name(&self) -> &str {
        "predictor"
    }
}

/// Outcome of predicting a single instance.
pub type Prediction = Result<Output, OracleError>;

/// Batching, timeout-enforcing front of a [`Predictor`].
#[derive(Clone)]
pub struct OracleAdapter {
    predictor: Arc<dyn Predictor>,
    config: OracleConfig,
    permits: Arc<Semaphore>,
    calls: Arc<AtomicUsize>,
}

impl OracleAdapter {
    pub fn new(predictor: Arc<dyn Predictor>, config: OracleConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.parallelism.max(1)));
        Self {
            predictor,
            config,
            permits,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn config(&self) -> &OracleConfig {
        &self.config
    }

    /// Number of calls made to the underlying predictor so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    /// Predict every instance, returning one result per input in order.
    ///
    /// Failed instances are retried up to `retries` times with exponential
    /// backoff; whatever still fails is returned as an error in its slot.
    pub async fn predict_batch(&self, instances: &[Instance]) -> Vec<Prediction> {
        let shared: Arc<Vec<Instance>> = Arc::new(instances.to_vec());
        let mut results: Vec<Option<Prediction>> = vec![None; instances.len()];
        let mut pending: Vec<usize> = (0..instances.len()).collect();
        let mut attempt = 0;

        while !pending.is_empty() {
            for &index in &pending {
                results[index] = None;
            }
            let mut failed = Vec::new();
            for (index, prediction) in self.run_round(&shared, &pending).await {
                if prediction.is_err() {
                    failed.push(index);
                }
                results[index] = Some(prediction);
            }
            for &index in &pending {
                if results[index].is_none() {
                    failed.push(index);
                    results[index] = Some(Err(OracleError::call_failed("prediction task was lost")));
                }
            }

            if failed.is_empty() || attempt >= self.config.retries {
                if !failed.is_empty() {
                    warn!(
                        predictor = self.predictor.name(),
                        failed = failed.len(),
                        attempts = attempt + 1,
                        "Predictions still failing after retries"
                    );
                }
                break;
            }

            let backoff = compute_backoff(&self.config, attempt);
            debug!(
                failed = failed.len(),
                attempt = attempt + 1,
                max = self.config.retries,
                backoff_ms = backoff.as_millis() as u64,
                "Retrying failed predictions"
            );
            tokio::time::sleep(backoff).await;
            attempt += 1;
            failed.sort_unstable();
            pending = failed;
        }

        results
            .into_iter()
            .map(|r| r.unwrap_or_else(|| Err(OracleError::call_failed("no prediction produced"))))
            .collect()
    }

    /// One pass over `pending`: chunk, run chunks on the bounded pool, and
    /// pair every prediction with its input index.
    async fn run_round(
        &self,
        instances: &Arc<Vec<Instance>>,
        pending: &[usize],
    ) -> Vec<(usize, Prediction)> {
        let mut tasks = JoinSet::new();
        for chunk in pending.chunks(self.config.batch_size.max(1)) {
            let indices = chunk.to_vec();
            let instances = Arc::clone(instances);
            let predictor = Arc::clone(&self.predictor);
            let permits = Arc::clone(&self.permits);
            let calls = Arc::clone(&self.calls);
            let timeout = self.config.timeout();

            tasks.spawn(async move {
                // The semaphore is never closed, so acquisition only fails on shutdown.
                let _permit = permits.acquire_owned().await.ok();
                let batch: Vec<Instance> = indices.iter().map(|&i| instances[i].clone()).collect();
                let predictions = call_isolated(predictor.as_ref(), &batch, timeout, &calls).await;
                indices.into_iter().zip(predictions).collect::<Vec<_>>()
            });
        }

        let mut out = Vec::with_capacity(pending.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(pairs) => out.extend(pairs),
                Err(e) => warn!(error = %e, "Prediction task aborted"),
            }
        }
        out
    }
}

/// Call the predictor on `batch`. If the call fails for a reason other than
/// a timeout, each instance is retried alone so that one bad instance yields
/// one failed prediction instead of failing the whole batch.
async fn call_isolated(
    predictor: &dyn Predictor,
    batch: &[Instance],
    timeout: Duration,
    calls: &AtomicUsize,
) -> Vec<Prediction> {
    match call_once(predictor, batch, timeout, calls).await {
        Ok(predictions) => predictions,
        Err(e @ OracleError::Timeout { .. }) => vec![Err(e); batch.len()],
        Err(e) if batch.len() > 1 => {
            debug!(
                predictor = predictor.name(),
                batch = batch.len(),
                error = %e,
                "Batch call failed, isolating instances"
            );
            let singles = batch.iter().map(|instance| async move {
                call_once(predictor, std::slice::from_ref(instance), timeout, calls)
                    .await
                    .and_then(|mut predictions| {
                        predictions.pop().unwrap_or(Err(OracleError::LengthMismatch {
                            expected: 1,
                            actual: 0,
                        }))
                    })
            });
            join_all(singles).await
        }
        Err(e) => vec![Err(e)],
    }
}

async fn call_once(
    predictor: &dyn Predictor,
    batch: &[Instance],
    timeout: Duration,
    calls: &AtomicUsize,
) -> Result<Vec<Prediction>, OracleError> {
    calls.fetch_add(1, Ordering::Relaxed);
    let call = AssertUnwindSafe(predictor.predict_partial(batch)).catch_unwind();
    match tokio::time::timeout(timeout, call).await {
        Err(_) => Err(OracleError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        }),
        Ok(Err(payload)) => Err(OracleError::Panicked {
            message: panic_message(payload.as_ref()),
        }),
        Ok(Ok(Err(e))) => Err(e),
        Ok(Ok(Ok(predictions))) if predictions.len() != batch.len() => {
            Err(OracleError::LengthMismatch {
                expected: batch.len(),
                actual: predictions.len(),
            })
        }
        Ok(Ok(Ok(predictions))) => Ok(predictions),
    }
}
