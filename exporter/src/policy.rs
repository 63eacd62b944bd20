//! Request policy for the fan-out phases.
//!
//! Each run builds its own [`RequestPolicy`], so no limiter state is shared
//! between runs. The policy bounds two things:
//! - how many requests are in flight at once (a semaphore), and
//! - how often a new request may start. Dispatches are spaced
//!   `interval / rate` apart, which also covers fractional rates such as one
//!   request every four seconds.
use crate::config::{MAX_SPACING, RateLimitConfig};
use crate::errors::SyncError;
use crate::source::UpstreamError;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep_until};

pub struct RequestPolicy {
    spacing: Duration,
    next_dispatch: Mutex<Instant>,
    in_flight: Arc<Semaphore>,
}

impl RequestPolicy {
    /// A config that failed validation gets the widest allowed spacing.
    pub fn new(config: &RateLimitConfig) -> Self {
        RequestPolicy {
            spacing: config.spacing().unwrap_or(MAX_SPACING),
            next_dispatch: Mutex::new(Instant::now()),
            in_flight: Arc::new(Semaphore::new(config.concurrency)),
        }
    }

    /// No spacing and no concurrency bound beyond `concurrency`.
    pub fn unthrottled(concurrency: usize) -> Self {
        RequestPolicy {
            spacing: Duration::ZERO,
            next_dispatch: Mutex::new(Instant::now()),
            in_flight: Arc::new(Semaphore::new(concurrency)),
        }
    }

    pub fn spacing(&self) -> Duration {
        self.spacing
    }

    /// Waits for a free slot and for the next dispatch time. The returned
    /// permit must be held for as long as the request is in flight.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, UpstreamError> {
        let permit = self.in_flight.clone().acquire_owned().await?;

        let dispatch_at = {
            let mut next = self.next_dispatch.lock();
            let slot = (*next).max(Instant::now());
            *next = slot + self.spacing;
            slot
        };
        sleep_until(dispatch_at).await;

        Ok(permit)
    }
}

/// Runs `request` once per input under `policy` and returns the results in
/// input order.
///
/// The first error ends the phase. Requests still running at that point are
/// aborted when the join set is dropped and their results are discarded.
pub async fn fan_out<I, T, F, Fut>(
    policy: Arc<RequestPolicy>,
    inputs: Vec<I>,
    request: F,
) -> Result<Vec<T>, SyncError>
where
    I: Send + 'static,
    T: Send + 'static,
    F: Fn(I) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = Result<T, SyncError>> + Send + 'static,
{
    let mut join_set = JoinSet::new();
    let total = inputs.len();

    for (index, input) in inputs.into_iter().enumerate() {
        let policy = policy.clone();
        let request = request.clone();
        join_set.spawn(async move {
            let result = match policy.acquire().await {
                Ok(_permit) => request(input).await,
                Err(e) => Err(e.into()),
            };
            (index, result)
        });
    }

    let mut slots: Vec<Option<T>> = (0..total).map(|_| None).collect();

    while let Some(joined) = join_set.join_next().await {
        let (index, result) = joined.map_err(UpstreamError::from)?;
        match result {
            Ok(value) => slots[index] = Some(value),
            Err(e) => {
                tracing::warn!(error = %e, pending = join_set.len(), "Request failed, aborting phase");
                return Err(e);
            }
        }
    }

    Ok(slots.into_iter().flatten().collect())
}
