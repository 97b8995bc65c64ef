//! Liveness signal while a stage runs.

use std::future::Future;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tracing::warn;

use troubadour_core::JobId;

use super::store::JobStore;

/// Shortest interval accepted; `tokio::time::interval` rejects zero.
const MIN_INTERVAL: Duration = Duration::from_millis(10);

/// Drive `work` to completion, refreshing the job's `heartbeat_at` every
/// `interval` until it finishes.
///
/// Heartbeat write failures are logged and never interrupt `work`.
pub async fn run_with_heartbeat<F>(
    jobs: &dyn JobStore,
    job_id: JobId,
    interval: Duration,
    work: F,
) -> F::Output
where
    F: Future,
{
    let interval = interval.max(MIN_INTERVAL);
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tokio::pin!(work);
    loop {
        tokio::select! {
            output = &mut work => return output,
            _ = ticker.tick() => {
                if let Err(e) = jobs.heartbeat(job_id).await {
                    warn!(job_id = %job_id, error = %e, "heartbeat update failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::types::{JobKind, NewJob};
    use troubadour_core::{TrackId, UserId};

    #[tokio::test]
    async fn heartbeat_advances_while_work_runs() {
        let store = InMemoryJobStore::new();
        let job = NewJob::new(
            JobKind::Analyze {
                track_id: TrackId::new(),
            },
            UserId::new(),
        )
        .into_job();
        let id = store.enqueue(job).await.unwrap();
        let claimed = store.claim_next().await.unwrap().unwrap();
        let first_beat = claimed.heartbeat_at.unwrap();

        let out = run_with_heartbeat(&store, id, Duration::from_millis(20), async {
            tokio::time::sleep(Duration::from_millis(120)).await;
            42
        })
        .await;
        assert_eq!(out, 42);

        let after = store.get(id).await.unwrap().unwrap();
        assert!(after.heartbeat_at.unwrap() > first_beat);
    }

    #[tokio::test]
    async fn quick_work_returns_without_beating() {
        let store = InMemoryJobStore::new();
        let out = run_with_heartbeat(&store, JobId::new(), Duration::from_secs(30), async { "done" })
            .await;
        assert_eq!(out, "done");
    }
}
