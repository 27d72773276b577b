use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};

use futures::future::BoxFuture;
use thiserror::Error;
use tokio::{sync::mpsc, time::sleep};
use tracing::{debug, error, info, warn};

use crate::{dao::models::ConnectionKey, services::presence_service::PresenceService};

const RETRY_INITIAL_DELAY: Duration = Duration::from_millis(1_000);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(30);

/// A delayed "finalize this disconnection" request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferredTask {
    /// Stable key of the task, derived from the connection key.
    pub task_key: String,
    /// Connection the task finalizes.
    pub key: ConnectionKey,
    /// Delay before the task becomes due.
    pub delay: Duration,
    /// Wall-clock time the task becomes due.
    pub due_at: SystemTime,
    /// Number of failed executions so far.
    pub attempt: u32,
}

impl DeferredTask {
    /// Finalize task for `key`, due after `delay`.
    pub fn finalize(key: ConnectionKey, delay: Duration, now: SystemTime) -> Self {
        Self {
            task_key: key.finalize_task_key(),
            key,
            delay,
            due_at: now + delay,
            attempt: 0,
        }
    }

    /// Same task, delayed with exponential backoff after a failed execution.
    pub fn retry(self, now: SystemTime) -> Self {
        let attempt = self.attempt + 1;
        let delay = RETRY_INITIAL_DELAY
            .saturating_mul(1 << self.attempt.min(16))
            .min(RETRY_MAX_DELAY);
        Self {
            delay,
            due_at: now + delay,
            attempt,
            ..self
        }
    }
}

/// Receipt of a scheduled task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferredTaskHandle {
    /// Key of the scheduled task.
    pub task_key: String,
    /// When the task becomes due.
    pub due_at: SystemTime,
}

/// Errors raised while scheduling deferred tasks.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Nothing drains due tasks anymore.
    #[error("deferred task queue is closed")]
    QueueClosed,
}

/// At-least-once delayed execution of finalize tasks.
///
/// There is no cancellation: a task fires even if the connection came back,
/// and the handler re-checks state before acting.
pub trait DeferredTaskScheduler: Send + Sync {
    /// Schedule `task` to run after its delay.
    fn schedule(
        &self,
        task: DeferredTask,
    ) -> BoxFuture<'static, Result<DeferredTaskHandle, SchedulerError>>;
}

/// Scheduler backed by Tokio timers. Due tasks are pushed onto a queue drained by
/// [`run_finalize_worker`].
#[derive(Clone)]
pub struct TokioScheduler {
    due: mpsc::UnboundedSender<DeferredTask>,
}

impl TokioScheduler {
    /// Create the scheduler together with the receiving end of its due queue.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DeferredTask>) {
        let (due, rx) = mpsc::unbounded_channel();
        (Self { due }, rx)
    }
}

impl DeferredTaskScheduler for TokioScheduler {
    fn schedule(
        &self,
        task: DeferredTask,
    ) -> BoxFuture<'static, Result<DeferredTaskHandle, SchedulerError>> {
        let due = self.due.clone();
        Box::pin(async move {
            if due.is_closed() {
                return Err(SchedulerError::QueueClosed);
            }

            let handle = DeferredTaskHandle {
                task_key: task.task_key.clone(),
                due_at: task.due_at,
            };
            debug!(
                task_key = %task.task_key,
                delay_ms = task.delay.as_millis() as u64,
                attempt = task.attempt,
                "deferred task scheduled"
            );

            tokio::spawn(async move {
                sleep(task.delay).await;
                let task_key = task.task_key.clone();
                if due.send(task).is_err() {
                    warn!(%task_key, "deferred task dropped: queue closed");
                }
            });

            Ok(handle)
        })
    }
}

/// Drain due finalize tasks, running each through the presence facade.
///
/// Failed executions are rescheduled with backoff so that a finalize is never lost
/// to a transient storage outage.
pub async fn run_finalize_worker(
    presence: Arc<PresenceService>,
    scheduler: Arc<dyn DeferredTaskScheduler>,
    mut due: mpsc::UnboundedReceiver<DeferredTask>,
) {
    info!("finalize worker started");

    while let Some(task) = due.recv().await {
        match presence.finalize_disconnection(task.key).await {
            Ok(_) => {
                debug!(task_key = %task.task_key, "deferred finalize executed");
            }
            Err(err) => {
                let retry = task.retry(presence.now());
                warn!(
                    task_key = %retry.task_key,
                    attempt = retry.attempt,
                    retry_in_ms = retry.delay.as_millis() as u64,
                    error = %err,
                    "deferred finalize failed; rescheduling"
                );
                if let Err(err) = scheduler.schedule(retry).await {
                    error!(error = %err, "failed to reschedule deferred finalize");
                }
            }
        }
    }

    info!("deferred task queue closed; finalize worker stopping");
}

#[cfg(test)]
mod tests {
    use std::time::UNIX_EPOCH;

    use tokio::time::timeout;

    use super::*;
    use crate::dao::models::PresenceContext;

    fn key() -> ConnectionKey {
        ConnectionKey::new(3, PresenceContext::debate(9))
    }

    #[test]
    fn finalize_task_is_keyed_by_connection() {
        let now = UNIX_EPOCH + Duration::from_secs(100);
        let task = DeferredTask::finalize(key(), Duration::from_secs(20), now);

        assert_eq!(task.task_key, "finalize-disconnection:3:debate:9");
        assert_eq!(task.due_at, now + Duration::from_secs(20));
    }

    #[test]
    fn retry_backs_off_up_to_cap() {
        let now = UNIX_EPOCH;
        let task = DeferredTask::finalize(key(), Duration::from_secs(20), now);

        let first = task.retry(now);
        assert_eq!(first.attempt, 1);
        assert_eq!(first.delay, Duration::from_secs(1));

        let second = first.retry(now);
        assert_eq!(second.delay, Duration::from_secs(2));

        let mut capped = second;
        for _ in 0..10 {
            capped = capped.retry(now);
        }
        assert_eq!(capped.delay, RETRY_MAX_DELAY);
    }

    #[tokio::test]
    async fn tokio_scheduler_delivers_after_delay() {
        let (scheduler, mut rx) = TokioScheduler::new();
        let task = DeferredTask::finalize(key(), Duration::from_millis(10), SystemTime::now());

        let handle = scheduler.schedule(task.clone()).await.unwrap();
        assert_eq!(handle.task_key, task.task_key);

        let delivered = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivered, task);
    }

    #[tokio::test]
    async fn scheduling_fails_once_queue_is_dropped() {
        let (scheduler, rx) = TokioScheduler::new();
        drop(rx);

        let task = DeferredTask::finalize(key(), Duration::from_millis(10), SystemTime::now());
        assert!(matches!(
            scheduler.schedule(task).await,
            Err(SchedulerError::QueueClosed)
        ));
    }
}
