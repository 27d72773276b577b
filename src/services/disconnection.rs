use std::{sync::Arc, time::Duration};

use tracing::{debug, info};

use crate::{
    config::PresenceConfig,
    dao::models::{ClientInfo, ConnectionKey, ConnectionRecord},
    error::ServiceError,
    services::{
        recorder::ConnectionRecorder,
        scheduler::{DeferredTask, DeferredTaskHandle, DeferredTaskScheduler},
    },
    state::state_machine::ConnectionState,
};

const OP_HANDLE: &str = "handle_disconnection";
const OP_FINALIZE: &str = "finalize_disconnection";

/// Drives the disconnect path: records the drop and arms the grace period.
pub struct DisconnectionCoordinator {
    recorder: Arc<ConnectionRecorder>,
    scheduler: Arc<dyn DeferredTaskScheduler>,
    config: Arc<PresenceConfig>,
}

impl DisconnectionCoordinator {
    /// Build a coordinator around the shared recorder and scheduler.
    pub fn new(
        recorder: Arc<ConnectionRecorder>,
        scheduler: Arc<dyn DeferredTaskScheduler>,
        config: Arc<PresenceConfig>,
    ) -> Self {
        Self {
            recorder,
            scheduler,
            config,
        }
    }

    /// Record a transport drop and schedule its finalize. Returns the handle of the
    /// scheduled task, or `None` when nothing was recorded.
    pub async fn handle(
        &self,
        key: ConnectionKey,
        client: Option<ClientInfo>,
    ) -> Result<Option<DeferredTaskHandle>, ServiceError> {
        Ok(self.disconnect(key, client).await?.map(|(_, handle)| handle))
    }

    /// Like [`Self::handle`], also returning the written record.
    pub async fn disconnect(
        &self,
        key: ConnectionKey,
        client: Option<ClientInfo>,
    ) -> Result<Option<(ConnectionRecord, DeferredTaskHandle)>, ServiceError> {
        if !self.recorder.subject_exists(OP_HANDLE, key).await? {
            return Ok(None);
        }

        if let Some(record) = self.recorder.latest(key).await?
            && record.state == ConnectionState::TemporarilyDisconnected
        {
            debug!(
                operation = OP_HANDLE,
                subject_id = key.subject_id,
                context = %key.context,
                record_id = %record.id,
                "already temporarily disconnected"
            );
            return Ok(None);
        }

        let Some(record) = self.recorder.record_disconnection(key, client).await? else {
            return Ok(None);
        };

        let grace = self.config.grace_period(key.context.kind);
        let handle = self
            .scheduler
            .schedule(DeferredTask::finalize(key, grace, self.recorder.now()))
            .await?;
        info!(
            operation = OP_HANDLE,
            subject_id = key.subject_id,
            context = %key.context,
            record_id = %record.id,
            grace_secs = grace.as_secs(),
            task_key = %handle.task_key,
            "grace period started"
        );

        Ok(Some((record, handle)))
    }

    /// Run a due finalize task.
    ///
    /// Only a record that is still temporarily disconnected and whose grace period
    /// has elapsed is closed. A task that fires early, because the connection went
    /// down again after it was armed, is pushed back to the end of the current grace
    /// period. Returns the record only when this call closed it.
    pub async fn finalize(
        &self,
        key: ConnectionKey,
    ) -> Result<Option<ConnectionRecord>, ServiceError> {
        let Some(record) = self.recorder.latest(key).await? else {
            debug!(
                operation = OP_FINALIZE,
                subject_id = key.subject_id,
                context = %key.context,
                "finalize ignored: no record"
            );
            return Ok(None);
        };
        if record.state != ConnectionState::TemporarilyDisconnected {
            debug!(
                operation = OP_FINALIZE,
                subject_id = key.subject_id,
                context = %key.context,
                state = %record.state,
                "stale finalize ignored"
            );
            return Ok(None);
        }

        let now = self.recorder.now();
        let grace = self.config.grace_period(key.context.kind);
        let elapsed = record
            .disconnected_at
            .and_then(|down| now.duration_since(down).ok())
            .unwrap_or(Duration::ZERO);
        if elapsed < grace {
            let remaining = grace - elapsed;
            let handle = self
                .scheduler
                .schedule(DeferredTask::finalize(key, remaining, now))
                .await?;
            info!(
                operation = OP_FINALIZE,
                subject_id = key.subject_id,
                context = %key.context,
                record_id = %record.id,
                remaining_secs = remaining.as_secs(),
                task_key = %handle.task_key,
                "grace period still running; finalize rescheduled"
            );
            return Ok(None);
        }

        let checked = record.id;
        let finalized = self.recorder.finalize_record(record).await?;
        match &finalized {
            Some(record) => {
                info!(
                    operation = OP_FINALIZE,
                    subject_id = key.subject_id,
                    context = %key.context,
                    record_id = %record.id,
                    down_secs = elapsed.as_secs(),
                    "connection finalized"
                );
            }
            None => {
                debug!(
                    operation = OP_FINALIZE,
                    subject_id = key.subject_id,
                    context = %key.context,
                    record_id = %checked,
                    "record moved after the grace check; finalize dropped"
                );
            }
        }
        Ok(finalized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dao::models::PresenceContext,
        state::clock::Clock,
        test_support::{Harness, SOFT_DELETED_SUBJECT},
    };

    fn coordinator(harness: &Harness) -> DisconnectionCoordinator {
        DisconnectionCoordinator::new(
            harness.recorder(),
            harness.scheduler.clone(),
            harness.config.clone(),
        )
    }

    #[tokio::test]
    async fn schedules_finalize_with_context_grace() {
        let harness = Harness::new();
        let coordinator = coordinator(&harness);
        let room = ConnectionKey::new(7, PresenceContext::room(1));
        let debate = ConnectionKey::new(7, PresenceContext::debate(2));
        for key in [room, debate] {
            harness.recorder().record_initial_connection(key, None).await.unwrap();
        }

        let room_handle = coordinator.handle(room, None).await.unwrap().unwrap();
        coordinator.handle(debate, None).await.unwrap().unwrap();

        let tasks = harness.scheduler.tasks();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].key, room);
        assert_eq!(tasks[0].delay, Duration::from_secs(60));
        assert_eq!(tasks[1].delay, Duration::from_secs(20));
        assert_eq!(room_handle.task_key, room.finalize_task_key());
        assert_eq!(room_handle.due_at, harness.clock.now() + Duration::from_secs(60));
    }

    #[tokio::test]
    async fn repeated_disconnect_schedules_once() {
        let harness = Harness::new();
        let coordinator = coordinator(&harness);
        let key = ConnectionKey::new(7, PresenceContext::room(1));
        harness.recorder().record_initial_connection(key, None).await.unwrap();

        assert!(coordinator.handle(key, None).await.unwrap().is_some());
        assert!(coordinator.handle(key, None).await.unwrap().is_none());
        assert_eq!(harness.scheduler.tasks().len(), 1);
    }

    #[tokio::test]
    async fn unknown_subject_or_missing_record_is_ignored() {
        let harness = Harness::new();
        let coordinator = coordinator(&harness);

        let stranger = ConnectionKey::new(404, PresenceContext::room(1));
        assert!(coordinator.handle(stranger, None).await.unwrap().is_none());

        let never_connected = ConnectionKey::new(7, PresenceContext::room(1));
        assert!(coordinator.handle(never_connected, None).await.unwrap().is_none());
        assert!(harness.scheduler.tasks().is_empty());
    }

    #[tokio::test]
    async fn soft_deleted_subject_is_still_tracked() {
        let harness = Harness::new();
        let coordinator = coordinator(&harness);
        let key = ConnectionKey::new(SOFT_DELETED_SUBJECT, PresenceContext::room(1));
        harness.recorder().record_initial_connection(key, None).await.unwrap();

        assert!(coordinator.handle(key, None).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn finalize_after_grace_closes_connection() {
        let harness = Harness::new();
        let coordinator = coordinator(&harness);
        let key = ConnectionKey::new(7, PresenceContext::debate(2));
        harness.recorder().record_initial_connection(key, None).await.unwrap();
        coordinator.handle(key, None).await.unwrap();

        harness.clock.advance(Duration::from_secs(20));
        let closed = coordinator.finalize(key).await.unwrap().unwrap();

        assert_eq!(closed.state, ConnectionState::Disconnected);
        assert!(coordinator.finalize(key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn finalize_after_reconnection_is_noop() {
        let harness = Harness::new();
        let coordinator = coordinator(&harness);
        let recorder = harness.recorder();
        let key = ConnectionKey::new(7, PresenceContext::room(1));
        recorder.record_initial_connection(key, None).await.unwrap();
        coordinator.handle(key, None).await.unwrap();
        harness.clock.advance(Duration::from_secs(10));
        recorder.record_reconnection(key, None).await.unwrap();

        harness.clock.advance(Duration::from_secs(60));
        assert!(coordinator.finalize(key).await.unwrap().is_none());

        let latest = recorder.latest(key).await.unwrap().unwrap();
        assert_eq!(latest.state, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn early_finalize_is_rescheduled_for_remaining_grace() {
        let harness = Harness::new();
        let coordinator = coordinator(&harness);
        let recorder = harness.recorder();
        let key = ConnectionKey::new(7, PresenceContext::room(1));
        recorder.record_initial_connection(key, None).await.unwrap();
        coordinator.handle(key, None).await.unwrap();
        harness.clock.advance(Duration::from_secs(10));
        recorder.record_reconnection(key, None).await.unwrap();
        harness.clock.advance(Duration::from_secs(20));
        coordinator.handle(key, None).await.unwrap();

        // The first task fires 60s after the first drop, 30s into the second one.
        harness.clock.advance(Duration::from_secs(30));
        assert!(coordinator.finalize(key).await.unwrap().is_none());

        let tasks = harness.scheduler.tasks();
        assert_eq!(tasks.len(), 3);
        assert_eq!(tasks[2].delay, Duration::from_secs(30));
        let latest = recorder.latest(key).await.unwrap().unwrap();
        assert_eq!(latest.state, ConnectionState::TemporarilyDisconnected);
    }

    #[tokio::test]
    async fn finalize_skips_new_drop_committed_after_grace_check() {
        let harness = Harness::new();
        let racing = harness.racing_store();
        let coordinator = DisconnectionCoordinator::new(
            harness.recorder_over(racing.clone()),
            harness.scheduler.clone(),
            harness.config.clone(),
        );
        let key = ConnectionKey::new(7, PresenceContext::room(1));
        harness.recorder().record_initial_connection(key, None).await.unwrap();
        coordinator.handle(key, None).await.unwrap();
        harness.clock.advance(Duration::from_secs(60));

        // The subject comes back and drops again right after the grace check.
        let competitor = harness.recorder();
        racing.race_after_read(1, move || {
            Box::pin(async move {
                competitor.record_reconnection(key, None).await.unwrap();
                competitor.record_disconnection(key, None).await.unwrap();
            })
        });

        assert!(coordinator.finalize(key).await.unwrap().is_none());
        let latest = harness.recorder().latest(key).await.unwrap().unwrap();
        assert_eq!(latest.state, ConnectionState::TemporarilyDisconnected);
        assert_eq!(latest.seq, 2);
        assert_eq!(latest.disconnected_at, Some(harness.clock.now()));
    }
}
