use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};

use tracing::{debug, error, info, warn};

use crate::{
    dao::{
        connection_store::{ConnectionStore, Predecessor},
        models::{AuditEvent, ClientInfo, ConnectionKey, ConnectionRecord},
        storage::CommitOutcome,
        subjects::SubjectDirectory,
    },
    error::ServiceError,
    state::{
        clock::Clock,
        state_machine::{self, ConnectionState},
    },
};

const OP_INITIAL: &str = "record_initial_connection";
const OP_DISCONNECT: &str = "record_disconnection";
const OP_RECONNECT: &str = "record_reconnection";
const OP_FINALIZE: &str = "record_final_disconnection";
const OP_LEAVE: &str = "record_graceful_disconnection";
const OP_HEARTBEAT: &str = "update_heartbeat";

/// How an initial connection was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOpening {
    /// The latest record was already connected; nothing was written.
    AlreadyConnected,
    /// A temporarily disconnected record was resumed in place.
    Resumed,
    /// A new record was inserted.
    Opened,
}

/// Transactional reads and writes of connection records.
///
/// Every method reads the latest record, validates the transition, and commits
/// one conditional write. When the condition fails a concurrent writer got
/// there first: the call is a no-op and returns `Ok(None)`.
pub struct ConnectionRecorder {
    store: Arc<dyn ConnectionStore>,
    subjects: Arc<dyn SubjectDirectory>,
    clock: Arc<dyn Clock>,
}

impl ConnectionRecorder {
    /// Build a recorder over the given collaborators.
    pub fn new(
        store: Arc<dyn ConnectionStore>,
        subjects: Arc<dyn SubjectDirectory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            subjects,
            clock,
        }
    }

    /// Current wall-clock time as seen by the recorder.
    pub fn now(&self) -> SystemTime {
        self.clock.now()
    }

    /// Whether the subject exists; unknown subjects are logged.
    pub async fn subject_exists(
        &self,
        operation: &'static str,
        key: ConnectionKey,
    ) -> Result<bool, ServiceError> {
        let exists = self
            .subjects
            .subject_exists(key.subject_id)
            .await
            .inspect_err(|err| {
                error!(
                    operation,
                    subject_id = key.subject_id,
                    context = %key.context,
                    error = %err,
                    "subject lookup failed"
                );
            })?;
        if !exists {
            info!(
                operation,
                subject_id = key.subject_id,
                context = %key.context,
                "ignoring presence signal for unknown subject"
            );
        }
        Ok(exists)
    }

    /// Latest (authoritative) record of the key.
    pub async fn latest(&self, key: ConnectionKey) -> Result<Option<ConnectionRecord>, ServiceError> {
        Ok(self.store.latest(key).await?)
    }

    /// Records of the key touched at or after `since`.
    pub async fn history(
        &self,
        key: ConnectionKey,
        since: SystemTime,
    ) -> Result<Vec<ConnectionRecord>, ServiceError> {
        Ok(self.store.history(key, since).await?)
    }

    /// Open a session, or return the connected one.
    ///
    /// A temporarily disconnected session is resumed in place; a closed one is
    /// followed by a fresh row.
    pub async fn record_initial_connection(
        &self,
        key: ConnectionKey,
        client: Option<ClientInfo>,
    ) -> Result<Option<ConnectionRecord>, ServiceError> {
        Ok(self
            .open_session(key, client)
            .await?
            .map(|(record, _)| record))
    }

    /// Like [`Self::record_initial_connection`], also telling how the session was
    /// obtained.
    pub async fn open_session(
        &self,
        key: ConnectionKey,
        client: Option<ClientInfo>,
    ) -> Result<Option<(ConnectionRecord, SessionOpening)>, ServiceError> {
        if !self.subject_exists(OP_INITIAL, key).await? {
            return Ok(None);
        }

        let (written, opening) = match self.latest(key).await? {
            Some(record) if record.state == ConnectionState::Connected => {
                debug!(
                    operation = OP_INITIAL,
                    subject_id = key.subject_id,
                    context = %key.context,
                    record_id = %record.id,
                    "already connected"
                );
                return Ok(Some((record, SessionOpening::AlreadyConnected)));
            }
            Some(record) if record.state == ConnectionState::TemporarilyDisconnected => (
                self.resume(OP_INITIAL, record, client).await?,
                SessionOpening::Resumed,
            ),
            previous => {
                let predecessor = previous.as_ref().map(Predecessor::of);
                let seq = previous.map_or(0, |record| record.seq + 1);
                let record = ConnectionRecord::open(key, seq, self.now(), client);
                (
                    self.commit_insert(OP_INITIAL, record, predecessor).await?,
                    SessionOpening::Opened,
                )
            }
        };
        Ok(written.map(|record| (record, opening)))
    }

    /// Move a connected session to temporarily disconnected by inserting a new row.
    pub async fn record_disconnection(
        &self,
        key: ConnectionKey,
        client: Option<ClientInfo>,
    ) -> Result<Option<ConnectionRecord>, ServiceError> {
        let current = self.latest(key).await?;
        let Some(current) = self.admit(OP_DISCONNECT, key, current, ConnectionState::TemporarilyDisconnected)
        else {
            return Ok(None);
        };

        let predecessor = Predecessor::of(&current);
        let now = self.now();
        let mut metadata = current.metadata.clone();
        metadata.merge_client(client);
        metadata.disconnection_duration_secs = None;
        metadata.record(now, AuditEvent::Disconnected, None);

        let record = ConnectionRecord {
            id: uuid::Uuid::new_v4(),
            state: ConnectionState::TemporarilyDisconnected,
            disconnected_at: Some(now),
            reconnected_at: None,
            metadata,
            created_at: now,
            updated_at: now,
            seq: current.seq + 1,
            version: 0,
            ..current
        };
        self.commit_insert(OP_DISCONNECT, record, Some(predecessor))
            .await
    }

    /// Resume a temporarily disconnected session in place, or open one when none exists.
    pub async fn record_reconnection(
        &self,
        key: ConnectionKey,
        client: Option<ClientInfo>,
    ) -> Result<Option<ConnectionRecord>, ServiceError> {
        match self.latest(key).await? {
            Some(record) if record.state == ConnectionState::TemporarilyDisconnected => {
                self.resume(OP_RECONNECT, record, client).await
            }
            None => {
                let record = ConnectionRecord::open(key, 0, self.now(), client);
                self.commit_insert(OP_RECONNECT, record, None).await
            }
            Some(record) => {
                self.reject(OP_RECONNECT, key, Some(record.state), ConnectionState::Connected);
                Ok(None)
            }
        }
    }

    /// Close a temporarily disconnected session. Idempotent: an already finalized record
    /// is returned unchanged.
    pub async fn record_final_disconnection(
        &self,
        key: ConnectionKey,
    ) -> Result<Option<ConnectionRecord>, ServiceError> {
        let current = self.latest(key).await?;
        if let Some(record) = current.as_ref()
            && record.state == ConnectionState::Disconnected
        {
            debug!(
                operation = OP_FINALIZE,
                subject_id = key.subject_id,
                context = %key.context,
                record_id = %record.id,
                "already finalized"
            );
            return Ok(current);
        }

        self.close(key, current).await
    }

    /// Close exactly the record the caller inspected. If that record changed since
    /// it was read, nothing is written and `None` is returned.
    pub async fn finalize_record(
        &self,
        record: ConnectionRecord,
    ) -> Result<Option<ConnectionRecord>, ServiceError> {
        self.close(record.key(), Some(record)).await
    }

    /// Close a connected session on explicit request.
    pub async fn record_graceful_disconnection(
        &self,
        key: ConnectionKey,
    ) -> Result<Option<ConnectionRecord>, ServiceError> {
        let current = self.latest(key).await?;
        let Some(mut record) =
            self.admit(OP_LEAVE, key, current, ConnectionState::GracefullyDisconnected)
        else {
            return Ok(None);
        };

        let now = self.now();
        record.metadata.record(now, AuditEvent::Left, None);
        self.commit_transition(OP_LEAVE, record, ConnectionState::GracefullyDisconnected, now)
            .await
    }

    /// Stamp the heartbeat of a connected record. Never changes state or timestamps.
    pub async fn update_heartbeat(
        &self,
        key: ConnectionKey,
    ) -> Result<Option<ConnectionRecord>, ServiceError> {
        let Some(mut record) = self.latest(key).await? else {
            debug!(
                operation = OP_HEARTBEAT,
                subject_id = key.subject_id,
                context = %key.context,
                "heartbeat ignored: no record"
            );
            return Ok(None);
        };
        if record.state != ConnectionState::Connected {
            debug!(
                operation = OP_HEARTBEAT,
                subject_id = key.subject_id,
                context = %key.context,
                state = %record.state,
                "heartbeat ignored: not connected"
            );
            return Ok(None);
        }

        let expected_version = record.version;
        record.metadata.last_heartbeat = Some(self.now());
        record.version += 1;
        self.commit_update(OP_HEARTBEAT, record, expected_version).await
    }

    async fn close(
        &self,
        key: ConnectionKey,
        current: Option<ConnectionRecord>,
    ) -> Result<Option<ConnectionRecord>, ServiceError> {
        let Some(mut record) = self.admit(OP_FINALIZE, key, current, ConnectionState::Disconnected)
        else {
            return Ok(None);
        };

        let now = self.now();
        record.metadata.finalized_at = Some(now);
        record.metadata.record(now, AuditEvent::Finalized, None);
        self.commit_transition(OP_FINALIZE, record, ConnectionState::Disconnected, now)
            .await
    }

    async fn resume(
        &self,
        operation: &'static str,
        mut record: ConnectionRecord,
        client: Option<ClientInfo>,
    ) -> Result<Option<ConnectionRecord>, ServiceError> {
        let now = self.now();
        let disconnected_at = record.disconnected_at.unwrap_or(record.updated_at);
        let elapsed = now
            .duration_since(disconnected_at)
            .unwrap_or(Duration::ZERO)
            .as_secs();

        record.reconnected_at = Some(now);
        record.metadata.merge_client(client);
        record.metadata.disconnection_duration_secs = Some(elapsed);
        record.metadata.record(
            now,
            AuditEvent::Reconnected,
            Some(format!("after {elapsed}s")),
        );
        self.commit_transition(operation, record, ConnectionState::Connected, now)
            .await
    }

    /// Return the current record if `requested` is a legal next state, logging otherwise.
    fn admit(
        &self,
        operation: &'static str,
        key: ConnectionKey,
        current: Option<ConnectionRecord>,
        requested: ConnectionState,
    ) -> Option<ConnectionRecord> {
        match current {
            Some(record) if state_machine::validate(Some(record.state), requested) => Some(record),
            other => {
                self.reject(operation, key, other.map(|record| record.state), requested);
                None
            }
        }
    }

    fn reject(
        &self,
        operation: &'static str,
        key: ConnectionKey,
        from: Option<ConnectionState>,
        requested: ConnectionState,
    ) {
        if let Err(invalid) = state_machine::check(from, requested) {
            info!(
                operation,
                subject_id = key.subject_id,
                context = %key.context,
                error = %invalid,
                "presence signal ignored"
            );
        } else {
            info!(
                operation,
                subject_id = key.subject_id,
                context = %key.context,
                "presence signal ignored: no record to act on"
            );
        }
    }

    async fn commit_transition(
        &self,
        operation: &'static str,
        mut record: ConnectionRecord,
        next: ConnectionState,
        now: SystemTime,
    ) -> Result<Option<ConnectionRecord>, ServiceError> {
        let expected_version = record.version;
        record.state = next;
        record.updated_at = now;
        record.version += 1;
        self.commit_update(operation, record, expected_version).await
    }

    async fn commit_insert(
        &self,
        operation: &'static str,
        record: ConnectionRecord,
        predecessor: Option<Predecessor>,
    ) -> Result<Option<ConnectionRecord>, ServiceError> {
        let key = record.key();
        match self.store.insert(record.clone(), predecessor).await {
            Ok(CommitOutcome::Committed) => {
                info!(
                    operation,
                    subject_id = key.subject_id,
                    context = %key.context,
                    record_id = %record.id,
                    state = %record.state,
                    "connection record inserted"
                );
                Ok(Some(record))
            }
            Ok(CommitOutcome::Conflict) => {
                warn!(
                    operation,
                    subject_id = key.subject_id,
                    context = %key.context,
                    "concurrent write landed first; insert skipped"
                );
                Ok(None)
            }
            Err(err) => {
                error!(
                    operation,
                    subject_id = key.subject_id,
                    context = %key.context,
                    record_id = %record.id,
                    error = %err,
                    "failed to insert connection record"
                );
                Err(err.into())
            }
        }
    }

    async fn commit_update(
        &self,
        operation: &'static str,
        record: ConnectionRecord,
        expected_version: u64,
    ) -> Result<Option<ConnectionRecord>, ServiceError> {
        let key = record.key();
        match self.store.update(record.clone(), expected_version).await {
            Ok(CommitOutcome::Committed) => {
                info!(
                    operation,
                    subject_id = key.subject_id,
                    context = %key.context,
                    record_id = %record.id,
                    state = %record.state,
                    "connection record updated"
                );
                Ok(Some(record))
            }
            Ok(CommitOutcome::Conflict) => {
                warn!(
                    operation,
                    subject_id = key.subject_id,
                    context = %key.context,
                    record_id = %record.id,
                    "record changed concurrently; update skipped"
                );
                Ok(None)
            }
            Err(err) => {
                error!(
                    operation,
                    subject_id = key.subject_id,
                    context = %key.context,
                    record_id = %record.id,
                    error = %err,
                    "failed to update connection record"
                );
                Err(err.into())
            }
        }
    }
}
