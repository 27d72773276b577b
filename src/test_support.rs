use std::{
    sync::{Arc, Mutex},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use futures::future::{self, BoxFuture};

use crate::{
    config::PresenceConfig,
    dao::{
        connection_store::{ConnectionStore, Predecessor, memory::MemoryConnectionStore},
        models::{ConnectionKey, ConnectionRecord},
        storage::{CommitOutcome, StorageResult},
        subjects::MemorySubjectDirectory,
    },
    services::{
        anomaly::AnomalyAnalyzer,
        presence_service::PresenceService,
        recorder::ConnectionRecorder,
        scheduler::{DeferredTask, DeferredTaskHandle, DeferredTaskScheduler, SchedulerError},
    },
    state::{clock::Clock, events::PresenceEvents},
};

/// Subjects registered in every harness directory.
pub const KNOWN_SUBJECTS: [i64; 3] = [1, 3, 7];
/// Subject registered as soft-deleted.
pub const SOFT_DELETED_SUBJECT: i64 = 11;

/// Clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<SystemTime>,
}

impl ManualClock {
    pub fn new(start: SystemTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        *self.now.lock().unwrap()
    }
}

/// Scheduler that records tasks instead of running them.
#[derive(Default)]
pub struct RecordingScheduler {
    tasks: Mutex<Vec<DeferredTask>>,
}

impl RecordingScheduler {
    pub fn tasks(&self) -> Vec<DeferredTask> {
        self.tasks.lock().unwrap().clone()
    }
}

impl DeferredTaskScheduler for RecordingScheduler {
    fn schedule(
        &self,
        task: DeferredTask,
    ) -> BoxFuture<'static, Result<DeferredTaskHandle, SchedulerError>> {
        let handle = DeferredTaskHandle {
            task_key: task.task_key.clone(),
            due_at: task.due_at,
        };
        self.tasks.lock().unwrap().push(task);
        Box::pin(future::ready(Ok(handle)))
    }
}

type RaceHook = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Memory store that runs a competing writer right after a chosen `latest` read,
/// before the reader gets its result back.
pub struct RacingStore {
    inner: MemoryConnectionStore,
    pending: Mutex<Option<(usize, RaceHook)>>,
}

impl RacingStore {
    pub fn new(inner: MemoryConnectionStore) -> Self {
        Self {
            inner,
            pending: Mutex::new(None),
        }
    }

    /// Run `writer` once the `nth` next `latest` read (1-based) has been served.
    pub fn race_after_read<F>(&self, nth: usize, writer: F)
    where
        F: FnOnce() -> BoxFuture<'static, ()> + Send + 'static,
    {
        let hook: RaceHook = Box::new(writer);
        *self.pending.lock().unwrap() = Some((nth, hook));
    }

    fn due_hook(&self) -> Option<RaceHook> {
        let mut pending = self.pending.lock().unwrap();
        let fire = match pending.as_mut() {
            Some((remaining, _)) if *remaining > 1 => {
                *remaining -= 1;
                false
            }
            Some(_) => true,
            None => false,
        };
        if fire {
            pending.take().map(|(_, hook)| hook)
        } else {
            None
        }
    }
}

impl ConnectionStore for RacingStore {
    fn latest(
        &self,
        key: ConnectionKey,
    ) -> BoxFuture<'static, StorageResult<Option<ConnectionRecord>>> {
        let read = self.inner.latest(key);
        let hook = self.due_hook();
        Box::pin(async move {
            let latest = read.await;
            if let Some(hook) = hook {
                hook().await;
            }
            latest
        })
    }

    fn history(
        &self,
        key: ConnectionKey,
        since: SystemTime,
    ) -> BoxFuture<'static, StorageResult<Vec<ConnectionRecord>>> {
        self.inner.history(key, since)
    }

    fn insert(
        &self,
        record: ConnectionRecord,
        predecessor: Option<Predecessor>,
    ) -> BoxFuture<'static, StorageResult<CommitOutcome>> {
        self.inner.insert(record, predecessor)
    }

    fn update(
        &self,
        record: ConnectionRecord,
        expected_version: u64,
    ) -> BoxFuture<'static, StorageResult<CommitOutcome>> {
        self.inner.update(record, expected_version)
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        self.inner.health_check()
    }
}

/// Wiring of every service over in-memory collaborators.
pub struct Harness {
    pub store: MemoryConnectionStore,
    pub subjects: MemorySubjectDirectory,
    pub clock: Arc<ManualClock>,
    pub scheduler: Arc<RecordingScheduler>,
    pub events: Arc<PresenceEvents>,
    pub config: Arc<PresenceConfig>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_store(MemoryConnectionStore::new())
    }

    pub fn with_store(store: MemoryConnectionStore) -> Self {
        let subjects = MemorySubjectDirectory::new();
        for subject in KNOWN_SUBJECTS {
            subjects.register(subject);
        }
        subjects.soft_delete(SOFT_DELETED_SUBJECT);

        Self {
            store,
            subjects,
            clock: Arc::new(ManualClock::new(UNIX_EPOCH + Duration::from_secs(1_700_000_000))),
            scheduler: Arc::new(RecordingScheduler::default()),
            events: Arc::new(PresenceEvents::new(64)),
            config: Arc::new(PresenceConfig::default()),
        }
    }

    pub fn recorder(&self) -> Arc<ConnectionRecorder> {
        self.recorder_over(Arc::new(self.store.clone()))
    }

    /// Recorder over a custom store sharing the harness subjects and clock.
    pub fn recorder_over(&self, store: Arc<dyn ConnectionStore>) -> Arc<ConnectionRecorder> {
        Arc::new(ConnectionRecorder::new(
            store,
            Arc::new(self.subjects.clone()),
            self.clock.clone(),
        ))
    }

    /// Store that shares the harness rows and can inject a concurrent writer.
    pub fn racing_store(&self) -> Arc<RacingStore> {
        Arc::new(RacingStore::new(self.store.clone()))
    }

    pub fn analyzer(&self) -> Arc<AnomalyAnalyzer> {
        Arc::new(AnomalyAnalyzer::new(self.recorder(), self.config.clone()))
    }

    pub fn presence(&self) -> PresenceService {
        self.presence_over(self.recorder())
    }

    pub fn presence_over(&self, recorder: Arc<ConnectionRecorder>) -> PresenceService {
        PresenceService::new(
            recorder,
            self.scheduler.clone(),
            self.events.clone(),
            self.config.clone(),
        )
    }
}
