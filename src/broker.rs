//! Broker interface shared by the coordinator and the workers.
//!
//! The coordinator only ever calls `enqueue`, `fetch_state`, `revoke` and
//! `inspect_workers`. Workers use the remaining methods to claim jobs and
//! persist state. [`MemoryBroker`] is an in-process implementation used by
//! the `standalone` role and by tests; the durable Redis implementation is
//! [`crate::queue::RedisBroker`].

use anyhow::Result;
use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::debug;

use crate::job::{JobDescriptor, JobId, JobState, QueuedJob, TaskRecord, WorkerSnapshot};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Broker: Send + Sync {
    /// Accepts a descriptor and returns the identifier minted for it.
    async fn enqueue(&self, descriptor: JobDescriptor) -> Result<JobId>;

    /// Current record for `id`. Unknown ids are reported as `PENDING`.
    async fn fetch_state(&self, id: &JobId) -> Result<TaskRecord>;

    /// Requests cancellation of `id`.
    ///
    /// A pending job becomes `REVOKED` at once and is never delivered. A
    /// running job only gets the revocation marker; its worker stops it and
    /// stores the single terminal record. Terminal and unknown ids are left
    /// untouched.
    async fn revoke(&self, id: &JobId) -> Result<()>;

    /// Snapshots of all live workers. Workers that stopped reporting are
    /// simply absent.
    async fn inspect_workers(&self) -> Result<Vec<WorkerSnapshot>>;

    /// Takes the highest-priority pending job, waiting up to `wait`.
    async fn claim(&self, wait: Duration) -> Result<Option<QueuedJob>>;

    /// Puts a claimed but unstarted job back at its original position.
    async fn requeue(&self, job: &QueuedJob) -> Result<()>;

    /// Progress update. Ignored once the record is terminal.
    async fn update_state(&self, id: &JobId, record: TaskRecord) -> Result<()>;

    /// Terminal record written by the worker. The first terminal record
    /// wins; later ones are ignored.
    async fn store_result(&self, id: &JobId, record: TaskRecord) -> Result<()>;

    async fn is_revoked(&self, id: &JobId) -> Result<bool>;

    /// Publishes a worker snapshot that expires after `ttl`.
    async fn publish_worker(&self, snapshot: &WorkerSnapshot, ttl: Duration) -> Result<()>;
}

/// Records and revocation markers are kept this long by default.
const DEFAULT_RESULT_TTL: Duration = Duration::from_secs(86_400);

/// Longest gap between sweeps of expired records.
const PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, PartialEq, Eq)]
struct PendingEntry {
    priority: i64,
    seq: u64,
    id: JobId,
}

impl Ord for PendingEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then earlier submissions.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for PendingEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct MemoryState {
    queue: BinaryHeap<PendingEntry>,
    /// Unfinished jobs with their queue sequence number.
    jobs: HashMap<JobId, (u64, QueuedJob)>,
    records: HashMap<JobId, (TaskRecord, Instant)>,
    revoked: HashMap<JobId, Instant>,
    workers: HashMap<String, (WorkerSnapshot, Instant)>,
    seq: u64,
    next_purge: Option<Instant>,
}

impl MemoryState {
    fn push(&mut self, seq: u64, job: &QueuedJob) {
        self.queue.push(PendingEntry {
            priority: job.descriptor.priority,
            seq,
            id: job.id.clone(),
        });
    }

    fn pop(&mut self, now: Instant) -> Option<QueuedJob> {
        while let Some(entry) = self.queue.pop() {
            if self.is_revoked(&entry.id, now) {
                debug!(job_id = %entry.id, "Skipping revoked job");
                self.jobs.remove(&entry.id);
                continue;
            }
            if let Some((_, job)) = self.jobs.get(&entry.id) {
                return Some(job.clone());
            }
        }
        None
    }

    fn record(&self, id: &JobId, now: Instant) -> Option<&TaskRecord> {
        self.records
            .get(id)
            .filter(|(_, expires)| *expires > now)
            .map(|(record, _)| record)
    }

    fn is_terminal(&self, id: &JobId, now: Instant) -> bool {
        self.record(id, now)
            .map(|record| record.state.is_terminal())
            .unwrap_or(false)
    }

    fn is_revoked(&self, id: &JobId, now: Instant) -> bool {
        self.revoked.get(id).is_some_and(|expires| *expires > now)
    }

    fn purge(&mut self, now: Instant, ttl: Duration) {
        if self.next_purge.is_some_and(|at| now < at) {
            return;
        }
        self.records.retain(|_, (_, expires)| *expires > now);
        self.revoked.retain(|_, expires| *expires > now);
        self.next_purge = Some(now + ttl.min(PURGE_INTERVAL));
    }
}

/// In-process broker with strict priority order and no persistence.
///
/// Records and revocation markers expire after the result TTL; descriptors
/// are released once a job reaches a terminal state.
pub struct MemoryBroker {
    state: Mutex<MemoryState>,
    notify: Notify,
    result_ttl: Duration,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::with_result_ttl(DEFAULT_RESULT_TTL)
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_result_ttl(result_ttl: Duration) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            notify: Notify::new(),
            result_ttl,
        }
    }

    /// Number of jobs waiting to be claimed.
    pub async fn pending_len(&self) -> usize {
        let now = Instant::now();
        let state = self.state.lock().await;
        state
            .queue
            .iter()
            .filter(|entry| state.jobs.contains_key(&entry.id) && !state.is_revoked(&entry.id, now))
            .count()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn enqueue(&self, descriptor: JobDescriptor) -> Result<JobId> {
        let job = QueuedJob::new(JobId::generate(), descriptor);
        let id = job.id.clone();
        {
            let now = Instant::now();
            let mut state = self.state.lock().await;
            state.purge(now, self.result_ttl);
            state.seq += 1;
            let seq = state.seq;
            state.push(seq, &job);
            state
                .records
                .insert(id.clone(), (TaskRecord::pending(), now + self.result_ttl));
            state.jobs.insert(id.clone(), (seq, job));
        }
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn fetch_state(&self, id: &JobId) -> Result<TaskRecord> {
        let state = self.state.lock().await;
        Ok(state
            .record(id, Instant::now())
            .cloned()
            .unwrap_or_else(TaskRecord::pending))
    }

    async fn revoke(&self, id: &JobId) -> Result<()> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.purge(now, self.result_ttl);

        if state.is_terminal(id, now) {
            debug!(job_id = %id, "Revoke after completion ignored");
            return Ok(());
        }
        if !state.jobs.contains_key(id) {
            debug!(job_id = %id, "Revoke of unknown job ignored");
            return Ok(());
        }

        state.revoked.insert(id.clone(), now + self.result_ttl);
        let running = state
            .record(id, now)
            .is_some_and(|record| record.state == JobState::Processing);
        if !running {
            state.jobs.remove(id);
            state
                .records
                .insert(id.clone(), (TaskRecord::revoked(), now + self.result_ttl));
        }
        Ok(())
    }

    async fn inspect_workers(&self) -> Result<Vec<WorkerSnapshot>> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.workers.retain(|_, (_, expires)| *expires > now);
        Ok(state.workers.values().map(|(s, _)| s.clone()).collect())
    }

    async fn claim(&self, wait: Duration) -> Result<Option<QueuedJob>> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            if let Some(job) = self.state.lock().await.pop(Instant::now()) {
                return Ok(Some(job));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn requeue(&self, job: &QueuedJob) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            let seq = match state.jobs.get(&job.id).map(|(seq, _)| *seq) {
                Some(seq) => seq,
                None => {
                    state.seq += 1;
                    state.seq
                }
            };
            state.push(seq, job);
            state.jobs.insert(job.id.clone(), (seq, job.clone()));
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn update_state(&self, id: &JobId, record: TaskRecord) -> Result<()> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        if state.is_terminal(id, now) {
            return Ok(());
        }
        state.records.insert(id.clone(), (record, now + self.result_ttl));
        Ok(())
    }

    async fn store_result(&self, id: &JobId, record: TaskRecord) -> Result<()> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.purge(now, self.result_ttl);
        state.jobs.remove(id);
        if state.is_terminal(id, now) {
            debug!(job_id = %id, state = %record.state, "Result after terminal state ignored");
            return Ok(());
        }
        state.records.insert(id.clone(), (record, now + self.result_ttl));
        Ok(())
    }

    async fn is_revoked(&self, id: &JobId) -> Result<bool> {
        Ok(self.state.lock().await.is_revoked(id, Instant::now()))
    }

    async fn publish_worker(&self, snapshot: &WorkerSnapshot, ttl: Duration) -> Result<()> {
        self.state.lock().await.workers.insert(
            snapshot.worker.clone(),
            (snapshot.clone(), Instant::now() + ttl),
        );
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::job::{ConversionResult, ProgressInfo, TaskFailure};
    use pretty_assertions::assert_eq;

    const NO_WAIT: Duration = Duration::from_millis(0);

    fn descriptor(name: &str, priority: i64) -> JobDescriptor {
        JobDescriptor::new(format!("/tmp/{name}.dxf"), format!("/tmp/{name}.pdf"), priority)
    }

    #[tokio::test]
    async fn test_enqueue_then_pending() {
        let broker = MemoryBroker::new();
        let id = broker.enqueue(descriptor("a", 0)).await.unwrap();

        let record = broker.fetch_state(&id).await.unwrap();
        assert_eq!(record.state, JobState::Pending);
        assert_eq!(broker.pending_len().await, 1);
    }

    #[tokio::test]
    async fn test_unknown_id_reports_pending() {
        let broker = MemoryBroker::new();
        let record = broker.fetch_state(&JobId::from("nope")).await.unwrap();
        assert_eq!(record.state, JobState::Pending);
        assert!(record.info.is_none());
    }

    #[tokio::test]
    async fn test_claim_prefers_priority_then_fifo() {
        let broker = MemoryBroker::new();
        let low = broker.enqueue(descriptor("low", 0)).await.unwrap();
        let first_high = broker.enqueue(descriptor("h1", 5)).await.unwrap();
        let second_high = broker.enqueue(descriptor("h2", 5)).await.unwrap();

        let order: Vec<JobId> = vec![
            broker.claim(NO_WAIT).await.unwrap().unwrap().id,
            broker.claim(NO_WAIT).await.unwrap().unwrap().id,
            broker.claim(NO_WAIT).await.unwrap().unwrap().id,
        ];
        assert_eq!(order, vec![first_high, second_high, low]);
        assert!(broker.claim(NO_WAIT).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_wakes_on_enqueue() {
        let broker = std::sync::Arc::new(MemoryBroker::new());
        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.claim(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let id = broker.enqueue(descriptor("late", 0)).await.unwrap();

        let claimed = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(claimed.id, id);
    }

    #[tokio::test]
    async fn test_revoked_pending_job_is_never_claimed() {
        let broker = MemoryBroker::new();
        let id = broker.enqueue(descriptor("a", 0)).await.unwrap();
        broker.revoke(&id).await.unwrap();

        assert!(broker.claim(NO_WAIT).await.unwrap().is_none());
        assert_eq!(broker.fetch_state(&id).await.unwrap().state, JobState::Revoked);
        assert!(broker.is_revoked(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_revoke_keeps_terminal_state() {
        let broker = MemoryBroker::new();
        let id = broker.enqueue(descriptor("a", 0)).await.unwrap();
        let done = TaskRecord::success(ConversionResult::succeeded("/tmp/a.pdf", 5), "w1");
        broker.store_result(&id, done.clone()).await.unwrap();

        broker.revoke(&id).await.unwrap();
        assert_eq!(broker.fetch_state(&id).await.unwrap(), done);
    }

    #[tokio::test]
    async fn test_progress_does_not_clobber_terminal_state() {
        let broker = MemoryBroker::new();
        let id = broker.enqueue(descriptor("a", 0)).await.unwrap();
        broker.revoke(&id).await.unwrap();

        broker
            .update_state(&id, TaskRecord::processing(ProgressInfo::new("x", 50), "w1"))
            .await
            .unwrap();
        assert_eq!(broker.fetch_state(&id).await.unwrap().state, JobState::Revoked);
    }

    #[tokio::test]
    async fn test_revoke_running_job_leaves_final_record_to_worker() {
        let broker = MemoryBroker::new();
        let id = broker.enqueue(descriptor("a", 0)).await.unwrap();
        broker.claim(NO_WAIT).await.unwrap().unwrap();
        broker
            .update_state(&id, TaskRecord::processing(ProgressInfo::new("x", 50), "w1"))
            .await
            .unwrap();

        broker.revoke(&id).await.unwrap();
        assert!(broker.is_revoked(&id).await.unwrap());
        assert_eq!(broker.fetch_state(&id).await.unwrap().state, JobState::Processing);

        let stopped = TaskRecord::from_output(
            Err(TaskFailure::new(ErrorKind::Revoked, "Task revoked", 12)),
            "w1",
        );
        broker.store_result(&id, stopped.clone()).await.unwrap();
        broker
            .store_result(
                &id,
                TaskRecord::success(ConversionResult::succeeded("/tmp/a.pdf", 30), "w1"),
            )
            .await
            .unwrap();

        assert_eq!(broker.fetch_state(&id).await.unwrap(), stopped);
        assert_eq!(broker.fetch_state(&id).await.unwrap(), stopped);
    }

    #[tokio::test]
    async fn test_revoked_claimed_job_keeps_revoked_record() {
        let broker = MemoryBroker::new();
        let id = broker.enqueue(descriptor("a", 0)).await.unwrap();
        broker.claim(NO_WAIT).await.unwrap().unwrap();

        // Claimed but not started yet: the record is still PENDING.
        broker.revoke(&id).await.unwrap();
        let revoked = broker.fetch_state(&id).await.unwrap();
        assert_eq!(revoked.state, JobState::Revoked);

        broker
            .store_result(
                &id,
                TaskRecord::success(ConversionResult::succeeded("/tmp/a.pdf", 30), "w1"),
            )
            .await
            .unwrap();
        assert_eq!(broker.fetch_state(&id).await.unwrap(), revoked);
    }

    #[tokio::test]
    async fn test_revoke_unknown_ids_is_not_retained() {
        let broker = MemoryBroker::new();
        for i in 0..1000 {
            broker.revoke(&JobId::from(format!("bogus-{i}"))).await.unwrap();
        }
        assert!(!broker.is_revoked(&JobId::from("bogus-1")).await.unwrap());

        let state = broker.state.lock().await;
        assert!(state.revoked.is_empty());
        assert!(state.records.is_empty());
    }

    #[tokio::test]
    async fn test_finished_jobs_release_descriptors() {
        let broker = MemoryBroker::new();
        for i in 0..10 {
            let id = broker.enqueue(descriptor(&format!("j{i}"), 0)).await.unwrap();
            broker.claim(NO_WAIT).await.unwrap().unwrap();
            broker
                .store_result(
                    &id,
                    TaskRecord::success(ConversionResult::succeeded("/tmp/x.pdf", 1), "w1"),
                )
                .await
                .unwrap();
        }
        let pending = broker.enqueue(descriptor("p", 0)).await.unwrap();
        broker.revoke(&pending).await.unwrap();

        let state = broker.state.lock().await;
        assert!(state.jobs.is_empty());
        assert_eq!(state.records.len(), 11);
    }

    #[tokio::test]
    async fn test_records_expire_after_result_ttl() {
        let broker = MemoryBroker::with_result_ttl(Duration::from_millis(50));
        let id = broker.enqueue(descriptor("a", 0)).await.unwrap();
        broker.claim(NO_WAIT).await.unwrap().unwrap();
        broker
            .store_result(
                &id,
                TaskRecord::success(ConversionResult::succeeded("/tmp/a.pdf", 5), "w1"),
            )
            .await
            .unwrap();
        assert_eq!(broker.fetch_state(&id).await.unwrap().state, JobState::Success);

        tokio::time::sleep(Duration::from_millis(80)).await;
        let record = broker.fetch_state(&id).await.unwrap();
        assert_eq!(record.state, JobState::Pending);
        assert!(record.info.is_none());

        broker.enqueue(descriptor("b", 0)).await.unwrap();
        assert_eq!(broker.state.lock().await.records.len(), 1);
    }

    #[tokio::test]
    async fn test_requeue_restores_position() {
        let broker = MemoryBroker::new();
        let first = broker.enqueue(descriptor("a", 0)).await.unwrap();
        let _second = broker.enqueue(descriptor("b", 0)).await.unwrap();

        let claimed = broker.claim(NO_WAIT).await.unwrap().unwrap();
        assert_eq!(claimed.id, first);
        broker.requeue(&claimed).await.unwrap();

        assert_eq!(broker.claim(NO_WAIT).await.unwrap().unwrap().id, first);
    }

    #[tokio::test]
    async fn test_worker_snapshots_expire() {
        let broker = MemoryBroker::new();
        let snapshot = WorkerSnapshot::new("w1");
        broker
            .publish_worker(&snapshot, Duration::from_millis(30))
            .await
            .unwrap();
        assert_eq!(broker.inspect_workers().await.unwrap().len(), 1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(broker.inspect_workers().await.unwrap().is_empty());
    }
}
