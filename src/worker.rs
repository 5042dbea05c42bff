//! Worker pool: claims jobs from the broker and runs them in bounded slots.
//!
//! The pool holds at most one reserved job beyond its running ones. Each
//! job runs under the hard time limit in its own task so that a panic or a
//! stuck conversion only ever fails that job.

use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::Broker;
use crate::config::WorkerConfig;
use crate::error::ErrorKind;
use crate::executor::{panic_message, Executor};
use crate::job::{JobId, QueuedJob, TaskFailure, TaskOutput, TaskRecord, WorkerSnapshot};
use crate::task::convert_file_task;
use crate::telemetry;

/// Builds a fresh execution unit for a slot.
pub type ExecutorFactory = Arc<dyn Fn() -> Box<dyn Executor> + Send + Sync>;

/// How long a single claim waits before re-checking for shutdown.
const CLAIM_WAIT: Duration = Duration::from_secs(1);

/// Back-off after a broker error in the claim loop.
const BROKER_RETRY: Duration = Duration::from_secs(5);

struct Shared {
    broker: Arc<dyn Broker>,
    config: WorkerConfig,
    factory: ExecutorFactory,
    idle: Mutex<Vec<Box<dyn Executor>>>,
    slots: Arc<Semaphore>,
    snapshot: Mutex<WorkerSnapshot>,
}

#[derive(Clone)]
pub struct WorkerPool {
    shared: Arc<Shared>,
}

impl WorkerPool {
    pub fn new(broker: Arc<dyn Broker>, config: WorkerConfig, factory: ExecutorFactory) -> Self {
        let snapshot = WorkerSnapshot::new(config.name.clone());
        let slots = Arc::new(Semaphore::new(config.concurrency.max(1)));
        Self {
            shared: Arc::new(Shared {
                broker,
                config,
                factory,
                idle: Mutex::new(Vec::new()),
                slots,
                snapshot: Mutex::new(snapshot),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    /// Current view of this worker's jobs.
    pub async fn snapshot(&self) -> WorkerSnapshot {
        self.shared.snapshot.lock().await.clone()
    }

    /// Runs the claim loop until `shutdown` is cancelled, then waits for
    /// running jobs to finish.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let shared = &self.shared;
        info!(
            worker = %shared.config.name,
            concurrency = shared.config.concurrency,
            "Worker pool started"
        );

        let heartbeat_stop = CancellationToken::new();
        let heartbeat = tokio::spawn(heartbeat_loop(shared.clone(), heartbeat_stop.clone()));
        shared.publish().await;

        while !shutdown.is_cancelled() {
            // Never raced against shutdown: a claimed job must not be dropped.
            let job = match shared.broker.claim(CLAIM_WAIT).await {
                Ok(Some(job)) => job,
                Ok(None) => continue,
                Err(e) => {
                    error!(worker = %shared.config.name, error = %format!("{:#}", e), "Failed to claim job");
                    tokio::select! {
                        _ = tokio::time::sleep(BROKER_RETRY) => {}
                        _ = shutdown.cancelled() => {}
                    }
                    continue;
                }
            };

            debug!(job_id = %job.id, "Reserved job");
            shared.snapshot.lock().await.reserved.push(job.id.clone());
            shared.publish().await;

            let permit = tokio::select! {
                permit = shared.slots.clone().acquire_owned() => permit.ok(),
                _ = shutdown.cancelled() => None,
            };
            remove_id(&mut shared.snapshot.lock().await.reserved, &job.id);

            let Some(permit) = permit else {
                info!(job_id = %job.id, "Returning reserved job to the queue");
                if let Err(e) = shared.broker.requeue(&job).await {
                    error!(job_id = %job.id, error = %format!("{:#}", e), "Failed to requeue job");
                }
                shared.publish().await;
                break;
            };

            match shared.broker.is_revoked(&job.id).await {
                Ok(true) => {
                    info!(job_id = %job.id, "Discarding revoked job");
                    shared.publish().await;
                    continue;
                }
                Ok(false) => {}
                Err(e) => warn!(job_id = %job.id, error = %format!("{:#}", e), "Failed to check revocation"),
            }

            shared.snapshot.lock().await.active.push(job.id.clone());
            shared.publish().await;

            let task_shared = shared.clone();
            tokio::spawn(async move {
                task_shared.execute(job).await;
                drop(permit);
            });
        }

        info!(worker = %shared.config.name, "Worker pool stopping, waiting for running jobs");
        let _drained = shared
            .slots
            .acquire_many(shared.config.concurrency.max(1) as u32)
            .await;

        heartbeat_stop.cancel();
        let _ = heartbeat.await;

        for mut executor in shared.idle.lock().await.drain(..) {
            executor.terminate().await;
        }
        shared.publish().await;

        info!(worker = %shared.config.name, "Worker pool stopped");
        Ok(())
    }
}

impl Shared {
    async fn checkout(&self) -> Box<dyn Executor> {
        match self.idle.lock().await.pop() {
            Some(executor) => executor,
            None => (self.factory)(),
        }
    }

    async fn checkin(&self, executor: Box<dyn Executor>) {
        self.idle.lock().await.push(executor);
    }

    async fn execute(self: &Arc<Self>, job: QueuedJob) {
        let started = Instant::now();
        let hard_limit = self.config.hard_time_limit;
        let executor = self.checkout().await;

        let revoke = CancellationToken::new();
        let watcher = tokio::spawn(watch_revocation(
            self.broker.clone(),
            job.id.clone(),
            self.config.revoke_poll,
            revoke.clone(),
        ));

        let inner = {
            let broker = self.broker.clone();
            let worker = self.config.name.clone();
            let soft_limit = self.config.soft_time_limit;
            let job = job.clone();
            let revoke = revoke.clone();
            tokio::spawn(async move {
                let mut executor = executor;
                let output = tokio::time::timeout(
                    hard_limit,
                    convert_file_task(
                        &job,
                        broker.as_ref(),
                        &worker,
                        executor.as_mut(),
                        soft_limit,
                        &revoke,
                    ),
                )
                .await;
                (output, executor)
            })
        };

        let elapsed_ms = || started.elapsed().as_millis() as u64;
        let output: TaskOutput = match inner.await {
            Ok((Ok(output), executor)) => {
                self.checkin(executor).await;
                output
            }
            Ok((Err(_), mut executor)) => {
                warn!(job_id = %job.id, limit_secs = hard_limit.as_secs(), "Hard time limit exceeded, terminating");
                executor.terminate().await;
                self.checkin(executor).await;
                Err(TaskFailure::new(
                    ErrorKind::TimeLimit,
                    format!("Hard time limit ({}s) exceeded", hard_limit.as_secs()),
                    elapsed_ms(),
                ))
            }
            Err(e) => {
                let message = if e.is_panic() {
                    panic_message(e.into_panic())
                } else {
                    e.to_string()
                };
                error!(job_id = %job.id, error = %message, "Task panicked");
                Err(TaskFailure::new(
                    ErrorKind::Internal,
                    format!("Task exception: {message}"),
                    elapsed_ms(),
                ))
            }
        };
        watcher.abort();

        let record = TaskRecord::from_output(output, &self.config.name);
        if let Err(e) = self.broker.store_result(&job.id, record.clone()).await {
            error!(job_id = %job.id, error = %format!("{:#}", e), "Failed to store job result");
        }
        telemetry::record_job_telemetry(&job, &record);

        {
            let mut snapshot = self.snapshot.lock().await;
            remove_id(&mut snapshot.active, &job.id);
            snapshot.processed += 1;
        }
        self.publish().await;
    }

    async fn publish(&self) {
        let snapshot = {
            let mut snapshot = self.snapshot.lock().await;
            snapshot.heartbeat_at = Utc::now();
            snapshot.clone()
        };
        if let Err(e) = self
            .broker
            .publish_worker(&snapshot, self.config.snapshot_ttl())
            .await
        {
            warn!(worker = %snapshot.worker, error = %format!("{:#}", e), "Failed to publish worker snapshot");
        }
    }
}

fn remove_id(ids: &mut Vec<JobId>, id: &JobId) {
    ids.retain(|candidate| candidate != id);
}

async fn heartbeat_loop(shared: Arc<Shared>, stop: CancellationToken) {
    let mut ticker = tokio::time::interval(shared.config.heartbeat);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop.cancelled() => break,
        }
        shared.publish().await;
        telemetry::record_worker_heartbeat(&*shared.snapshot.lock().await);
    }
}

async fn watch_revocation(
    broker: Arc<dyn Broker>,
    id: JobId,
    poll: Duration,
    revoke: CancellationToken,
) {
    let mut ticker = tokio::time::interval(poll);
    loop {
        ticker.tick().await;
        match broker.is_revoked(&id).await {
            Ok(true) => {
                revoke.cancel();
                return;
            }
            Ok(false) => {}
            Err(e) => debug!(job_id = %id, error = %format!("{:#}", e), "Revocation check failed"),
        }
    }
}
