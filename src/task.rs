//! The conversion task run by a worker for each claimed job.
//!
//! The task announces progress, validates paths, runs the capability under
//! the soft time limit and returns a [`TaskOutput`]. Nothing inside it
//! propagates as an error; every failure becomes a [`TaskFailure`].

use std::path::Path;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::broker::Broker;
use crate::converter::partial_path;
use crate::error::ErrorKind;
use crate::executor::{ExecOutcome, Executor};
use crate::job::{ConversionResult, ProgressInfo, QueuedJob, TaskFailure, TaskOutput, TaskRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Revoked,
    SoftLimit,
}

async fn announce(broker: &dyn Broker, job: &QueuedJob, worker: &str, status: &str, progress: u8) {
    let record = TaskRecord::processing(ProgressInfo::new(status, progress), worker);
    if let Err(e) = broker.update_state(&job.id, record).await {
        warn!(job_id = %job.id, error = %format!("{:#}", e), "Failed to update job progress");
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// Executes one conversion job.
///
/// `revoke` is cancelled by the worker when the job is revoked; the running
/// conversion is then terminated and the task returns a `Revoked` failure.
/// When `soft_limit` elapses the conversion is terminated, its partial
/// output removed, and the task fails with `TimeLimit`.
pub async fn convert_file_task(
    job: &QueuedJob,
    broker: &dyn Broker,
    worker: &str,
    executor: &mut dyn Executor,
    soft_limit: Duration,
    revoke: &CancellationToken,
) -> TaskOutput {
    let started = Instant::now();
    let input = Path::new(&job.descriptor.input_path);
    let output = Path::new(&job.descriptor.output_path);

    info!(
        job_id = %job.id,
        input = %input.display(),
        output = %output.display(),
        "Starting conversion task"
    );

    announce(broker, job, worker, "Converting file...", 10).await;

    if tokio::fs::metadata(input).await.is_err() {
        return Err(TaskFailure::new(
            ErrorKind::NotFound,
            format!("Task exception: Input file not found: {}", input.display()),
            elapsed_ms(started),
        ));
    }

    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            return Err(TaskFailure::new(
                ErrorKind::Io,
                format!(
                    "Task exception: Failed to create output directory {}: {}",
                    parent.display(),
                    e
                ),
                elapsed_ms(started),
            ));
        }
    }

    announce(broker, job, worker, "Processing CAD file...", 50).await;

    if revoke.is_cancelled() {
        return Err(TaskFailure::new(ErrorKind::Revoked, "Task revoked", elapsed_ms(started)));
    }

    let stop = CancellationToken::new();
    let soft_deadline = tokio::time::sleep(soft_limit);
    tokio::pin!(soft_deadline);
    let mut reason = None;

    let mut run = executor.run(input, output, &stop);
    let outcome = loop {
        tokio::select! {
            outcome = &mut run => break outcome,
            _ = &mut soft_deadline, if reason.is_none() => {
                warn!(job_id = %job.id, limit_secs = soft_limit.as_secs(), "Soft time limit exceeded");
                reason = Some(StopReason::SoftLimit);
                stop.cancel();
            }
            _ = revoke.cancelled(), if reason.is_none() => {
                info!(job_id = %job.id, "Revoke received, terminating conversion");
                reason = Some(StopReason::Revoked);
                stop.cancel();
            }
        }
    };
    drop(run);

    let processing_time_ms = elapsed_ms(started);

    match outcome {
        // A conversion that finished before it could be stopped stands.
        ExecOutcome::Finished(Ok(())) => {
            info!(job_id = %job.id, processing_time_ms, "Conversion successful");
            Ok(ConversionResult::succeeded(
                job.descriptor.output_path.clone(),
                processing_time_ms,
            ))
        }
        ExecOutcome::Finished(Err(message)) => {
            warn!(job_id = %job.id, error = %message, "Conversion failed");
            Err(TaskFailure::new(ErrorKind::Conversion, message, processing_time_ms))
        }
        ExecOutcome::Stopped => match reason {
            Some(StopReason::SoftLimit) => {
                let partial = partial_path(output);
                if let Err(e) = tokio::fs::remove_file(&partial).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(job_id = %job.id, error = %e, "Failed to remove partial output");
                    }
                }
                Err(TaskFailure::new(
                    ErrorKind::TimeLimit,
                    format!("Soft time limit ({}s) exceeded", soft_limit.as_secs()),
                    processing_time_ms,
                ))
            }
            _ => Err(TaskFailure::new(ErrorKind::Revoked, "Task revoked", processing_time_ms)),
        },
        ExecOutcome::Crashed(message) => Err(TaskFailure::new(
            ErrorKind::Internal,
            format!("Task exception: {message}"),
            processing_time_ms,
        )),
    }
}
