//! Telemetry and structured logging for the coordinator and workers.

use crate::config::LogFormat;
use crate::job::{JobState, QueuedJob, TaskRecord, WorkerSnapshot};
use opentelemetry::trace::{Span, Tracer};
use opentelemetry::{global, KeyValue};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const TRACER_NAME: &str = "dwg-converter";

/// Jobs slower than this are flagged in the logs.
const SLOW_JOB_THRESHOLD_MS: u64 = 5000;

/// Installs the global tracing subscriber.
///
/// Output goes to stderr so the conversion child can keep stdout for its
/// protocol. `RUST_LOG` overrides the default `info` filter.
pub fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);

    let result = match format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    };
    if let Err(e) = result {
        eprintln!("tracing subscriber already installed: {e}");
    }
}

/// Records telemetry for a job that reached a terminal state.
///
/// Emits a span carrying the job attributes, and a warning for jobs that
/// took longer than the performance threshold.
pub fn record_job_telemetry(job: &QueuedJob, record: &TaskRecord) {
    let tracer = global::tracer(TRACER_NAME);
    let mut span = tracer.start("conversion_job");

    span.set_attribute(KeyValue::new("job_id", job.id.to_string()));
    span.set_attribute(KeyValue::new("input_path", job.descriptor.input_path.clone()));
    span.set_attribute(KeyValue::new("output_path", job.descriptor.output_path.clone()));
    span.set_attribute(KeyValue::new("priority", job.descriptor.priority));
    span.set_attribute(KeyValue::new("state", record.state.to_string()));
    if let Some(worker) = &record.worker {
        span.set_attribute(KeyValue::new("worker", worker.clone()));
    }

    let duration_ms = record
        .result()
        .map(|r| r.processing_time_ms)
        .or_else(|| record.failure_info().map(|f| f.processing_time_ms));

    if let Some(duration_ms) = duration_ms {
        span.set_attribute(KeyValue::new("duration_ms", duration_ms as i64));

        info!(
            job_id = %job.id,
            state = %record.state,
            duration_ms,
            "Conversion job finished"
        );

        if duration_ms > SLOW_JOB_THRESHOLD_MS {
            warn!(
                job_id = %job.id,
                duration_ms,
                "Conversion exceeded performance threshold ({}ms)",
                SLOW_JOB_THRESHOLD_MS
            );
        }
    }

    if let Some(failure) = record.failure_info() {
        span.set_attribute(KeyValue::new("error", failure.message.clone()));
        span.set_attribute(KeyValue::new("error_kind", format!("{:?}", failure.kind)));
        if record.state == JobState::Failure {
            warn!(
                job_id = %job.id,
                error = %failure.message,
                "Conversion job failed"
            );
        }
    }

    span.end();
}

/// Records a worker heartbeat.
pub fn record_worker_heartbeat(snapshot: &WorkerSnapshot) {
    let tracer = global::tracer(TRACER_NAME);
    let mut span = tracer.start("worker_heartbeat");

    span.set_attribute(KeyValue::new("worker", snapshot.worker.clone()));
    span.set_attribute(KeyValue::new("active", snapshot.active.len() as i64));
    span.set_attribute(KeyValue::new("reserved", snapshot.reserved.len() as i64));
    span.set_attribute(KeyValue::new("processed", snapshot.processed as i64));
    span.end();

    tracing::debug!(
        worker = %snapshot.worker,
        active = snapshot.active.len(),
        reserved = snapshot.reserved.len(),
        processed = snapshot.processed,
        "Worker heartbeat"
    );
}

/// Initializes OpenTelemetry with an OTLP exporter.
///
/// Reads configuration from environment variables:
/// - `OTEL_EXPORTER_OTLP_ENDPOINT` - Collector endpoint (default: http://localhost:4317)
/// - `OTEL_SERVICE_NAME` - Service name (default: dwg-converter)
pub fn init_telemetry() -> Result<(), Box<dyn std::error::Error>> {
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::trace::Config;

    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .unwrap_or_else(|_| "http://localhost:4317".to_string());
    let service_name =
        std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| "dwg-converter".to_string());

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(&endpoint),
        )
        .with_trace_config(Config::default().with_resource(
            opentelemetry_sdk::Resource::new(vec![
                KeyValue::new("service.name", service_name),
                KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
            ]),
        ))
        .install_batch(opentelemetry_sdk::runtime::Tokio)?;

    if let Some(provider) = tracer.provider() {
        global::set_tracer_provider(provider);
    }

    info!("Telemetry initialized: endpoint={}", endpoint);
    Ok(())
}

/// Flushes pending spans before exit.
pub fn shutdown_telemetry() {
    global::shutdown_tracer_provider();
}
