/// End-to-end tests: API submission through a worker pool to a PDF on disk.
///
/// Workers run conversions in child processes of the built binary, exactly
/// as the `worker` role does. The in-process broker stands in for Redis.
///
/// ```bash
/// cargo test --test conversion_flow_test
/// ```

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use axum::Router;
    use dwg_converter::api::{router, AppState};
    use dwg_converter::broker::{Broker, MemoryBroker};
    use dwg_converter::config::WorkerConfig;
    use dwg_converter::converter::DrawingConverter;
    use dwg_converter::executor::{Executor, InlineExecutor, ProcessExecutor};
    use dwg_converter::worker::{ExecutorFactory, WorkerPool};
    use http_body_util::BodyExt;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use std::path::Path;
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;
    use tokio::task::JoinHandle;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    const PLATE: &str = include_str!("fixtures/plate.dxf");

    fn worker_config() -> WorkerConfig {
        WorkerConfig {
            name: "worker@flow-test".to_string(),
            concurrency: 2,
            soft_time_limit: Duration::from_secs(20),
            hard_time_limit: Duration::from_secs(30),
            max_tasks_per_child: 2,
            revoke_poll: Duration::from_millis(50),
            heartbeat: Duration::from_millis(200),
        }
    }

    fn process_factory() -> ExecutorFactory {
        Arc::new(|| {
            Box::new(ProcessExecutor::new(env!("CARGO_BIN_EXE_dwg-converter"), 2)) as Box<dyn Executor>
        })
    }

    fn inline_factory() -> ExecutorFactory {
        let converter = Arc::new(DrawingConverter::new(None));
        Arc::new(move || Box::new(InlineExecutor::new(converter.clone())) as Box<dyn Executor>)
    }

    struct Service {
        app: Router,
        shutdown: CancellationToken,
        pool: Option<JoinHandle<anyhow::Result<()>>>,
        broker: Arc<MemoryBroker>,
    }

    impl Service {
        fn new() -> Self {
            let broker = Arc::new(MemoryBroker::new());
            let app = router(AppState::new(broker.clone(), 100 * 1024 * 1024));
            Self {
                app,
                shutdown: CancellationToken::new(),
                pool: None,
                broker,
            }
        }

        fn start_workers(&mut self, factory: ExecutorFactory) {
            let pool = WorkerPool::new(self.broker.clone(), worker_config(), factory);
            let token = self.shutdown.clone();
            self.pool = Some(tokio::spawn(async move { pool.run(token).await }));
        }

        async fn send(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
            let request = Request::builder()
                .method(method)
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.map(|b| b.to_string()).unwrap_or_default()))
                .unwrap();
            let response = self.app.clone().oneshot(request).await.unwrap();
            let status = response.status();
            let bytes = response.into_body().collect().await.unwrap().to_bytes();
            (status, serde_json::from_slice(&bytes).unwrap())
        }

        async fn submit(&self, input: &Path, output: &Path) -> String {
            let (status, body) = self
                .send(
                    Method::POST,
                    "/convert",
                    Some(json!({"input_path": input, "output_path": output})),
                )
                .await;
            assert_eq!(status, StatusCode::ACCEPTED, "{body}");
            body["task_id"].as_str().unwrap().to_string()
        }

        async fn status(&self, task_id: &str) -> Value {
            let (status, body) = self.send(Method::GET, &format!("/status/{task_id}"), None).await;
            assert_eq!(status, StatusCode::OK);
            body
        }

        /// Polls until the job leaves PENDING/PROCESSING.
        async fn wait_terminal(&self, task_id: &str) -> Value {
            let deadline = Instant::now() + Duration::from_secs(30);
            loop {
                let body = self.status(task_id).await;
                match body["state"].as_str() {
                    Some("PENDING") | Some("PROCESSING") => {}
                    _ => return body,
                }
                assert!(Instant::now() < deadline, "job {task_id} never finished: {body}");
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        }

        async fn stop(mut self) {
            self.shutdown.cancel();
            if let Some(pool) = self.pool.take() {
                tokio::time::timeout(Duration::from_secs(10), pool)
                    .await
                    .expect("worker pool did not stop")
                    .unwrap()
                    .unwrap();
            }
        }
    }

    fn write_fixture(dir: &TempDir, name: &str, contents: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    /// Test a valid drawing converts end to end in a child process.
    #[tokio::test]
    async fn test_dxf_converts_to_pdf() {
        let dir = TempDir::new().unwrap();
        let input = write_fixture(&dir, "a.dxf", PLATE);
        let output = dir.path().join("pdf/a.pdf");

        let mut service = Service::new();
        service.start_workers(process_factory());

        let task_id = service.submit(&input, &output).await;
        let body = service.wait_terminal(&task_id).await;

        assert_eq!(body["state"], "SUCCESS", "{body}");
        assert_eq!(body["status"], "Task completed successfully");
        assert_eq!(body["result"]["success"], true);
        assert_eq!(body["result"]["output_path"], output.to_str().unwrap());
        assert_eq!(body["result"]["error"], Value::Null);
        assert!(body["result"]["processing_time_ms"].as_u64().is_some());

        let pdf = std::fs::read(&output).unwrap();
        assert!(pdf.starts_with(b"%PDF"));

        // Terminal payloads are stable across polls.
        assert_eq!(service.status(&task_id).await, body);

        service.stop().await;
    }

    /// Test an unsupported input format fails with a readable error.
    #[tokio::test]
    async fn test_unsupported_format_fails() {
        let dir = TempDir::new().unwrap();
        let input = write_fixture(&dir, "notes.txt", "not a drawing");
        let output = dir.path().join("notes.pdf");

        let mut service = Service::new();
        service.start_workers(process_factory());

        let task_id = service.submit(&input, &output).await;
        let body = service.wait_terminal(&task_id).await;

        assert_eq!(body["state"], "FAILURE", "{body}");
        assert_eq!(body["status"], "Task failed");
        let error = body["error"].as_str().unwrap();
        assert!(error.to_lowercase().contains("unsupported format"), "{error}");
        assert_eq!(body["result"]["success"], false);
        assert!(!output.exists());

        service.stop().await;
    }

    /// Test child recycling keeps serving jobs past the per-child limit.
    #[tokio::test]
    async fn test_many_jobs_across_recycled_children() {
        let dir = TempDir::new().unwrap();
        let mut service = Service::new();
        service.start_workers(process_factory());

        let mut tasks = Vec::new();
        for i in 0..5 {
            let input = write_fixture(&dir, &format!("part{i}.dxf"), PLATE);
            let output = dir.path().join(format!("part{i}.pdf"));
            tasks.push((service.submit(&input, &output).await, output));
        }

        for (task_id, output) in tasks {
            let body = service.wait_terminal(&task_id).await;
            assert_eq!(body["state"], "SUCCESS", "{body}");
            assert!(output.exists());
        }

        service.stop().await;
    }

    /// Test a cancelled pending job is never processed.
    #[tokio::test]
    async fn test_cancel_before_workers_start() {
        let dir = TempDir::new().unwrap();
        let input = write_fixture(&dir, "a.dxf", PLATE);
        let output = dir.path().join("a.pdf");

        let mut service = Service::new();
        let cancelled = service.submit(&input, &output).await;
        let (status, _) = service
            .send(Method::POST, &format!("/cancel/{cancelled}"), None)
            .await;
        assert_eq!(status, StatusCode::OK);

        let other_output = dir.path().join("b.pdf");
        let other = service.submit(&input, &other_output).await;

        service.start_workers(inline_factory());
        let body = service.wait_terminal(&other).await;
        assert_eq!(body["state"], "SUCCESS");

        let body = service.status(&cancelled).await;
        assert_eq!(body["state"], "REVOKED");
        assert!(!output.exists());

        service.stop().await;
    }

    /// Test queue stats reflect the running worker.
    #[tokio::test]
    async fn test_queue_stats_with_idle_worker() {
        let mut service = Service::new();
        service.start_workers(inline_factory());

        let deadline = Instant::now() + Duration::from_secs(5);
        while service.broker.inspect_workers().await.unwrap().is_empty() {
            assert!(Instant::now() < deadline, "worker never reported");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let (status, body) = service.send(Method::GET, "/queue/stats", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total_pending"], 0);

        service.stop().await;
    }
}
