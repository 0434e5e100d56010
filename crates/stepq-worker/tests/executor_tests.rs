use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use stepq_core::{HealthConfig, WorkerConfig};
use stepq_queue::{JobInfo, JobParams, Queue, Status};
use stepq_worker::{
    ProcessSpec, QueueReconciler, Reconciler, StateFile, WorkerError, WorkerExecutor, WorkerExit,
    WorkerState, CRASHED_MESSAGE, EXCEEDED_DURATION_MESSAGE,
};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct RecordingReconciler {
    calls: Mutex<Vec<(String, String)>>,
}

impl RecordingReconciler {
    fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Reconciler for RecordingReconciler {
    async fn set_crashed(&self, job: &JobInfo, message: &str) -> stepq_worker::Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push((job.job_id.clone(), message.to_string()));
        Ok(())
    }

    async fn set_exceeded_maximum_duration(
        &self,
        job: &JobInfo,
        message: &str,
    ) -> stepq_worker::Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push((job.job_id.clone(), message.to_string()));
        Ok(())
    }
}

struct Fixture {
    _dir: TempDir,
    queue: Arc<Queue>,
    state_file: StateFile,
    config: WorkerConfig,
    health: HealthConfig,
    // Holds the health port open for the fake health-check process.
    _listener: TcpListener,
}

impl Fixture {
    async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(Queue::open(dir.path().join("queue.db"), Duration::from_secs(5)).unwrap());
        let state_file = StateFile::new(dir.path().join("state.json"));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let health = HealthConfig {
            host: "127.0.0.1".to_string(),
            port: listener.local_addr().unwrap().port(),
            startup_timeout_seconds: 5,
        };
        let config = WorkerConfig {
            startup_timeout_seconds: 5,
            stop_timeout_seconds: 2,
            ..WorkerConfig::default()
        };
        Self {
            _dir: dir,
            queue,
            state_file,
            config,
            health,
            _listener: listener,
        }
    }

    fn executor(&self, reconciler: Arc<dyn Reconciler>, worker_script: &str) -> Arc<WorkerExecutor> {
        let worker = ProcessSpec::new("sh").arg("-c").arg(worker_script);
        let health = ProcessSpec::new("sh").arg("-c").arg("sleep 30");
        Arc::new(WorkerExecutor::new(
            Arc::clone(&self.queue),
            reconciler,
            self.state_file.clone(),
            self.config.clone(),
            self.health.clone(),
            worker,
            health,
        ))
    }

    /// A fake worker loop: prints the banner, then runs `then`.
    fn worker_script(&self, then: &str) -> String {
        format!("echo '{}'; {then}", self.state_file.path().display())
    }

    fn started_job(&self, dataset: &str) -> JobInfo {
        self.queue
            .add_job("split-first-rows", &JobParams::new(dataset), false)
            .unwrap();
        self.queue.start_job("split-first-rows", None).unwrap().info()
    }
}

#[tokio::test]
async fn kill_zombies_reconciles_silent_jobs() {
    let mut fx = Fixture::new().await;
    fx.config.heartbeat_interval_seconds = 0;
    let job = fx.started_job("user/ds");
    fx.queue.add_job("split-first-rows", &JobParams::new("other"), false).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let recorder = Arc::new(RecordingReconciler::default());
    let executor = fx.executor(recorder.clone(), "true");
    executor.kill_zombies().await.unwrap();
    assert_eq!(
        recorder.calls(),
        vec![(job.job_id.clone(), CRASHED_MESSAGE.to_string())]
    );

    let executor = fx.executor(Arc::new(QueueReconciler::new(Arc::clone(&fx.queue))), "true");
    executor.kill_zombies().await.unwrap();
    assert_eq!(fx.queue.get_job(&job.job_id).unwrap().unwrap().status, Status::Error);
    assert!(fx.queue.get_zombies(Duration::ZERO).unwrap().is_empty());
}

#[tokio::test]
async fn fresh_jobs_are_not_zombies() {
    let fx = Fixture::new().await;
    fx.started_job("user/ds");

    let recorder = Arc::new(RecordingReconciler::default());
    fx.executor(recorder.clone(), "true").kill_zombies().await.unwrap();
    assert!(recorder.calls().is_empty());
}

#[tokio::test]
async fn heartbeat_relays_the_current_job() {
    let fx = Fixture::new().await;
    let executor = fx.executor(Arc::new(RecordingReconciler::default()), "true");

    // no state file yet, then idle: nothing to do
    executor.heartbeat().unwrap();
    fx.state_file.write(&WorkerState::idle()).unwrap();
    executor.heartbeat().unwrap();

    let job = fx.started_job("user/ds");
    assert!(fx.queue.get_job(&job.job_id).unwrap().unwrap().last_heartbeat.is_none());
    fx.state_file.write(&WorkerState::running(job.clone())).unwrap();
    executor.heartbeat().unwrap();
    assert!(fx.queue.get_job(&job.job_id).unwrap().unwrap().last_heartbeat.is_some());

    // a job that finished meanwhile is left alone
    fx.queue.finish_job(&job.job_id, Status::Success).unwrap();
    executor.heartbeat().unwrap();
    assert_eq!(fx.queue.get_job(&job.job_id).unwrap().unwrap().status, Status::Success);
}

#[tokio::test]
async fn unreadable_state_file_is_an_error() {
    let fx = Fixture::new().await;
    std::fs::write(fx.state_file.path(), b"garbage").unwrap();
    let executor = fx.executor(Arc::new(RecordingReconciler::default()), "true");

    assert!(matches!(executor.heartbeat(), Err(WorkerError::BadWorkerState { .. })));
    assert!(matches!(
        executor.kill_long_job().await,
        Err(WorkerError::BadWorkerState { .. })
    ));
}

#[tokio::test]
async fn kill_long_job_respects_the_duration_limit() {
    let mut fx = Fixture::new().await;
    let job = fx.started_job("user/ds");
    fx.state_file.write(&WorkerState::running(job.clone())).unwrap();

    let recorder = Arc::new(RecordingReconciler::default());
    fx.executor(recorder.clone(), "true").kill_long_job().await.unwrap();
    assert!(recorder.calls().is_empty());

    fx.config.max_job_duration_seconds = 0;
    fx.executor(recorder.clone(), "true").kill_long_job().await.unwrap();
    assert_eq!(
        recorder.calls(),
        vec![(job.job_id.clone(), EXCEEDED_DURATION_MESSAGE.to_string())]
    );
}

#[tokio::test]
async fn idle_worker_is_never_a_long_job() {
    let mut fx = Fixture::new().await;
    fx.config.max_job_duration_seconds = 0;
    let recorder = Arc::new(RecordingReconciler::default());
    let executor = fx.executor(recorder.clone(), "true");

    executor.kill_long_job().await.unwrap();
    fx.state_file.write(&WorkerState::idle()).unwrap();
    executor.kill_long_job().await.unwrap();
    assert!(recorder.calls().is_empty());
}

/// Exits 0 on SIGTERM, like `stepq worker-loop`.
const GRACEFUL_WORKER: &str = "trap 'exit 0' TERM; while true; do sleep 0.1; done";

#[tokio::test]
async fn long_job_stops_the_worker_before_reconciling() {
    let mut fx = Fixture::new().await;
    fx.config.max_job_duration_seconds = 0;
    let job = fx.started_job("user/ds");
    fx.state_file.write(&WorkerState::running(job.clone())).unwrap();

    let executor = fx.executor(
        Arc::new(QueueReconciler::new(Arc::clone(&fx.queue))),
        &fx.worker_script(GRACEFUL_WORKER),
    );
    executor.start().await.unwrap();
    assert!(executor.is_worker_alive().await.unwrap());

    executor.kill_long_job().await.unwrap();
    assert_eq!(fx.queue.get_job(&job.job_id).unwrap().unwrap().status, Status::Error);
    match executor.is_worker_alive().await.unwrap_err() {
        WorkerError::JobTimeout { job_id, max_secs } => {
            assert_eq!(job_id, job.job_id);
            assert_eq!(max_secs, 0);
        }
        other => panic!("unexpected error: {other}"),
    }
    executor.stop().await;
}

#[tokio::test]
async fn long_job_ends_the_run_with_a_timeout() {
    let mut fx = Fixture::new().await;
    fx.config.max_job_duration_seconds = 0;
    fx.config.kill_long_job_interval_seconds = 1;
    let job = fx.started_job("user/ds");
    fx.state_file.write(&WorkerState::running(job.clone())).unwrap();

    let executor = fx.executor(
        Arc::new(QueueReconciler::new(Arc::clone(&fx.queue))),
        &fx.worker_script(GRACEFUL_WORKER),
    );
    let err = tokio::time::timeout(
        Duration::from_secs(15),
        Arc::clone(&executor).run(CancellationToken::new()),
    )
    .await
    .unwrap()
    .unwrap_err();
    assert!(
        matches!(&err, WorkerError::JobTimeout { job_id, .. } if *job_id == job.job_id),
        "unexpected error: {err}"
    );
    assert!(err.to_string().contains("exceeded the maximum duration"));
    assert_eq!(fx.queue.get_job(&job.job_id).unwrap().unwrap().status, Status::Error);
}

#[tokio::test]
async fn crashed_worker_is_reported_with_its_job() {
    let fx = Fixture::new().await;
    let job = fx.started_job("user/ds");
    fx.state_file.write(&WorkerState::running(job.clone())).unwrap();

    let recorder = Arc::new(RecordingReconciler::default());
    let executor = fx.executor(recorder.clone(), &fx.worker_script("sleep 0.2; exit 3"));
    let err = Arc::clone(&executor)
        .run(CancellationToken::new())
        .await
        .unwrap_err();
    match err {
        WorkerError::WorkerCrashed { exit, job_id } => {
            assert_eq!(exit, WorkerExit::Failed { code: 3 });
            assert_eq!(job_id.as_deref(), Some(job.job_id.as_str()));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(recorder.calls(), vec![(job.job_id.clone(), CRASHED_MESSAGE.to_string())]);
}

#[test]
fn crash_message_names_the_cause_and_the_job() {
    let err = WorkerError::WorkerCrashed {
        exit: WorkerExit::Signaled { signal: 9 },
        job_id: Some("job-42".to_string()),
    };
    let message = err.to_string();
    assert!(message.contains("surely an OOM"));
    assert!(message.ends_with("when running job_id=job-42"));

    let err = WorkerError::WorkerCrashed {
        exit: WorkerExit::Failed { code: 1 },
        job_id: None,
    };
    assert_eq!(err.to_string(), "Worker crashed (exit code 1)");
}

#[tokio::test]
async fn clean_worker_exit_ends_the_run() {
    let fx = Fixture::new().await;
    let executor = fx.executor(
        Arc::new(RecordingReconciler::default()),
        &fx.worker_script("sleep 0.2; exit 0"),
    );
    tokio::time::timeout(
        Duration::from_secs(10),
        Arc::clone(&executor).run(CancellationToken::new()),
    )
    .await
    .unwrap()
    .unwrap();
}

#[tokio::test]
async fn shutdown_stops_both_processes() {
    let fx = Fixture::new().await;
    let executor = fx.executor(
        Arc::new(RecordingReconciler::default()),
        &fx.worker_script("sleep 30"),
    );
    let shutdown = CancellationToken::new();
    let run = tokio::spawn(Arc::clone(&executor).run(shutdown.clone()));

    tokio::time::sleep(Duration::from_millis(500)).await;
    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    // stopping again is a no-op
    executor.stop().await;
    executor.stop().await;
}

#[tokio::test]
async fn worker_without_banner_fails_to_start() {
    let mut fx = Fixture::new().await;
    fx.config.startup_timeout_seconds = 1;
    let executor = fx.executor(Arc::new(RecordingReconciler::default()), "sleep 30");
    assert!(matches!(
        executor.start().await,
        Err(WorkerError::StartupTimeout { .. })
    ));

    let executor = fx.executor(Arc::new(RecordingReconciler::default()), "echo not-the-path");
    assert!(matches!(executor.start().await, Err(WorkerError::Spawn { .. })));
}
