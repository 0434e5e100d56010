use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use stepq_queue::{JobInfo, JobParams, Queue, Status};
use stepq_worker::{Interval, JobRunner, StateFile, WorkerError, WorkerLoop};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Records which job the state file advertised while each job ran.
struct FakeRunner {
    state_file: StateFile,
    outcome: Status,
    seen: Mutex<Vec<(String, Option<String>)>>,
}

#[async_trait]
impl JobRunner for FakeRunner {
    async fn run(&self, job: &JobInfo) -> Status {
        let published = self
            .state_file
            .read()
            .unwrap()
            .and_then(|state| state.job_id().map(str::to_string));
        self.seen.lock().unwrap().push((job.job_id.clone(), published));
        self.outcome
    }
}

struct Hang;

#[async_trait]
impl JobRunner for Hang {
    async fn run(&self, _job: &JobInfo) -> Status {
        std::future::pending().await
    }
}

fn setup() -> (TempDir, Arc<Queue>, StateFile) {
    let dir = tempfile::tempdir().unwrap();
    let queue = Arc::new(Queue::open(dir.path().join("queue.db"), Duration::from_secs(5)).unwrap());
    let state_file = StateFile::new(dir.path().join("state.json"));
    (dir, queue, state_file)
}

fn worker(queue: &Arc<Queue>, runner: Arc<dyn JobRunner>, state_file: &StateFile, types: &[&str]) -> WorkerLoop {
    WorkerLoop::new(
        Arc::clone(queue),
        runner,
        state_file.clone(),
        types.iter().map(|t| t.to_string()).collect(),
        None,
        Interval::Fixed(Duration::from_millis(10)),
    )
}

#[tokio::test]
async fn processes_jobs_and_publishes_state() {
    let (_dir, queue, state_file) = setup();
    queue.add_job("parquet", &JobParams::new("a/one"), false).unwrap();
    queue.add_job("first-rows", &JobParams::new("b/two").with_split("train"), false).unwrap();

    let runner = Arc::new(FakeRunner {
        state_file: state_file.clone(),
        outcome: Status::Success,
        seen: Mutex::new(Vec::new()),
    });
    let worker = worker(&queue, runner.clone(), &state_file, &["parquet", "first-rows"]);
    worker.publish_idle().unwrap();
    assert_eq!(state_file.read().unwrap().unwrap().job_id(), None);

    let shutdown = CancellationToken::new();
    assert!(worker.process_next_job(&shutdown).await.unwrap());
    assert!(worker.process_next_job(&shutdown).await.unwrap());
    assert!(!worker.process_next_job(&shutdown).await.unwrap());

    let seen = runner.seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 2);
    for (job_id, published) in &seen {
        assert_eq!(published.as_deref(), Some(job_id.as_str()));
        assert_eq!(queue.get_job(job_id).unwrap().unwrap().status, Status::Success);
    }
    assert_eq!(state_file.read().unwrap().unwrap().job_id(), None);
}

#[tokio::test]
async fn failed_jobs_are_reported_as_errors() {
    let (_dir, queue, state_file) = setup();
    queue.add_job("parquet", &JobParams::new("a/one"), false).unwrap();
    let runner = Arc::new(FakeRunner {
        state_file: state_file.clone(),
        outcome: Status::Error,
        seen: Mutex::new(Vec::new()),
    });
    let worker = worker(&queue, runner, &state_file, &["parquet"]);

    assert!(worker.process_next_job(&CancellationToken::new()).await.unwrap());
    assert_eq!(queue.get_jobs_count_by_status("parquet").unwrap().error, 1);
}

#[tokio::test]
async fn shutdown_abandons_the_running_job() {
    let (_dir, queue, state_file) = setup();
    queue.add_job("parquet", &JobParams::new("a/one"), false).unwrap();
    let worker = worker(&queue, Arc::new(Hang), &state_file, &["parquet"]);

    let shutdown = CancellationToken::new();
    let canceller = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            shutdown.cancel();
        })
    };
    assert!(worker.process_next_job(&shutdown).await.unwrap());
    canceller.await.unwrap();

    let started = queue.get_started_jobs("parquet").unwrap();
    assert_eq!(started.len(), 1);
    assert_eq!(
        state_file.read().unwrap().unwrap().job_id(),
        Some(started[0].id.as_str())
    );
}

#[tokio::test]
async fn run_drains_the_queue_until_shutdown() {
    let (_dir, queue, state_file) = setup();
    for dataset in ["a/one", "a/two", "b/three"] {
        queue.add_job("parquet", &JobParams::new(dataset), false).unwrap();
    }
    let runner = Arc::new(FakeRunner {
        state_file: state_file.clone(),
        outcome: Status::Success,
        seen: Mutex::new(Vec::new()),
    });
    let worker = Arc::new(worker(&queue, runner, &state_file, &["parquet"]));

    let shutdown = CancellationToken::new();
    let task = {
        let worker = Arc::clone(&worker);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { worker.run(shutdown).await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    shutdown.cancel();
    task.await.unwrap().unwrap();

    assert_eq!(queue.get_jobs_count_by_status("parquet").unwrap().success, 3);
}

#[tokio::test]
async fn run_requires_job_types() {
    let (_dir, queue, state_file) = setup();
    let worker = worker(&queue, Arc::new(Hang), &state_file, &[]);
    assert!(matches!(
        worker.run(CancellationToken::new()).await,
        Err(WorkerError::Config(_))
    ));
}
