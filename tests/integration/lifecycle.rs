//! Task mount lifecycles across worker restarts

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::json;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use warden::clients::{Index, IndexedTask, PurgeCacheService, PurgeRequest, Queue};
use warden::config::Config;
use warden::error::ErrorKind;
use warden::mounts::{Mounts, TaskContext, TaskMount};
use warden::{WardenError, WardenResult};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[derive(Default)]
struct FakeQueue {
    artifacts: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl FakeQueue {
    fn publish(&self, task_id: &str, artifact: &str, content: Vec<u8>) {
        self.artifacts
            .lock()
            .unwrap()
            .insert((task_id.to_string(), artifact.to_string()), content);
    }
}

#[async_trait]
impl Queue for FakeQueue {
    async fn download_artifact_to_file(
        &self,
        task_id: &str,
        _run_id: Option<u32>,
        artifact: &str,
        dest: &Path,
    ) -> WardenResult<u64> {
        let content = self
            .artifacts
            .lock()
            .unwrap()
            .get(&(task_id.to_string(), artifact.to_string()))
            .cloned()
            .ok_or_else(|| WardenError::download(artifact, "404 Not Found"))?;
        std::fs::write(dest, &content).map_err(|e| WardenError::io("writing artifact", e))?;
        Ok(content.len() as u64)
    }
}

struct FakeIndex {
    tasks: HashMap<String, String>,
}

#[async_trait]
impl Index for FakeIndex {
    async fn find_task(&self, namespace: &str) -> WardenResult<IndexedTask> {
        self.tasks
            .get(namespace)
            .map(|task_id| IndexedTask {
                namespace: namespace.to_string(),
                task_id: task_id.clone(),
            })
            .ok_or_else(|| WardenError::User(format!("{} not found", namespace)))
    }
}

#[derive(Default)]
struct FakePurges {
    requests: Mutex<Vec<PurgeRequest>>,
}

#[async_trait]
impl PurgeCacheService for FakePurges {
    async fn purge_requests(
        &self,
        _worker_pool_id: &str,
        _since: Option<DateTime<Utc>>,
    ) -> WardenResult<Vec<PurgeRequest>> {
        Ok(self.requests.lock().unwrap().clone())
    }
}

struct Worker {
    temp: TempDir,
    queue: Arc<FakeQueue>,
    purges: Arc<FakePurges>,
}

impl Worker {
    fn new() -> Self {
        Self {
            temp: TempDir::new().unwrap(),
            queue: Arc::new(FakeQueue::default()),
            purges: Arc::new(FakePurges::default()),
        }
    }

    fn config(&self) -> Config {
        let mut config = Config::default();
        config.worker.state_dir = Some(self.temp.path().join("state"));
        config.mounts.required_free_space_mb = 0;
        config.http.initial_backoff_ms = 10;
        config
    }

    /// A fresh worker process reusing the persisted state
    fn boot(&self) -> Arc<Mounts> {
        Arc::new(
            Mounts::initialise(
                &self.config(),
                Arc::clone(&self.queue) as Arc<dyn Queue>,
                Arc::clone(&self.purges) as Arc<dyn PurgeCacheService>,
            )
            .unwrap(),
        )
    }

    fn task(&self, mounts: &Arc<Mounts>, name: &str, payload: serde_json::Value) -> TaskMount {
        self.task_with_index(mounts, name, payload, HashMap::new())
    }

    fn task_with_index(
        &self,
        mounts: &Arc<Mounts>,
        name: &str,
        payload: serde_json::Value,
        indexed: HashMap<String, String>,
    ) -> TaskMount {
        let task_dir = self.temp.path().join("tasks").join(name);
        std::fs::create_dir_all(&task_dir).unwrap();
        let ctx = TaskContext::new(name, task_dir, Arc::new(FakeIndex { tasks: indexed }))
            .with_payload(serde_json::from_value(payload).unwrap())
            .with_dependencies(vec!["build".into()]);
        TaskMount::new(Arc::clone(mounts), ctx)
    }

    fn task_dir(&self, name: &str) -> std::path::PathBuf {
        self.temp.path().join("tasks").join(name)
    }
}

fn tar_gz(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (name, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, *content).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

#[tokio::test]
async fn caches_survive_worker_restart() {
    let worker = Worker::new();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/tool.sh"))
        .respond_with(ResponseTemplate::new(200).set_body_string("echo hi\n"))
        .expect(1)
        .mount(&server)
        .await;
    let payload = json!({
        "mounts": [
            {"cacheName": "cargo", "directory": "target"},
            {"file": "bin/tool.sh", "content": {"url": format!("{}/tool.sh", server.uri())}}
        ]
    });

    let mounts = worker.boot();
    let mut first = worker.task(&mounts, "first", payload.clone());
    first.start().await.unwrap();
    std::fs::write(worker.task_dir("first").join("target/incremental"), "state").unwrap();
    assert!(first.stop(Some(0)).await.is_empty());
    drop(first);
    drop(mounts);

    let mounts = worker.boot();
    assert!(mounts.directory_caches().contains("cargo"));
    assert_eq!(mounts.file_caches().len(), 1);

    let mut second = worker.task(&mounts, "second", payload);
    second.start().await.unwrap();

    let dir = worker.task_dir("second");
    assert_eq!(
        std::fs::read_to_string(dir.join("target/incremental")).unwrap(),
        "state"
    );
    assert_eq!(std::fs::read_to_string(dir.join("bin/tool.sh")).unwrap(), "echo hi\n");
    assert_eq!(mounts.directory_caches().get("cargo").unwrap().hits, 2);
    assert!(second.stop(Some(0)).await.is_empty());
}

#[tokio::test]
async fn purge_request_discards_cache_before_next_task() {
    let worker = Worker::new();
    let payload = json!({"mounts": [{"cacheName": "cargo", "directory": "target"}]});
    let mounts = worker.boot();

    let mut first = worker.task(&mounts, "first", payload.clone());
    first.start().await.unwrap();
    std::fs::write(worker.task_dir("first").join("target/stale"), "x").unwrap();
    assert!(first.stop(Some(0)).await.is_empty());

    worker.purges.requests.lock().unwrap().push(PurgeRequest {
        cache_name: "cargo".into(),
        before: Utc::now() + Duration::minutes(10),
    });

    let mut second = worker.task(&mounts, "second", payload);
    second.start().await.unwrap();

    assert!(!worker.task_dir("second").join("target/stale").exists());
    assert_eq!(mounts.directory_caches().get("cargo").unwrap().hits, 1);
    assert!(second.stop(Some(0)).await.is_empty());
}

#[tokio::test]
async fn indexed_archive_mounts_read_only_directory() {
    let worker = Worker::new();
    worker.queue.publish(
        "build",
        "public/toolchain.tar.gz",
        tar_gz(&[("bin/cc", b"#!/bin/sh\n"), ("README", b"toolchain")]),
    );
    let payload = json!({
        "mounts": [{
            "directory": "toolchain",
            "content": {"namespace": "project.toolchain.latest", "artifact": "public/toolchain.tar.gz"},
            "format": "tar.gz"
        }]
    });
    let indexed = HashMap::from([("project.toolchain.latest".to_string(), "build".to_string())]);
    let mounts = worker.boot();

    let mut task = worker.task_with_index(&mounts, "first", payload, indexed);
    task.start().await.unwrap();

    let toolchain = worker.task_dir("first").join("toolchain");
    assert_eq!(std::fs::read_to_string(toolchain.join("README")).unwrap(), "toolchain");
    assert!(toolchain.join("bin/cc").exists());
    assert!(mounts.file_caches().contains("artifact:build:public/toolchain.tar.gz"));
    assert!(task.stop(Some(0)).await.is_empty());
}

#[tokio::test]
async fn unresolvable_namespace_fails_the_task() {
    let worker = Worker::new();
    let payload = json!({
        "mounts": [{
            "file": "tool",
            "content": {"namespace": "project.missing", "artifact": "public/tool"}
        }]
    });
    let mounts = worker.boot();

    let mut task = worker.task(&mounts, "first", payload);
    let err = task.start().await.unwrap_err();

    assert!(matches!(err, WardenError::IndexLookup { .. }));
    assert_eq!(err.kind(), ErrorKind::TaskFailure);
    assert!(task.stop(None).await.is_empty());
}

#[tokio::test]
async fn sha256_mismatch_fails_without_caching() {
    let worker = Worker::new();
    worker
        .queue
        .publish("build", "public/tool", b"tampered".to_vec());
    let payload = json!({
        "mounts": [{
            "file": "tool",
            "content": {
                "taskId": "build",
                "artifact": "public/tool",
                "sha256": "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08"
            }
        }]
    });
    let mounts = worker.boot();

    let mut task = worker.task(&mounts, "first", payload);
    let err = task.start().await.unwrap_err();

    assert!(matches!(err, WardenError::HashMismatch { .. }));
    assert!(mounts.file_caches().is_empty());
    assert!(!worker.task_dir("first").join("tool").exists());
}

#[tokio::test]
async fn impossible_free_space_is_a_worker_fault() {
    let worker = Worker::new();
    let mut config = worker.config();
    config.mounts.required_free_space_mb = u64::MAX / (1024 * 1024);
    let mounts = Arc::new(
        Mounts::initialise(
            &config,
            Arc::clone(&worker.queue) as Arc<dyn Queue>,
            Arc::clone(&worker.purges) as Arc<dyn PurgeCacheService>,
        )
        .unwrap(),
    );

    let mut task = worker.task(
        &mounts,
        "first",
        json!({"mounts": [{"file": "f", "content": {"raw": "x"}}]}),
    );
    let err = task.start().await.unwrap_err();

    assert!(matches!(err, WardenError::DiskSpaceExhausted { .. }));
    assert!(err.is_worker_fault());
}
