use super::*;

use serde_json::json;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::listener::dispatch_frame;
use crate::proxy::ServerProxy;
use fluxrun_core::config::{FileManagerConfig, ServerProxyConfig};

const FAST: Duration = Duration::from_millis(50);

struct Harness {
    server: MockServer,
    proxy: Arc<ServerProxy>,
    files: Arc<FileManager>,
    _workdir: tempfile::TempDir,
}

fn job_json(job: &JobRecord) -> Value {
    serde_json::to_value(job).unwrap()
}

fn pending_job(priority: u32, executable: &str, script: &str) -> JobRecord {
    JobRecord {
        id: Uuid::new_v4(),
        application_id: Uuid::new_v4(),
        priority,
        executable: executable.to_string(),
        command_line_args: vec!["-c".to_string(), script.to_string()],
        resource_ids: vec![],
        status: JobStatus::Queued,
        working_directory: None,
        exit_code: None,
    }
}

async fn harness_with_backlog(backlog: &[JobRecord]) -> Harness {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
        .and(path_regex("^/runner_manager/report_status/.+"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path_regex("^/job_manager/job/.+"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path_regex("^/job_manager/resource/.+"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;

    let config = ServerProxyConfig {
        name: "test_runner".to_string(),
        id: Uuid::new_v4(),
        token: Uuid::new_v4(),
        api_url: server.uri().parse().unwrap(),
        api_port: server.address().port(),
        report_interval: 600,
    };
    Mock::given(method("GET"))
        .and(path(format!("/job_manager/runner_jobs/{}", config.id)))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(backlog.iter().map(job_json).collect::<Vec<_>>()),
        )
        .mount(&server)
        .await;

    let proxy = Arc::new(ServerProxy::connect(&config).await.unwrap());

    let workdir = tempfile::tempdir().unwrap();
    let files = Arc::new(FileManager::new(&FileManagerConfig {
        working_directory: workdir.path().to_path_buf(),
        simulation_directory: "simulations".into(),
    }));
    files.init_directories().unwrap();

    Harness {
        server,
        proxy,
        files,
        _workdir: workdir,
    }
}

async fn mount_application(server: &MockServer, application_id: Uuid) {
    Mock::given(method("GET"))
        .and(path(format!(
            "/application_manager/application/{application_id}"
        )))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": application_id,
            "name": "solver",
            "application_type": "PYTHON",
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!(
            "/application_manager/application/{application_id}/program"
        )))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"print('solver')".to_vec()))
        .mount(server)
        .await;
}

async fn manager_for(harness: &Harness, max_concurrent_jobs: usize) -> JobManager {
    let config = JobManagerConfig {
        max_concurrent_jobs,
        max_main_loop_count: u64::MAX,
    };
    let mut manager = JobManager::new(
        harness.proxy.clone(),
        harness.files.clone(),
        config,
        CancellationToken::new(),
    )
    .await
    .unwrap();
    manager.set_pacing(FAST, FAST);
    manager
}

#[tokio::test]
async fn startup_partitions_the_backlog_between_queue_and_tracker() {
    let mut running = pending_job(2, "/bin/sh", "exit 0");
    running.status = JobStatus::Running;
    let mut done = pending_job(3, "/bin/sh", "exit 0");
    done.status = JobStatus::Succeeded;
    let queued = pending_job(1, "/bin/sh", "exit 0");

    let harness = harness_with_backlog(&[running.clone(), done.clone(), queued.clone()]).await;
    let manager = manager_for(&harness, 2).await;

    assert_eq!(manager.pending_len(), 1);
    assert!(manager.tracker().is_active(running.id));
    assert!(manager.tracker().is_completed(done.id));
    assert!(!manager.tracker().is_tracked(queued.id));

    harness.proxy.shutdown();
}

#[tokio::test]
async fn launch_failure_rolls_the_job_back() {
    // An empty executable cannot be launched; the manager must reset the
    // job on the server and requeue it locally at its original priority.
    let job = pending_job(7, "", "");
    let job_id = job.id;

    let harness = harness_with_backlog(&[job]).await;
    let mut manager = manager_for(&harness, 2).await;
    assert_eq!(manager.pending_len(), 1);

    manager.tick().await.unwrap();

    // The server was told the job is QUEUED again, on the same
    // id-suffixed endpoint every other job PATCH uses.
    let runner_id = harness.proxy.runner_id();
    let requests = harness.server.received_requests().await.unwrap();
    let reset = requests
        .iter()
        .find(|request| {
            request.url.path() == format!("/job_manager/job/{job_id}/{runner_id}")
        })
        .expect("rollback PATCH not sent");
    let body: Value = serde_json::from_slice(&reset.body).unwrap();
    assert_eq!(body["status"], "QUEUED");

    // The job is back in the local queue at priority 7, and not tracked.
    assert_eq!(manager.worker_count(), 0);
    assert!(!manager.tracker().is_tracked(job_id));
    let requeued = manager.pending_queue().try_pop().unwrap();
    assert_eq!(requeued.id, job_id);
    assert_eq!(requeued.priority, 7);
    assert_eq!(requeued.status, JobStatus::Queued);

    harness.proxy.shutdown();
}

#[cfg(unix)]
#[tokio::test]
async fn at_capacity_no_job_launches_until_a_worker_is_reaped() {
    let slow = pending_job(1, "/bin/sh", "sleep 0.4");
    let next = pending_job(2, "/bin/sh", "exit 0");
    let harness = harness_with_backlog(&[slow.clone(), next.clone()]).await;
    mount_application(&harness.server, slow.application_id).await;
    mount_application(&harness.server, next.application_id).await;

    let mut manager = manager_for(&harness, 1).await;
    assert_eq!(manager.pending_len(), 2);

    manager.tick().await.unwrap();
    assert_eq!(manager.worker_count(), 1);
    assert_eq!(manager.pending_len(), 1);

    // Still at capacity: the tick backs off without popping the queue.
    manager.tick().await.unwrap();
    assert_eq!(manager.worker_count(), 1);
    assert_eq!(manager.pending_len(), 1);

    // Once the first worker finishes and is reaped, the next job launches.
    for _ in 0..100 {
        manager.tick().await.unwrap();
        if manager.pending_len() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(manager.pending_len(), 0);

    // Drain the remaining worker.
    for _ in 0..100 {
        manager.tick().await.unwrap();
        if manager.worker_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(manager.worker_count(), 0);

    harness.proxy.shutdown();
}

#[tokio::test]
async fn new_job_announcements_are_queued_through_the_observer() {
    let harness = harness_with_backlog(&[]).await;
    let manager = manager_for(&harness, 1).await;
    assert_eq!(manager.pending_len(), 0);

    let job = pending_job(4, "/bin/sh", "exit 0");
    let frame = json!({
        "id": "m1",
        "type": "new_job_available",
        "job": job_json(&job),
    });
    let reply = dispatch_frame(harness.proxy.observers(), &frame.to_string()).unwrap();
    assert_eq!(reply, json!({"type": "success", "response_to": "m1"}));
    assert_eq!(manager.pending_len(), 1);

    // Non-pending announcements are ignored.
    let mut active = pending_job(4, "/bin/sh", "exit 0");
    active.status = JobStatus::Running;
    let frame = json!({
        "id": "m2",
        "type": "new_job_available",
        "job": job_json(&active),
    });
    dispatch_frame(harness.proxy.observers(), &frame.to_string()).unwrap();
    assert_eq!(manager.pending_len(), 1);

    harness.proxy.shutdown();
}

#[cfg(unix)]
#[tokio::test]
async fn terminate_frames_cancel_the_owning_job() {
    let job = pending_job(1, "/bin/sh", "sleep 30");
    let job_id = job.id;
    let application_id = job.application_id;
    let harness = harness_with_backlog(&[job]).await;
    mount_application(&harness.server, application_id).await;

    let mut manager = manager_for(&harness, 1).await;
    manager.tick().await.unwrap();
    assert_eq!(manager.worker_count(), 1);

    // Wait until the job is actually running.
    for _ in 0..100 {
        if manager.tracker().job_status(job_id) == Some(JobStatus::Running) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let frame = json!({
        "id": "m9",
        "type": "terminate",
        "job_id": job_id.to_string(),
    });
    let reply = dispatch_frame(harness.proxy.observers(), &frame.to_string()).unwrap();
    assert_eq!(reply["type"], "success");

    for _ in 0..100 {
        if manager.tracker().job_status(job_id) == Some(JobStatus::FailedTerminated) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(
        manager.tracker().job_status(job_id),
        Some(JobStatus::FailedTerminated)
    );

    harness.proxy.shutdown();
}

#[tokio::test]
async fn terminate_for_an_unknown_job_reports_an_error() {
    let harness = harness_with_backlog(&[]).await;
    let manager = manager_for(&harness, 1).await;

    let frame = json!({
        "id": "m3",
        "type": "terminate",
        "job_id": Uuid::new_v4().to_string(),
    });
    let reply = dispatch_frame(harness.proxy.observers(), &frame.to_string()).unwrap();
    assert_eq!(reply["type"], "error");
    assert!(reply["data"].as_str().unwrap().contains("not running"));

    drop(manager);
    harness.proxy.shutdown();
}

#[tokio::test]
async fn pause_is_answered_with_an_error() {
    let harness = harness_with_backlog(&[]).await;
    let _manager = manager_for(&harness, 1).await;

    let frame = json!({"id": "m4", "type": "pause"});
    let reply = dispatch_frame(harness.proxy.observers(), &frame.to_string()).unwrap();
    assert_eq!(reply["type"], "error");
    assert!(reply["data"].as_str().unwrap().contains("not supported"));

    harness.proxy.shutdown();
}

#[tokio::test]
async fn observers_cannot_be_registered_twice() {
    let harness = harness_with_backlog(&[]).await;
    let _manager = manager_for(&harness, 1).await;

    // A second manager against the same proxy would double-register.
    let result = JobManager::new(
        harness.proxy.clone(),
        harness.files.clone(),
        JobManagerConfig::default(),
        CancellationToken::new(),
    )
    .await;
    match result {
        Ok(_) => panic!("expected duplicate registration to fail"),
        Err(err) => assert_eq!(
            err,
            ObserverError::AlreadyRegistered("new_job_available".to_string())
        ),
    }

    harness.proxy.shutdown();
}
