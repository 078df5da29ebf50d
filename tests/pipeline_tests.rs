use std::collections::HashSet;
use std::fs;
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use actix_web::{App, HttpRequest, HttpResponse, HttpServer, web};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use sqlx::sqlite::SqlitePool;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use classbuild::config::{ContainerConfig, ProjectConfig, SandboxHostConfig, StudentConfig};
use classbuild::database as db;
use classbuild::job::JobState;
use classbuild::notifier::{OPERATION_ID_HEADER, ResultNotifier};
use classbuild::push::{
    self, PushEvent, PushEventRepository, RawCommit, RepositoryOwner, Student,
    StudentRepoPushEvents,
};
use classbuild::queue::JobQueue;
use classbuild::runner::ProjectRunner;
use classbuild::sandbox::SandboxHost;
use classbuild::worker::worker;

// End-to-end coverage of the build pipeline: push event in, deduplicated
// commit recorded, job queued, executed by a worker against a stub
// container runtime, and the result delivered to a callback server.

fn test_project() -> ProjectConfig {
    ProjectConfig {
        id: 1,
        name: "project1".to_string(),
        explicit_submission_required: true,
        private_file_paths: vec!["tests/GradedTests.java".to_string()],
        immutable_file_paths: vec![],
        test_classes: vec!["GradedTests".to_string()],
        students: vec![StudentConfig {
            user_id: 100,
            github_team: "team1".to_string(),
        }],
    }
}

fn at(t: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(t, 0).unwrap()
}

fn push_event(sha: &str, pushed_at: DateTime<Utc>) -> PushEvent {
    PushEvent {
        repository: PushEventRepository {
            name: "project1_team1".to_string(),
            owner: RepositoryOwner {
                name: "classroom-org".to_string(),
            },
            default_branch: Some("main".to_string()),
        },
        git_ref: "refs/heads/main".to_string(),
        after: sha.to_string(),
        commits: vec![RawCommit {
            id: sha.to_string(),
            message: format!("commit {sha}"),
            timestamp: pushed_at,
        }],
        created_at: pushed_at,
    }
}

fn repo_events(events: Vec<PushEvent>) -> Vec<StudentRepoPushEvents> {
    vec![StudentRepoPushEvents {
        student: Student {
            user_id: 100,
            github_team: "team1".to_string(),
        },
        events,
    }]
}

struct TestDb {
    pool: SqlitePool,
    path: PathBuf,
}

impl TestDb {
    async fn new() -> Self {
        let path = std::env::temp_dir().join(format!(
            "classbuild-test-{}.sqlite3",
            Uuid::new_v4().simple()
        ));
        let pool = db::init_db(&path).await.unwrap();
        Self { pool, path }
    }
}

impl Drop for TestDb {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
        let _ = fs::remove_file(format!("{}-wal", self.path.display()));
        let _ = fs::remove_file(format!("{}-shm", self.path.display()));
    }
}

#[actix_web::test]
async fn explicit_submission_scenario_end_to_end() {
    let test_db = TestDb::new().await;
    let project = test_project();
    let queue = JobQueue::new();

    // A push arrives carrying one commit.
    let existing = db::load_descriptors(project.id, &test_db.pool).await.unwrap();
    assert_eq!(existing, HashSet::new());

    let new_commits =
        push::new_commits_to_process(&project, &existing, &repo_events(vec![push_event("abc123", at(2))]));
    assert_eq!(new_commits.len(), 1);
    let token = new_commits[0].commit.build_request_token.clone();
    assert!(token.is_some(), "explicit-submission projects issue a token");

    let commits: Vec<_> = new_commits.iter().map(|pec| pec.commit.clone()).collect();
    db::save_commits(&commits, &test_db.pool).await.unwrap();

    let job_id =
        push::create_build_job(&project, &new_commits[0], "/builds/result", &queue, "op-1").await;
    db::set_build_job_id(&new_commits[0].commit.descriptor(), &job_id, &test_db.pool)
        .await
        .unwrap();

    let queued = queue.pop().await;
    assert_eq!(queued.job_id, job_id);
    assert_eq!(queued.job.commit_sha, "abc123");
    assert_eq!(queued.job.build_request_token, token);

    // The webhook is retried a second later; the commit is already
    // known and nothing new is queued.
    let existing = db::load_descriptors(project.id, &test_db.pool).await.unwrap();
    let replayed =
        push::new_commits_to_process(&project, &existing, &repo_events(vec![push_event("abc123", at(3))]));
    assert_eq!(replayed.len(), 0);

    // A genuinely new commit still gets through.
    let next =
        push::new_commits_to_process(&project, &existing, &repo_events(vec![push_event("def456", at(4))]));
    assert_eq!(next.len(), 1);
    assert_eq!(next[0].commit.sha, "def456");
}

// ---------------------------------------------------------------------
// Worker execution against a stub container runtime, with a local HTTP
// server capturing the result callback.

type CapturedCallbacks = Arc<Mutex<Vec<(String, Value)>>>;

async fn capture_callback(
    req: HttpRequest,
    body: web::Json<Value>,
    store: web::Data<CapturedCallbacks>,
) -> HttpResponse {
    let operation_id = req
        .headers()
        .get(OPERATION_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();

    store.lock().unwrap().push((operation_id, body.into_inner()));
    HttpResponse::Ok().finish()
}

/// Starts a callback-capturing server on an ephemeral port and returns
/// its base URL plus the store the handler appends to.
fn start_callback_server() -> (String, CapturedCallbacks) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let store: CapturedCallbacks = Arc::new(Mutex::new(Vec::new()));
    let handler_store = store.clone();

    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(handler_store.clone()))
            .route("/builds/result", web::post().to(capture_callback))
    })
    .listen(listener)
    .unwrap()
    .workers(1)
    .run();
    actix_web::rt::spawn(server);

    (format!("http://127.0.0.1:{port}"), store)
}

struct StubRuntime {
    root: PathBuf,
    work_root: PathBuf,
    stub_path: PathBuf,
}

impl StubRuntime {
    fn new() -> Self {
        let root = std::env::temp_dir().join(format!("classbuild-e2e-{}", Uuid::new_v4().simple()));
        let work_root = root.join("jobs");
        fs::create_dir_all(&work_root).unwrap();

        Self {
            stub_path: root.join("docker-stub.sh"),
            root,
            work_root,
        }
    }

    fn write_stub(&self, body: &str) {
        fs::write(&self.stub_path, format!("#!/bin/sh\n{body}\n")).unwrap();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.stub_path, fs::Permissions::from_mode(0o755)).unwrap();
        }
    }

    /// A stub behaving like a container whose build and tests passed:
    /// it writes a well-formed test-result list as the response.
    fn write_passing_stub(&self) {
        self.write_stub(&format!(
            r#"for d in "{root}"/*/; do
  printf '%s' '[{{"class_name":"GradedTests","test_name":"testAdd","failure":null}}]' > "${{d}}response.json"
done
echo "cloning project1_team1...""#,
            root = self.work_root.display()
        ));
    }

    fn sandbox(&self, max_lifetime_secs: u64) -> SandboxHost {
        SandboxHost::new(
            SandboxHostConfig {
                docker_path: self.stub_path.to_string_lossy().into_owned(),
                work_root: self.work_root.clone(),
                mount_root: None,
            },
            ContainerConfig {
                image: "classbuild/project-runner".to_string(),
                mount_point: "/mnt/buildjob".to_string(),
                request_file_name: "request.json".to_string(),
                response_file_name: "response.json".to_string(),
                max_lifetime_secs,
                cpu_shares: 128,
            },
        )
    }
}

impl Drop for StubRuntime {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}

async fn wait_for_callback(store: &CapturedCallbacks) -> (String, Value) {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(captured) = store.lock().unwrap().first().cloned() {
            return captured;
        }
        assert!(
            Instant::now() < deadline,
            "no callback was delivered within 10s"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn run_one_job_through_worker(
    stub: &StubRuntime,
    max_lifetime_secs: u64,
) -> (String, Value, JobState) {
    let (callback_host, store) = start_callback_server();

    let queue = Arc::new(JobQueue::new());
    let runner = Arc::new(ProjectRunner::new(
        stub.sandbox(max_lifetime_secs),
        ResultNotifier::new(),
        callback_host,
        "gh-token".to_string(),
    ));

    let project = test_project();
    let new_commits = push::new_commits_to_process(
        &project,
        &HashSet::new(),
        &repo_events(vec![push_event("abc123", at(2))]),
    );
    let job_id =
        push::create_build_job(&project, &new_commits[0], "/builds/result", &queue, "op-42").await;

    let shutdown = CancellationToken::new();
    let worker_handle = tokio::spawn(worker(1, runner, queue.clone(), shutdown.clone()));

    let (operation_id, result) = wait_for_callback(&store).await;

    // After delivery the job leaves the queue's visible history.
    let deadline = Instant::now() + Duration::from_secs(5);
    let final_state = loop {
        let status = queue.job_status(&job_id).await;
        if status.state == JobState::Unknown || Instant::now() >= deadline {
            break status.state;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    };

    shutdown.cancel();
    worker_handle.await.unwrap().unwrap();

    (operation_id, result, final_state)
}

#[actix_web::test]
async fn worker_delivers_completed_result_to_callback() {
    let stub = StubRuntime::new();
    stub.write_passing_stub();

    let (operation_id, result, final_state) = run_one_job_through_worker(&stub, 30).await;

    assert_eq!(operation_id, "op-42");
    assert_eq!(result["status"], "Completed");
    assert!(result["build_request_token"].is_string());

    let test_results = result["test_results"].as_array().unwrap();
    assert_eq!(test_results.len(), 1);
    assert_eq!(test_results[0]["test_name"], "testAdd");
    assert!(test_results[0]["failure"].is_null());

    assert!(result["build_output"].as_str().unwrap().contains("cloning"));
    assert_eq!(final_state, JobState::Unknown);
}

#[actix_web::test]
async fn worker_reports_timeout_for_overrunning_jobs() {
    // The stub ignores the kill-path `rm -f` invocation and sleeps well
    // past the 1 second lifetime.
    let stub = StubRuntime::new();
    stub.write_stub(
        r#"case "$1" in
  rm) exit 0 ;;
esac
sleep 30"#,
    );

    let (operation_id, result, final_state) = run_one_job_through_worker(&stub, 1).await;

    assert_eq!(operation_id, "op-42");
    assert_eq!(result["status"], "Timeout");
    assert!(result["test_results"].is_null());
    assert_eq!(final_state, JobState::Unknown);
}
