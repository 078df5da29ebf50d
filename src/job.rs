use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One unit of work submitted to the queue: build and test a single
/// commit of a student submission repository.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProjectJob {
    /// Token correlating an explicit submission action to this commit,
    /// absent for projects that grade every push
    pub build_request_token: Option<String>,
    pub github_org: String,
    pub project_name: String,
    pub submission_repo: String,
    pub template_repo: String,
    pub commit_sha: String,
    /// Paths copied from the template repository into the submission
    /// before building
    pub copy_paths: Vec<String>,
    pub test_classes: Vec<String>,
    /// URL path to notify once the job finishes
    pub callback_path: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectJobStatus {
    Completed,
    Timeout,
    Error,
}

/// The outcome of one build job, delivered to the callback URL.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ProjectJobResult {
    pub build_request_token: Option<String>,
    pub status: ProjectJobStatus,
    pub job_started: DateTime<Utc>,
    pub job_finished: DateTime<Utc>,
    /// Combined stdout/stderr of the sandboxed build
    pub build_output: String,
    pub test_results: Option<Vec<TestResult>>,
}

impl ProjectJobResult {
    /// A build succeeded when the runner produced a test-result list,
    /// even an empty one.
    pub fn succeeded(&self) -> bool {
        self.test_results.is_some()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TestResult {
    pub class_name: String,
    pub test_name: String,
    pub failure: Option<TestFailure>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TestFailure {
    pub message: String,
    pub trace: String,
    pub output: String,
}

/// Queue-side view of where a job is in its lifecycle.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    NotStarted,
    InProgress,
    Unknown,
}
