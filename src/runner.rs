use anyhow::Result;
use chrono::Utc;

use crate::job::{ProjectJob, ProjectJobResult, ProjectJobStatus, TestResult};
use crate::notifier::ResultNotifier;
use crate::sandbox::SandboxHost;

// Environment variables handed to the sandboxed build.
const GITHUB_OAUTH_TOKEN_VAR: &str = "GITHUB_OAUTH_TOKEN";
const GITHUB_ORG_NAME_VAR: &str = "GITHUB_ORG_NAME";
const GITHUB_SUBMISSION_REPO_NAME_VAR: &str = "GITHUB_SUBMISSION_REPO_NAME";
const GITHUB_TEMPLATE_REPO_NAME_VAR: &str = "GITHUB_TEMPLATE_REPO_NAME";
const PROJECT_NAME_VAR: &str = "PROJECT_NAME";
const COMMIT_SHA_VAR: &str = "COMMIT_SHA";
const TEST_CLASSES_VAR: &str = "TEST_CLASSES";
const PATHS_TO_COPY_VAR: &str = "PATHS_TO_COPY";

/// Executes project jobs in the sandbox and reports their results to
/// the callback URL each job names.
pub struct ProjectRunner {
    sandbox: SandboxHost,
    notifier: ResultNotifier,
    callback_host: String,
    github_oauth_token: String,
}

impl ProjectRunner {
    pub fn new(
        sandbox: SandboxHost,
        notifier: ResultNotifier,
        callback_host: String,
        github_oauth_token: String,
    ) -> Self {
        Self {
            sandbox,
            notifier,
            callback_host,
            github_oauth_token,
        }
    }

    /// Runs one job to completion and notifies the callback path.
    pub async fn execute_project_job(
        &self,
        job: &ProjectJob,
        operation_id: &str,
    ) -> Result<ProjectJobResult> {
        log::info!(
            "Starting project job for {}/{} at {} (operation {operation_id})",
            job.github_org,
            job.submission_repo,
            job.commit_sha
        );

        let result = self.run_job(job).await?;

        log::info!(
            "Project job completed with {:?} status and {} test results",
            result.status,
            result.test_results.as_ref().map_or(0, Vec::len)
        );

        self.notifier
            .notify(&self.callback_host, &job.callback_path, operation_id, &result)
            .await;

        Ok(result)
    }

    async fn run_job(&self, job: &ProjectJob) -> Result<ProjectJobResult> {
        let environment = self.build_environment(job);

        let job_started = Utc::now();
        let outcome = self.sandbox.run(None, &environment).await?;
        let job_finished = Utc::now();

        let test_results = outcome.response.as_deref().and_then(parse_test_results);
        let status = classify(
            outcome.completed,
            outcome.response.is_some(),
            test_results.is_some(),
        );

        Ok(ProjectJobResult {
            build_request_token: job.build_request_token.clone(),
            status,
            job_started,
            job_finished,
            build_output: outcome.output,
            test_results,
        })
    }

    fn build_environment(&self, job: &ProjectJob) -> Vec<(String, String)> {
        vec![
            (
                GITHUB_OAUTH_TOKEN_VAR.to_string(),
                self.github_oauth_token.clone(),
            ),
            (GITHUB_ORG_NAME_VAR.to_string(), job.github_org.clone()),
            (PROJECT_NAME_VAR.to_string(), job.project_name.clone()),
            (
                GITHUB_SUBMISSION_REPO_NAME_VAR.to_string(),
                job.submission_repo.clone(),
            ),
            (
                GITHUB_TEMPLATE_REPO_NAME_VAR.to_string(),
                job.template_repo.clone(),
            ),
            (COMMIT_SHA_VAR.to_string(), job.commit_sha.clone()),
            (PATHS_TO_COPY_VAR.to_string(), job.copy_paths.join(";")),
            (TEST_CLASSES_VAR.to_string(), job.test_classes.join(";")),
        ]
    }
}

/// Maps a raw sandbox outcome to a job status.
///
/// A response that was produced but fails to parse is classified as
/// Timeout, while a missing response is an Error. The asymmetry is the
/// documented contract of the callback protocol; do not "fix" it here.
pub fn classify(completed: bool, has_response: bool, valid_response: bool) -> ProjectJobStatus {
    if completed {
        if has_response {
            if valid_response {
                ProjectJobStatus::Completed
            } else {
                ProjectJobStatus::Timeout
            }
        } else {
            ProjectJobStatus::Error
        }
    } else {
        ProjectJobStatus::Timeout
    }
}

fn parse_test_results(response: &str) -> Option<Vec<TestResult>> {
    match serde_json::from_str(response) {
        Ok(results) => Some(results),
        Err(e) => {
            log::error!("Failed to parse sandbox response: {e}; response was: {response}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_matrix_is_exhaustive() {
        // Not completed: always a timeout, whatever the response looks like.
        for has_response in [false, true] {
            for valid in [false, true] {
                assert_eq!(
                    classify(false, has_response, valid),
                    ProjectJobStatus::Timeout
                );
            }
        }

        assert_eq!(classify(true, false, false), ProjectJobStatus::Error);
        assert_eq!(classify(true, true, false), ProjectJobStatus::Timeout);
        assert_eq!(classify(true, true, true), ProjectJobStatus::Completed);
    }

    #[test]
    fn well_formed_response_parses_into_test_results() {
        let response = r#"[
            {"class_name": "GradedTests", "test_name": "testAdd", "failure": null},
            {"class_name": "GradedTests", "test_name": "testSub",
             "failure": {"message": "expected 1", "trace": "at line 3", "output": "got 2"}}
        ]"#;

        let results = parse_test_results(response).unwrap();
        assert_eq!(results.len(), 2);
        assert!(results[0].failure.is_none());
        assert_eq!(results[1].failure.as_ref().unwrap().message, "expected 1");
    }

    #[test]
    fn malformed_response_yields_none() {
        assert!(parse_test_results("not json").is_none());
        assert!(parse_test_results(r#"{"unexpected": "shape"}"#).is_none());
    }
}
