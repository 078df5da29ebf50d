use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use uuid::Uuid;

use crate::config::{ContainerConfig, SandboxHostConfig};

/// Environment variable carrying the in-container request file path.
pub const REQUEST_FILE_PATH_VAR: &str = "REQUEST_FILE_PATH";
/// Environment variable carrying the in-container response file path.
pub const RESPONSE_FILE_PATH_VAR: &str = "RESPONSE_FILE_PATH";

/// Debounce between the exit/timeout race and the exit-flag check; a
/// just-exited process may not have its flag observable yet.
const WAIT_FOR_EXIT_GRACE: Duration = Duration::from_millis(50);

/// How many times to attempt removing a container that outlived its
/// maximum lifetime.
const KILL_CONTAINER_RETRY_ATTEMPTS: u32 = 15;
const KILL_CONTAINER_RETRY_DELAY: Duration = Duration::from_secs(1);

/// What one sandbox run produced. Timeouts and missing responses are
/// data here, never errors.
#[derive(Debug)]
pub struct SandboxOutcome {
    /// False when the container had to be killed at its lifetime limit
    pub completed: bool,
    /// Combined stdout/stderr of the container
    pub output: String,
    /// Contents of the response file, if the container wrote one
    pub response: Option<String>,
}

/// Runs one job per call in a fresh, resource-capped container, using
/// files in a uniquely named working directory as the request/response
/// channel.
pub struct SandboxHost {
    host: SandboxHostConfig,
    container: ContainerConfig,
}

impl SandboxHost {
    pub fn new(host: SandboxHostConfig, container: ContainerConfig) -> Self {
        Self { host, container }
    }

    /// Runs the container image once. The request contents, if any, are
    /// written to the configured request file inside a fresh working
    /// directory that is bind-mounted into the container; the response
    /// file is read back after the container exits. The working
    /// directory is deleted on every exit path.
    ///
    /// Failing to start the container process at all is the only error;
    /// everything that happens after launch is reported in the outcome.
    pub async fn run(
        &self,
        request_contents: Option<&str>,
        environment: &[(String, String)],
    ) -> Result<SandboxOutcome> {
        let container_name = Uuid::new_v4().simple().to_string();
        let work_dir = self.host.work_root.join(&container_name);
        std::fs::create_dir_all(&work_dir)
            .with_context(|| format!("creating sandbox work dir {}", work_dir.display()))?;

        let outcome = self
            .run_in_work_dir(&container_name, &work_dir, request_contents, environment)
            .await;

        if let Err(e) = std::fs::remove_dir_all(&work_dir) {
            log::warn!(
                "Failed to remove sandbox work dir {}: {e}",
                work_dir.display()
            );
        }

        outcome
    }

    async fn run_in_work_dir(
        &self,
        container_name: &str,
        work_dir: &Path,
        request_contents: Option<&str>,
        environment: &[(String, String)],
    ) -> Result<SandboxOutcome> {
        if let Some(contents) = request_contents {
            let request_path = work_dir.join(&self.container.request_file_name);
            std::fs::write(&request_path, contents)
                .with_context(|| format!("writing request file {}", request_path.display()))?;
        }

        let args = self.container_arguments(container_name, environment);
        log::debug!("Launching sandbox container {container_name}");

        let mut child = Command::new(&self.host.docker_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning {}", self.host.docker_path))?;

        let stdout_lines = tokio::spawn(collect_lines(child.stdout.take()));
        let stderr_lines = tokio::spawn(collect_lines(child.stderr.take()));

        let max_lifetime = Duration::from_secs(self.container.max_lifetime_secs);
        let wait_result = tokio::time::timeout(max_lifetime, child.wait()).await;

        tokio::time::sleep(WAIT_FOR_EXIT_GRACE).await;

        let completed = match wait_result {
            Ok(exit) => {
                exit.context("waiting for sandbox container")?;
                true
            }
            // Recheck after the grace delay; the process may have
            // exited right at the deadline.
            Err(_elapsed) => match child.try_wait()? {
                Some(_) => true,
                None => {
                    log::warn!(
                        "Sandbox container {container_name} exceeded its {}s lifetime, killing it",
                        self.container.max_lifetime_secs
                    );
                    kill_child(&mut child).await;
                    self.force_remove_container(container_name).await;
                    false
                }
            },
        };

        let mut output = stdout_lines.await.unwrap_or_default();
        output.push_str(&stderr_lines.await.unwrap_or_default());

        let response = if completed {
            self.read_response_file(work_dir)
        } else {
            None
        };

        Ok(SandboxOutcome {
            completed,
            output,
            response,
        })
    }

    /// Command-line arguments for one container run.
    fn container_arguments(
        &self,
        container_name: &str,
        environment: &[(String, String)],
    ) -> Vec<String> {
        let mount_dir: PathBuf = self.host.mount_root().join(container_name);
        let mount_point = &self.container.mount_point;

        let mut args = vec![
            "run".to_string(),
            // Name the container, so we can kill it if necessary
            "--name".to_string(),
            container_name.to_string(),
            // Cap the relative CPU weight well below one default share,
            // so many sandboxes can coexist
            "--cpu-shares".to_string(),
            self.container.cpu_shares.to_string(),
            // Mount the folder holding the request and response files
            "-v".to_string(),
            format!("{}:{mount_point}", mount_dir.display()),
            "-e".to_string(),
            format!(
                "{REQUEST_FILE_PATH_VAR}={mount_point}/{}",
                self.container.request_file_name
            ),
            "-e".to_string(),
            format!(
                "{RESPONSE_FILE_PATH_VAR}={mount_point}/{}",
                self.container.response_file_name
            ),
        ];

        for (key, value) in environment {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }

        // Remove the container once it finishes executing
        args.push("--rm".to_string());
        args.push(self.container.image.clone());

        args
    }

    /// A container that ignored the kill signal would leak; removal is
    /// retried a bounded number of times and then given up on.
    async fn force_remove_container(&self, container_name: &str) {
        for attempt in 1..=KILL_CONTAINER_RETRY_ATTEMPTS {
            let removal = Command::new(&self.host.docker_path)
                .args(["rm", "-f", container_name])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;

            match removal {
                Ok(status) if status.success() => return,
                Ok(status) => log::warn!(
                    "Removing container {container_name} failed with {status} (attempt {attempt})"
                ),
                Err(e) => log::warn!(
                    "Removing container {container_name} failed: {e} (attempt {attempt})"
                ),
            }

            tokio::time::sleep(KILL_CONTAINER_RETRY_DELAY).await;
        }

        log::error!(
            "Gave up removing container {container_name} after {KILL_CONTAINER_RETRY_ATTEMPTS} attempts"
        );
    }

    /// A job may legitimately complete without writing a response if it
    /// crashed internally; only a missing file counts as "no response".
    /// An existing file is always a response, even an empty or
    /// unreadable-as-results one; that distinction drives the job's
    /// final classification.
    fn read_response_file(&self, work_dir: &Path) -> Option<String> {
        let response_path = work_dir.join(&self.container.response_file_name);
        match std::fs::read_to_string(&response_path) {
            Ok(contents) => Some(contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                log::warn!(
                    "Failed to read response file {}: {e}",
                    response_path.display()
                );
                None
            }
        }
    }
}

async fn kill_child(child: &mut Child) {
    if let Err(e) = child.kill().await {
        log::warn!("Failed to kill sandbox process: {e}");
    }
}

/// Drains one output stream line by line into a buffer as lines arrive.
async fn collect_lines(stream: Option<impl AsyncRead + Unpin>) -> String {
    let Some(stream) = stream else {
        return String::new();
    };

    let mut lines = BufReader::new(stream).lines();
    let mut collected = String::new();
    while let Ok(Some(line)) = lines.next_line().await {
        collected.push_str(&line);
        collected.push('\n');
    }
    collected
}
