use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;

#[derive(Parser)]
#[command(name = "classbuild", version = "1.0", about, long_about = None)]
pub struct CliArgs {
    /// Path to the configuration file
    #[arg(long = "config", short = 'c')]
    pub config_path: String,

    /// Whether to flush the existing commit database
    #[arg(long = "flush-data", short = 'f', default_value_t = false)]
    pub flush_data: bool,
}

impl CliArgs {
    /// Load the configuration from the specified file
    pub fn to_config(&self) -> std::io::Result<Config> {
        let file = std::fs::File::open(&self.config_path)?;
        let reader = std::io::BufReader::new(file);
        serde_json::from_reader(reader).map_err(|e| e.into())
    }
}

#[derive(Deserialize, Debug)]
pub struct Config {
    pub server: ServerConfig,
    /// Shared secret used to verify webhook payload signatures
    pub webhook_secret: String,
    /// OAuth token handed to the sandboxed build for cloning repositories
    pub github_oauth_token: String,
    /// Host portion of the build-result callback URL
    pub callback_host: String,
    /// Path portion of the build-result callback URL
    pub callback_path: String,
    #[serde(default = "default_workers")]
    pub workers: u8,
    pub sandbox: SandboxHostConfig,
    pub container: ContainerConfig,
    pub projects: Vec<ProjectConfig>,
}

#[derive(Deserialize, Debug)]
pub struct ServerConfig {
    pub bind_address: Option<String>,
    pub bind_port: Option<u16>,
}

/// Host-side settings for launching sandbox containers.
#[derive(Deserialize, Debug, Clone)]
pub struct SandboxHostConfig {
    #[serde(default = "default_docker_path")]
    pub docker_path: String,
    /// Directory where per-job request/response folders are created
    pub work_root: PathBuf,
    /// Path prefix of `work_root` as seen by the container runtime,
    /// when the service itself runs inside a container
    pub mount_root: Option<PathBuf>,
}

impl SandboxHostConfig {
    pub fn mount_root(&self) -> &PathBuf {
        self.mount_root.as_ref().unwrap_or(&self.work_root)
    }
}

/// Settings for the sandbox container instances themselves.
#[derive(Deserialize, Debug, Clone)]
pub struct ContainerConfig {
    pub image: String,
    #[serde(default = "default_mount_point")]
    pub mount_point: String,
    #[serde(default = "default_request_file_name")]
    pub request_file_name: String,
    #[serde(default = "default_response_file_name")]
    pub response_file_name: String,
    /// Hard wall-clock limit for one job, in seconds
    pub max_lifetime_secs: u64,
    /// Relative CPU weight, a fraction of the default 1024 share
    #[serde(default = "default_cpu_shares")]
    pub cpu_shares: u32,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ProjectConfig {
    pub id: i64,
    pub name: String,
    /// When true, commits are only graded after an explicit submission
    /// action; every new commit gets an opaque build-request token.
    pub explicit_submission_required: bool,
    #[serde(default)]
    pub private_file_paths: Vec<String>,
    #[serde(default)]
    pub immutable_file_paths: Vec<String>,
    pub test_classes: Vec<String>,
    #[serde(default)]
    pub students: Vec<StudentConfig>,
}

impl ProjectConfig {
    /// The template repository holding the project skeleton and private tests.
    pub fn template_repo(&self) -> String {
        format!("{}_template", self.name)
    }

    /// Paths copied from the template repository into the submission
    /// before building: private files first, then immutable ones.
    pub fn copy_paths(&self) -> Vec<String> {
        self.private_file_paths
            .iter()
            .chain(self.immutable_file_paths.iter())
            .cloned()
            .collect()
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct StudentConfig {
    pub user_id: i64,
    /// Team name suffix of the student's submission repository,
    /// i.e. the repository is named `{project}_{github_team}`
    pub github_team: String,
}

fn default_workers() -> u8 {
    1
}

fn default_docker_path() -> String {
    "docker".to_string()
}

fn default_mount_point() -> String {
    "/mnt/buildjob".to_string()
}

fn default_request_file_name() -> String {
    "request.json".to_string()
}

fn default_response_file_name() -> String {
    "response.json".to_string()
}

fn default_cpu_shares() -> u32 {
    128
}
