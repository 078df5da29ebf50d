use std::collections::HashMap;
use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::config::ProjectConfig;
use crate::job::ProjectJob;
use crate::ops;
use crate::queue::JobQueue;

/// One push notification from source control.
#[derive(Deserialize, Debug, Clone)]
pub struct PushEvent {
    pub repository: PushEventRepository,
    /// The full git ref that was pushed, e.g. "refs/heads/main"
    #[serde(rename = "ref")]
    pub git_ref: String,
    /// SHA of the most recent commit on the ref after the push
    pub after: String,
    pub commits: Vec<RawCommit>,
    /// When the push occurred; stamped at receipt if the payload
    /// does not carry it
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl PushEvent {
    /// Whether this push targeted the repository's default branch.
    pub fn is_default_branch_push(&self) -> bool {
        match &self.repository.default_branch {
            Some(branch) => self.git_ref == format!("refs/heads/{branch}"),
            None => true,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct PushEventRepository {
    pub name: String,
    pub owner: RepositoryOwner,
    pub default_branch: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct RepositoryOwner {
    pub name: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct RawCommit {
    pub id: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Identity of an already-processed commit. Two descriptors are equal
/// iff all three fields match.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CommitDescriptor {
    pub sha: String,
    pub project_id: i64,
    pub user_id: i64,
}

/// A commit accepted for building, derived from a push event plus
/// project and student context.
#[derive(Debug, Clone, PartialEq)]
pub struct Commit {
    pub sha: String,
    pub project_id: i64,
    pub user_id: i64,
    pub push_date: DateTime<Utc>,
    pub commit_date: DateTime<Utc>,
    pub message: String,
    pub build_request_token: Option<String>,
    pub build_job_id: Option<String>,
}

impl Commit {
    pub fn descriptor(&self) -> CommitDescriptor {
        CommitDescriptor {
            sha: self.sha.clone(),
            project_id: self.project_id,
            user_id: self.user_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Student {
    pub user_id: i64,
    pub github_team: String,
}

/// All push events retrieved for one student's submission repository.
#[derive(Debug, Clone)]
pub struct StudentRepoPushEvents {
    pub student: Student,
    pub events: Vec<PushEvent>,
}

/// A new commit to build, paired with the push event that carried it.
#[derive(Debug, Clone)]
pub struct PushEventCommit {
    pub push_event: PushEvent,
    pub commit: Commit,
}

/// A collaborator that can fetch the push events for one student's
/// repository from the source-control API.
///
/// The push webhook is the only inbound source wired up today; this
/// seam and [`retrieve_all_push_events`] exist for polling the API
/// directly, e.g. to backfill deliveries missed while the service was
/// down.
pub trait PushEventSource {
    fn push_events(
        &self,
        student: &Student,
    ) -> impl Future<Output = anyhow::Result<Vec<PushEvent>>>;
}

/// Upper bound on simultaneous push-event retrievals, to avoid
/// overwhelming the upstream source-control API.
const MAX_SIMULTANEOUS_RETRIEVALS: usize = 4;

/// Retrieves push events for every student, a bounded number of
/// repositories at a time.
pub async fn retrieve_all_push_events<S: PushEventSource>(
    source: &S,
    students: &[Student],
) -> anyhow::Result<Vec<StudentRepoPushEvents>> {
    let retrievals = students.iter().map(|student| async move {
        let events = source.push_events(student).await?;
        Ok(StudentRepoPushEvents {
            student: student.clone(),
            events,
        })
    });

    ops::run_bounded(retrievals, MAX_SIMULTANEOUS_RETRIEVALS)
        .await
        .into_iter()
        .collect()
}

/// Given push events for a set of students and the set of commits
/// already processed, returns the minimal list of new commits to build.
///
/// Replaying the same push events against a set that already contains
/// their commits yields nothing; the same physical commit appearing in
/// several push events (retried webhooks) is collapsed to the candidate
/// with the latest push date.
pub fn new_commits_to_process(
    project: &ProjectConfig,
    existing_commits: &HashSet<CommitDescriptor>,
    repo_event_lists: &[StudentRepoPushEvents],
) -> Vec<PushEventCommit> {
    let candidates = repo_event_lists.iter().flat_map(|repo_events| {
        repo_events.events.iter().flat_map(move |push_event| {
            push_event.commits.iter().map(move |raw_commit| {
                (repo_events.student.user_id, push_event, raw_commit)
            })
        })
    });

    let mut unique: Vec<PushEventCommit> = Vec::new();
    let mut index_by_identity: HashMap<(i64, String), usize> = HashMap::new();

    for (user_id, push_event, raw_commit) in candidates {
        let descriptor = CommitDescriptor {
            sha: raw_commit.id.clone(),
            project_id: project.id,
            user_id,
        };
        if existing_commits.contains(&descriptor) {
            continue;
        }

        let candidate = PushEventCommit {
            push_event: push_event.clone(),
            commit: Commit {
                sha: raw_commit.id.clone(),
                project_id: project.id,
                user_id,
                push_date: push_event.created_at,
                commit_date: raw_commit.timestamp,
                message: raw_commit.message.clone(),
                build_request_token: project
                    .explicit_submission_required
                    .then(|| Uuid::new_v4().to_string()),
                build_job_id: None,
            },
        };

        match index_by_identity.get(&(user_id, raw_commit.id.clone())) {
            Some(&idx) => {
                // Same (user, sha) seen again; latest push date wins,
                // later input on a tie.
                if candidate.commit.push_date >= unique[idx].commit.push_date {
                    unique[idx] = candidate;
                }
            }
            None => {
                index_by_identity.insert((user_id, raw_commit.id.clone()), unique.len());
                unique.push(candidate);
            }
        }
    }

    unique
}

/// Builds the queue job for a newly accepted commit and submits it.
/// Returns the job id, the only thing callers retain.
pub async fn create_build_job(
    project: &ProjectConfig,
    new_commit: &PushEventCommit,
    callback_path: &str,
    queue: &JobQueue,
    operation_id: &str,
) -> String {
    let job = ProjectJob {
        build_request_token: new_commit.commit.build_request_token.clone(),
        github_org: new_commit.push_event.repository.owner.name.clone(),
        project_name: project.name.clone(),
        submission_repo: new_commit.push_event.repository.name.clone(),
        template_repo: project.template_repo(),
        commit_sha: new_commit.commit.sha.clone(),
        copy_paths: project.copy_paths(),
        test_classes: project.test_classes.clone(),
        callback_path: callback_path.to_string(),
    };

    queue.enqueue(job, operation_id.to_string()).await
}
