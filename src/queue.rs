use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

use crate::job::{JobState, ProjectJob};

/// A job handed to a worker, tagged with its queue id and the
/// correlation id of the request that created it.
#[derive(Debug)]
pub struct QueuedJob {
    pub job_id: String,
    pub operation_id: String,
    pub job: ProjectJob,
}

/// The most recent recorded state of a queued job, and when it
/// entered that state.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobStatus {
    pub state: JobState,
    pub entered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HistoryState {
    Enqueued,
    Processing,
}

struct HistoryEntry {
    state: HistoryState,
    entered_at: DateTime<Utc>,
}

/// An in-process job queue that decouples "submit work" from
/// "execute work". Enqueueing records intent and returns immediately;
/// workers drain the queue and report state transitions back here.
pub struct JobQueue {
    queue: Mutex<VecDeque<QueuedJob>>,
    history: Mutex<HashMap<String, Vec<HistoryEntry>>>,
    notify: Notify,
}

impl JobQueue {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            history: Mutex::new(HashMap::new()),
            notify: Notify::new(),
        }
    }

    /// Accepts a job and returns its opaque id. Never blocks on job
    /// execution.
    pub async fn enqueue(&self, job: ProjectJob, operation_id: String) -> String {
        let job_id = Uuid::new_v4().to_string();

        self.record_transition(&job_id, HistoryState::Enqueued).await;
        self.queue.lock().await.push_back(QueuedJob {
            job_id: job_id.clone(),
            operation_id,
            job,
        });
        self.notify.notify_one();

        log::debug!("Enqueued job {job_id}");
        job_id
    }

    /// Blocks until a job is available, then hands it out.
    pub async fn pop(&self) -> QueuedJob {
        loop {
            if let Some(job) = self.queue.lock().await.pop_front() {
                return job;
            }
            self.notify.notified().await;
        }
    }

    /// Records that a worker has picked up the job.
    pub async fn mark_processing(&self, job_id: &str) {
        self.record_transition(job_id, HistoryState::Processing).await;
    }

    /// Records that the job's execution has finished, in any way.
    /// Finished jobs report the same `Unknown` status as never-seen
    /// ones, so their history is dropped outright; the map only ever
    /// holds jobs that are waiting or running.
    pub async fn mark_finished(&self, job_id: &str) {
        self.history.lock().await.remove(job_id);
    }

    /// Inspects the most recent state-history entry for the job.
    ///
    /// Callers must tolerate `Unknown` as a valid answer: a job whose
    /// execution has finished, or whose history is gone, reports
    /// `Unknown` with a minimum timestamp.
    pub async fn job_status(&self, job_id: &str) -> JobStatus {
        let history = self.history.lock().await;
        let latest = history.get(job_id).and_then(|entries| entries.last());

        match latest {
            Some(entry) => JobStatus {
                state: match entry.state {
                    HistoryState::Enqueued => JobState::NotStarted,
                    HistoryState::Processing => JobState::InProgress,
                },
                entered_at: entry.entered_at,
            },
            None => JobStatus {
                state: JobState::Unknown,
                entered_at: DateTime::<Utc>::MIN_UTC,
            },
        }
    }

    async fn record_transition(&self, job_id: &str, state: HistoryState) {
        self.history
            .lock()
            .await
            .entry(job_id.to_string())
            .or_default()
            .push(HistoryEntry {
                state,
                entered_at: Utc::now(),
            });
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}
