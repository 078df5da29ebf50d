use actix_web::{HttpRequest, HttpResponse, Responder, post, web};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use sqlx::sqlite::SqlitePool;
use uuid::Uuid;

use super::ErrorResponse;
use crate::config::ProjectConfig;
use crate::database as db;
use crate::push::{self, PushEvent, Student, StudentRepoPushEvents};
use crate::queue::JobQueue;
use crate::web_server::AppState;

/// Header carrying the HMAC of the raw payload bytes.
pub const SIGNATURE_HEADER: &str = "X-Hub-Signature-256";

type HmacSha256 = Hmac<Sha256>;

/// Verifies the payload signature: `sha256=<hex of HMAC-SHA256 over
/// the raw bytes>`, keyed with the shared webhook secret.
pub fn verify_signature(secret: &str, payload: &[u8], signature_header: &str) -> bool {
    let Some(hex_digest) = signature_header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(claimed) = hex::decode(hex_digest) else {
        return false;
    };

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(payload);
    mac.verify_slice(&claimed).is_ok()
}

#[derive(Serialize, Debug)]
pub struct WebhookResponse {
    pub operation_id: String,
    pub new_commits: usize,
    pub job_ids: Vec<String>,
}

#[post("/webhooks/push/{project}")]
pub async fn push_webhook_handler(
    req: HttpRequest,
    path: web::Path<String>,
    body: web::Bytes,
    state: web::Data<AppState>,
    pool: web::Data<SqlitePool>,
    queue: web::Data<JobQueue>,
) -> impl Responder {
    let signature = req
        .headers()
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    // Unsigned payloads never reach the pipeline
    if !verify_signature(&state.webhook_secret, &body, signature) {
        log::warn!("Rejected push event with a missing or invalid signature");
        return HttpResponse::Forbidden().json(ErrorResponse {
            reason: "ERR_INVALID_SIGNATURE",
            code: 2,
        });
    }

    let push_event: PushEvent = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(e) => {
            log::warn!("Rejected malformed push event payload: {e}");
            return HttpResponse::BadRequest().json(ErrorResponse {
                reason: "ERR_INVALID_ARGUMENT",
                code: 1,
            });
        }
    };

    let project_name = path.into_inner();
    let Some(project) = state.projects.iter().find(|p| p.name == project_name) else {
        return HttpResponse::NotFound().json(ErrorResponse {
            reason: "ERR_NOT_FOUND",
            code: 3,
        });
    };

    let operation_id = Uuid::new_v4().to_string();

    // Only pushes to the default branch are graded
    if !push_event.is_default_branch_push() {
        log::debug!(
            "Ignoring push to {} on {}",
            push_event.git_ref,
            push_event.repository.name
        );
        return HttpResponse::Ok().json(WebhookResponse {
            operation_id,
            new_commits: 0,
            job_ids: vec![],
        });
    }

    let Some(student) = find_student(project, &push_event.repository.name) else {
        log::warn!(
            "Push event for unrecognized repository {}",
            push_event.repository.name
        );
        return HttpResponse::NotFound().json(ErrorResponse {
            reason: "ERR_NOT_FOUND",
            code: 3,
        });
    };

    let existing_commits = match db::load_descriptors(project.id, &pool).await {
        Ok(descriptors) => descriptors,
        Err(e) => {
            log::error!("Failed to load processed commits: {e}");
            return HttpResponse::InternalServerError().json(ErrorResponse {
                reason: "ERR_EXTERNAL",
                code: 5,
            });
        }
    };

    let repo_events = vec![StudentRepoPushEvents {
        student,
        events: vec![push_event],
    }];
    let new_commits = push::new_commits_to_process(project, &existing_commits, &repo_events);

    let commits: Vec<_> = new_commits.iter().map(|pec| pec.commit.clone()).collect();
    if let Err(e) = db::save_commits(&commits, &pool).await {
        log::error!("Failed to record new commits: {e}");
        return HttpResponse::InternalServerError().json(ErrorResponse {
            reason: "ERR_EXTERNAL",
            code: 5,
        });
    }

    let mut job_ids = Vec::with_capacity(new_commits.len());
    for new_commit in &new_commits {
        let job_id = push::create_build_job(
            project,
            new_commit,
            &state.callback_path,
            &queue,
            &operation_id,
        )
        .await;

        if let Err(e) =
            db::set_build_job_id(&new_commit.commit.descriptor(), &job_id, &pool).await
        {
            log::error!("Failed to record build job id {job_id}: {e}");
        }

        log::info!(
            "Enqueued build job {job_id} for commit {} (operation {operation_id})",
            new_commit.commit.sha
        );
        job_ids.push(job_id);
    }

    HttpResponse::Ok().json(WebhookResponse {
        operation_id,
        new_commits: new_commits.len(),
        job_ids,
    })
}

/// The submission repository is named `{project}_{team}`; the team
/// identifies the student.
fn find_student(project: &ProjectConfig, repo_name: &str) -> Option<Student> {
    let team = repo_name.strip_prefix(&format!("{}_", project.name))?;

    project
        .students
        .iter()
        .find(|s| s.github_team == team)
        .map(|s| Student {
            user_id: s.user_id,
            github_team: s.github_team.clone(),
        })
}
