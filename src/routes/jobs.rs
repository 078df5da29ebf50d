use actix_web::{HttpResponse, Responder, get, web};

use crate::queue::JobQueue;

/// Answers "what state is job X in?". `Unknown` is a valid terminal
/// answer for ids that were never seen or whose history is gone, so
/// this never 404s.
#[get("/jobs/{id}")]
pub async fn get_job_status_handler(
    path: web::Path<String>,
    queue: web::Data<JobQueue>,
) -> impl Responder {
    let job_id = path.into_inner();
    let status = queue.job_status(&job_id).await;

    HttpResponse::Ok().json(status)
}
