use std::sync::Arc;

use actix_web::{App, HttpServer, dev::Server, middleware, web};
use sqlx::sqlite::SqlitePool;

use crate::config::{Config, ProjectConfig, ServerConfig};
use crate::queue::JobQueue;
use crate::routes::{get_job_status_handler, json_error_handler, push_webhook_handler};

/// Request-handling state shared by every route.
pub struct AppState {
    pub projects: Vec<ProjectConfig>,
    pub webhook_secret: String,
    pub callback_path: String,
}

impl AppState {
    pub fn from_config(config: &Config) -> Self {
        Self {
            projects: config.projects.clone(),
            webhook_secret: config.webhook_secret.clone(),
            callback_path: config.callback_path.clone(),
        }
    }
}

pub fn build_server(
    server_config: ServerConfig,
    state: AppState,
    db_pool: SqlitePool,
    queue: Arc<JobQueue>,
) -> std::io::Result<Server> {
    let state = web::Data::new(state);
    let db_pool = web::Data::new(db_pool);
    let queue = web::Data::from(queue);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .app_data(db_pool.clone())
            .app_data(queue.clone())
            .app_data(web::JsonConfig::default().error_handler(json_error_handler))
            .wrap(middleware::Logger::default())
            .service(push_webhook_handler)
            .service(get_job_status_handler)
    })
    .bind((
        server_config
            .bind_address
            .unwrap_or("127.0.0.1".to_string()),
        server_config.bind_port.unwrap_or(12345),
    ))?
    .run();

    Ok(server)
}
