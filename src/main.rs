use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use classbuild::config::CliArgs;
use classbuild::database as db;
use classbuild::notifier::ResultNotifier;
use classbuild::ops;
use classbuild::queue::JobQueue;
use classbuild::runner::ProjectRunner;
use classbuild::sandbox::SandboxHost;
use classbuild::web_server::{AppState, build_server};
use classbuild::worker::worker;

/// Delay before the single retry when the backing store is not
/// provisioned yet.
const DB_INIT_RETRY_DELAY: Duration = Duration::from_secs(5);

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = CliArgs::parse();
    let config = cli.to_config().expect("Failed to load configuration");

    if config.workers == 0 {
        panic!("The number of workers must not be 0");
    }

    let db_path = db::get_db_path();
    if cli.flush_data {
        db::remove_db(&db_path);
    }

    let db_pool = ops::retry_once(|| db::init_db(&db_path), DB_INIT_RETRY_DELAY)
        .await
        .expect("Failed to initialize database");

    let state = AppState::from_config(&config);
    let queue = Arc::new(JobQueue::new());
    let runner = Arc::new(ProjectRunner::new(
        SandboxHost::new(config.sandbox.clone(), config.container.clone()),
        ResultNotifier::new(),
        config.callback_host.clone(),
        config.github_oauth_token.clone(),
    ));
    let shutdown_token = CancellationToken::new();

    // ======= PREPARATION END, EXECUTION START =======

    let mut workers = JoinSet::new();
    for i in 1..=config.workers {
        workers.spawn(worker(
            i,
            runner.clone(),
            queue.clone(),
            shutdown_token.clone(),
        ));
    }

    let server = build_server(config.server, state, db_pool, queue)
        .expect("Failed to build server");

    let server_handle = server.handle();
    let server_task = actix_web::rt::spawn(server);

    // ===== EXECUTION END, WAITING FOR SHUTDOWN ======

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("Ctrl-c received, shutting down...");
        }
        res_server = server_task => {
            log::error!("Server terminated unexpectedly: {:?}", res_server);
        }
        Some(res_worker) = workers.join_next() => {
            log::error!("A worker terminated unexpectedly: {:?}", res_worker);
        }
    }

    // 1. Shutdown the web server gracefully
    server_handle.stop(true).await;

    // 2. Broadcast shutdown signal to workers
    shutdown_token.cancel();
    log::info!("Shutdown signal sent to workers, waiting for them to finish...");

    // 3. Wait until every worker terminates
    while let Some(res) = workers.join_next().await {
        if let Err(e) = res {
            if e.is_panic() {
                log::error!("Worker handle panicked: {:?}", e);
            } else {
                log::error!("Worker handle finished with error: {:?}", e);
            }
        }
    }

    log::info!("Shutdown complete");
    Ok(())
}
