use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

use crate::push::{Commit, CommitDescriptor};

const DATABASE_NAME: &str = "classbuild.sqlite3";

pub fn get_db_path() -> PathBuf {
    use directories::ProjectDirs;

    let proj_dirs =
        ProjectDirs::from("", "", "classbuild").expect("Unable to find user directory");
    let data_dir = proj_dirs.data_local_dir();

    fs::create_dir_all(data_dir).expect("Failed to create local data dir");

    data_dir.join(DATABASE_NAME)
}

pub async fn init_db(db_path: impl AsRef<Path>) -> sqlx::Result<SqlitePool> {
    let db_url = format!("sqlite://{}?mode=rwc", db_path.as_ref().display()); // rwc = read/write/create
    let db_pool = SqlitePoolOptions::new()
        .max_connections(2)
        .connect(&db_url)
        .await?;

    // PRAGMA statements cannot run inside a transaction
    for pragma_sql in &[
        "PRAGMA foreign_keys = ON;",
        "PRAGMA busy_timeout = 2000;", // 2 seconds timeout for lock contention
        "PRAGMA journal_mode = WAL;",  // Write-Ahead Logging for better concurrency
        "PRAGMA synchronous = NORMAL;",
    ] {
        sqlx::query(pragma_sql).execute(&db_pool).await?;
    }

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS commits (
            sha                  TEXT    NOT NULL,
            project_id           INTEGER NOT NULL,
            user_id              INTEGER NOT NULL,
            push_date            TEXT    NOT NULL,
            commit_date          TEXT    NOT NULL,
            message              TEXT    NOT NULL DEFAULT '',
            build_request_token  TEXT,
            build_job_id         TEXT,
            PRIMARY KEY (sha, project_id, user_id)
        );",
    )
    .execute(&db_pool)
    .await?;

    log::info!("Initialized database at {}", db_path.as_ref().display());

    Ok(db_pool)
}

pub fn remove_db(db_path: impl AsRef<Path>) {
    // WAL and SHM files might not exist; ignore errors
    let wal_path = format!("{}-wal", db_path.as_ref().display());
    let shm_path = format!("{}-shm", db_path.as_ref().display());
    let _ = fs::remove_file(wal_path);
    let _ = fs::remove_file(shm_path);

    if let Err(e) = std::fs::remove_file(&db_path) {
        log::warn!(
            "Unable to remove database at {}: {e}",
            db_path.as_ref().display()
        );
    } else {
        log::info!("Removed database at {}", db_path.as_ref().display());
    }
}

/// Loads the descriptors of every commit already processed for the
/// given project, for the deduplication pass.
pub async fn load_descriptors(
    project_id: i64,
    pool: &SqlitePool,
) -> sqlx::Result<HashSet<CommitDescriptor>> {
    let rows = sqlx::query("SELECT sha, user_id FROM commits WHERE project_id = ?")
        .bind(project_id)
        .fetch_all(pool)
        .await?;

    Ok(rows
        .into_iter()
        .map(|row| CommitDescriptor {
            sha: row.get("sha"),
            project_id,
            user_id: row.get("user_id"),
        })
        .collect())
}

/// Records newly accepted commits. Replayed rows are ignored rather
/// than rejected, so a concurrent duplicate insert cannot fail a
/// webhook delivery.
pub async fn save_commits(commits: &[Commit], pool: &SqlitePool) -> sqlx::Result<()> {
    let mut tx = pool.begin().await?;

    for commit in commits {
        sqlx::query(
            r"
            INSERT OR IGNORE INTO commits
                (sha, project_id, user_id, push_date, commit_date, message, build_request_token)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(&commit.sha)
        .bind(commit.project_id)
        .bind(commit.user_id)
        .bind(format_date(&commit.push_date))
        .bind(format_date(&commit.commit_date))
        .bind(&commit.message)
        .bind(&commit.build_request_token)
        .execute(tx.as_mut())
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

/// Records the queue job id assigned to a commit's build.
pub async fn set_build_job_id(
    descriptor: &CommitDescriptor,
    build_job_id: &str,
    pool: &SqlitePool,
) -> sqlx::Result<()> {
    sqlx::query(
        r"
        UPDATE commits SET build_job_id = ?
        WHERE sha = ? AND project_id = ? AND user_id = ?
        ",
    )
    .bind(build_job_id)
    .bind(&descriptor.sha)
    .bind(descriptor.project_id)
    .bind(descriptor.user_id)
    .execute(pool)
    .await?;

    Ok(())
}

fn format_date(date: &DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Millis, true)
}
