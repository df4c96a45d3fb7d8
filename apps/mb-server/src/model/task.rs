use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::ids;

/// Upload progress bookkeeping. Progress updates are last-writer-wins; a
/// worker crash mid-archive is reconciled by the retry rebuilding the task.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct UploadTask {
    pub id: Uuid,
    pub create_time: DateTime<Utc>,
    pub pid: i32,
    pub total_size: i64,
    pub current_size: i64,
    pub archive_path: Option<String>,
}

impl UploadTask {
    pub fn progress(&self) -> f64 {
        self.current_size as f64 / self.total_size.max(1) as f64
    }
}

pub async fn create_task(db: &PgPool, task_id: Option<Uuid>) -> Result<Uuid, sqlx::Error> {
    let id = task_id.unwrap_or_else(ids::new_task_id);
    sqlx::query(
        r#"
        INSERT INTO upload_tasks (id)
        VALUES ($1)
        ON CONFLICT (id) DO NOTHING
        "#,
    )
    .bind(id)
    .execute(db)
    .await?;
    Ok(id)
}

pub async fn delete_task(db: &PgPool, task_id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM upload_tasks WHERE id = $1")
        .bind(task_id)
        .execute(db)
        .await?;
    Ok(())
}

pub async fn find_task(db: &PgPool, task_id: Uuid) -> Result<Option<UploadTask>, sqlx::Error> {
    sqlx::query_as(
        r#"
        SELECT id, create_time, pid, total_size, current_size, archive_path
        FROM upload_tasks
        WHERE id = $1
        "#,
    )
    .bind(task_id)
    .fetch_optional(db)
    .await
}

/// Per-id lookup preserving order; missing ids yield None.
pub async fn list_tasks(
    db: &PgPool,
    task_ids: &[Uuid],
) -> Result<Vec<Option<UploadTask>>, sqlx::Error> {
    let mut tasks = Vec::with_capacity(task_ids.len());
    for task_id in task_ids {
        tasks.push(find_task(db, *task_id).await?);
    }
    Ok(tasks)
}

pub async fn begin_archive(
    db: &PgPool,
    task_id: Uuid,
    archive_path: Option<&str>,
    total_size: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE upload_tasks
        SET pid = $2, archive_path = $3, total_size = $4
        WHERE id = $1
        "#,
    )
    .bind(task_id)
    .bind(std::process::id() as i32)
    .bind(archive_path)
    .bind(total_size)
    .execute(db)
    .await?;
    Ok(())
}

/// Naive read-modify-write; tolerated by design, the visible progress only
/// ever moves forward.
pub async fn bump_progress(db: &PgPool, task_id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE upload_tasks
        SET current_size = current_size + 1
        WHERE id = $1
        "#,
    )
    .bind(task_id)
    .execute(db)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_guards_zero_total() {
        let task = UploadTask {
            id: ids::new_task_id(),
            create_time: Utc::now(),
            pid: 0,
            total_size: 0,
            current_size: 0,
            archive_path: None,
        };
        assert_eq!(task.progress(), 0.0);
    }

    #[test]
    fn progress_reaches_unity_on_completion() {
        let task = UploadTask {
            id: ids::new_task_id(),
            create_time: Utc::now(),
            pid: 0,
            total_size: 4,
            current_size: 4,
            archive_path: None,
        };
        assert!((task.progress() - 1.0).abs() < 1e-12);
    }
}
