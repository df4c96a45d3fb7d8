use anyhow::{Context, Result};
use serde_json::{json, Value as JsonValue};
use sqlx::types::Json as SqlJson;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::jobs::{
    is_transient_error, JobDispatcher, ParseArchiveJob, ProcessRecordJob, KIND_PARSE_ARCHIVE,
    KIND_PROCESS_RECORD,
};
use crate::model::task;
use crate::process;

/// Initial retry delay; doubled on every further attempt.
const RETRY_BASE_DELAY_SECONDS: i64 = 10;
/// Retries after the first attempt.
const RETRY_LIMIT: i32 = 3;

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    kind: String,
    payload: SqlJson<JsonValue>,
    attempt_count: i32,
}

/// One worker process: registers itself, heartbeats, and drains the queue
/// one job at a time (the prefetch bound).
pub struct Worker {
    dispatcher: Arc<JobDispatcher>,
    id: Uuid,
}

impl Worker {
    pub fn new(dispatcher: Arc<JobDispatcher>) -> Self {
        Self {
            dispatcher,
            id: Uuid::new_v4(),
        }
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        self.register().await.context("worker registration failed")?;
        tracing::info!(worker_id = %self.id, "worker online");

        let mut ticker = tokio::time::interval(Duration::from_millis(
            self.dispatcher.config.worker_poll_interval_ms,
        ));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.heartbeat().await {
                        tracing::warn!(error = %err, "worker heartbeat failed");
                        continue;
                    }
                    if let Err(err) = self.poll_once().await {
                        tracing::warn!(error = format!("{err:#}"), "worker poll failed");
                    }
                }
            }
        }

        if let Err(err) = self.deregister().await {
            tracing::warn!(error = %err, "worker deregistration failed");
        }
        Ok(())
    }

    async fn register(&self) -> Result<(), sqlx::Error> {
        sqlx::query("INSERT INTO workers (id, pid, hostname) VALUES ($1, $2, $3)")
            .bind(self.id)
            .bind(std::process::id() as i32)
            .bind(hostname())
            .execute(&self.dispatcher.db)
            .await?;
        Ok(())
    }

    async fn deregister(&self) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM workers WHERE id = $1")
            .bind(self.id)
            .execute(&self.dispatcher.db)
            .await?;
        Ok(())
    }

    async fn heartbeat(&self) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE workers SET heartbeat_at = NOW() WHERE id = $1")
            .bind(self.id)
            .execute(&self.dispatcher.db)
            .await?;
        Ok(())
    }

    async fn claim_next_job(&self) -> Result<Option<JobRow>, sqlx::Error> {
        let mut tx = self.dispatcher.db.begin().await?;
        let row: Option<JobRow> = sqlx::query_as(
            r#"
            SELECT id, kind, payload, attempt_count
            FROM jobs
            WHERE status = 'queued'
              AND next_attempt_at <= NOW()
            ORDER BY created_at ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .fetch_optional(&mut *tx)
        .await?;

        let Some(job) = row else {
            tx.commit().await?;
            return Ok(None);
        };

        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'running',
                attempt_count = attempt_count + 1,
                last_attempt_at = NOW(),
                message = NULL
            WHERE id = $1
            "#,
        )
        .bind(job.id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(job))
    }

    async fn poll_once(&self) -> Result<()> {
        let Some(job) = self.claim_next_job().await? else {
            return Ok(());
        };

        match job.kind.as_str() {
            KIND_PARSE_ARCHIVE => self.run_parse_job(&job).await,
            KIND_PROCESS_RECORD => self.run_process_job(&job).await,
            other => {
                self.finish_failed(job.id, &format!("unknown job kind {other}"))
                    .await
            }
        }
    }

    async fn run_parse_job(&self, job: &JobRow) -> Result<()> {
        let payload: ParseArchiveJob =
            serde_json::from_value(job.payload.0.clone()).context("malformed parse job payload")?;

        // attempt_count already counts this run
        let attempt = job.attempt_count + 1;
        match self.dispatcher.execute_parse(&payload, false).await {
            Ok(file_names) => self.finish_done(job.id, json!(file_names)).await,
            Err(err) => {
                // A live task entry must survive the failure so polls keep
                // seeing it, retried or not.
                if let Some(task_id) = payload.task_id {
                    let _ = task::create_task(&self.dispatcher.db, Some(task_id)).await;
                }
                if is_transient_error(&err) && attempt <= RETRY_LIMIT {
                    tracing::warn!(
                        job_id = %job.id,
                        attempt,
                        error = format!("{err:#}"),
                        "transient failure, requeueing"
                    );
                    self.requeue(job.id, attempt).await
                } else {
                    tracing::error!(
                        job_id = %job.id,
                        error = format!("{err:#}"),
                        "parse job failed"
                    );
                    self.finish_failed(job.id, &format!("{err:#}")).await
                }
            }
        }
    }

    async fn run_process_job(&self, job: &JobRow) -> Result<()> {
        let payload: ProcessRecordJob = serde_json::from_value(job.payload.0.clone())
            .context("malformed process job payload")?;

        let result = tokio::task::spawn_blocking(move || {
            process::process_record(&payload.record, &payload.process_config)
        })
        .await
        .context("processing task panicked")?;

        match result {
            Ok(processed) => self.finish_done(job.id, json!(processed)).await,
            Err(err) => {
                tracing::error!(job_id = %job.id, error = format!("{err:#}"), "process job failed");
                self.finish_failed(job.id, &format!("{err:#}")).await
            }
        }
    }

    async fn finish_done(&self, job_id: Uuid, result: JsonValue) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'done', result = $2, finished_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(SqlJson(result))
        .execute(&self.dispatcher.db)
        .await?;
        Ok(())
    }

    async fn finish_failed(&self, job_id: Uuid, message: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed', message = $2, finished_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(message)
        .execute(&self.dispatcher.db)
        .await?;
        Ok(())
    }

    async fn requeue(&self, job_id: Uuid, attempt: i32) -> Result<()> {
        let delay = RETRY_BASE_DELAY_SECONDS << (attempt - 1).clamp(0, 8);
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'queued',
                next_attempt_at = NOW() + make_interval(secs => $2::int)
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(delay as i32)
        .execute(&self.dispatcher.db)
        .await?;
        Ok(())
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_doubles_from_ten_seconds() {
        let delays: Vec<i64> = (1..=3)
            .map(|attempt: i32| RETRY_BASE_DELAY_SECONDS << (attempt - 1).clamp(0, 8))
            .collect();
        assert_eq!(delays, vec![10, 20, 40]);
    }
}
