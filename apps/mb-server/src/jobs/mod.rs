pub mod worker;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use sqlx::types::Json as SqlJson;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::config::Config;
use crate::error::is_transient_db_error;
use crate::model::{task, Record};
use crate::parse::{nied, nzsm};
use crate::process::{self, ProcessConfig, ProcessedWaveform};
use crate::search::ElasticService;
use crate::storage::FileProxy;

pub const KIND_PARSE_ARCHIVE: &str = "parse_archive";
pub const KIND_PROCESS_RECORD: &str = "process_record";

/// One staged archive to parse. The blob URI is the unit of ownership handed
/// from the HTTP layer to whichever executor runs the job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParseArchiveJob {
    pub region: String,
    pub archive_uri: String,
    pub access_token: Option<String>,
    pub user_id: String,
    pub task_id: Option<Uuid>,
    pub overwrite_existing: bool,
}

/// A record plus its processing request, self-contained so a worker needs no
/// further store round-trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessRecordJob {
    pub record: Record,
    pub process_config: ProcessConfig,
}

/// Routes jobs to the durable queue when live workers are around and to the
/// in-process background executor otherwise. The mode is decided at dispatch
/// time, per job.
pub struct JobDispatcher {
    pub db: PgPool,
    pub config: Config,
    pub elastic: Arc<ElasticService>,
    pub http: reqwest::Client,
}

impl JobDispatcher {
    pub fn new(
        db: PgPool,
        config: Config,
        elastic: Arc<ElasticService>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            db,
            config,
            elastic,
            http,
        }
    }

    /// The broker stats probe: workers with a fresh heartbeat.
    pub async fn worker_count(&self) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar(
            "SELECT COUNT(*) FROM workers WHERE heartbeat_at > NOW() - make_interval(secs => $1::int)",
        )
        .bind(self.config.worker_heartbeat_seconds as i32 * 2)
        .fetch_one(&self.db)
        .await
    }

    pub async fn has_workers(&self) -> bool {
        match self.worker_count().await {
            Ok(count) => count > 0,
            Err(err) => {
                tracing::warn!(error = %err, "worker stats probe failed");
                false
            }
        }
    }

    pub async fn enqueue(&self, kind: &str, payload: JsonValue) -> Result<Uuid, sqlx::Error> {
        let id = Uuid::new_v4();
        sqlx::query("INSERT INTO jobs (id, kind, payload) VALUES ($1, $2, $3)")
            .bind(id)
            .bind(kind)
            .bind(SqlJson(payload))
            .execute(&self.db)
            .await?;
        Ok(id)
    }

    /// Block until the job reaches a terminal state. There is no wall-clock
    /// timeout; retries bound total time through their backoff.
    pub async fn wait_for_result(&self, job_id: Uuid) -> Result<JsonValue> {
        loop {
            let row: Option<(String, Option<SqlJson<JsonValue>>, Option<String>)> =
                sqlx::query_as("SELECT status, result, message FROM jobs WHERE id = $1")
                    .bind(job_id)
                    .fetch_optional(&self.db)
                    .await?;
            let (status, result, message) = row.context("job vanished from the queue")?;
            match status.as_str() {
                "done" => return Ok(result.map(|value| value.0).unwrap_or(JsonValue::Null)),
                "failed" => {
                    anyhow::bail!(message.unwrap_or_else(|| "job failed".to_string()))
                }
                _ => {
                    tokio::time::sleep(Duration::from_millis(self.config.worker_poll_interval_ms))
                        .await
                }
            }
        }
    }

    /// Fetch the blob, run the parser, push the batch to the search index
    /// and release the blob. Shared by workers and the local executor; the
    /// blob survives a failed run unless `always_delete` says otherwise, so
    /// a retry finds it intact.
    pub async fn execute_parse(
        &self,
        job: &ParseArchiveJob,
        always_delete: bool,
    ) -> Result<Vec<String>> {
        let proxy = FileProxy::fetch(
            &self.config,
            &self.http,
            &job.archive_uri,
            job.access_token.as_deref(),
            always_delete,
        )
        .await?;

        let parsed = self.parse_with_proxy(job, &proxy).await;
        match parsed {
            Ok(records) => {
                if let Err(err) = self.elastic.bulk_index(&records).await {
                    tracing::warn!(error = format!("{err:#}"), "bulk index failed");
                }
                proxy.exit(true).await;
                Ok(records
                    .iter()
                    .filter_map(|record| record.file_name.clone())
                    .collect())
            }
            Err(err) => {
                proxy.exit(false).await;
                Err(err)
            }
        }
    }

    async fn parse_with_proxy(
        &self,
        job: &ParseArchiveJob,
        proxy: &FileProxy,
    ) -> Result<Vec<Record>> {
        match job.region.as_str() {
            "jp" => nied::parse_archive(
                &self.db,
                proxy.data(),
                &job.user_id,
                proxy.file_name(),
                job.task_id,
                Some(&job.archive_uri),
                job.overwrite_existing,
            )
            .await
            .map_err(Into::into),
            "nz" => nzsm::parse_archive(
                &self.db,
                proxy.data(),
                &job.user_id,
                proxy.file_name(),
                job.task_id,
                Some(&job.archive_uri),
                job.overwrite_existing,
            )
            .await
            .map_err(Into::into),
            other => anyhow::bail!("unknown region {other}"),
        }
    }

    /// Local mode: run on the server's background executor. Failures are
    /// swallowed and logged, and the task is removed so no orphan progress
    /// entry survives.
    pub fn spawn_parse_local(self: &Arc<Self>, job: ParseArchiveJob) {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            if let Err(err) = dispatcher.execute_parse(&job, true).await {
                tracing::error!(
                    archive_uri = %job.archive_uri,
                    error = format!("{err:#}"),
                    "Failed to parse archive."
                );
                if let Some(task_id) = job.task_id {
                    let _ = task::delete_task(&dispatcher.db, task_id).await;
                }
            }
        });
    }

    /// Routing policy for processing: a light request, or a pool of at most
    /// one worker, stays local; everything else goes through the queue.
    pub async fn process_record_routed(
        &self,
        record: &Record,
        config: &ProcessConfig,
    ) -> Result<ProcessedWaveform> {
        let workers = self.worker_count().await.unwrap_or(0);
        if workers <= 1 || config.is_light() {
            let record = record.clone();
            let config = config.clone();
            return tokio::task::spawn_blocking(move || process::process_record(&record, &config))
                .await
                .context("processing task panicked")?;
        }

        let payload = json!(ProcessRecordJob {
            record: record.clone(),
            process_config: config.clone(),
        });
        let job_id = self.enqueue(KIND_PROCESS_RECORD, payload).await?;
        let result = self.wait_for_result(job_id).await?;
        serde_json::from_value(result).context("malformed processing result")
    }
}

/// Connection-level failures from the store or the index are worth a retry;
/// anything else is terminal for the job.
pub fn is_transient_error(err: &anyhow::Error) -> bool {
    for cause in err.chain() {
        if let Some(db_err) = cause.downcast_ref::<sqlx::Error>() {
            if is_transient_db_error(db_err) {
                return true;
            }
        }
        if let Some(http_err) = cause.downcast_ref::<reqwest::Error>() {
            if http_err.is_timeout() || http_err.is_connect() {
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        let timeout: anyhow::Error = sqlx::Error::PoolTimedOut.into();
        assert!(is_transient_error(&timeout));

        let wrapped = timeout.context("while saving a record");
        assert!(is_transient_error(&wrapped));

        let fatal = anyhow::anyhow!("unknown region xx");
        assert!(!is_transient_error(&fatal));

        let parse: anyhow::Error = sqlx::Error::RowNotFound.into();
        assert!(!is_transient_error(&parse));
    }

    #[test]
    fn job_payloads_round_trip() {
        let job = ParseArchiveJob {
            region: "jp".to_string(),
            archive_uri: "http://localhost:8000/access/x/y.tar.gz".to_string(),
            access_token: Some("token".to_string()),
            user_id: "user".to_string(),
            task_id: Some(Uuid::new_v4()),
            overwrite_existing: true,
        };
        let value = json!(job);
        let back: ParseArchiveJob = serde_json::from_value(value).unwrap();
        assert_eq!(back.region, "jp");
        assert_eq!(back.task_id, job.task_id);
    }
}
