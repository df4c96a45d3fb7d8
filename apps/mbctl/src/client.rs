use anyhow::{Context, Result};
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use walkdir::WalkDir;

const UPLOAD_RETRIES: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);
const RETRY_BACKOFF_FACTOR: u32 = 2;

/// One downloaded record; only the fields the client consumes.
#[derive(Debug, Clone, Deserialize)]
pub struct MbRecord {
    pub id: String,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub direction: Option<String>,
    #[serde(default)]
    pub time_interval: Option<f64>,
    #[serde(default)]
    pub waveform: Option<Vec<f64>>,
    #[serde(default)]
    pub processed_data_unit: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    #[serde(default)]
    task_ids: Option<Vec<String>>,
    #[serde(default)]
    records: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct ListRecordResponse {
    records: Vec<MbRecord>,
}

#[derive(Debug, Deserialize)]
struct TaskStatusResponse {
    total_size: i64,
    current_size: i64,
}

/// Bounded-concurrency client: every request runs under one semaphore
/// permit, ten by default.
pub struct MbClient {
    base_url: String,
    http: reqwest::Client,
    semaphore: Arc<Semaphore>,
    token: Option<String>,
    tasks: Mutex<HashMap<String, f64>>,
}

impl MbClient {
    pub fn new(host: &str, concurrency: usize) -> Self {
        Self {
            base_url: host.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
            token: None,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn connect(&self) -> Result<()> {
        let resp = self
            .http
            .get(format!("{}/alive", self.base_url))
            .send()
            .await
            .context("Server is not reachable.")?;
        if resp.status() != StatusCode::OK {
            anyhow::bail!("Server is not reachable.");
        }
        Ok(())
    }

    pub async fn login(&mut self, username: &str, password: &str) -> Result<()> {
        let resp = self
            .http
            .post(format!("{}/user/token", self.base_url))
            .form(&[("username", username), ("password", password)])
            .send()
            .await?;
        if !resp.status().is_success() {
            anyhow::bail!("Incorrect username or password.");
        }
        let token: TokenResponse = resp.json().await?;
        self.token = Some(token.access_token);
        Ok(())
    }

    fn authed(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn uploadable(file_name: &str) -> bool {
        let lower = file_name.to_lowercase();
        lower.ends_with(".tar.gz")
            || lower.ends_with(".zip")
            || lower.contains("v1a")
            || lower.contains("v2a")
    }

    /// Walk the path and post every uploadable file, all under the request
    /// cap. Task ids from every accepted upload are recorded for polling.
    pub async fn upload(
        self: &Arc<Self>,
        region: &str,
        path: &Path,
        wait_for_result: bool,
        overwrite_existing: bool,
    ) -> Result<Vec<String>> {
        if self.token.is_none() {
            anyhow::bail!("Upload requires authentication.");
        }

        let files: Vec<PathBuf> = if path.is_dir() {
            WalkDir::new(path)
                .into_iter()
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.file_type().is_file())
                .map(|entry| entry.into_path())
                .filter(|path| {
                    path.file_name()
                        .and_then(|name| name.to_str())
                        .is_some_and(Self::uploadable)
                })
                .collect()
        } else {
            vec![path.to_path_buf()]
        };

        let total = files.len();
        let mut handles = Vec::with_capacity(total);
        for file in files {
            let client = self.clone();
            let region = region.to_string();
            handles.push(tokio::spawn(async move {
                client
                    .upload_single(&region, &file, wait_for_result, overwrite_existing)
                    .await
                    .with_context(|| format!("failed to upload {}", file.display()))
            }));
        }

        let mut records = Vec::new();
        let mut uploaded = 0usize;
        for handle in handles {
            match handle.await? {
                Ok(names) => {
                    uploaded += 1;
                    println!("Uploaded [{uploaded}/{total}].");
                    records.extend(names);
                }
                Err(err) => eprintln!("{err:#}"),
            }
        }
        Ok(records)
    }

    async fn upload_single(
        &self,
        region: &str,
        path: &Path,
        wait_for_result: bool,
        overwrite_existing: bool,
    ) -> Result<Vec<String>> {
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .context("path has no file name")?
            .to_string();
        if !Self::uploadable(&file_name) {
            return Ok(Vec::new());
        }
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;

        let _permit = self.semaphore.acquire().await?;

        let url = format!(
            "{}/{}/upload?wait_for_result={}&overwrite_existing={}",
            self.base_url, region, wait_for_result, overwrite_existing
        );

        let mut delay = RETRY_BASE_DELAY;
        let mut attempt = 0u32;
        let resp = loop {
            let form = Form::new().part(
                "archives",
                Part::bytes(bytes.clone()).file_name(file_name.clone()),
            );
            let result = self.authed(self.http.post(&url)).multipart(form).send().await;
            match result {
                Ok(resp) if resp.status() == StatusCode::ACCEPTED => break resp,
                Ok(resp) if attempt >= UPLOAD_RETRIES => {
                    anyhow::bail!("Failed to upload: server returned {}", resp.status())
                }
                Err(err) if attempt >= UPLOAD_RETRIES => {
                    return Err(err).context("Failed to upload.")
                }
                _ => {
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                    delay *= RETRY_BACKOFF_FACTOR;
                }
            }
        };

        let upload: UploadResponse = resp.json().await?;
        if let Some(task_ids) = upload.task_ids {
            let mut tasks = self.tasks.lock().await;
            for task_id in task_ids {
                tasks.insert(task_id, 0.0);
            }
        }
        Ok(upload.records.unwrap_or_default())
    }

    pub async fn download(self: &Arc<Self>, record_ids: &[String]) -> Result<Vec<MbRecord>> {
        let mut handles = Vec::with_capacity(record_ids.len());
        for record_id in record_ids {
            let client = self.clone();
            let record_id = record_id.clone();
            handles.push(tokio::spawn(async move {
                client.download_single(&record_id).await
            }));
        }

        let mut pool = Vec::new();
        for handle in handles {
            match handle.await? {
                Ok(mut records) => pool.append(&mut records),
                Err(err) => eprintln!("{err:#}"),
            }
        }
        Ok(pool)
    }

    async fn download_single(&self, record_id: &str) -> Result<Vec<MbRecord>> {
        let _permit = self.semaphore.acquire().await?;
        let resp = self
            .http
            .post(format!("{}/waveform", self.base_url))
            .json(&json!([record_id]))
            .send()
            .await?;
        if resp.status() != StatusCode::OK {
            anyhow::bail!("Fail to download file {record_id}.");
        }
        let list: ListRecordResponse = resp.json().await?;
        Ok(list.records)
    }

    pub async fn jackpot(&self) -> Result<MbRecord> {
        let resp = self
            .http
            .get(format!("{}/waveform/jackpot", self.base_url))
            .send()
            .await?;
        if resp.status() != StatusCode::OK {
            anyhow::bail!("Failed to get jackpot waveform.");
        }
        Ok(resp.json().await?)
    }

    /// Single page through the store-backed query endpoint.
    pub async fn search(&self, query: &JsonValue) -> Result<Vec<JsonValue>> {
        let resp = self
            .http
            .post(format!("{}/query", self.base_url))
            .json(query)
            .send()
            .await?;
        if resp.status() != StatusCode::OK {
            anyhow::bail!("Failed to perform query.");
        }
        let body: JsonValue = resp.json().await?;
        Ok(body["records"].as_array().cloned().unwrap_or_default())
    }

    /// Stream the full result set through the index with `search_after`
    /// pagination.
    pub async fn retrieve_all(&self, query: &JsonValue) -> Result<Vec<JsonValue>> {
        let mut query = query.clone();
        if !query.is_object() {
            anyhow::bail!("query must be a JSON object");
        }
        let mut all = Vec::new();
        let mut search_after: Option<JsonValue> = None;

        loop {
            if let Some(after) = &search_after {
                query
                    .as_object_mut()
                    .and_then(|object| {
                        object
                            .entry("pagination")
                            .or_insert_with(|| json!({}))
                            .as_object_mut()
                    })
                    .context("malformed pagination config")?
                    .insert("search_after".to_string(), after.clone());
            }

            let resp = self
                .http
                .post(format!("{}/search", self.base_url))
                .json(&query)
                .send()
                .await?;
            if resp.status() != StatusCode::OK {
                anyhow::bail!("Failed to perform query.");
            }
            let body: JsonValue = resp.json().await?;
            let records = body["records"].as_array().cloned().unwrap_or_default();
            if records.is_empty() {
                return Ok(all);
            }
            all.extend(records);

            match body["pagination"]["search_after"].clone() {
                JsonValue::Null => return Ok(all),
                after => search_after = Some(after),
            }
        }
    }

    /// One polling pass; finished tasks disappear from the registry and are
    /// dropped from the watch list.
    pub async fn task_status(&self, task_id: &str) -> Result<Option<f64>> {
        let resp = self
            .http
            .get(format!("{}/task/status/{}", self.base_url, task_id))
            .send()
            .await?;
        if resp.status() != StatusCode::OK {
            let mut tasks = self.tasks.lock().await;
            tasks.remove(task_id);
            return Ok(None);
        }
        let status: TaskStatusResponse = resp.json().await?;
        let progress = status.current_size as f64 / status.total_size.max(1) as f64;
        let mut tasks = self.tasks.lock().await;
        tasks.insert(task_id.to_string(), progress);
        Ok(Some(progress))
    }

    pub async fn watch_tasks(&self, task_ids: &[String]) -> Result<()> {
        {
            let mut tasks = self.tasks.lock().await;
            for task_id in task_ids {
                tasks.insert(task_id.clone(), 0.0);
            }
        }

        loop {
            let pending: Vec<String> = {
                let tasks = self.tasks.lock().await;
                tasks.keys().cloned().collect()
            };
            if pending.is_empty() {
                return Ok(());
            }
            for task_id in pending {
                match self.task_status(&task_id).await? {
                    Some(progress) => println!("{task_id}: {:.2}%", progress * 100.0),
                    None => println!("{task_id}: done"),
                }
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }

    pub async fn pending_tasks(&self) -> Vec<String> {
        self.tasks.lock().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_filter_matches_vendor_names() {
        assert!(MbClient::uploadable("jp_test.knt.tar.gz"));
        assert!(MbClient::uploadable("batch.zip"));
        assert!(MbClient::uploadable("20110222_015029_MQZ.V2A"));
        assert!(MbClient::uploadable("20110222_015029_mqz.v1a.bin"));
        assert!(!MbClient::uploadable("notes.txt"));
        assert!(!MbClient::uploadable("archive.tar"));
    }

    #[test]
    fn retry_schedule_doubles() {
        let mut delay = RETRY_BASE_DELAY;
        let mut total = Duration::ZERO;
        for _ in 0..UPLOAD_RETRIES {
            total += delay;
            delay *= RETRY_BACKOFF_FACTOR;
        }
        assert_eq!(total, Duration::from_secs(1 + 2 + 4));
    }
}
