//! Thin HTTP client for the orchestrator Control API.

use anyhow::{anyhow, Result};
use backup_orchestrator::job::JobView;
use backup_orchestrator::orchestrator::LogChunk;
use backup_orchestrator::store::{BackupRecord, BackupStats};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Deserialize)]
pub struct Started {
    pub job_id: String,
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct CurrentStatus {
    pub running: bool,
    pub job: Option<JobView>,
}

#[derive(Debug, Deserialize)]
struct BackupList {
    backups: Vec<BackupRecord>,
}

pub struct Client {
    base: String,
    http: reqwest::Client,
}

impl Client {
    pub fn new(base: &str) -> Self {
        Self {
            base: base.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    pub async fn start_backup(
        &self,
        target: Option<&str>,
        components: &[String],
    ) -> Result<Started> {
        let body = json!({ "target": target, "components": components });
        decode(self.http.post(self.url("/api/backup")).json(&body).send().await?).await
    }

    pub async fn start_restore(
        &self,
        backup_id: &str,
        components: Option<&[String]>,
    ) -> Result<Started> {
        let body = json!({ "backup_id": backup_id, "components": components });
        decode(self.http.post(self.url("/api/restore")).json(&body).send().await?).await
    }

    pub async fn job(&self, id: &str) -> Result<JobView> {
        decode(self.http.get(self.url(&format!("/api/jobs/{id}"))).send().await?).await
    }

    pub async fn jobs(&self) -> Result<Vec<JobView>> {
        decode(self.http.get(self.url("/api/jobs")).send().await?).await
    }

    pub async fn current(&self) -> Result<CurrentStatus> {
        decode(self.http.get(self.url("/api/backup/status")).send().await?).await
    }

    pub async fn abort(&self, id: &str) -> Result<JobView> {
        decode(self.http.post(self.url(&format!("/api/jobs/{id}/abort"))).send().await?).await
    }

    pub async fn log(&self, id: &str, offset: usize) -> Result<LogChunk> {
        let url = self.url(&format!("/api/jobs/{id}/log?offset={offset}"));
        decode(self.http.get(url).send().await?).await
    }

    pub async fn list(&self, target: Option<&str>) -> Result<Vec<BackupRecord>> {
        let mut request = self.http.get(self.url("/api/backup/list"));
        if let Some(target) = target {
            request = request.query(&[("target", target)]);
        }
        let list: BackupList = decode(request.send().await?).await?;
        Ok(list.backups)
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let response = self.http.delete(self.url(&format!("/api/backups/{id}"))).send().await?;
        if response.status().is_success() {
            return Ok(());
        }
        Err(api_error(response).await)
    }

    pub async fn stats(&self) -> Result<BackupStats> {
        decode(self.http.get(self.url("/api/backup/stats")).send().await?).await
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    if !response.status().is_success() {
        return Err(api_error(response).await);
    }
    Ok(response.json().await?)
}

async fn api_error(response: reqwest::Response) -> anyhow::Error {
    let status = response.status();
    match response.json::<Value>().await {
        Ok(body) => {
            let message = body["error"].as_str().unwrap_or("request failed");
            match body["active_job_id"].as_str() {
                Some(active) => anyhow!("HTTP {status}: {message} (active job {active})"),
                None => anyhow!("HTTP {status}: {message}"),
            }
        }
        Err(_) => anyhow!("HTTP {status}"),
    }
}
