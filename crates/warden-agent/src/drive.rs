//! Google Drive v3 REST adapter for [`ObjectStore`].

use std::{path::Path, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use crate::{
    backup::{BackupRecord, FOLDER_KIND, ObjectStore, StoreError},
    config::BackupConfig,
};

const PAGE_SIZE: &str = "100";
const LIST_FIELDS: &str = "nextPageToken, files(id, name, mimeType, size, parents, modifiedTime)";
const CREDENTIALS_MAX_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    next_page_token: Option<String>,
    #[serde(default)]
    files: Vec<DriveFile>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    name: String,
    mime_type: String,
    // Drive encodes int64 as a JSON string.
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    parents: Vec<String>,
    modified_time: DateTime<Utc>,
}

impl From<DriveFile> for BackupRecord {
    fn from(f: DriveFile) -> Self {
        BackupRecord {
            size: f.size.as_deref().and_then(|s| s.parse().ok()),
            id: f.id,
            name: f.name,
            kind: f.mime_type,
            parents: f.parents,
            modified: f.modified_time,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Created {
    id: String,
}

pub struct DriveStore {
    client: reqwest::Client,
    api_base: String,
    token: String,
}

/// The credentials file must exist; one older than a week only earns a warning.
pub fn check_credentials(path: &Path) -> anyhow::Result<()> {
    let meta = std::fs::metadata(path)
        .with_context(|| format!("credentials file {} is missing", path.display()))?;
    let age = meta
        .modified()
        .ok()
        .and_then(|m| m.elapsed().ok())
        .unwrap_or_default();
    if age > CREDENTIALS_MAX_AGE {
        tracing::warn!(
            path = %path.display(),
            age_days = age.as_secs() / 86_400,
            "credentials are older than 7 days; refresh them if requests start failing"
        );
    }
    Ok(())
}

fn read_token(cfg: &BackupConfig) -> anyhow::Result<String> {
    if let Ok(v) = std::env::var("WARDEN_DRIVE_TOKEN") {
        let v = v.trim().to_string();
        if !v.is_empty() {
            return Ok(v);
        }
    }
    let raw = std::fs::read_to_string(&cfg.token_file)
        .with_context(|| format!("read drive token {}", cfg.token_file.display()))?;
    let token = raw.trim().to_string();
    if token.is_empty() {
        anyhow::bail!("drive token file {} is empty", cfg.token_file.display());
    }
    Ok(token)
}

async fn checked(
    operation: &'static str,
    resp: reqwest::Response,
) -> Result<reqwest::Response, StoreError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(StoreError::NotFound(resp.url().path().to_string()));
    }
    let body = resp.text().await.unwrap_or_default();
    Err(StoreError::Status {
        operation,
        status: status.as_u16(),
        body,
    })
}

impl DriveStore {
    pub fn from_config(cfg: &BackupConfig) -> anyhow::Result<Self> {
        check_credentials(&cfg.credentials_file)?;
        let token = read_token(cfg)?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_sec))
            .build()
            .context("build http client")?;
        Ok(Self {
            client,
            api_base: cfg.api_base.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn files_url(&self) -> String {
        format!("{}/drive/v3/files", self.api_base)
    }
}

#[async_trait]
impl ObjectStore for DriveStore {
    async fn list(&self) -> Result<Vec<BackupRecord>, StoreError> {
        let mut out = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut query = vec![
                ("q", "trashed=false".to_string()),
                ("pageSize", PAGE_SIZE.to_string()),
                ("fields", LIST_FIELDS.to_string()),
            ];
            if let Some(token) = page_token.take() {
                query.push(("pageToken", token));
            }
            let resp = self
                .client
                .get(self.files_url())
                .bearer_auth(&self.token)
                .query(&query)
                .send()
                .await?;
            let page: FileList = checked("list", resp).await?.json().await?;
            out.extend(page.files.into_iter().map(BackupRecord::from));
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }
        tracing::debug!(count = out.len(), "drive listing complete");
        Ok(out)
    }

    async fn download(&self, id: &str) -> Result<Vec<u8>, StoreError> {
        let resp = self
            .client
            .get(format!("{}/{id}", self.files_url()))
            .bearer_auth(&self.token)
            .query(&[("alt", "media")])
            .send()
            .await?;
        let bytes = checked("download", resp).await?.bytes().await?;
        Ok(bytes.to_vec())
    }

    async fn upload(&self, name: &str, parent_id: &str, bytes: Vec<u8>) -> Result<String, StoreError> {
        let resp = self
            .client
            .post(self.files_url())
            .bearer_auth(&self.token)
            .json(&json!({
                "name": name,
                "parents": [parent_id],
                "mimeType": "application/zip",
            }))
            .send()
            .await?;
        let created: Created = checked("upload", resp).await?.json().await?;

        let resp = self
            .client
            .patch(format!("{}/upload/drive/v3/files/{}", self.api_base, created.id))
            .bearer_auth(&self.token)
            .query(&[("uploadType", "media")])
            .header(reqwest::header::CONTENT_TYPE, "application/zip")
            .body(bytes)
            .send()
            .await?;
        checked("upload", resp).await?;
        Ok(created.id)
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let resp = self
            .client
            .delete(format!("{}/{id}", self.files_url()))
            .bearer_auth(&self.token)
            .send()
            .await?;
        checked("delete", resp).await?;
        Ok(())
    }

    async fn create_folder(&self, name: &str, parent_id: Option<&str>) -> Result<String, StoreError> {
        let mut meta = json!({ "name": name, "mimeType": FOLDER_KIND });
        if let Some(parent) = parent_id {
            meta["parents"] = json!([parent]);
        }
        let resp = self
            .client
            .post(self.files_url())
            .bearer_auth(&self.token)
            .json(&meta)
            .send()
            .await?;
        let created: Created = checked("create folder", resp).await?.json().await?;
        if created.id.is_empty() {
            return Err(StoreError::Malformed("folder created without an id".to_string()));
        }
        Ok(created.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_list_page_maps_to_records() {
        let raw = r#"{
            "nextPageToken": "tok",
            "files": [
                {"id": "1", "name": "world_save.zip", "mimeType": "application/zip",
                 "size": "2048", "parents": ["p"], "modifiedTime": "2024-02-03T04:05:06.789Z"},
                {"id": "2", "name": "world", "mimeType": "application/vnd.google-apps.folder",
                 "modifiedTime": "2024-02-01T00:00:00Z"}
            ]
        }"#;
        let page: FileList = serde_json::from_str(raw).unwrap();
        assert_eq!(page.next_page_token.as_deref(), Some("tok"));
        let records: Vec<BackupRecord> = page.files.into_iter().map(Into::into).collect();
        assert_eq!(records[0].size, Some(2048));
        assert!(records[0].is_zip());
        assert_eq!(records[0].parents, vec!["p".to_string()]);
        assert!(records[1].is_folder());
        assert_eq!(records[1].size, None);
        assert!(records[0].modified > records[1].modified);
    }

    #[test]
    fn last_page_has_no_token() {
        let page: FileList = serde_json::from_str(r#"{"files": []}"#).unwrap();
        assert!(page.next_page_token.is_none());
        assert!(page.files.is_empty());
    }

    #[test]
    fn missing_credentials_are_fatal() {
        let dir = tempfile::tempdir().unwrap();
        assert!(check_credentials(&dir.path().join("credentials.json")).is_err());
        std::fs::write(dir.path().join("credentials.json"), b"{}").unwrap();
        check_credentials(&dir.path().join("credentials.json")).unwrap();
    }
}
