//! 远程同步：本地备份创建成功后把归档上传到远程存储

use crate::config::RemoteSyncConfig;
use crate::constants::remote_sync::{CHECKSUM_HEADER, USER_AGENT};
use crate::db::BackupRecord;
use crate::{BackupError, Result};
use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::{Body, Client};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

#[async_trait]
pub trait RemoteSync: Send + Sync + std::fmt::Debug {
    /// 上传一个已完成的备份
    async fn upload(&self, record: &BackupRecord) -> Result<()>;
}

/// 基于 HTTP PUT 的远程同步
#[derive(Debug, Clone)]
pub struct HttpRemoteSync {
    client: Client,
    endpoint: String,
    bearer_token: Option<String>,
}

impl HttpRemoteSync {
    pub fn new(config: &RemoteSyncConfig) -> Result<Self> {
        if config.endpoint.trim().is_empty() {
            return Err(BackupError::config("remote_sync.endpoint 不能为空"));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            bearer_token: config.bearer_token.clone().filter(|t| !t.is_empty()),
        })
    }

    /// 按配置构造；未启用时返回 `None`
    pub fn from_config(config: &RemoteSyncConfig) -> Result<Option<Arc<dyn RemoteSync>>> {
        if !config.enabled {
            return Ok(None);
        }
        Ok(Some(Arc::new(Self::new(config)?)))
    }

    fn upload_url(&self, record: &BackupRecord) -> Result<String> {
        let file_name = record
            .location
            .file_name()
            .ok_or_else(|| BackupError::custom("备份文件路径缺少文件名"))?
            .to_string_lossy();
        Ok(format!("{}/{file_name}", self.endpoint))
    }
}

#[async_trait]
impl RemoteSync for HttpRemoteSync {
    async fn upload(&self, record: &BackupRecord) -> Result<()> {
        let url = self.upload_url(record)?;
        let file = tokio::fs::File::open(&record.location).await?;

        let sent = Arc::new(AtomicU64::new(0));
        let counter = sent.clone();
        let stream = ReaderStream::new(file).inspect_ok(move |chunk| {
            counter.fetch_add(chunk.len() as u64, Ordering::Relaxed);
        });

        let mut request = self
            .client
            .put(&url)
            .header(CHECKSUM_HEADER, &record.checksum)
            .header(reqwest::header::CONTENT_LENGTH, record.file_size)
            .body(Body::wrap_stream(stream));
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            warn!(backup_id = %record.id, url = %url, error = %e, "远程同步请求失败");
            BackupError::UpstreamUnavailable(format!("上传到 {url} 失败: {e}"))
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(backup_id = %record.id, status = %status, "远程存储拒绝上传");
            return Err(BackupError::UpstreamUnavailable(format!(
                "远程存储返回 {status}: {body}"
            )));
        }

        info!(
            backup_id = %record.id,
            url = %url,
            bytes = sent.load(Ordering::Relaxed),
            "备份已同步到远程存储"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_config_yields_none() {
        let config = RemoteSyncConfig::default();
        assert!(HttpRemoteSync::from_config(&config).unwrap().is_none());
    }

    #[test]
    fn test_upload_url_joins_endpoint_and_file_name() {
        let config = RemoteSyncConfig {
            enabled: true,
            endpoint: "https://backup.example.com/library/".to_string(),
            bearer_token: Some(String::new()),
            timeout_secs: 5,
        };
        let sync = HttpRemoteSync::new(&config).unwrap();
        assert!(sync.bearer_token.is_none());

        let record = BackupRecord {
            id: "20260101-020000-000".to_string(),
            created_at: chrono::Utc::now(),
            description: None,
            includes: Default::default(),
            file_size: 0,
            checksum: String::new(),
            is_safety_snapshot: false,
            location: "/var/backups/20260101-020000-000.tar.gz".into(),
        };
        assert_eq!(
            sync.upload_url(&record).unwrap(),
            "https://backup.example.com/library/20260101-020000-000.tar.gz"
        );
    }
}
