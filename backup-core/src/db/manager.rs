use crate::{BackupError, Result};
use std::path::Path;
use tokio::sync::{mpsc, oneshot};

use super::actor::DuckDbActor;
use super::messages::DbMessage;
use super::models::BackupRecord;

/// DuckDB数据库管理器
#[derive(Debug, Clone)]
pub struct DuckDbManager {
    sender: mpsc::Sender<DbMessage>,
}

impl DuckDbManager {
    /// 创建新的DuckDB管理器
    pub async fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();

        // 确保数据库文件的父目录存在
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let actor = DuckDbActor::new(db_path)?;
        Self::spawn(actor).await
    }

    /// 创建内存数据库管理器
    pub async fn new_memory() -> Result<Self> {
        let actor = DuckDbActor::new_memory()?;
        Self::spawn(actor).await
    }

    async fn spawn(actor: DuckDbActor) -> Result<Self> {
        let (sender, receiver) = mpsc::channel(100);
        tokio::spawn(actor.run(receiver));

        let manager = Self { sender };
        manager
            .call(|respond_to| DbMessage::InitTables { respond_to })
            .await?;
        Ok(manager)
    }

    /// 没有 Actor 在接收的管理器，所有调用都会失败
    #[cfg(test)]
    pub(crate) fn disconnected() -> Self {
        let (sender, _) = mpsc::channel(1);
        Self { sender }
    }

    /// 发送消息并等待Actor响应
    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> DbMessage,
    ) -> Result<T> {
        let (respond_to, receiver) = oneshot::channel();

        self.sender
            .send(build(respond_to))
            .await
            .map_err(|_| BackupError::custom("数据库Actor已关闭"))?;

        receiver
            .await
            .map_err(|_| BackupError::custom("等待数据库响应失败"))?
    }

    /// 获取配置值
    pub async fn get_config(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        self.call(|respond_to| DbMessage::GetConfig { key, respond_to })
            .await
    }

    /// 设置配置值
    pub async fn set_config(&self, key: &str, value: &str) -> Result<()> {
        let key = key.to_string();
        let value = value.to_string();
        self.call(|respond_to| DbMessage::SetConfig {
            key,
            value,
            respond_to,
        })
        .await
    }

    /// 按前缀列出配置
    pub async fn list_configs(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let prefix = prefix.to_string();
        self.call(|respond_to| DbMessage::ListConfigs { prefix, respond_to })
            .await
    }

    /// 写入备份记录
    pub async fn insert_backup(&self, record: BackupRecord) -> Result<()> {
        self.call(|respond_to| DbMessage::InsertBackup { record, respond_to })
            .await
    }

    /// 获取所有备份记录（最新在前）
    pub async fn list_backups(&self) -> Result<Vec<BackupRecord>> {
        self.call(|respond_to| DbMessage::ListBackups { respond_to })
            .await
    }

    /// 根据ID获取备份记录
    pub async fn get_backup(&self, id: &str) -> Result<Option<BackupRecord>> {
        let id = id.to_string();
        self.call(|respond_to| DbMessage::GetBackup { id, respond_to })
            .await
    }

    /// 删除备份记录
    pub async fn delete_backup(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.call(|respond_to| DbMessage::DeleteBackup { id, respond_to })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::ContentGroup;
    use chrono::{Duration, TimeZone, Utc};
    use std::collections::BTreeSet;
    use std::path::PathBuf;

    fn record(id: &str, offset_secs: i64) -> BackupRecord {
        BackupRecord {
            id: id.to_string(),
            created_at: Utc.with_ymd_and_hms(2026, 1, 1, 2, 0, 0).unwrap()
                + Duration::seconds(offset_secs),
            description: None,
            includes: BTreeSet::from([ContentGroup::Records, ContentGroup::Config]),
            file_size: 42,
            checksum: "abc".to_string(),
            is_safety_snapshot: false,
            location: PathBuf::from(format!("/tmp/{id}.tar.gz")),
        }
    }

    #[tokio::test]
    async fn test_backup_records_newest_first() {
        let db = DuckDbManager::new_memory().await.unwrap();
        db.insert_backup(record("a", 0)).await.unwrap();
        db.insert_backup(record("c", 20)).await.unwrap();
        db.insert_backup(record("b", 10)).await.unwrap();

        let ids: Vec<String> = db
            .list_backups()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["c", "b", "a"]);

        let fetched = db.get_backup("b").await.unwrap().unwrap();
        assert_eq!(fetched, record("b", 10));

        assert!(db.delete_backup("b").await.unwrap());
        assert!(!db.delete_backup("b").await.unwrap());
        assert!(db.get_backup("b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_config_roundtrip_and_prefix_listing() {
        let db = DuckDbManager::new_memory().await.unwrap();
        db.set_config("auto_backup.enabled", "true").await.unwrap();
        db.set_config("auto_backup.enabled", "false").await.unwrap();
        db.set_config("auto_backup.last_error", "say \"hi\"")
            .await
            .unwrap();
        db.set_config("other.key", "x").await.unwrap();

        assert_eq!(
            db.get_config("auto_backup.enabled").await.unwrap(),
            Some("false".to_string())
        );
        let listed = db.list_configs("auto_backup.").await.unwrap();
        assert_eq!(
            listed,
            vec![
                ("auto_backup.enabled".to_string(), "false".to_string()),
                ("auto_backup.last_error".to_string(), "say \"hi\"".to_string()),
            ]
        );
    }
}
