//! 对外的管理接口：create / list / validate / restore / delete / stats
//!
//! 写操作（create、restore、delete）占用任务槽，只读操作不等待任务槽。

use crate::backup::{BackupStats, BackupStore, BackupStoreOptions, CreateRequest, RecoveryReport};
use crate::config::AppConfig;
use crate::content::ContentGroup;
use crate::db::{BackupRecord, DuckDbManager};
use crate::integrity::ValidationReport;
use crate::job_slot::{JobGuard, JobSlot};
use crate::remote_sync::{HttpRemoteSync, RemoteSync};
use crate::restore::{RestoreCoordinator, RestoreOutcome, RestoreRequest};
use crate::Result;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::warn;

/// 创建备份的结果
#[derive(Debug, Clone, Serialize)]
pub struct CreateOutcome {
    pub record: BackupRecord,
    /// 远程同步失败时的提示；本地备份仍然有效
    pub sync_warning: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BackupService {
    db: DuckDbManager,
    store: BackupStore,
    restorer: RestoreCoordinator,
    slot: JobSlot,
    remote: Option<Arc<dyn RemoteSync>>,
}

impl BackupService {
    pub fn new(
        db: DuckDbManager,
        store: BackupStore,
        remote: Option<Arc<dyn RemoteSync>>,
    ) -> Self {
        Self {
            db,
            restorer: RestoreCoordinator::new(store.clone()),
            store,
            slot: JobSlot::new(),
            remote,
        }
    }

    /// 按应用配置打开索引库并构造服务
    pub async fn from_config(config: &AppConfig) -> Result<Self> {
        config.validate()?;

        let db = DuckDbManager::new(config.get_index_db_path()).await?;
        let store = BackupStore::new(
            BackupStoreOptions {
                storage_dir: config.get_backup_dir(),
                retention_count: config.backup.retention_count,
                safety_retention_count: config.backup.safety_retention_count,
                compression_level: config.backup.compression_level,
            },
            db.clone(),
            config.content_sources(),
        )?;
        let remote = HttpRemoteSync::from_config(&config.remote_sync)?;

        Ok(Self::new(db, store, remote))
    }

    pub fn database(&self) -> &DuckDbManager {
        &self.db
    }

    pub fn store(&self) -> &BackupStore {
        &self.store
    }

    pub fn job_slot(&self) -> &JobSlot {
        &self.slot
    }

    /// 创建备份
    pub async fn create(
        &self,
        includes: BTreeSet<ContentGroup>,
        description: Option<String>,
    ) -> Result<CreateOutcome> {
        let guard = self.slot.try_acquire()?;
        let mut request = CreateRequest::new(includes);
        request.description = description;
        self.create_with(&guard, request).await
    }

    /// 在已占用任务槽的情况下创建备份，成功后执行远程同步
    pub async fn create_with(&self, guard: &JobGuard, request: CreateRequest) -> Result<CreateOutcome> {
        let is_safety_snapshot = request.is_safety_snapshot;
        let record = self.store.create(guard, request).await?;

        let sync_warning = match (&self.remote, is_safety_snapshot) {
            (Some(remote), false) => match remote.upload(&record).await {
                Ok(()) => None,
                Err(e) => {
                    warn!(backup_id = %record.id, error = %e, "远程同步失败，本地备份仍然有效");
                    Some(e.to_string())
                }
            },
            _ => None,
        };

        Ok(CreateOutcome {
            record,
            sync_warning,
        })
    }

    /// 列出所有备份（最新在前）
    pub async fn list(&self) -> Result<Vec<BackupRecord>> {
        self.store.list().await
    }

    /// 校验备份
    pub async fn validate(&self, id: &str) -> Result<ValidationReport> {
        self.store.validate(id).await
    }

    /// 恢复备份
    pub async fn restore(&self, request: RestoreRequest) -> Result<RestoreOutcome> {
        let guard = self.slot.try_acquire()?;
        self.restorer.restore(&guard, request).await
    }

    /// 删除备份
    pub async fn delete(&self, id: &str) -> Result<()> {
        let guard = self.slot.try_acquire()?;
        self.store.delete(&guard, id).await
    }

    /// 统计信息
    pub async fn stats(&self) -> Result<BackupStats> {
        self.store.stats().await
    }

    /// 启动清理，占用任务槽以免与正在进行的任务冲突
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let _guard = self.slot.try_acquire()?;
        self.store.recover().await
    }
}
