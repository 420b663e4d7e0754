use crate::archive::{ArchiveCodec, CapturedGroup, ManifestExtras};
use crate::constants::archive::{ARCHIVE_EXTENSION, PARTIAL_SUFFIX};
use crate::constants::backup::{ID_TIME_FORMAT, STAGING_DIR_NAME};
use crate::content::{ContentGroup, ContentSource, SourceLayout, join_includes, remove_path};
use crate::db::{BackupRecord, DuckDbManager};
use crate::integrity::{IntegrityVerifier, ValidationReport, compute_digest};
use crate::job_slot::JobGuard;
use crate::{BackupError, Result};
use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, instrument, warn};

/// 备份存储配置
#[derive(Debug, Clone)]
pub struct BackupStoreOptions {
    pub storage_dir: PathBuf,
    pub retention_count: usize,
    pub safety_retention_count: usize,
    pub compression_level: u32,
}

/// 创建备份的请求
#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub includes: BTreeSet<ContentGroup>,
    pub description: Option<String>,
    pub is_safety_snapshot: bool,
    /// 保留策略清理时跳过的备份（正在恢复的备份）
    pub retain: Option<String>,
}

impl CreateRequest {
    pub fn new(includes: BTreeSet<ContentGroup>) -> Self {
        Self {
            includes,
            description: None,
            is_safety_snapshot: false,
            retain: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// 恢复前的安全快照
    pub fn safety_snapshot(includes: BTreeSet<ContentGroup>, description: impl Into<String>) -> Self {
        Self {
            includes,
            description: Some(description.into()),
            is_safety_snapshot: true,
            retain: None,
        }
    }

    /// 本次清理不删除指定的备份
    pub fn retaining(mut self, id: impl Into<String>) -> Self {
        self.retain = Some(id.into());
        self
    }
}

/// 备份概要
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackupSummary {
    pub id: String,
    pub created_at: DateTime<Utc>,
}

/// 备份统计信息
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackupStats {
    pub total_count: usize,
    pub total_bytes: u64,
    pub safety_snapshot_count: usize,
    pub oldest: Option<BackupSummary>,
    pub newest: Option<BackupSummary>,
    pub retention_count: usize,
    pub safety_retention_count: usize,
}

/// 启动清理的结果
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecoveryReport {
    pub removed_partials: Vec<PathBuf>,
    pub removed_staging: bool,
    pub missing_archives: Vec<String>,
}

/// 备份存储：负责创建、列出、校验、删除备份以及保留策略
#[derive(Debug, Clone)]
pub struct BackupStore {
    storage_dir: PathBuf,
    db: DuckDbManager,
    codec: ArchiveCodec,
    verifier: IntegrityVerifier,
    sources: Arc<BTreeMap<ContentGroup, Arc<dyn ContentSource>>>,
    retention_count: usize,
    safety_retention_count: usize,
    last_issued: Arc<Mutex<Option<DateTime<Utc>>>>,
}

impl BackupStore {
    /// 创建新的备份存储
    pub fn new(
        options: BackupStoreOptions,
        db: DuckDbManager,
        sources: Vec<Arc<dyn ContentSource>>,
    ) -> Result<Self> {
        if options.retention_count == 0 || options.safety_retention_count == 0 {
            return Err(BackupError::config("保留数量必须大于等于 1"));
        }

        if !options.storage_dir.exists() {
            std::fs::create_dir_all(&options.storage_dir)?;
        }

        let codec = ArchiveCodec::new(options.compression_level);
        let sources = sources
            .into_iter()
            .map(|source| (source.group(), source))
            .collect();

        Ok(Self {
            storage_dir: options.storage_dir,
            db,
            verifier: IntegrityVerifier::new(codec.clone()),
            codec,
            sources: Arc::new(sources),
            retention_count: options.retention_count,
            safety_retention_count: options.safety_retention_count,
            last_issued: Arc::new(Mutex::new(None)),
        })
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    /// 恢复暂存区根目录
    pub fn staging_root(&self) -> PathBuf {
        self.storage_dir.join(STAGING_DIR_NAME)
    }

    pub fn codec(&self) -> &ArchiveCodec {
        &self.codec
    }

    pub fn source(&self, group: ContentGroup) -> Option<Arc<dyn ContentSource>> {
        self.sources.get(&group).cloned()
    }

    /// 创建备份（全部成功或全部失败）
    ///
    /// 任何内容组捕获或写入失败时，暂存文件被删除且索引中不会出现记录。
    #[instrument(skip_all, fields(includes = %join_includes(&request.includes), safety = request.is_safety_snapshot))]
    pub async fn create(&self, _guard: &JobGuard, request: CreateRequest) -> Result<BackupRecord> {
        if request.includes.is_empty() {
            return Err(BackupError::invalid("至少需要指定一个内容组"));
        }
        for group in &request.includes {
            if !self.sources.contains_key(group) {
                return Err(BackupError::invalid(format!("未配置内容组 {group} 的来源")));
            }
        }

        let (id, created_at) = self.next_id().await?;
        let archive_path = self.archive_path(&id);
        info!(backup_id = %id, "开始创建备份: {}", archive_path.display());

        let capture_dir = self.staging_root().join(format!("capture-{id}"));
        let written = self
            .capture_and_write(&request, &id, created_at, &capture_dir, &archive_path)
            .await;
        if let Err(e) = remove_path(&capture_dir).await {
            warn!(path = %capture_dir.display(), error = %e, "清理捕获目录失败");
        }
        let file_size = match written {
            Ok(size) => size,
            Err(e) => {
                error!(backup_id = %id, error = %e, "备份创建失败");
                return Err(e);
            }
        };

        // 归档完整写入后才计算摘要
        let checksum = match compute_digest(&archive_path).await {
            Ok(checksum) => checksum,
            Err(e) => {
                if let Err(cleanup) = remove_path(&archive_path).await {
                    warn!(path = %archive_path.display(), error = %cleanup, "删除未完成的归档失败");
                }
                return Err(e);
            }
        };

        let record = BackupRecord {
            id: id.clone(),
            created_at,
            description: request.description,
            includes: request.includes,
            file_size,
            checksum,
            is_safety_snapshot: request.is_safety_snapshot,
            location: archive_path.clone(),
        };

        if let Err(e) = self.db.insert_backup(record.clone()).await {
            error!(backup_id = %id, error = %e, "写入备份索引失败，删除归档");
            if let Err(cleanup) = remove_path(&archive_path).await {
                warn!(path = %archive_path.display(), error = %cleanup, "删除未入索引的归档失败");
            }
            return Err(e);
        }

        info!(
            backup_id = %id,
            file_size = record.file_size,
            checksum = %record.checksum,
            "备份创建成功"
        );

        if let Err(e) = self
            .apply_retention(record.is_safety_snapshot, request.retain.as_deref())
            .await
        {
            warn!(error = %e, "保留策略清理失败，将在下次创建备份时重试");
        }

        Ok(record)
    }

    async fn capture_and_write(
        &self,
        request: &CreateRequest,
        id: &str,
        created_at: DateTime<Utc>,
        capture_dir: &Path,
        archive_path: &Path,
    ) -> Result<u64> {
        remove_path(capture_dir).await?;
        tokio::fs::create_dir_all(capture_dir).await?;

        let mut captured = Vec::with_capacity(request.includes.len());
        for group in &request.includes {
            let source = self
                .sources
                .get(group)
                .ok_or_else(|| BackupError::invalid(format!("未配置内容组 {group} 的来源")))?;

            let group_dir = capture_dir.join(group.as_str());
            let dest = match source.layout() {
                SourceLayout::File => {
                    let file_name = source
                        .live_path()
                        .file_name()
                        .map(|n| n.to_os_string())
                        .unwrap_or_else(|| group.as_str().into());
                    group_dir.join(file_name)
                }
                SourceLayout::Directory => group_dir,
            };

            source.capture(&dest).await?;
            debug!(group = %group, "内容组捕获完成");

            captured.push(CapturedGroup {
                group: *group,
                layout: source.layout(),
                path: dest,
            });
        }

        let handle = self
            .codec
            .write(
                archive_path,
                captured,
                ManifestExtras {
                    id: id.to_string(),
                    created_at,
                    description: request.description.clone(),
                    is_safety_snapshot: request.is_safety_snapshot,
                },
            )
            .await?;
        Ok(handle.file_size)
    }

    /// 分配新的备份 ID：`YYYYMMDD-HHMMSS-mmm`（UTC），单调递增且不与索引重复
    async fn next_id(&self) -> Result<(String, DateTime<Utc>)> {
        let now = Utc::now()
            .duration_trunc(Duration::milliseconds(1))
            .unwrap_or_else(|_| Utc::now());

        let mut candidate = {
            let mut last = self
                .last_issued
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let candidate = match *last {
                Some(prev) if now <= prev => prev + Duration::milliseconds(1),
                _ => now,
            };
            *last = Some(candidate);
            candidate
        };

        loop {
            let id = format_id(&candidate);
            if self.db.get_backup(&id).await?.is_none() {
                let mut last = self
                    .last_issued
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                if last.is_none_or(|prev| prev < candidate) {
                    *last = Some(candidate);
                }
                return Ok((id, candidate));
            }
            candidate += Duration::milliseconds(1);
        }
    }

    fn archive_path(&self, id: &str) -> PathBuf {
        self.storage_dir.join(format!("{id}{ARCHIVE_EXTENSION}"))
    }

    /// 列出所有备份（最新在前）
    pub async fn list(&self) -> Result<Vec<BackupRecord>> {
        self.db.list_backups().await
    }

    /// 获取备份记录
    pub async fn get(&self, id: &str) -> Result<BackupRecord> {
        self.db
            .get_backup(id)
            .await?
            .ok_or_else(|| BackupError::not_found(id))
    }

    /// 校验备份完整性
    pub async fn validate(&self, id: &str) -> Result<ValidationReport> {
        let record = self.get(id).await?;
        self.verifier.verify(&record).await
    }

    /// 删除备份
    pub async fn delete(&self, _guard: &JobGuard, id: &str) -> Result<()> {
        let record = self.get(id).await?;
        self.remove_record(&record).await
    }

    /// 先删索引再删归档，索引中不会留下没有归档的记录
    async fn remove_record(&self, record: &BackupRecord) -> Result<()> {
        self.db.delete_backup(&record.id).await?;
        if let Err(e) = remove_path(&record.location).await {
            warn!(
                backup_id = %record.id,
                path = %record.location.display(),
                error = %e,
                "备份记录已删除，但归档文件删除失败"
            );
        }
        info!(backup_id = %record.id, "备份已删除");
        Ok(())
    }

    /// 按保留数量清理；普通备份和安全快照分别计数，互不影响。
    /// `retain` 指定的备份不参与计数，也不会被删除。
    async fn apply_retention(&self, safety: bool, retain: Option<&str>) -> Result<Vec<String>> {
        let keep = if safety {
            self.safety_retention_count
        } else {
            self.retention_count
        };

        let expired: Vec<BackupRecord> = self
            .list()
            .await?
            .into_iter()
            .filter(|record| record.is_safety_snapshot == safety)
            .filter(|record| retain != Some(record.id.as_str()))
            .skip(keep)
            .collect();

        let mut removed = Vec::with_capacity(expired.len());
        for record in expired {
            self.remove_record(&record).await?;
            info!(backup_id = %record.id, safety, "超出保留数量，已删除旧备份");
            removed.push(record.id);
        }
        Ok(removed)
    }

    /// 统计信息
    pub async fn stats(&self) -> Result<BackupStats> {
        let records = self.list().await?;
        let summary = |record: &BackupRecord| BackupSummary {
            id: record.id.clone(),
            created_at: record.created_at,
        };

        Ok(BackupStats {
            total_count: records.len(),
            total_bytes: records.iter().map(|r| r.file_size).sum(),
            safety_snapshot_count: records.iter().filter(|r| r.is_safety_snapshot).count(),
            newest: records.first().map(summary),
            oldest: records.last().map(summary),
            retention_count: self.retention_count,
            safety_retention_count: self.safety_retention_count,
        })
    }

    /// 启动清理：删除中断遗留的暂存归档和暂存目录，报告丢失归档的记录
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();

        let mut entries = tokio::fs::read_dir(&self.storage_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_partial = path
                .file_name()
                .map(|n| n.to_string_lossy().ends_with(PARTIAL_SUFFIX))
                .unwrap_or(false);
            if is_partial {
                remove_path(&path).await?;
                warn!(path = %path.display(), "删除中断遗留的暂存归档");
                report.removed_partials.push(path);
            }
        }

        let staging = self.staging_root();
        if tokio::fs::try_exists(&staging).await? {
            remove_path(&staging).await?;
            warn!(path = %staging.display(), "删除中断遗留的暂存目录");
            report.removed_staging = true;
        }

        for record in self.list().await? {
            if !tokio::fs::try_exists(&record.location).await? {
                error!(
                    backup_id = %record.id,
                    path = %record.location.display(),
                    "索引中的备份文件已丢失"
                );
                report.missing_archives.push(record.id);
            }
        }

        Ok(report)
    }
}

fn format_id(at: &DateTime<Utc>) -> String {
    format!(
        "{}-{:03}",
        at.format(ID_TIME_FORMAT),
        at.timestamp_subsec_millis()
    )
}
