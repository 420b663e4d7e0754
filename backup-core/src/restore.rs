//! 恢复协调器
//!
//! 状态机：校验 -> 安全快照 -> 解压到暂存区 -> 逐组换入 -> 报告。
//! 前三步不修改在线内容；换入阶段任何内容组失败都会回滚已换入的内容组。

use crate::backup::{BackupStore, CreateRequest};
use crate::content::{ContentGroup, remove_path, revert_swap};
use crate::db::BackupRecord;
use crate::job_slot::JobGuard;
use crate::{BackupError, Result};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// 恢复请求
#[derive(Debug, Clone)]
pub struct RestoreRequest {
    pub backup_id: String,
    /// 为空时恢复备份中的全部内容组
    pub includes: Option<BTreeSet<ContentGroup>>,
    pub make_safety_snapshot: bool,
}

impl RestoreRequest {
    pub fn new(backup_id: impl Into<String>) -> Self {
        Self {
            backup_id: backup_id.into(),
            includes: None,
            make_safety_snapshot: true,
        }
    }

    pub fn with_includes(mut self, includes: BTreeSet<ContentGroup>) -> Self {
        self.includes = Some(includes);
        self
    }

    pub fn without_safety_snapshot(mut self) -> Self {
        self.make_safety_snapshot = false;
        self
    }
}

/// 恢复结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RestoreOutcome {
    pub backup_id: String,
    pub restored: BTreeSet<ContentGroup>,
    pub safety_snapshot_id: Option<String>,
}

/// 已换入的内容组及其被换下的旧内容
struct Installed {
    group: ContentGroup,
    live: PathBuf,
    aside: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct RestoreCoordinator {
    store: BackupStore,
}

impl RestoreCoordinator {
    pub fn new(store: BackupStore) -> Self {
        Self { store }
    }

    /// 执行恢复
    #[instrument(skip_all, fields(backup_id = %request.backup_id))]
    pub async fn restore(&self, guard: &JobGuard, request: RestoreRequest) -> Result<RestoreOutcome> {
        let record = self.store.get(&request.backup_id).await?;
        let includes = self.resolve_includes(&record, request.includes)?;

        // 1. 校验
        let report = self.store.validate(&record.id).await?;
        if !report.valid {
            error!(reason = ?report.reason, "备份校验失败，放弃恢复");
        }
        report.into_result()?;

        // 2. 安全快照
        let snapshot = if request.make_safety_snapshot {
            self.make_safety_snapshot(guard, &record, &includes).await?
        } else {
            warn!("未创建安全快照，换入失败时只能用换下的旧内容回滚");
            None
        };
        let snapshot_id = snapshot.as_ref().map(|s| s.id.clone());

        // 3. 解压到暂存区
        let staging = self
            .store
            .staging_root()
            .join(Uuid::new_v4().to_string());
        let result = self
            .stage_and_swap(&record, &includes, snapshot.as_ref(), &staging)
            .await;
        if let Err(e) = remove_path(&staging).await {
            warn!(path = %staging.display(), error = %e, "清理恢复暂存目录失败");
        }

        match result {
            Ok(restored) => {
                info!(restored = ?restored, safety_snapshot = ?snapshot_id, "恢复完成");
                Ok(RestoreOutcome {
                    backup_id: record.id,
                    restored,
                    safety_snapshot_id: snapshot_id,
                })
            }
            Err(SwapFailure {
                restored,
                rolled_back,
                source,
            }) => {
                error!(
                    error = %source,
                    restored = ?restored,
                    rolled_back = ?rolled_back,
                    safety_snapshot = ?snapshot_id,
                    "恢复失败"
                );
                Err(BackupError::Restore {
                    safety_snapshot_id: snapshot_id,
                    restored,
                    rolled_back,
                    source: Box::new(source),
                })
            }
        }
    }

    fn resolve_includes(
        &self,
        record: &BackupRecord,
        requested: Option<BTreeSet<ContentGroup>>,
    ) -> Result<BTreeSet<ContentGroup>> {
        let includes = requested.unwrap_or_else(|| record.includes.clone());
        if includes.is_empty() {
            return Err(BackupError::invalid("至少需要指定一个内容组"));
        }
        for group in &includes {
            if !record.includes.contains(group) {
                return Err(BackupError::MissingGroup(*group));
            }
            if self.store.source(*group).is_none() {
                return Err(BackupError::invalid(format!("未配置内容组 {group} 的来源")));
            }
        }
        Ok(includes)
    }

    /// 只对当前在线存在的内容组做快照；全部不存在时没有需要保护的内容
    async fn make_safety_snapshot(
        &self,
        guard: &JobGuard,
        record: &BackupRecord,
        includes: &BTreeSet<ContentGroup>,
    ) -> Result<Option<BackupRecord>> {
        let mut present = BTreeSet::new();
        for group in includes {
            if let Some(source) = self.store.source(*group) {
                if tokio::fs::try_exists(source.live_path()).await? {
                    present.insert(*group);
                }
            }
        }

        if present.is_empty() {
            info!("在线内容均不存在，跳过安全快照");
            return Ok(None);
        }

        let snapshot = self
            .store
            .create(
                guard,
                // 正在恢复的备份可能本身就是最旧的安全快照
                CreateRequest::safety_snapshot(present, format!("恢复 {} 前的安全快照", record.id))
                    .retaining(record.id.clone()),
            )
            .await
            .inspect_err(|e| error!(error = %e, "安全快照创建失败，放弃恢复"))?;

        info!(snapshot_id = %snapshot.id, "安全快照已创建");
        Ok(Some(snapshot))
    }

    async fn stage_and_swap(
        &self,
        record: &BackupRecord,
        includes: &BTreeSet<ContentGroup>,
        snapshot: Option<&BackupRecord>,
        staging: &Path,
    ) -> std::result::Result<BTreeSet<ContentGroup>, SwapFailure> {
        let extracted = self
            .store
            .codec()
            .read(&record.location, includes, &staging.join("incoming"))
            .await
            .map_err(SwapFailure::before_swap)?;

        // 4. 逐组换入
        let mut installed: Vec<Installed> = Vec::with_capacity(extracted.len());
        for item in extracted {
            let source = match self.store.source(item.group) {
                Some(source) => source,
                None => {
                    let err = BackupError::invalid(format!("未配置内容组 {} 的来源", item.group));
                    return Err(self.rollback(installed, snapshot, staging, err).await);
                }
            };

            match source.install(&item.path).await {
                Ok(aside) => {
                    info!(group = %item.group, "内容组已换入");
                    installed.push(Installed {
                        group: item.group,
                        live: source.live_path().to_path_buf(),
                        aside,
                    });
                }
                Err(e) => {
                    error!(group = %item.group, error = %e, "内容组换入失败，开始回滚");
                    let err = BackupError::partial(item.group, e.to_string());
                    return Err(self.rollback(installed, snapshot, staging, err).await);
                }
            }
        }

        let mut restored = BTreeSet::new();
        for item in installed {
            if let Some(aside) = &item.aside {
                if let Err(e) = remove_path(aside).await {
                    warn!(path = %aside.display(), error = %e, "删除换下的旧内容失败");
                }
            }
            restored.insert(item.group);
        }
        Ok(restored)
    }

    /// 回滚已换入的内容组：优先使用安全快照，失败或没有快照时用换下的旧内容
    async fn rollback(
        &self,
        installed: Vec<Installed>,
        snapshot: Option<&BackupRecord>,
        staging: &Path,
        cause: BackupError,
    ) -> SwapFailure {
        let mut restored = Vec::new();
        let mut rolled_back = Vec::new();

        let snapshot_groups: BTreeSet<ContentGroup> = match snapshot {
            Some(snapshot) => installed
                .iter()
                .map(|i| i.group)
                .filter(|g| snapshot.includes.contains(g))
                .collect(),
            None => BTreeSet::new(),
        };

        let mut from_snapshot = Vec::new();
        if let (Some(snapshot), false) = (snapshot, snapshot_groups.is_empty()) {
            match self
                .store
                .codec()
                .read(&snapshot.location, &snapshot_groups, &staging.join("rollback"))
                .await
            {
                Ok(extracted) => from_snapshot = extracted,
                Err(e) => warn!(error = %e, "无法从安全快照解压，改用换下的旧内容回滚"),
            }
        }

        // 逆序回滚
        for item in installed.into_iter().rev() {
            let staged = from_snapshot.iter().find(|e| e.group == item.group);
            let mut reverted = false;

            if let (Some(staged), Some(source)) = (staged, self.store.source(item.group)) {
                match source.install(&staged.path).await {
                    Ok(replaced) => {
                        for leftover in replaced.iter().chain(item.aside.iter()) {
                            if let Err(e) = remove_path(leftover).await {
                                warn!(path = %leftover.display(), error = %e, "删除回滚遗留内容失败");
                            }
                        }
                        reverted = true;
                    }
                    Err(e) => {
                        warn!(group = %item.group, error = %e, "从安全快照回滚失败，改用换下的旧内容");
                    }
                }
            }

            if !reverted {
                match revert_swap(item.aside.as_deref(), &item.live).await {
                    Ok(()) => reverted = true,
                    Err(e) => {
                        error!(group = %item.group, error = %e, "回滚失败，该内容组保持为恢复后的内容");
                    }
                }
            }

            if reverted {
                info!(group = %item.group, "内容组已回滚");
                rolled_back.push(item.group);
            } else {
                restored.push(item.group);
            }
        }

        rolled_back.sort();
        restored.sort();
        SwapFailure {
            restored,
            rolled_back,
            source: cause,
        }
    }
}

/// 换入阶段的失败信息
struct SwapFailure {
    restored: Vec<ContentGroup>,
    rolled_back: Vec<ContentGroup>,
    source: BackupError,
}

impl SwapFailure {
    fn before_swap(source: BackupError) -> Self {
        Self {
            restored: Vec::new(),
            rolled_back: Vec::new(),
            source,
        }
    }
}
