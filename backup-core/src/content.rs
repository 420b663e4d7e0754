//! 内容组与在线内容来源
//!
//! 一个内容组（记录库、资源目录、配置文件）是可以独立备份和恢复的系统状态单元。
//! `ContentSource` 描述某个内容组的在线位置：如何做一致性读取（capture），
//! 以及如何把暂存好的内容原子地换入在线位置（install）。

use crate::{BackupError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, warn};
use uuid::Uuid;
use walkdir::WalkDir;

/// 内容组
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentGroup {
    Records,
    Assets,
    Config,
}

impl ContentGroup {
    pub const ALL: [ContentGroup; 3] = [
        ContentGroup::Records,
        ContentGroup::Assets,
        ContentGroup::Config,
    ];

    /// 在清单、归档路径和命令行中使用的名字
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentGroup::Records => "records",
            ContentGroup::Assets => "assets",
            ContentGroup::Config => "config",
        }
    }
}

impl std::fmt::Display for ContentGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentGroup {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "records" => Ok(ContentGroup::Records),
            "assets" => Ok(ContentGroup::Assets),
            "config" => Ok(ContentGroup::Config),
            other => Err(BackupError::invalid(format!(
                "未知的内容组: {other}（可选: records, assets, config）"
            ))),
        }
    }
}

/// 解析内容组名字列表
pub fn parse_includes<S: AsRef<str>>(names: &[S]) -> Result<BTreeSet<ContentGroup>> {
    names.iter().map(|n| n.as_ref().parse()).collect()
}

/// 以逗号连接内容组名字（索引表中的存储格式）
pub fn join_includes(groups: &BTreeSet<ContentGroup>) -> String {
    groups
        .iter()
        .map(ContentGroup::as_str)
        .collect::<Vec<_>>()
        .join(",")
}

/// 在线内容的形态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceLayout {
    /// 单个文件，例如记录库文件或配置文件
    File,
    /// 目录树，例如封面资源
    Directory,
}

/// 某个内容组的在线位置
///
/// 记录库的 `capture` 必须基于外部记录库提供的一致性读取原语实现，
/// 保证快照不会看到写了一半的事务；引擎本身无法强制这一点。
#[async_trait]
pub trait ContentSource: Send + Sync + std::fmt::Debug {
    fn group(&self) -> ContentGroup;

    fn live_path(&self) -> &Path;

    fn layout(&self) -> SourceLayout;

    /// 把当前在线内容的时间点副本写到 `dest`
    async fn capture(&self, dest: &Path) -> Result<()>;

    /// 用 `staged` 替换在线内容；失败时在线内容保持原样
    ///
    /// 成功时返回被换下的旧内容位置（原先不存在则为 `None`），由调用方决定丢弃或换回。
    async fn install(&self, staged: &Path) -> Result<Option<PathBuf>> {
        swap_in_keep(staged, self.live_path()).await
    }
}

/// 单文件内容来源
#[derive(Debug, Clone)]
pub struct FileSource {
    group: ContentGroup,
    path: PathBuf,
}

impl FileSource {
    pub fn new(group: ContentGroup, path: impl Into<PathBuf>) -> Self {
        Self {
            group,
            path: path.into(),
        }
    }
}

#[async_trait]
impl ContentSource for FileSource {
    fn group(&self) -> ContentGroup {
        self.group
    }

    fn live_path(&self) -> &Path {
        &self.path
    }

    fn layout(&self) -> SourceLayout {
        SourceLayout::File
    }

    async fn capture(&self, dest: &Path) -> Result<()> {
        if !tokio::fs::try_exists(&self.path).await? {
            return Err(BackupError::partial(
                self.group,
                format!("在线文件不存在: {}", self.path.display()),
            ));
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // 先复制到临时名，再改名，避免留下复制了一半的文件
        let tmp = sibling_with_suffix(dest, ".copying");
        if let Err(e) = tokio::fs::copy(&self.path, &tmp).await {
            discard(&tmp).await;
            return Err(BackupError::partial(
                self.group,
                format!("读取 {} 失败: {e}", self.path.display()),
            ));
        }
        tokio::fs::rename(&tmp, dest).await?;

        debug!(group = %self.group, path = %self.path.display(), "文件快照完成");
        Ok(())
    }
}

/// 目录树内容来源
#[derive(Debug, Clone)]
pub struct DirectorySource {
    group: ContentGroup,
    path: PathBuf,
}

impl DirectorySource {
    pub fn new(group: ContentGroup, path: impl Into<PathBuf>) -> Self {
        Self {
            group,
            path: path.into(),
        }
    }
}

#[async_trait]
impl ContentSource for DirectorySource {
    fn group(&self) -> ContentGroup {
        self.group
    }

    fn live_path(&self) -> &Path {
        &self.path
    }

    fn layout(&self) -> SourceLayout {
        SourceLayout::Directory
    }

    async fn capture(&self, dest: &Path) -> Result<()> {
        if !self.path.is_dir() {
            return Err(BackupError::partial(
                self.group,
                format!("在线目录不存在: {}", self.path.display()),
            ));
        }

        let source = self.path.clone();
        let target = dest.to_path_buf();
        let group = self.group;
        tokio::task::spawn_blocking(move || copy_dir_recursive(&source, &target))
            .await?
            .map_err(|e| BackupError::partial(group, format!("复制目录失败: {e}")))?;

        debug!(group = %self.group, path = %self.path.display(), "目录快照完成");
        Ok(())
    }
}

/// 递归复制目录（只复制普通文件和目录）
pub fn copy_dir_recursive(source: &Path, target: &Path) -> Result<u64> {
    std::fs::create_dir_all(target)?;
    let mut copied = 0u64;

    for entry in WalkDir::new(source).follow_links(false) {
        let entry = entry?;
        let relative = entry.path().strip_prefix(source)?;
        if relative.as_os_str().is_empty() {
            continue;
        }
        let dest = target.join(relative);

        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&dest)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &dest)?;
            copied += 1;
        }
    }

    Ok(copied)
}

/// 删除文件或目录，不存在时忽略
pub async fn remove_path(path: &Path) -> Result<()> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await?,
        Ok(_) => tokio::fs::remove_file(path).await?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

/// 清理临时内容，失败只记录日志
async fn discard(path: &Path) {
    if let Err(e) = remove_path(path).await {
        warn!(path = %path.display(), error = %e, "清理临时内容失败");
    }
}

/// 把暂存内容换入在线位置，保留换下的旧内容
///
/// 步骤：暂存内容先移到在线位置的同级目录（跨文件系统时复制），
/// 旧内容改名到一旁，新内容改名到在线位置。
/// 改名失败时把旧内容改回原名，在线位置要么是全新内容要么是原内容。
pub async fn swap_in_keep(staged: &Path, live: &Path) -> Result<Option<PathBuf>> {
    if let Some(parent) = live.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    // 换下的旧内容可能还被回滚流程引用，每次换入使用不同的名字
    let incoming = sibling_with_suffix(live, ".restore-new");
    let aside = sibling_with_suffix(live, &format!(".restore-old-{}", Uuid::new_v4().simple()));
    remove_path(&incoming).await?;

    move_or_copy(staged, &incoming).await?;

    let had_live = tokio::fs::symlink_metadata(live).await.is_ok();
    if had_live {
        if let Err(e) = tokio::fs::rename(live, &aside).await {
            discard(&incoming).await;
            return Err(e.into());
        }
    }

    if let Err(e) = tokio::fs::rename(&incoming, live).await {
        if had_live {
            if let Err(revert_err) = tokio::fs::rename(&aside, live).await {
                warn!(
                    path = %live.display(),
                    error = %revert_err,
                    "换入失败后还原旧内容也失败，旧内容保留在 {}",
                    aside.display()
                );
            }
        }
        discard(&incoming).await;
        return Err(e.into());
    }

    Ok(had_live.then_some(aside))
}

/// 用换下的旧内容还原在线位置；`aside` 为 `None` 表示原先不存在，直接删除
pub async fn revert_swap(aside: Option<&Path>, live: &Path) -> Result<()> {
    remove_path(live).await?;
    if let Some(aside) = aside {
        tokio::fs::rename(aside, live).await?;
    }
    Ok(())
}

/// 同一文件系统内改名，否则复制后删除源
async fn move_or_copy(from: &Path, to: &Path) -> Result<()> {
    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }

    let meta = tokio::fs::symlink_metadata(from).await?;
    if meta.is_dir() {
        let source = from.to_path_buf();
        let target = to.to_path_buf();
        tokio::task::spawn_blocking(move || copy_dir_recursive(&source, &target)).await??;
    } else {
        tokio::fs::copy(from, to).await?;
    }
    remove_path(from).await
}

/// 生成同级隐藏路径，例如 `covers` -> `.covers.restore-new`
fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}{suffix}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_includes() {
        let groups = parse_includes(&["records", "Config"]).unwrap();
        assert_eq!(join_includes(&groups), "records,config");
        assert!(parse_includes(&["covers"]).is_err());
    }

    #[tokio::test]
    async fn test_file_source_capture_missing_is_partial_failure() {
        let temp_dir = tempdir().unwrap();
        let source = FileSource::new(ContentGroup::Records, temp_dir.path().join("missing.db"));

        let err = source
            .capture(&temp_dir.path().join("out.db"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::PartialGroupFailure);
    }

    #[tokio::test]
    async fn test_directory_source_capture_copies_tree() {
        let temp_dir = tempdir().unwrap();
        let live = temp_dir.path().join("covers");
        std::fs::create_dir_all(live.join("a/b")).unwrap();
        std::fs::write(live.join("a/b/cover.jpg"), b"jpeg").unwrap();
        std::fs::write(live.join("top.png"), b"png").unwrap();

        let source = DirectorySource::new(ContentGroup::Assets, &live);
        let dest = temp_dir.path().join("snapshot");
        source.capture(&dest).await.unwrap();

        assert_eq!(std::fs::read(dest.join("a/b/cover.jpg")).unwrap(), b"jpeg");
        assert_eq!(std::fs::read(dest.join("top.png")).unwrap(), b"png");
    }

    #[tokio::test]
    async fn test_swap_in_keep_replaces_directory() {
        let temp_dir = tempdir().unwrap();
        let live = temp_dir.path().join("covers");
        std::fs::create_dir_all(&live).unwrap();
        std::fs::write(live.join("old.jpg"), b"old").unwrap();

        let staged = temp_dir.path().join("staged");
        std::fs::create_dir_all(&staged).unwrap();
        std::fs::write(staged.join("new.jpg"), b"new").unwrap();

        let aside = swap_in_keep(&staged, &live).await.unwrap().unwrap();

        assert!(!live.join("old.jpg").exists());
        assert_eq!(std::fs::read(live.join("new.jpg")).unwrap(), b"new");
        assert_eq!(std::fs::read(aside.join("old.jpg")).unwrap(), b"old");
        assert!(!staged.exists());
        // 在线目录和换下的旧目录，没有残留的 .restore-new
        assert_eq!(std::fs::read_dir(temp_dir.path()).unwrap().count(), 2);
    }

    #[tokio::test]
    async fn test_swap_in_keep_failure_keeps_live_content() {
        let temp_dir = tempdir().unwrap();
        let live = temp_dir.path().join("config.yaml");
        std::fs::write(&live, b"port: 8080").unwrap();

        let result = swap_in_keep(&temp_dir.path().join("does-not-exist"), &live).await;

        assert!(result.is_err());
        assert_eq!(std::fs::read(&live).unwrap(), b"port: 8080");
    }

    #[tokio::test]
    async fn test_swap_in_keep_then_revert() {
        let temp_dir = tempdir().unwrap();
        let live = temp_dir.path().join("library.db");
        std::fs::write(&live, b"before").unwrap();
        let staged = temp_dir.path().join("staged.db");
        std::fs::write(&staged, b"after").unwrap();

        let aside = swap_in_keep(&staged, &live).await.unwrap().unwrap();
        assert_eq!(std::fs::read(&live).unwrap(), b"after");
        assert_eq!(std::fs::read(&aside).unwrap(), b"before");

        revert_swap(Some(&aside), &live).await.unwrap();
        assert_eq!(std::fs::read(&live).unwrap(), b"before");
        assert!(!aside.exists());
    }
}
