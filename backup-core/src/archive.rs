//! 归档编解码
//!
//! 一个归档是 gzip 压缩的 tar 文件：
//!
//! ```text
//! <id>.tar.gz
//! ├── manifest.json   # 备份元数据
//! ├── records/        # 记录库快照
//! ├── assets/         # 资源目录树
//! └── config/         # 配置文件
//! ```
//!
//! 写入时先写 `<id>.tar.gz.partial`，所有内容组都成功写完后才改名为最终文件名。

use crate::constants::archive::{FORMAT_VERSION, MANIFEST_PATH, PARTIAL_SUFFIX};
use crate::content::{ContentGroup, SourceLayout};
use crate::integrity::IntegrityCheck;
use crate::{BackupError, Result};
use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use tar::{Archive, Builder, Header};
use tracing::warn;
use walkdir::WalkDir;

/// 归档内的清单
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: u32,
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub description: Option<String>,
    pub includes: BTreeSet<ContentGroup>,
    pub is_safety_snapshot: bool,
    pub groups: BTreeMap<ContentGroup, GroupEntry>,
}

/// 清单中每个内容组的描述
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupEntry {
    pub layout: GroupLayout,
    /// 单文件内容组在归档中的文件名
    pub file_name: Option<String>,
    /// 写入的文件数量
    pub entries: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupLayout {
    File,
    Directory,
}

impl From<SourceLayout> for GroupLayout {
    fn from(layout: SourceLayout) -> Self {
        match layout {
            SourceLayout::File => GroupLayout::File,
            SourceLayout::Directory => GroupLayout::Directory,
        }
    }
}

/// 已经从在线位置捕获到本地的内容组
#[derive(Debug, Clone)]
pub struct CapturedGroup {
    pub group: ContentGroup,
    pub layout: SourceLayout,
    pub path: PathBuf,
}

/// 写入完成的归档
#[derive(Debug, Clone)]
pub struct ArchiveHandle {
    pub path: PathBuf,
    pub file_size: u64,
}

/// 解压到暂存区的内容组
#[derive(Debug, Clone)]
pub struct ExtractedGroup {
    pub group: ContentGroup,
    pub layout: GroupLayout,
    /// 单文件组指向文件本身，目录组指向目录
    pub path: PathBuf,
}

/// 清单的可变部分，由调用方提供
#[derive(Debug, Clone)]
pub struct ManifestExtras {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub description: Option<String>,
    pub is_safety_snapshot: bool,
}

/// 归档编解码器
#[derive(Debug, Clone)]
pub struct ArchiveCodec {
    compression_level: u32,
}

impl ArchiveCodec {
    pub fn new(compression_level: u32) -> Self {
        Self {
            compression_level: compression_level.min(9),
        }
    }

    /// 写入归档；失败时删除暂存文件，最终文件名下不会出现不完整的归档
    pub async fn write(
        &self,
        final_path: &Path,
        groups: Vec<CapturedGroup>,
        extras: ManifestExtras,
    ) -> Result<ArchiveHandle> {
        if groups.is_empty() {
            return Err(BackupError::invalid("至少需要一个内容组"));
        }

        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let final_path = final_path.to_path_buf();
        let partial_path = partial_path_for(&final_path);
        let level = self.compression_level;

        // 在后台线程中执行压缩操作，避免阻塞异步运行时
        let written = {
            let partial_path = partial_path.clone();
            tokio::task::spawn_blocking(move || {
                write_archive_blocking(&partial_path, &groups, extras, level)
            })
            .await
        };

        let written = match written {
            Ok(inner) => inner,
            Err(join_err) => Err(join_err.into()),
        };
        if let Err(e) = written {
            discard_partial(&partial_path).await;
            return Err(e);
        }

        if let Err(e) = tokio::fs::rename(&partial_path, &final_path).await {
            discard_partial(&partial_path).await;
            return Err(e.into());
        }

        let file_size = tokio::fs::metadata(&final_path).await?.len();
        Ok(ArchiveHandle {
            path: final_path,
            file_size,
        })
    }

    /// 只解压需要的内容组到 `dest`
    pub async fn read(
        &self,
        archive_path: &Path,
        wanted: &BTreeSet<ContentGroup>,
        dest: &Path,
    ) -> Result<Vec<ExtractedGroup>> {
        let archive_path = archive_path.to_path_buf();
        let wanted = wanted.clone();
        let dest = dest.to_path_buf();

        tokio::task::spawn_blocking(move || read_archive_blocking(&archive_path, &wanted, &dest))
            .await?
    }

    /// 读取清单
    pub async fn read_manifest(&self, archive_path: &Path) -> Result<Manifest> {
        let archive_path = archive_path.to_path_buf();
        tokio::task::spawn_blocking(move || read_manifest_blocking(&archive_path)).await?
    }

    /// 列出归档中实际存在的顶层内容组名字
    pub async fn list_groups(&self, archive_path: &Path) -> Result<BTreeSet<String>> {
        let archive_path = archive_path.to_path_buf();
        tokio::task::spawn_blocking(move || list_groups_blocking(&archive_path)).await?
    }
}

/// 暂存文件路径：`<final>.partial`
pub fn partial_path_for(final_path: &Path) -> PathBuf {
    let mut name = final_path.as_os_str().to_os_string();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

fn write_archive_blocking(
    partial_path: &Path,
    groups: &[CapturedGroup],
    extras: ManifestExtras,
    level: u32,
) -> Result<()> {
    let file = File::create(partial_path)?;
    let encoder = GzEncoder::new(file, Compression::new(level));
    let mut builder = Builder::new(encoder);

    let mut manifest = Manifest {
        format_version: FORMAT_VERSION,
        id: extras.id,
        created_at: extras.created_at,
        description: extras.description,
        includes: groups.iter().map(|g| g.group).collect(),
        is_safety_snapshot: extras.is_safety_snapshot,
        groups: BTreeMap::new(),
    };

    // 先写内容组，清单最后写入以便记录条目数量
    for captured in groups {
        let entry = append_group(&mut builder, captured)?;
        manifest.groups.insert(captured.group, entry);
    }

    let json = serde_json::to_vec_pretty(&manifest)?;
    let mut header = Header::new_gnu();
    header.set_size(json.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(manifest.created_at.timestamp().max(0) as u64);
    header.set_cksum();
    builder.append_data(&mut header, MANIFEST_PATH, json.as_slice())?;

    let encoder = builder.into_inner()?;
    let file = encoder.finish()?;
    file.sync_all()?;
    Ok(())
}

fn append_group(
    builder: &mut Builder<GzEncoder<File>>,
    captured: &CapturedGroup,
) -> Result<GroupEntry> {
    let group = captured.group;
    let prefix = group.as_str();

    match captured.layout {
        SourceLayout::File => {
            let file_name = captured
                .path
                .file_name()
                .ok_or_else(|| BackupError::partial(group, "无法获取文件名"))?
                .to_string_lossy()
                .to_string();
            builder
                .append_path_with_name(&captured.path, format!("{prefix}/{file_name}"))
                .map_err(|e| BackupError::partial(group, format!("添加文件到归档失败: {e}")))?;

            Ok(GroupEntry {
                layout: GroupLayout::File,
                file_name: Some(file_name),
                entries: 1,
            })
        }
        SourceLayout::Directory => {
            // 目录本身也写入，空目录同样会出现在归档中
            builder
                .append_dir(prefix, &captured.path)
                .map_err(|e| BackupError::partial(group, format!("添加目录到归档失败: {e}")))?;

            let mut entries = 0u64;
            for entry in WalkDir::new(&captured.path).follow_links(false) {
                let entry = entry?;
                let relative = entry.path().strip_prefix(&captured.path)?;
                if relative.as_os_str().is_empty() {
                    continue;
                }

                // tar归档内部使用Unix风格路径（/）
                let relative = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                let archive_name = format!("{prefix}/{relative}");

                if entry.file_type().is_dir() {
                    builder.append_dir(&archive_name, entry.path()).map_err(|e| {
                        BackupError::partial(group, format!("添加目录到归档失败: {e}"))
                    })?;
                } else if entry.file_type().is_file() {
                    builder
                        .append_path_with_name(entry.path(), &archive_name)
                        .map_err(|e| {
                            BackupError::partial(group, format!("添加文件到归档失败: {e}"))
                        })?;
                    entries += 1;
                }
            }

            Ok(GroupEntry {
                layout: GroupLayout::Directory,
                file_name: None,
                entries,
            })
        }
    }
}

async fn discard_partial(partial_path: &Path) {
    match tokio::fs::remove_file(partial_path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %partial_path.display(), error = %e, "删除暂存归档失败"),
    }
}

fn open_archive(archive_path: &Path) -> Result<Archive<GzDecoder<File>>> {
    let file = File::open(archive_path)?;
    Ok(Archive::new(GzDecoder::new(file)))
}

fn container_error(e: impl std::fmt::Display) -> BackupError {
    BackupError::corrupt(IntegrityCheck::Container, format!("归档结构无法解析: {e}"))
}

/// 校验归档成员路径：不允许绝对路径和 `..`
fn checked_member_path(path: &Path) -> Result<PathBuf> {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            _ => {
                return Err(BackupError::corrupt(
                    IntegrityCheck::Container,
                    format!("归档包含非法路径: {}", path.display()),
                ));
            }
        }
    }
    Ok(clean)
}

fn top_level_name(path: &Path) -> Option<String> {
    path.components().next().and_then(|c| match c {
        Component::Normal(part) => Some(part.to_string_lossy().to_string()),
        _ => None,
    })
}

fn read_manifest_blocking(archive_path: &Path) -> Result<Manifest> {
    let mut archive = open_archive(archive_path)?;

    for entry in archive.entries().map_err(container_error)? {
        let mut entry = entry.map_err(container_error)?;
        let path = entry.path().map_err(container_error)?.into_owned();
        if checked_member_path(&path)? == Path::new(MANIFEST_PATH) {
            let mut content = String::new();
            entry.read_to_string(&mut content).map_err(container_error)?;
            return serde_json::from_str(&content).map_err(|e| {
                BackupError::corrupt(
                    IntegrityCheck::ManifestUnreadable,
                    format!("清单无法解析: {e}"),
                )
            });
        }
    }

    Err(BackupError::corrupt(
        IntegrityCheck::ManifestUnreadable,
        "归档中缺少清单",
    ))
}

fn list_groups_blocking(archive_path: &Path) -> Result<BTreeSet<String>> {
    let mut archive = open_archive(archive_path)?;
    let mut names = BTreeSet::new();

    for entry in archive.entries().map_err(container_error)? {
        let entry = entry.map_err(container_error)?;
        let path = checked_member_path(&entry.path().map_err(container_error)?)?;
        if path == Path::new(MANIFEST_PATH) {
            continue;
        }
        if let Some(name) = top_level_name(&path) {
            names.insert(name);
        }
    }

    Ok(names)
}

fn read_archive_blocking(
    archive_path: &Path,
    wanted: &BTreeSet<ContentGroup>,
    dest: &Path,
) -> Result<Vec<ExtractedGroup>> {
    let manifest = read_manifest_blocking(archive_path)?;

    for group in wanted {
        if !manifest.includes.contains(group) {
            return Err(BackupError::MissingGroup(*group));
        }
    }

    let wanted_names: BTreeSet<&str> = wanted.iter().map(ContentGroup::as_str).collect();
    std::fs::create_dir_all(dest)?;

    let mut archive = open_archive(archive_path)?;
    for entry in archive.entries().map_err(container_error)? {
        let mut entry = entry.map_err(container_error)?;
        let path = checked_member_path(&entry.path().map_err(container_error)?)?;

        let Some(top) = top_level_name(&path) else {
            continue;
        };
        if !wanted_names.contains(top.as_str()) {
            continue;
        }

        // 写入时从不打包链接
        let entry_type = entry.header().entry_type();
        if entry_type.is_symlink() || entry_type.is_hard_link() {
            return Err(BackupError::corrupt(
                IntegrityCheck::Container,
                format!("归档包含链接成员: {}", path.display()),
            ));
        }
        if !entry.unpack_in(dest).map_err(container_error)? {
            return Err(BackupError::corrupt(
                IntegrityCheck::Container,
                format!("归档成员超出解压目录: {}", path.display()),
            ));
        }
    }

    let mut extracted = Vec::with_capacity(wanted.len());
    for group in wanted {
        let entry = manifest.groups.get(group).ok_or_else(|| {
            BackupError::corrupt(
                IntegrityCheck::ManifestMismatch,
                format!("清单缺少内容组 {group} 的描述"),
            )
        })?;

        let group_dir = dest.join(group.as_str());
        let path = match (entry.layout, &entry.file_name) {
            (GroupLayout::File, Some(name)) => group_dir.join(name),
            (GroupLayout::File, None) => {
                return Err(BackupError::corrupt(
                    IntegrityCheck::ManifestMismatch,
                    format!("清单缺少内容组 {group} 的文件名"),
                ));
            }
            (GroupLayout::Directory, _) => group_dir,
        };

        if !path.exists() {
            return Err(BackupError::corrupt(
                IntegrityCheck::GroupMismatch,
                format!("归档中缺少内容组 {group} 的数据"),
            ));
        }

        extracted.push(ExtractedGroup {
            group: *group,
            layout: entry.layout,
            path,
        });
    }

    Ok(extracted)
}
