//! 完整性校验：整文件摘要与清单自描述

use crate::archive::ArchiveCodec;
use crate::constants::archive::DIGEST_CHUNK_SIZE;
use crate::db::BackupRecord;
use crate::{BackupError, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

/// 校验失败的具体检查项
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityCheck {
    /// 归档文件不存在
    MissingFile,
    /// 整文件摘要不一致
    DigestMismatch,
    /// 清单缺失或无法解析
    ManifestUnreadable,
    /// 清单与索引记录不一致
    ManifestMismatch,
    /// 声明的内容组与实际内容不一致
    GroupMismatch,
    /// 归档容器本身无法解析
    Container,
}

impl IntegrityCheck {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntegrityCheck::MissingFile => "missing_file",
            IntegrityCheck::DigestMismatch => "digest_mismatch",
            IntegrityCheck::ManifestUnreadable => "manifest_unreadable",
            IntegrityCheck::ManifestMismatch => "manifest_mismatch",
            IntegrityCheck::GroupMismatch => "group_mismatch",
            IntegrityCheck::Container => "container",
        }
    }
}

impl std::fmt::Display for IntegrityCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 校验结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationReport {
    pub backup_id: String,
    pub valid: bool,
    pub check: Option<IntegrityCheck>,
    pub reason: Option<String>,
}

impl ValidationReport {
    fn ok(backup_id: &str) -> Self {
        Self {
            backup_id: backup_id.to_string(),
            valid: true,
            check: None,
            reason: None,
        }
    }

    fn failed(backup_id: &str, check: IntegrityCheck, reason: impl Into<String>) -> Self {
        Self {
            backup_id: backup_id.to_string(),
            valid: false,
            check: Some(check),
            reason: Some(reason.into()),
        }
    }

    /// 转换为错误；校验通过时返回 `Ok(())`
    pub fn into_result(self) -> Result<()> {
        match (self.valid, self.check) {
            (true, _) => Ok(()),
            (false, check) => Err(BackupError::corrupt(
                check.unwrap_or(IntegrityCheck::Container),
                self.reason.unwrap_or_default(),
            )),
        }
    }
}

/// 计算文件的 SHA-256 摘要（十六进制）
pub async fn compute_digest(file_path: &Path) -> Result<String> {
    let mut file = File::open(file_path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; DIGEST_CHUNK_SIZE];

    loop {
        let bytes_read = file.read(&mut buffer).await?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    let hash = hasher.finalize();
    Ok(format!("{hash:x}"))
}

/// 完整性校验器
#[derive(Debug, Clone)]
pub struct IntegrityVerifier {
    codec: ArchiveCodec,
}

impl IntegrityVerifier {
    pub fn new(codec: ArchiveCodec) -> Self {
        Self { codec }
    }

    /// 依次检查：文件存在、摘要、清单可读、清单与记录一致、内容组一致
    pub async fn verify(&self, record: &BackupRecord) -> Result<ValidationReport> {
        let id = record.id.as_str();
        let path = record.location.as_path();

        if !tokio::fs::try_exists(path).await? {
            warn!(backup_id = %id, path = %path.display(), "备份文件不存在");
            return Ok(ValidationReport::failed(
                id,
                IntegrityCheck::MissingFile,
                format!("备份文件不存在: {}", path.display()),
            ));
        }

        let actual = compute_digest(path).await?;
        if actual != record.checksum {
            warn!(backup_id = %id, expected = %record.checksum, actual = %actual, "备份摘要不一致");
            return Ok(ValidationReport::failed(
                id,
                IntegrityCheck::DigestMismatch,
                format!("摘要不一致: 期望 {}, 实际 {actual}", record.checksum),
            ));
        }

        let manifest = match self.codec.read_manifest(path).await {
            Ok(manifest) => manifest,
            Err(BackupError::Corrupt { check, reason }) => {
                return Ok(ValidationReport::failed(id, check, reason));
            }
            Err(e) => return Err(e),
        };

        if manifest.id != record.id
            || manifest.includes != record.includes
            || manifest.is_safety_snapshot != record.is_safety_snapshot
        {
            return Ok(ValidationReport::failed(
                id,
                IntegrityCheck::ManifestMismatch,
                format!(
                    "清单与索引记录不一致: 清单 id={} 内容组={:?}",
                    manifest.id, manifest.includes
                ),
            ));
        }

        let present = match self.codec.list_groups(path).await {
            Ok(groups) => groups,
            Err(BackupError::Corrupt { check, reason }) => {
                return Ok(ValidationReport::failed(id, check, reason));
            }
            Err(e) => return Err(e),
        };
        let declared: BTreeSet<String> = manifest
            .includes
            .iter()
            .map(|g| g.as_str().to_string())
            .collect();

        if present != declared {
            return Ok(ValidationReport::failed(
                id,
                IntegrityCheck::GroupMismatch,
                format!("声明的内容组 {declared:?} 与实际内容 {present:?} 不一致"),
            ));
        }

        debug!(backup_id = %id, "备份校验通过");
        Ok(ValidationReport::ok(id))
    }
}
