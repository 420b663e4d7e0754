use crate::content::{ContentGroup, join_includes, parse_includes};
use crate::{BackupError, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;

/// 备份记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub description: Option<String>,
    pub includes: BTreeSet<ContentGroup>,
    pub file_size: u64,
    pub checksum: String,
    pub is_safety_snapshot: bool,
    pub location: PathBuf,
}

/// 索引表中的原始行
#[derive(Debug, Clone)]
pub(crate) struct BackupRow {
    pub id: String,
    pub created_at: String,
    pub description: Option<String>,
    pub includes: String,
    pub file_size: i64,
    pub checksum: String,
    pub is_safety_snapshot: bool,
    pub file_path: String,
}

/// 统一的时间戳存储格式，字典序与时间顺序一致
pub(crate) fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| BackupError::custom(format!("无效的时间戳 {raw}: {e}")))
}

impl From<&BackupRecord> for BackupRow {
    fn from(record: &BackupRecord) -> Self {
        Self {
            id: record.id.clone(),
            created_at: format_timestamp(&record.created_at),
            description: record.description.clone(),
            includes: join_includes(&record.includes),
            file_size: record.file_size as i64,
            checksum: record.checksum.clone(),
            is_safety_snapshot: record.is_safety_snapshot,
            file_path: record.location.to_string_lossy().to_string(),
        }
    }
}

impl TryFrom<BackupRow> for BackupRecord {
    type Error = BackupError;

    fn try_from(row: BackupRow) -> Result<Self> {
        let includes: Vec<&str> = row
            .includes
            .split(',')
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            created_at: parse_timestamp(&row.created_at)?,
            includes: parse_includes(&includes)?,
            file_size: row.file_size.max(0) as u64,
            location: PathBuf::from(row.file_path),
            id: row.id,
            description: row.description,
            checksum: row.checksum,
            is_safety_snapshot: row.is_safety_snapshot,
        })
    }
}
