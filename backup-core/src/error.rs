use crate::content::ContentGroup;
use crate::integrity::IntegrityCheck;
use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BackupError>;

/// 机器可读的错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Corrupt,
    InFlight,
    PartialGroupFailure,
    ScheduleInvalid,
    UpstreamUnavailable,
    InvalidRequest,
    Config,
    Io,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Corrupt => "corrupt",
            ErrorKind::InFlight => "in_flight",
            ErrorKind::PartialGroupFailure => "partial_group_failure",
            ErrorKind::ScheduleInvalid => "schedule_invalid",
            ErrorKind::UpstreamUnavailable => "upstream_unavailable",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::Config => "config",
            ErrorKind::Io => "io",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("备份不存在: {0}")]
    NotFound(String),

    #[error("备份已损坏 ({check}): {reason}")]
    Corrupt {
        check: IntegrityCheck,
        reason: String,
    },

    #[error("已有备份或恢复任务正在执行，请稍后重试")]
    InFlight,

    #[error("内容组 {group} 处理失败: {reason}")]
    PartialGroupFailure { group: ContentGroup, reason: String },

    #[error("备份中不包含内容组: {0}")]
    MissingGroup(ContentGroup),

    #[error("无效的 cron 表达式: {0}")]
    ScheduleInvalid(String),

    #[error("远程存储不可用: {0}")]
    UpstreamUnavailable(String),

    #[error("恢复失败: {source}{}", snapshot_hint(.safety_snapshot_id))]
    Restore {
        safety_snapshot_id: Option<String>,
        restored: Vec<ContentGroup>,
        rolled_back: Vec<ContentGroup>,
        #[source]
        source: Box<BackupError>,
    },

    #[error("无效请求: {0}")]
    InvalidRequest(String),

    #[error("配置错误: {0}")]
    Config(String),

    #[error("配置解析错误: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("DuckDB数据库错误: {0}")]
    DuckDb(String),

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("序列化错误: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("任务执行错误: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("HTTP 请求错误: {0}")]
    Http(#[from] reqwest::Error),

    #[error("目录遍历错误: {0}")]
    WalkDir(#[from] walkdir::Error),

    #[error("路径错误: {0}")]
    StripPrefix(#[from] std::path::StripPrefixError),

    #[error("自定义错误: {0}")]
    Custom(String),
}

fn snapshot_hint(snapshot_id: &Option<String>) -> String {
    match snapshot_id {
        Some(id) => format!("（可使用安全快照 {id} 手动恢复）"),
        None => String::new(),
    }
}

// 为DuckDB错误实现From trait
impl From<duckdb::Error> for BackupError {
    fn from(err: duckdb::Error) -> Self {
        BackupError::DuckDb(err.to_string())
    }
}

impl BackupError {
    pub fn custom(msg: impl Into<String>) -> Self {
        Self::Custom(msg.into())
    }

    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound(id.into())
    }

    pub fn corrupt(check: IntegrityCheck, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            check,
            reason: reason.into(),
        }
    }

    pub fn partial(group: ContentGroup, reason: impl Into<String>) -> Self {
        Self::PartialGroupFailure {
            group,
            reason: reason.into(),
        }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// 错误类别；恢复失败取内部原因的类别
    pub fn kind(&self) -> ErrorKind {
        match self {
            BackupError::NotFound(_) => ErrorKind::NotFound,
            BackupError::Corrupt { .. } => ErrorKind::Corrupt,
            BackupError::InFlight => ErrorKind::InFlight,
            BackupError::PartialGroupFailure { .. } | BackupError::MissingGroup(_) => {
                ErrorKind::PartialGroupFailure
            }
            BackupError::ScheduleInvalid(_) => ErrorKind::ScheduleInvalid,
            BackupError::UpstreamUnavailable(_) | BackupError::Http(_) => {
                ErrorKind::UpstreamUnavailable
            }
            BackupError::Restore { source, .. } => source.kind(),
            BackupError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            BackupError::Config(_) | BackupError::ConfigParse(_) => ErrorKind::Config,
            BackupError::Io(_) | BackupError::WalkDir(_) | BackupError::StripPrefix(_) => {
                ErrorKind::Io
            }
            BackupError::DuckDb(_)
            | BackupError::Serde(_)
            | BackupError::Join(_)
            | BackupError::Custom(_) => ErrorKind::Internal,
        }
    }

    /// 调用方退避后可以重试
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::InFlight
    }

    /// 恢复失败时附带的安全快照 ID
    pub fn safety_snapshot_id(&self) -> Option<&str> {
        match self {
            BackupError::Restore {
                safety_snapshot_id, ..
            } => safety_snapshot_id.as_deref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restore_error_delegates_kind_and_carries_snapshot() {
        let err = BackupError::Restore {
            safety_snapshot_id: Some("20260101-020000-000".to_string()),
            restored: vec![],
            rolled_back: vec![ContentGroup::Records],
            source: Box::new(BackupError::partial(ContentGroup::Config, "rename failed")),
        };

        assert_eq!(err.kind(), ErrorKind::PartialGroupFailure);
        assert_eq!(err.safety_snapshot_id(), Some("20260101-020000-000"));
        assert!(err.to_string().contains("20260101-020000-000"));
    }

    #[test]
    fn test_only_in_flight_is_retryable() {
        assert!(BackupError::InFlight.is_retryable());
        assert!(!BackupError::not_found("x").is_retryable());
        assert_eq!(
            BackupError::corrupt(IntegrityCheck::DigestMismatch, "x").kind(),
            ErrorKind::Corrupt
        );
    }
}
