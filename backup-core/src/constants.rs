/// 归档文件布局相关常量
pub mod archive {
    /// 清单文件在归档内的固定路径
    pub const MANIFEST_PATH: &str = "manifest.json";

    /// 清单格式版本
    pub const FORMAT_VERSION: u32 = 1;

    /// 归档文件扩展名
    pub const ARCHIVE_EXTENSION: &str = ".tar.gz";

    /// 写入中的暂存文件后缀（提交前不可见）
    pub const PARTIAL_SUFFIX: &str = ".partial";

    /// 默认压缩级别 (0-9)
    pub const DEFAULT_COMPRESSION_LEVEL: u32 = 6;

    /// 摘要计算的读取块大小
    pub const DIGEST_CHUNK_SIZE: usize = 64 * 1024;
}

/// 备份存储相关常量
pub mod backup {
    use std::path::{Path, PathBuf};

    /// 备份目录名
    pub const BACKUP_DIR_NAME: &str = "backups";

    /// 索引数据库文件名
    pub const INDEX_DB_FILE_NAME: &str = "index.duckdb";

    /// 恢复暂存目录名（位于备份目录下）
    pub const STAGING_DIR_NAME: &str = ".staging";

    /// 默认保留的普通备份数量
    pub const DEFAULT_RETENTION_COUNT: usize = 10;

    /// 默认保留的安全快照数量
    pub const DEFAULT_SAFETY_RETENTION_COUNT: usize = 5;

    /// 备份 ID 的时间格式（UTC）
    pub const ID_TIME_FORMAT: &str = "%Y%m%d-%H%M%S";

    /// 获取默认备份存储目录
    pub fn get_default_storage_dir() -> PathBuf {
        Path::new(".").join(BACKUP_DIR_NAME)
    }

    /// 获取默认索引数据库路径
    pub fn get_default_index_db() -> PathBuf {
        get_default_storage_dir().join(INDEX_DB_FILE_NAME)
    }
}

/// 在线内容位置的默认值
pub mod sources {
    use std::path::{Path, PathBuf};

    /// 数据目录名
    pub const DATA_DIR_NAME: &str = "data";

    /// 默认记录库文件
    pub fn get_default_records_path() -> PathBuf {
        Path::new(".").join(DATA_DIR_NAME).join("library.db")
    }

    /// 默认资源目录（封面等）
    pub fn get_default_assets_dir() -> PathBuf {
        Path::new(".").join("covers")
    }

    /// 默认应用配置文件
    pub fn get_default_config_path() -> PathBuf {
        Path::new(".").join("config").join("config.yaml")
    }
}

/// Cron任务相关常量
pub mod cron {
    /// 默认自动备份cron表达式（每天凌晨2点）
    pub const DEFAULT_BACKUP_CRON: &str = "0 2 * * *";

    /// Cron表达式字段数量
    pub const CRON_FIELDS_COUNT: usize = 5;

    /// 默认时区偏移（cron 字段按该偏移解释）
    pub const DEFAULT_UTC_OFFSET: &str = "+08:00";

    /// 默认连续失败告警阈值
    pub const DEFAULT_MAX_FAILURES: u32 = 3;
}

/// 持久化在 app_config 表中的调度器配置键
pub mod scheduler_keys {
    pub const PREFIX: &str = "auto_backup.";
    pub const ENABLED: &str = "auto_backup.enabled";
    pub const CRON_EXPRESSION: &str = "auto_backup.cron_expression";
    pub const LAST_RUN_AT: &str = "auto_backup.last_backup_at";
    pub const LAST_STATUS: &str = "auto_backup.last_status";
    pub const LAST_ERROR: &str = "auto_backup.last_error";
    pub const CONSECUTIVE_FAILURES: &str = "auto_backup.consecutive_failures";
}

/// 远程同步相关常量
pub mod remote_sync {
    /// 默认上传超时时间（秒）
    pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

    /// 校验和请求头
    pub const CHECKSUM_HEADER: &str = "X-Backup-Checksum";

    /// User-Agent头
    pub const USER_AGENT: &str = "library-backup/0.1";
}

/// 应用配置相关常量
pub mod config {
    /// 配置文件候选名，按优先级排列
    pub const CONFIG_FILE_CANDIDATES: [&str; 3] =
        ["config.toml", "library-backup.toml", ".library-backup.toml"];

    /// 默认配置文件名
    pub const CONFIG_FILE_NAME: &str = "config.toml";
}
