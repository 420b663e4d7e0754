use crate::constants::{archive, backup, config, cron, remote_sync, sources};
use crate::content::{
    ContentGroup, ContentSource, DirectorySource, FileSource, parse_includes,
};
use crate::cron::{CronSchedule, parse_utc_offset};
use crate::{BackupError, Result};
use chrono::FixedOffset;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// 应用配置结构
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub remote_sync: RemoteSyncConfig,
}

/// 备份存储相关配置
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct BackupConfig {
    pub storage_dir: String,
    pub index_db: String,
    pub retention_count: usize,
    pub safety_retention_count: usize,
    pub compression_level: u32,
    pub default_includes: Vec<String>,
}

/// 在线内容位置
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SourcesConfig {
    pub records: String,
    pub assets: String,
    pub config: String,
}

/// 自动备份调度配置
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub cron_expression: String,
    pub utc_offset: String,
    pub max_consecutive_failures: u32,
}

/// 远程同步配置
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RemoteSyncConfig {
    pub enabled: bool,
    pub endpoint: String,
    pub bearer_token: Option<String>,
    pub timeout_secs: u64,
}

fn path_string(path: PathBuf) -> String {
    path.to_string_lossy().to_string()
}

/// 转义为 TOML 字符串字面量（含引号）
fn toml_string(value: &str) -> String {
    toml::Value::String(value.to_string()).to_string()
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            storage_dir: path_string(backup::get_default_storage_dir()),
            index_db: path_string(backup::get_default_index_db()),
            retention_count: backup::DEFAULT_RETENTION_COUNT,
            safety_retention_count: backup::DEFAULT_SAFETY_RETENTION_COUNT,
            compression_level: archive::DEFAULT_COMPRESSION_LEVEL,
            default_includes: ContentGroup::ALL
                .iter()
                .map(|g| g.as_str().to_string())
                .collect(),
        }
    }
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            records: path_string(sources::get_default_records_path()),
            assets: path_string(sources::get_default_assets_dir()),
            config: path_string(sources::get_default_config_path()),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cron_expression: cron::DEFAULT_BACKUP_CRON.to_string(),
            utc_offset: cron::DEFAULT_UTC_OFFSET.to_string(),
            max_consecutive_failures: cron::DEFAULT_MAX_FAILURES,
        }
    }
}

impl Default for RemoteSyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: String::new(),
            bearer_token: None,
            timeout_secs: remote_sync::DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl AppConfig {
    /// 智能查找并加载配置文件
    /// 按优先级查找：config.toml -> library-backup.toml -> .library-backup.toml
    pub fn find_and_load_config() -> Result<Self> {
        for config_file in &config::CONFIG_FILE_CANDIDATES {
            if Path::new(config_file).exists() {
                tracing::info!("找到配置文件: {}", config_file);
                return Self::load_from_file(config_file);
            }
        }

        // 如果没找到配置文件，创建默认配置
        tracing::warn!("未找到配置文件，创建默认配置: {}", config::CONFIG_FILE_NAME);
        let default_config = Self::default();
        default_config.save_to_file(config::CONFIG_FILE_NAME)?;
        Ok(default_config)
    }

    /// 从指定文件加载配置
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)?;
        let config: AppConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// 保存配置到文件
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(&path, self.to_toml_with_comments())?;
        Ok(())
    }

    /// 生成带注释的TOML配置
    fn to_toml_with_comments(&self) -> String {
        const TEMPLATE: &str = include_str!("../templates/config.toml.template");

        let default_includes = format!(
            "[{}]",
            self.backup
                .default_includes
                .iter()
                .map(|g| toml_string(g))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let bearer_token_line = match &self.remote_sync.bearer_token {
            Some(token) => format!("bearer_token = {}", toml_string(token)),
            None => "# bearer_token = \"\"".to_string(),
        };

        TEMPLATE
            .replace("{storage_dir}", &toml_string(&self.backup.storage_dir))
            .replace("{index_db}", &toml_string(&self.backup.index_db))
            .replace("{retention_count}", &self.backup.retention_count.to_string())
            .replace(
                "{safety_retention_count}",
                &self.backup.safety_retention_count.to_string(),
            )
            .replace(
                "{compression_level}",
                &self.backup.compression_level.to_string(),
            )
            .replace("{default_includes}", &default_includes)
            .replace("{records_path}", &toml_string(&self.sources.records))
            .replace("{assets_path}", &toml_string(&self.sources.assets))
            .replace("{config_path}", &toml_string(&self.sources.config))
            .replace("{scheduler_enabled}", &self.scheduler.enabled.to_string())
            .replace("{cron_expression}", &toml_string(&self.scheduler.cron_expression))
            .replace("{utc_offset}", &toml_string(&self.scheduler.utc_offset))
            .replace(
                "{max_consecutive_failures}",
                &self.scheduler.max_consecutive_failures.to_string(),
            )
            .replace("{remote_enabled}", &self.remote_sync.enabled.to_string())
            .replace("{endpoint}", &toml_string(&self.remote_sync.endpoint))
            .replace("{bearer_token_line}", &bearer_token_line)
            .replace("{timeout_secs}", &self.remote_sync.timeout_secs.to_string())
    }

    /// 校验配置取值范围
    pub fn validate(&self) -> Result<()> {
        if self.backup.retention_count == 0 {
            return Err(BackupError::config("backup.retention_count 必须大于等于 1"));
        }
        if self.backup.safety_retention_count == 0 {
            return Err(BackupError::config(
                "backup.safety_retention_count 必须大于等于 1",
            ));
        }
        if self.backup.compression_level > 9 {
            return Err(BackupError::config("backup.compression_level 取值范围为 0-9"));
        }
        if self.default_includes()?.is_empty() {
            return Err(BackupError::config("backup.default_includes 不能为空"));
        }

        CronSchedule::parse(&self.scheduler.cron_expression)?;
        self.utc_offset()?;

        if self.remote_sync.enabled && self.remote_sync.endpoint.trim().is_empty() {
            return Err(BackupError::config(
                "启用远程同步时 remote_sync.endpoint 不能为空",
            ));
        }
        Ok(())
    }

    /// 获取备份目录路径
    pub fn get_backup_dir(&self) -> PathBuf {
        PathBuf::from(&self.backup.storage_dir)
    }

    /// 获取索引数据库路径
    pub fn get_index_db_path(&self) -> PathBuf {
        PathBuf::from(&self.backup.index_db)
    }

    /// 默认备份的内容组
    pub fn default_includes(&self) -> Result<BTreeSet<ContentGroup>> {
        parse_includes(&self.backup.default_includes)
            .map_err(|e| BackupError::config(format!("backup.default_includes: {e}")))
    }

    /// cron 字段使用的时区偏移
    pub fn utc_offset(&self) -> Result<FixedOffset> {
        parse_utc_offset(&self.scheduler.utc_offset)
    }

    /// 按配置构造三个内容组的在线来源
    pub fn content_sources(&self) -> Vec<Arc<dyn ContentSource>> {
        vec![
            Arc::new(FileSource::new(ContentGroup::Records, &self.sources.records)),
            Arc::new(DirectorySource::new(ContentGroup::Assets, &self.sources.assets)),
            Arc::new(FileSource::new(ContentGroup::Config, &self.sources.config)),
        ]
    }
}
