use crate::config::SchedulerConfig;
use crate::constants::scheduler_keys;
use crate::db::{DuckDbManager, format_timestamp, parse_timestamp};
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 上次自动备份的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LastStatus {
    NeverRun,
    Success,
    Failure,
}

impl LastStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LastStatus::NeverRun => "never_run",
            LastStatus::Success => "success",
            LastStatus::Failure => "failure",
        }
    }

    fn parse(raw: &str) -> Self {
        match raw {
            "success" => LastStatus::Success,
            "failure" => LastStatus::Failure,
            _ => LastStatus::NeverRun,
        }
    }
}

impl std::fmt::Display for LastStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 持久化的自动备份状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoBackupConfig {
    pub enabled: bool,
    pub cron_expression: String,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_status: LastStatus,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

/// 配置管理器：自动备份状态保存在索引库的 app_config 表中
#[derive(Debug, Clone)]
pub struct ConfigManager {
    db: DuckDbManager,
}

impl ConfigManager {
    pub fn new(db: DuckDbManager) -> Self {
        Self { db }
    }

    /// 获取自动备份配置；数据库中没有的项使用配置文件中的默认值
    pub async fn get_auto_backup_config(
        &self,
        defaults: &SchedulerConfig,
    ) -> Result<AutoBackupConfig> {
        let enabled = self
            .db
            .get_config(scheduler_keys::ENABLED)
            .await?
            .and_then(|s| s.parse::<bool>().ok())
            .unwrap_or(defaults.enabled);

        let cron_expression = self
            .db
            .get_config(scheduler_keys::CRON_EXPRESSION)
            .await?
            .unwrap_or_else(|| defaults.cron_expression.clone());

        let last_run_at = self
            .db
            .get_config(scheduler_keys::LAST_RUN_AT)
            .await?
            .and_then(|s| parse_timestamp(&s).ok());

        let last_status = self
            .db
            .get_config(scheduler_keys::LAST_STATUS)
            .await?
            .map(|s| LastStatus::parse(&s))
            .unwrap_or(LastStatus::NeverRun);

        let last_error = self
            .db
            .get_config(scheduler_keys::LAST_ERROR)
            .await?
            .filter(|s| !s.is_empty());

        let consecutive_failures = self
            .db
            .get_config(scheduler_keys::CONSECUTIVE_FAILURES)
            .await?
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(0);

        Ok(AutoBackupConfig {
            enabled,
            cron_expression,
            last_run_at,
            last_status,
            last_error,
            consecutive_failures,
        })
    }

    /// 更新自动备份启用状态
    pub async fn set_auto_backup_enabled(&self, enabled: bool) -> Result<()> {
        self.db
            .set_config(scheduler_keys::ENABLED, &enabled.to_string())
            .await?;
        tracing::info!("自动备份启用状态已更新: {}", enabled);
        Ok(())
    }

    /// 更新自动备份cron表达式
    pub async fn set_auto_backup_cron(&self, cron_expression: &str) -> Result<()> {
        self.db
            .set_config(scheduler_keys::CRON_EXPRESSION, cron_expression)
            .await?;
        tracing::info!("自动备份cron表达式已更新: {}", cron_expression);
        Ok(())
    }

    /// 记录一次执行结果，返回更新后的连续失败次数
    pub async fn record_run(
        &self,
        run_at: DateTime<Utc>,
        error: Option<&str>,
    ) -> Result<u32> {
        self.db
            .set_config(scheduler_keys::LAST_RUN_AT, &format_timestamp(&run_at))
            .await?;

        let failures = match error {
            None => {
                self.db
                    .set_config(scheduler_keys::LAST_STATUS, LastStatus::Success.as_str())
                    .await?;
                self.db.set_config(scheduler_keys::LAST_ERROR, "").await?;
                0
            }
            Some(message) => {
                let current_failures = self
                    .db
                    .get_config(scheduler_keys::CONSECUTIVE_FAILURES)
                    .await?
                    .and_then(|s| s.parse::<u32>().ok())
                    .unwrap_or(0);
                self.db
                    .set_config(scheduler_keys::LAST_STATUS, LastStatus::Failure.as_str())
                    .await?;
                self.db
                    .set_config(scheduler_keys::LAST_ERROR, message)
                    .await?;
                current_failures + 1
            }
        };

        self.db
            .set_config(scheduler_keys::CONSECUTIVE_FAILURES, &failures.to_string())
            .await?;
        Ok(failures)
    }

    /// 获取所有自动备份相关配置
    pub async fn get_all_auto_backup_configs(&self) -> Result<Vec<(String, String)>> {
        self.db.list_configs(scheduler_keys::PREFIX).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_defaults_then_persisted_values() {
        let manager = ConfigManager::new(DuckDbManager::new_memory().await.unwrap());
        let defaults = SchedulerConfig::default();

        let initial = manager.get_auto_backup_config(&defaults).await.unwrap();
        assert_eq!(initial.enabled, defaults.enabled);
        assert_eq!(initial.last_status, LastStatus::NeverRun);
        assert!(initial.last_run_at.is_none());

        manager.set_auto_backup_enabled(true).await.unwrap();
        manager.set_auto_backup_cron("*/5 * * * *").await.unwrap();
        let stored = manager.get_auto_backup_config(&defaults).await.unwrap();
        assert!(stored.enabled);
        assert_eq!(stored.cron_expression, "*/5 * * * *");
    }

    #[tokio::test]
    async fn test_failures_accumulate_and_reset() {
        let manager = ConfigManager::new(DuckDbManager::new_memory().await.unwrap());
        let now = Utc::now();

        assert_eq!(manager.record_run(now, Some("disk full")).await.unwrap(), 1);
        assert_eq!(manager.record_run(now, Some("disk full")).await.unwrap(), 2);

        let state = manager
            .get_auto_backup_config(&SchedulerConfig::default())
            .await
            .unwrap();
        assert_eq!(state.last_status, LastStatus::Failure);
        assert_eq!(state.last_error.as_deref(), Some("disk full"));
        assert_eq!(state.consecutive_failures, 2);

        let keys: Vec<String> = manager
            .get_all_auto_backup_configs()
            .await
            .unwrap()
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        assert!(keys.contains(&scheduler_keys::LAST_ERROR.to_string()));

        assert_eq!(manager.record_run(now, None).await.unwrap(), 0);
        let state = manager
            .get_auto_backup_config(&SchedulerConfig::default())
            .await
            .unwrap();
        assert_eq!(state.last_status, LastStatus::Success);
        assert!(state.last_error.is_none());
    }
}
