use backup_core::{
    Result,
    clock::SystemClock,
    config::AppConfig,
    content::{ContentGroup, parse_includes},
    scheduler::SchedulerService,
    service::BackupService,
};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::cli::{Commands, SchedulerCommand};
use crate::commands;

#[derive(Debug, Clone)]
pub struct CliApp {
    pub config: AppConfig,
    pub service: BackupService,
}

impl CliApp {
    /// 加载配置并打开索引库；未指定配置文件时按默认顺序查找
    pub async fn new(config_path: Option<&Path>) -> Result<Self> {
        let config = match config_path {
            Some(path) => {
                debug!(path = %path.display(), "使用指定的配置文件");
                AppConfig::load_from_file(path)?
            }
            None => AppConfig::find_and_load_config()?,
        };

        let service = BackupService::from_config(&config).await?;
        Ok(Self { config, service })
    }

    /// 命令行指定的内容组；为空时使用配置中的默认值
    pub fn resolve_includes(&self, names: &[String]) -> Result<BTreeSet<ContentGroup>> {
        if names.is_empty() {
            self.config.default_includes()
        } else {
            parse_includes(names)
        }
    }

    /// 构造使用系统时钟的调度器
    pub async fn scheduler(&self) -> Result<SchedulerService> {
        SchedulerService::new(
            self.service.clone(),
            &self.config.scheduler,
            self.config.default_includes()?,
            Arc::new(SystemClock),
        )
        .await
    }

    /// 运行应用命令
    pub async fn run(&self, command: Commands) -> Result<()> {
        match command {
            Commands::Init { .. } => unreachable!(), // 已经在 main.rs 中处理
            Commands::Create {
                includes,
                description,
            } => commands::run_create(self, &includes, description).await,
            Commands::List => commands::run_list(self).await,
            Commands::Validate { backup_id } => commands::run_validate(self, &backup_id).await,
            Commands::Restore {
                backup_id,
                includes,
                no_snapshot,
                force,
            } => commands::run_restore(self, &backup_id, &includes, no_snapshot, force).await,
            Commands::Delete { backup_id } => commands::run_delete(self, &backup_id).await,
            Commands::Stats => commands::run_stats(self).await,
            Commands::Scheduler(scheduler_cmd) => self.run_scheduler_command(scheduler_cmd).await,
            Commands::Serve => commands::run_serve(self).await,
        }
    }

    /// 运行自动备份调度相关命令
    async fn run_scheduler_command(&self, cmd: SchedulerCommand) -> Result<()> {
        let scheduler = self.scheduler().await?;
        match cmd {
            SchedulerCommand::Status => commands::show_scheduler_status(self, &scheduler).await,
            SchedulerCommand::Enable { expression } => {
                info!("启用自动备份");
                commands::enable_scheduler(&scheduler, expression.as_deref()).await
            }
            SchedulerCommand::Disable => {
                info!("禁用自动备份");
                commands::disable_scheduler(&scheduler).await
            }
            SchedulerCommand::Update { expression } => {
                info!("更新自动备份 cron 表达式");
                commands::update_schedule(&scheduler, &expression).await
            }
            SchedulerCommand::Trigger => {
                info!("🔄 立即执行自动备份...");
                commands::trigger_scheduler(&scheduler).await
            }
        }
    }
}
