use crate::app::CliApp;
use crate::utils::format_local_time;
use backup_core::{Result, config_manager::ConfigManager, scheduler::SchedulerService};
use tracing::{debug, info, instrument, warn};

/// 显示调度状态
pub async fn show_scheduler_status(app: &CliApp, scheduler: &SchedulerService) -> Result<()> {
    let status = scheduler.status();

    let config_manager = ConfigManager::new(app.service.database().clone());
    for (key, value) in config_manager.get_all_auto_backup_configs().await? {
        debug!(key = %key, value = %value, "已保存的自动备份配置");
    }

    info!("⏰ 自动备份状态");
    info!("================");
    info!("   启用: {}", if status.enabled { "是" } else { "否" });
    info!("   cron 表达式: {} (UTC{})", status.cron_expression, status.utc_offset);
    match status.last_run_at {
        Some(at) => info!("   上次执行: {} ({})", format_local_time(&at), status.last_status),
        None => info!("   上次执行: 从未执行"),
    }
    if let Some(last_error) = &status.last_error {
        warn!("   上次错误: {}", last_error);
    }
    info!(
        "   连续失败: {} / 告警阈值 {}",
        status.consecutive_failures, status.max_consecutive_failures
    );
    if status.enabled {
        info!("💡 定时备份由常驻进程执行: library-backup serve");
    }
    Ok(())
}

#[instrument(skip(scheduler))]
pub async fn enable_scheduler(scheduler: &SchedulerService, expression: Option<&str>) -> Result<()> {
    scheduler.enable(expression).await?;
    info!("✅ 自动备份已启用: {}", scheduler.status().cron_expression);
    Ok(())
}

pub async fn disable_scheduler(scheduler: &SchedulerService) -> Result<()> {
    scheduler.disable().await?;
    info!("✅ 自动备份已禁用");
    Ok(())
}

#[instrument(skip(scheduler))]
pub async fn update_schedule(scheduler: &SchedulerService, expression: &str) -> Result<()> {
    scheduler.update_schedule(expression).await?;
    info!("✅ cron 表达式已更新: {}", expression);
    Ok(())
}

/// 立即执行一次自动备份
pub async fn trigger_scheduler(scheduler: &SchedulerService) -> Result<()> {
    let outcome = scheduler.trigger_now().await?;
    info!("🎉 自动备份完成: {}", outcome.record.id);
    if let Some(warning) = &outcome.sync_warning {
        warn!("⚠️  远程同步失败，本地备份仍然有效: {}", warning);
    }
    Ok(())
}
