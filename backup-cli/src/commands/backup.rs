use crate::app::CliApp;
use crate::utils::{format_local_time, format_size};
use backup_core::{content::join_includes, Result};
use tracing::{error, info, warn};

/// 手动创建备份
pub async fn run_create(app: &CliApp, includes: &[String], description: Option<String>) -> Result<()> {
    let includes = app.resolve_includes(includes)?;

    info!("💾 创建备份");
    info!("===========");
    info!("   备份内容: {}", join_includes(&includes));
    info!("   备份目录: {}", app.config.get_backup_dir().display());

    let outcome = app.service.create(includes, description).await?;
    let record = &outcome.record;

    info!("🎉 备份创建成功！");
    info!("   备份ID: {}", record.id);
    info!("   备份文件: {}", record.location.display());
    info!("   文件大小: {}", format_size(record.file_size));
    info!("   SHA-256: {}", record.checksum);

    if let Some(warning) = &outcome.sync_warning {
        warn!("⚠️  远程同步失败，本地备份仍然有效: {}", warning);
    }
    Ok(())
}

/// 列出所有备份
pub async fn run_list(app: &CliApp) -> Result<()> {
    let backups = app.service.list().await?;

    if backups.is_empty() {
        info!("📦 暂无备份记录");
        info!("💡 使用以下命令创建备份:");
        info!("   library-backup create");
        return Ok(());
    }

    info!("📦 备份列表");
    info!("============");
    info!(
        "{:<20} {:<8} {:<20} {:<10} {:<24} {}",
        "ID", "类型", "创建时间", "大小", "内容", "说明"
    );
    info!("{}", "-".repeat(100));

    let mut total_size = 0u64;
    for backup in &backups {
        total_size += backup.file_size;
        let kind = if backup.is_safety_snapshot {
            "安全快照"
        } else {
            "普通"
        };
        info!(
            "{:<20} {:<8} {:<20} {:<10} {:<24} {}",
            backup.id,
            kind,
            format_local_time(&backup.created_at),
            format_size(backup.file_size),
            join_includes(&backup.includes),
            backup.description.as_deref().unwrap_or("-")
        );
    }

    info!("{}", "-".repeat(100));
    info!("共 {} 个备份，总大小 {}", backups.len(), format_size(total_size));
    Ok(())
}

/// 校验备份
pub async fn run_validate(app: &CliApp, backup_id: &str) -> Result<()> {
    info!("🔍 校验备份: {}", backup_id);

    let report = app.service.validate(backup_id).await?;
    if report.valid {
        info!("✅ 备份完整，可以用于恢复");
        return Ok(());
    }

    let check = report
        .check
        .map(|c| c.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    error!("❌ 备份校验失败 ({})", check);
    if let Some(reason) = &report.reason {
        error!("   原因: {}", reason);
    }
    report.into_result()
}

/// 删除备份
pub async fn run_delete(app: &CliApp, backup_id: &str) -> Result<()> {
    app.service.delete(backup_id).await?;
    info!("🗑️  备份已删除: {}", backup_id);
    Ok(())
}

/// 显示统计信息
pub async fn run_stats(app: &CliApp) -> Result<()> {
    let stats = app.service.stats().await?;

    info!("📊 备份统计");
    info!("============");
    info!("   备份数量: {} (其中安全快照 {})", stats.total_count, stats.safety_snapshot_count);
    info!("   占用空间: {}", format_size(stats.total_bytes));
    info!(
        "   保留策略: 最近 {} 个普通备份，最近 {} 个安全快照",
        stats.retention_count, stats.safety_retention_count
    );
    match (&stats.oldest, &stats.newest) {
        (Some(oldest), Some(newest)) => {
            info!("   最早备份: {} ({})", oldest.id, format_local_time(&oldest.created_at));
            info!("   最新备份: {} ({})", newest.id, format_local_time(&newest.created_at));
        }
        _ => info!("   暂无备份"),
    }
    Ok(())
}
