use crate::app::CliApp;
use crate::utils::format_local_time;
use backup_core::Result;
use tracing::{error, info, warn};

/// 常驻运行调度器，收到 Ctrl+C 后停止
pub async fn run_serve(app: &CliApp) -> Result<()> {
    info!("🚀 启动自动备份服务");

    // 清理上次异常退出遗留的暂存文件
    let report = app.service.recover().await?;
    if !report.removed_partials.is_empty() || report.removed_staging {
        warn!(
            "已清理中断遗留的暂存文件: {} 个暂存归档{}",
            report.removed_partials.len(),
            if report.removed_staging { "，以及暂存目录" } else { "" }
        );
    }
    for backup_id in &report.missing_archives {
        error!("❌ 备份 {} 的归档文件已丢失，请检查备份目录", backup_id);
    }

    let scheduler = app.scheduler().await?;
    scheduler.start();

    let status = scheduler.status();
    if status.enabled {
        match status.next_run_at {
            Some(at) => info!("   下次自动备份: {}", format_local_time(&at)),
            None => warn!("   cron 表达式 {} 没有可用的触发时间", status.cron_expression),
        }
    } else {
        info!("   自动备份当前已禁用，可使用 'library-backup scheduler enable' 启用");
    }
    info!("按 Ctrl+C 停止服务");

    let signal = tokio::signal::ctrl_c().await;
    info!("正在停止自动备份服务...");
    scheduler.stop().await;
    signal?;

    info!("✅ 自动备份服务已停止");
    Ok(())
}
