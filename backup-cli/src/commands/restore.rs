use crate::app::CliApp;
use backup_core::{
    BackupError, Result,
    content::{join_includes, parse_includes},
    restore::RestoreRequest,
};
use std::io::Write;
use tracing::{error, info, warn};

/// 从备份恢复
pub async fn run_restore(
    app: &CliApp,
    backup_id: &str,
    includes: &[String],
    no_snapshot: bool,
    force: bool,
) -> Result<()> {
    let mut request = RestoreRequest::new(backup_id);
    if !includes.is_empty() {
        request = request.with_includes(parse_includes(includes)?);
    }
    if no_snapshot {
        request = request.without_safety_snapshot();
    }

    if !force && !confirm(backup_id, &request)? {
        warn!("操作已取消");
        return Ok(());
    }

    info!("开始恢复操作...");
    match app.service.restore(request).await {
        Ok(outcome) => {
            info!("✅ 恢复完成");
            info!("   已恢复: {}", join_includes(&outcome.restored));
            if let Some(snapshot_id) = &outcome.safety_snapshot_id {
                info!("   恢复前的内容已保存为安全快照: {}", snapshot_id);
            }
            Ok(())
        }
        Err(e) => {
            if let BackupError::Restore {
                restored,
                rolled_back,
                ..
            } = &e
            {
                error!("❌ 恢复失败，已回滚: {:?}，未能回滚: {:?}", rolled_back, restored);
            }
            if let Some(snapshot_id) = e.safety_snapshot_id() {
                info!("💡 可以用安全快照手动恢复:");
                info!("   library-backup restore {} --no-snapshot", snapshot_id);
            }
            Err(e)
        }
    }
}

fn confirm(backup_id: &str, request: &RestoreRequest) -> Result<bool> {
    let scope = request
        .includes
        .as_ref()
        .map(join_includes)
        .unwrap_or_else(|| "备份中的全部内容".to_string());
    warn!("⚠️  警告: 此操作将覆盖当前的 {}!", scope);
    print!("请确认您要从备份 {backup_id} 恢复 (y/N): ");
    std::io::stdout().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case("y"))
}
