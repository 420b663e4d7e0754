use backup_core::{Result, config::AppConfig, constants::config, db::DuckDbManager};
use std::path::Path;
use tracing::{info, warn};

/// 运行独立的初始化流程
pub async fn run_init(config_path: Option<&Path>, force: bool) -> Result<()> {
    let config_path = config_path.unwrap_or(Path::new(config::CONFIG_FILE_NAME));

    info!("📚 Library Backup 初始化");
    info!("========================");

    if !force && config_path.exists() {
        warn!("⚠️  检测到已存在的配置文件: {}", config_path.display());
        info!("如果您要重新初始化，请使用 --force 参数");
        info!("示例: library-backup init --force");
        return Ok(());
    }

    info!("📋 步骤 1: 创建配置文件和备份目录");

    let app_config = AppConfig::default();
    app_config.save_to_file(config_path)?;
    info!("   ✅ 创建配置文件: {}", config_path.display());

    std::fs::create_dir_all(app_config.get_backup_dir())?;
    info!("   ✅ 创建备份目录: {}", app_config.get_backup_dir().display());

    info!("📋 步骤 2: 初始化索引库");

    let db_path = app_config.get_index_db_path();
    DuckDbManager::new(&db_path).await?;
    info!("   ✅ 创建DuckDB索引库: {}", db_path.display());

    info!("🎉 初始化完成！");
    info!("💡 请在配置文件 [sources] 中确认书库记录、封面目录和应用配置的位置，然后运行:");
    info!("   library-backup create");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_init_does_not_overwrite_without_force() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        std::fs::write(&config_path, "# 用户修改过的配置").unwrap();

        run_init(Some(&config_path), false).await.unwrap();

        assert_eq!(
            std::fs::read_to_string(&config_path).unwrap(),
            "# 用户修改过的配置"
        );
    }
}
