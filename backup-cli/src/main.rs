use backup_cli::{Cli, CliApp, Commands, LOG_FILE_ENV, run_init, setup_logging};
use backup_core::ErrorKind;
use clap::Parser;
use tracing::error;

#[tokio::main]
async fn main() {
    // 解析命令行参数
    let cli = Cli::parse();

    // 设置日志记录；guard 需要保持到进程退出
    let _log_guard = match setup_logging(cli.verbose) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("❌ 无法打开 {LOG_FILE_ENV} 指定的日志文件: {e}");
            std::process::exit(1);
        }
    };

    // `init` 命令是特例，它不需要预先加载配置
    if let Commands::Init { force } = cli.command {
        if let Err(e) = run_init(cli.config.as_deref(), force).await {
            error!("❌ 初始化失败: {}", e);
            std::process::exit(1);
        }
        return;
    }

    let app = match CliApp::new(cli.config.as_deref()).await {
        Ok(app) => app,
        Err(e) => {
            error!("❌ 应用初始化失败: {}", e);
            if matches!(e.kind(), ErrorKind::Io | ErrorKind::Config) {
                error!("👉 请检查配置文件，或运行 'library-backup init' 创建默认配置。");
            }
            std::process::exit(1);
        }
    };

    // 运行命令
    if let Err(e) = app.run(cli.command).await {
        error!("❌ 操作失败 [{}]: {}", e.kind(), e);
        if e.is_retryable() {
            error!("👉 请等待当前任务结束后重试。");
        }
        std::process::exit(1);
    }
}
