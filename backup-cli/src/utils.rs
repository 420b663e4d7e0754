use chrono::{DateTime, Local, Utc};
use tracing_appender::non_blocking::WorkerGuard;

/// 日志文件路径的环境变量，设置后日志输出到文件而非终端
pub const LOG_FILE_ENV: &str = "LIBRARY_BACKUP_LOG_FILE";

/// 设置日志记录系统
///
/// - 支持 RUST_LOG 环境变量控制日志级别
/// - 终端输出简洁格式，文件输出详细格式
/// - 文件输出经由后台线程写入，返回的 guard 需要保持到进程退出
pub fn setup_logging(verbose: bool) -> std::io::Result<Option<WorkerGuard>> {
    use tracing_subscriber::{EnvFilter, fmt};

    let default_level = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    if let Ok(log_file) = std::env::var(LOG_FILE_ENV) {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)?;
        let (writer, guard) = tracing_appender::non_blocking(file);

        fmt()
            .with_env_filter(env_filter)
            .with_writer(writer)
            .with_ansi(false)
            .with_target(true)
            .with_thread_names(true)
            .with_line_number(true)
            .init();
        Ok(Some(guard))
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(false) // 不显示模块路径
            .with_thread_names(false)
            .with_line_number(false)
            .without_time()
            .compact()
            .init();
        Ok(None)
    }
}

/// 人类可读的文件大小
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1}GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1}MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1}KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes}B")
    }
}

/// 按本地时区显示时间
pub fn format_local_time(at: &DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
}
