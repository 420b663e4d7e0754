use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// 自动备份调度相关命令
#[derive(Subcommand, Debug)]
pub enum SchedulerCommand {
    /// 显示自动备份调度状态
    Status,
    /// 启用自动备份
    Enable {
        /// cron 表达式，例如 "0 2 * * *" 表示每天凌晨2点
        #[arg(help = "cron 表达式，例如 '0 2 * * *' 表示每天凌晨2点（不填则沿用当前表达式）")]
        expression: Option<String>,
    },
    /// 禁用自动备份
    Disable,
    /// 更新自动备份的 cron 表达式
    Update {
        #[arg(help = "cron 表达式，例如 '*/30 * * * *' 表示每30分钟")]
        expression: String,
    },
    /// 立即执行一次自动备份
    Trigger,
}

/// Library Backup CLI - 书库备份、恢复与定时任务管理工具
#[derive(Parser, Debug)]
#[command(name = "library-backup")]
#[command(about = "书库记录、封面资源和配置的备份与恢复工具")]
#[command(version)]
pub struct Cli {
    /// 配置文件路径（不指定时按 config.toml、library-backup.toml 顺序查找）
    #[arg(short, long, env = "LIBRARY_BACKUP_CONFIG")]
    pub config: Option<PathBuf>,

    /// 详细输出
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 首次使用时初始化，创建配置文件、备份目录和索引库
    Init {
        /// 如果配置文件已存在，强制覆盖
        #[arg(long)]
        force: bool,
    },
    /// 手动创建备份
    Create {
        /// 要备份的内容组（records、assets、config），可重复指定；不指定时使用配置中的默认值
        #[arg(short, long = "include", value_name = "GROUP")]
        includes: Vec<String>,
        /// 备份说明
        #[arg(short, long)]
        description: Option<String>,
    },
    /// 列出所有备份
    List,
    /// 校验备份完整性
    Validate {
        /// 备份 ID
        backup_id: String,
    },
    /// 从备份恢复
    Restore {
        /// 备份 ID
        backup_id: String,
        /// 只恢复指定的内容组，可重复指定；不指定时恢复备份中的全部内容组
        #[arg(short, long = "include", value_name = "GROUP")]
        includes: Vec<String>,
        /// 不创建恢复前的安全快照
        #[arg(long)]
        no_snapshot: bool,
        /// 跳过确认
        #[arg(long)]
        force: bool,
    },
    /// 删除备份
    Delete {
        /// 备份 ID
        backup_id: String,
    },
    /// 显示备份统计信息
    Stats,
    /// 自动备份调度管理
    #[command(subcommand)]
    Scheduler(SchedulerCommand),
    /// 以常驻进程运行调度器，按 cron 表达式自动备份
    Serve,
}
