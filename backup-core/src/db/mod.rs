// 备份索引数据库模块
//
// 通过Actor模式保证DuckDB的单线程访问，为备份存储和调度器
// 提供异步、类型安全的API。
//
// 主要组件：
// - DuckDbManager: 高级API接口
// - DuckDbActor: 内部Actor，处理实际的数据库操作
// - 数据模型和消息定义

mod actor;
mod manager;
mod messages;
mod models;

pub use manager::DuckDbManager;
pub use models::BackupRecord;
pub(crate) use models::{format_timestamp, parse_timestamp};
