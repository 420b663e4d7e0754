use crate::Result;
use tokio::sync::oneshot;

use super::models::BackupRecord;

/// DuckDB数据库操作消息
#[derive(Debug)]
pub enum DbMessage {
    /// 初始化数据库表
    InitTables {
        respond_to: oneshot::Sender<Result<()>>,
    },
    /// 获取配置值
    GetConfig {
        key: String,
        respond_to: oneshot::Sender<Result<Option<String>>>,
    },
    /// 设置配置值
    SetConfig {
        key: String,
        value: String,
        respond_to: oneshot::Sender<Result<()>>,
    },
    /// 按前缀列出配置
    ListConfigs {
        prefix: String,
        respond_to: oneshot::Sender<Result<Vec<(String, String)>>>,
    },

    // ========== 备份索引 ==========
    /// 写入备份记录
    InsertBackup {
        record: BackupRecord,
        respond_to: oneshot::Sender<Result<()>>,
    },
    /// 获取所有备份记录（最新在前）
    ListBackups {
        respond_to: oneshot::Sender<Result<Vec<BackupRecord>>>,
    },
    /// 根据ID获取备份记录
    GetBackup {
        id: String,
        respond_to: oneshot::Sender<Result<Option<BackupRecord>>>,
    },
    /// 删除备份记录，返回是否存在
    DeleteBackup {
        id: String,
        respond_to: oneshot::Sender<Result<bool>>,
    },
}
