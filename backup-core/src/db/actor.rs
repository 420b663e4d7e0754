use crate::Result;
use duckdb::{Connection, params};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::messages::DbMessage;
use super::models::{BackupRecord, BackupRow};

const BACKUP_COLUMNS: &str =
    "id, created_at, description, includes, file_size, checksum, is_safety_snapshot, file_path";

/// DuckDB Actor - 确保单线程访问DuckDB
pub struct DuckDbActor {
    connection: Connection,
}

impl DuckDbActor {
    /// 创建新的DuckDB Actor
    pub fn new(db_path: PathBuf) -> Result<Self> {
        let connection = Connection::open(db_path)?;
        Ok(Self { connection })
    }

    /// 创建内存DuckDB Actor
    pub fn new_memory() -> Result<Self> {
        let connection = Connection::open_in_memory()?;
        Ok(Self { connection })
    }

    /// 运行Actor消息循环
    pub async fn run(mut self, mut receiver: mpsc::Receiver<DbMessage>) {
        debug!("DuckDB Actor 已启动");

        while let Some(message) = receiver.recv().await {
            self.handle_message(message);
        }

        debug!("DuckDB Actor 已关闭");
    }

    /// 处理数据库消息
    fn handle_message(&mut self, message: DbMessage) {
        match message {
            DbMessage::InitTables { respond_to } => {
                let _ = respond_to.send(self.init_tables());
            }
            DbMessage::GetConfig { key, respond_to } => {
                let _ = respond_to.send(self.get_config(&key));
            }
            DbMessage::SetConfig {
                key,
                value,
                respond_to,
            } => {
                let _ = respond_to.send(self.set_config(&key, &value));
            }
            DbMessage::ListConfigs { prefix, respond_to } => {
                let _ = respond_to.send(self.list_configs(&prefix));
            }
            DbMessage::InsertBackup { record, respond_to } => {
                let _ = respond_to.send(self.insert_backup(&record));
            }
            DbMessage::ListBackups { respond_to } => {
                let _ = respond_to.send(self.list_backups());
            }
            DbMessage::GetBackup { id, respond_to } => {
                let _ = respond_to.send(self.get_backup(&id));
            }
            DbMessage::DeleteBackup { id, respond_to } => {
                let _ = respond_to.send(self.delete_backup(&id));
            }
        }
    }

    /// 初始化数据库表
    fn init_tables(&mut self) -> Result<()> {
        debug!("正在初始化索引表...");

        let sql_content = include_str!("../../migrations/init_index.sql");

        // 按分号分割SQL语句并执行
        for statement in sql_content.split(';') {
            let trimmed = statement.trim();
            let has_sql = trimmed
                .lines()
                .any(|line| !line.trim().is_empty() && !line.trim().starts_with("--"));
            if has_sql {
                self.connection.execute(trimmed, [])?;
            }
        }

        info!("索引表初始化完成");
        Ok(())
    }

    /// 获取配置值
    fn get_config(&mut self, key: &str) -> Result<Option<String>> {
        let mut stmt = self
            .connection
            .prepare("SELECT config_value FROM app_config WHERE config_key = ?")?;
        let mut rows = stmt.query(params![key])?;

        if let Some(row) = rows.next()? {
            let raw: String = row.get(0)?;
            Ok(Some(decode_config_value(raw)))
        } else {
            Ok(None)
        }
    }

    /// 设置配置值
    fn set_config(&mut self, key: &str, value: &str) -> Result<()> {
        let encoded = serde_json::to_string(value)?;

        // 首先尝试更新现有配置
        let updated = self.connection.execute(
            "UPDATE app_config SET config_value = ?, updated_at = CURRENT_TIMESTAMP WHERE config_key = ?",
            params![encoded, key],
        )?;

        // 如果没有更新任何行，则插入新配置
        if updated == 0 {
            self.connection.execute(
                "INSERT INTO app_config (config_key, config_value) VALUES (?, ?)",
                params![key, encoded],
            )?;
        }
        Ok(())
    }

    /// 按前缀列出配置
    fn list_configs(&mut self, prefix: &str) -> Result<Vec<(String, String)>> {
        let mut stmt = self.connection.prepare(
            "SELECT config_key, config_value FROM app_config WHERE starts_with(config_key, ?) ORDER BY config_key",
        )?;
        let rows = stmt.query_map(params![prefix], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut configs = Vec::new();
        for row in rows {
            let (key, raw) = row?;
            configs.push((key, decode_config_value(raw)));
        }
        Ok(configs)
    }

    /// 写入备份记录
    fn insert_backup(&mut self, record: &BackupRecord) -> Result<()> {
        let row = BackupRow::from(record);
        self.connection.execute(
            &format!("INSERT INTO backup_records ({BACKUP_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)"),
            params![
                row.id,
                row.created_at,
                row.description,
                row.includes,
                row.file_size,
                row.checksum,
                row.is_safety_snapshot,
                row.file_path
            ],
        )?;
        Ok(())
    }

    /// 获取所有备份记录
    fn list_backups(&mut self) -> Result<Vec<BackupRecord>> {
        let mut stmt = self.connection.prepare(&format!(
            "SELECT {BACKUP_COLUMNS} FROM backup_records ORDER BY created_at DESC, id DESC"
        ))?;

        let rows = stmt.query_map([], read_row)?;

        let mut backups = Vec::new();
        for row in rows {
            backups.push(BackupRecord::try_from(row?)?);
        }
        Ok(backups)
    }

    /// 根据ID获取备份记录
    fn get_backup(&mut self, id: &str) -> Result<Option<BackupRecord>> {
        let mut stmt = self.connection.prepare(&format!(
            "SELECT {BACKUP_COLUMNS} FROM backup_records WHERE id = ?"
        ))?;
        let mut rows = stmt.query(params![id])?;

        match rows.next()? {
            Some(row) => Ok(Some(BackupRecord::try_from(read_row(row)?)?)),
            None => Ok(None),
        }
    }

    /// 删除备份记录
    fn delete_backup(&mut self, id: &str) -> Result<bool> {
        let deleted = self
            .connection
            .execute("DELETE FROM backup_records WHERE id = ?", params![id])?;
        Ok(deleted > 0)
    }
}

fn read_row(row: &duckdb::Row<'_>) -> duckdb::Result<BackupRow> {
    Ok(BackupRow {
        id: row.get(0)?,
        created_at: row.get(1)?,
        description: row.get(2)?,
        includes: row.get(3)?,
        file_size: row.get(4)?,
        checksum: row.get(5)?,
        is_safety_snapshot: row.get(6)?,
        file_path: row.get(7)?,
    })
}

/// 配置值以JSON字符串保存，取出时去掉引号
fn decode_config_value(raw: String) -> String {
    match serde_json::from_str::<serde_json::Value>(&raw) {
        Ok(serde_json::Value::String(s)) => s,
        _ => raw,
    }
}
