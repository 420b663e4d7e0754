//! 全局唯一的任务槽：同一时刻只允许一个备份或恢复任务

use crate::{BackupError, Result};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// 任务槽
#[derive(Debug, Clone, Default)]
pub struct JobSlot {
    inner: Arc<Mutex<()>>,
}

/// 持有任务槽的凭证，释放即归还
///
/// 修改在线内容或写入新备份的操作都要求传入该凭证。
#[derive(Debug)]
pub struct JobGuard {
    _guard: OwnedMutexGuard<()>,
}

impl JobSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// 尝试占用任务槽；已被占用时立即返回 `InFlight`，不排队
    pub fn try_acquire(&self) -> Result<JobGuard> {
        self.inner
            .clone()
            .try_lock_owned()
            .map(|guard| JobGuard { _guard: guard })
            .map_err(|_| BackupError::InFlight)
    }
}
