//! 自动备份调度器
//!
//! 生命周期：`Stopped -> Idle -> Running -> Idle ...`，`enabled` 是 `Idle` 上的独立开关。
//! 定时触发和手动触发走同一条执行路径，并受同一个任务槽约束：
//! 已有任务在执行时新的请求直接被拒绝，不排队。

use crate::backup::CreateRequest;
use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::config_manager::{ConfigManager, LastStatus};
use crate::content::ContentGroup;
use crate::cron::{CronSchedule, parse_utc_offset};
use crate::service::{BackupService, CreateOutcome};
use crate::{BackupError, Result};
use chrono::{DateTime, FixedOffset, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// 调度器生命周期
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerLifecycle {
    Stopped,
    Idle,
    Running,
}

/// 调度器状态快照
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchedulerStatus {
    pub lifecycle: SchedulerLifecycle,
    pub enabled: bool,
    pub cron_expression: String,
    pub utc_offset: String,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_status: LastStatus,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub max_consecutive_failures: u32,
}

/// 触发来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Scheduled,
    Manual,
}

#[derive(Debug)]
struct SchedulerState {
    started: bool,
    job_running: bool,
    enabled: bool,
    schedule: CronSchedule,
    next_run_at: Option<DateTime<Utc>>,
    last_run_at: Option<DateTime<Utc>>,
    last_status: LastStatus,
    last_error: Option<String>,
    consecutive_failures: u32,
}

#[derive(Debug)]
struct SchedulerInner {
    service: BackupService,
    config_manager: ConfigManager,
    clock: Arc<dyn Clock>,
    offset: FixedOffset,
    default_includes: BTreeSet<ContentGroup>,
    max_failures: u32,
    state: Mutex<SchedulerState>,
    wake: Notify,
    runner: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
    /// 定时触发的备份任务
    jobs: Mutex<Vec<JoinHandle<()>>>,
}

/// 调度器服务
#[derive(Debug, Clone)]
pub struct SchedulerService {
    inner: Arc<SchedulerInner>,
}

impl SchedulerService {
    /// 创建调度器，并从索引库加载持久化的调度状态
    pub async fn new(
        service: BackupService,
        config: &SchedulerConfig,
        default_includes: BTreeSet<ContentGroup>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        if default_includes.is_empty() {
            return Err(BackupError::config("自动备份的内容组不能为空"));
        }

        let offset = parse_utc_offset(&config.utc_offset)?;
        let config_manager = ConfigManager::new(service.database().clone());
        let persisted = config_manager.get_auto_backup_config(config).await?;

        let schedule = match CronSchedule::parse(&persisted.cron_expression) {
            Ok(schedule) => schedule,
            Err(e) => {
                warn!(error = %e, "已保存的 cron 表达式无效，使用配置文件中的表达式");
                CronSchedule::parse(&config.cron_expression)?
            }
        };

        let state = SchedulerState {
            started: false,
            job_running: false,
            enabled: persisted.enabled,
            schedule,
            next_run_at: None,
            last_run_at: persisted.last_run_at,
            last_status: persisted.last_status,
            last_error: persisted.last_error,
            consecutive_failures: persisted.consecutive_failures,
        };

        Ok(Self {
            inner: Arc::new(SchedulerInner {
                service,
                config_manager,
                clock,
                offset,
                default_includes,
                max_failures: config.max_consecutive_failures,
                state: Mutex::new(state),
                wake: Notify::new(),
                runner: Mutex::new(None),
                jobs: Mutex::new(Vec::new()),
            }),
        })
    }

    /// 启动调度循环；已启动时不做任何事
    pub fn start(&self) {
        let mut runner = lock(&self.inner.runner);
        if runner.is_some() {
            return;
        }

        {
            let mut state = lock(&self.inner.state);
            state.started = true;
            self.inner.rearm(&mut state);
            info!(
                enabled = state.enabled,
                cron = %state.schedule,
                next_run_at = ?state.next_run_at,
                "调度器已启动"
            );
        }

        let token = CancellationToken::new();
        let handle = tokio::spawn(self.inner.clone().run_loop(token.clone()));
        *runner = Some((token, handle));
    }

    /// 停止调度循环；不会中断正在执行的任务，返回前等待其完成
    pub async fn stop(&self) {
        let runner = lock(&self.inner.runner).take();
        if let Some((token, handle)) = runner {
            token.cancel();
            if let Err(e) = handle.await {
                warn!(error = %e, "调度循环异常退出");
            }
        }

        let jobs = std::mem::take(&mut *lock(&self.inner.jobs));
        if jobs.iter().any(|job| !job.is_finished()) {
            info!("等待正在执行的自动备份完成...");
        }
        for job in jobs {
            if let Err(e) = job.await {
                warn!(error = %e, "自动备份任务异常退出");
            }
        }

        let mut state = lock(&self.inner.state);
        state.started = false;
        state.next_run_at = None;
        info!("调度器已停止");
    }

    /// 启用自动备份，可同时更新 cron 表达式
    pub async fn enable(&self, expression: Option<&str>) -> Result<()> {
        let schedule = expression.map(CronSchedule::parse).transpose()?;

        if let Some(schedule) = &schedule {
            self.inner
                .config_manager
                .set_auto_backup_cron(schedule.expression())
                .await?;
        }
        self.inner.config_manager.set_auto_backup_enabled(true).await?;

        {
            let mut state = lock(&self.inner.state);
            if let Some(schedule) = schedule {
                state.schedule = schedule;
            }
            state.enabled = true;
            self.inner.rearm(&mut state);
        }
        self.inner.wake.notify_one();
        Ok(())
    }

    /// 禁用自动备份；调度器继续运行，只是不再自动触发
    pub async fn disable(&self) -> Result<()> {
        self.inner
            .config_manager
            .set_auto_backup_enabled(false)
            .await?;

        {
            let mut state = lock(&self.inner.state);
            state.enabled = false;
            state.next_run_at = None;
        }
        self.inner.wake.notify_one();
        Ok(())
    }

    /// 更新 cron 表达式；表达式无效时不做任何修改
    pub async fn update_schedule(&self, expression: &str) -> Result<()> {
        let schedule = CronSchedule::parse(expression)?;
        self.inner
            .config_manager
            .set_auto_backup_cron(schedule.expression())
            .await?;

        {
            let mut state = lock(&self.inner.state);
            state.schedule = schedule;
            self.inner.rearm(&mut state);
        }
        self.inner.wake.notify_one();
        Ok(())
    }

    /// 立即执行一次备份，不受 `enabled` 影响，也不改变下次触发时间
    pub async fn trigger_now(&self) -> Result<CreateOutcome> {
        self.inner.run_job(Trigger::Manual).await
    }

    /// 当前状态
    pub fn status(&self) -> SchedulerStatus {
        let state = lock(&self.inner.state);
        let lifecycle = match (state.started, state.job_running) {
            (_, true) => SchedulerLifecycle::Running,
            (true, false) => SchedulerLifecycle::Idle,
            (false, false) => SchedulerLifecycle::Stopped,
        };

        SchedulerStatus {
            lifecycle,
            enabled: state.enabled,
            cron_expression: state.schedule.expression().to_string(),
            utc_offset: self.inner.offset.to_string(),
            next_run_at: state.next_run_at,
            last_run_at: state.last_run_at,
            last_status: state.last_status,
            last_error: state.last_error.clone(),
            consecutive_failures: state.consecutive_failures,
            max_consecutive_failures: self.inner.max_failures,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SchedulerInner {
    /// 重新计算下次触发时间
    fn rearm(&self, state: &mut SchedulerState) {
        state.next_run_at = if state.started && state.enabled {
            state.schedule.next_after(self.clock.now(), &self.offset)
        } else {
            None
        };
    }

    async fn run_loop(self: Arc<Self>, token: CancellationToken) {
        loop {
            let next = lock(&self.state).next_run_at;

            match next {
                Some(at) => {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = self.wake.notified() => continue,
                        _ = self.clock.sleep_until(at) => self.fire(at),
                    }
                }
                None => {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = self.wake.notified() => continue,
                    }
                }
            }
        }
    }

    /// 到点触发：先推进下次触发时间，再在独立任务中执行备份
    fn fire(self: &Arc<Self>, at: DateTime<Utc>) {
        {
            let mut state = lock(&self.state);
            // 等待期间调度被修改过，本次不触发
            if state.next_run_at != Some(at) || !state.enabled {
                return;
            }
            let now = self.clock.now().max(at);
            state.next_run_at = state.schedule.next_after(now, &self.offset);
        }

        let inner = self.clone();
        let job = tokio::spawn(async move {
            if let Err(e) = inner.run_job(Trigger::Scheduled).await {
                if !matches!(e, BackupError::InFlight) {
                    warn!(error = %e, "自动备份失败");
                }
            }
        });

        let mut jobs = lock(&self.jobs);
        jobs.retain(|job| !job.is_finished());
        jobs.push(job);
    }

    /// 执行一次备份任务并记录结果
    async fn run_job(&self, trigger: Trigger) -> Result<CreateOutcome> {
        let guard = match self.service.job_slot().try_acquire() {
            Ok(guard) => guard,
            Err(e) => {
                warn!(trigger = ?trigger, "已有备份或恢复任务正在执行，跳过本次自动备份");
                return Err(e);
            }
        };

        let local_time = self
            .clock
            .now()
            .with_timezone(&self.offset)
            .format("%Y-%m-%d %H:%M:%S");
        let description = match trigger {
            Trigger::Scheduled => format!("自动备份 - {local_time}"),
            Trigger::Manual => format!("手动触发的自动备份 - {local_time}"),
        };
        info!(trigger = ?trigger, "开始执行自动备份");

        lock(&self.state).job_running = true;
        let request = CreateRequest::new(self.default_includes.clone()).with_description(description);
        let result = self.service.create_with(&guard, request).await;
        drop(guard);

        let finished_at = self.clock.now();
        let error_message = result.as_ref().err().map(|e| e.to_string());
        let persisted = self
            .config_manager
            .record_run(finished_at, error_message.as_deref())
            .await;

        let failures = {
            let mut state = lock(&self.state);
            state.job_running = false;
            state.last_run_at = Some(finished_at);
            match &error_message {
                None => {
                    state.last_status = LastStatus::Success;
                    state.last_error = None;
                    state.consecutive_failures = 0;
                }
                Some(message) => {
                    state.last_status = LastStatus::Failure;
                    state.last_error = Some(message.clone());
                    state.consecutive_failures += 1;
                }
            }
            match persisted {
                Ok(failures) => state.consecutive_failures = failures,
                Err(e) => warn!(error = %e, "保存自动备份状态失败"),
            }
            state.consecutive_failures
        };

        match &result {
            Ok(outcome) => info!(backup_id = %outcome.record.id, "自动备份完成"),
            Err(e) => {
                error!(error = %e, consecutive_failures = failures, "自动备份失败");
                if self.max_failures > 0 && failures >= self.max_failures {
                    error!(
                        consecutive_failures = failures,
                        threshold = self.max_failures,
                        "自动备份连续失败次数已达到告警阈值，请检查备份配置和存储空间"
                    );
                }
            }
        }

        result
    }
}
