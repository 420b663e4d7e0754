//! 五字段 cron 表达式
//!
//! `分 时 日 月 周`，语法和匹配规则由 `croner` 提供：范围、步长、列表、
//! 月份名和星期名，星期字段的 `7` 等同于周日，日和周同时受限时任一匹配即可。
//!
//! 表达式只在启用或更新调度时解析一次，之后的计算都基于解析结果。

use crate::constants::cron::CRON_FIELDS_COUNT;
use crate::{BackupError, Result};
use chrono::{DateTime, FixedOffset, Utc};
use croner::Cron;
use std::fmt;
use std::str::FromStr;

/// 已校验的 cron 调度
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    cron: Cron,
}

impl CronSchedule {
    /// 解析 cron 表达式
    pub fn parse(expression: &str) -> Result<Self> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        // croner 也接受秒字段和 @daily 之类的别名，这里只允许标准五字段
        if fields.len() != CRON_FIELDS_COUNT {
            return Err(BackupError::ScheduleInvalid(format!(
                "'{expression}' 需要 {CRON_FIELDS_COUNT} 个字段，实际为 {}",
                fields.len()
            )));
        }

        let expression = fields.join(" ");
        let cron = Cron::new(&expression)
            .parse()
            .map_err(|e| BackupError::ScheduleInvalid(format!("'{expression}': {e}")))?;

        Ok(Self { expression, cron })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// 严格晚于 `after` 的下一个触发时刻；字段按 `offset` 所在时区解释
    pub fn next_after(&self, after: DateTime<Utc>, offset: &FixedOffset) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(offset);
        self.cron
            .find_next_occurrence(&local, false)
            .ok()
            .map(|next| next.with_timezone(&Utc))
    }
}

impl FromStr for CronSchedule {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

/// 解析 `+08:00` / `-05:30` / `Z` 形式的固定时区偏移
pub fn parse_utc_offset(text: &str) -> Result<FixedOffset> {
    let trimmed = text.trim();
    if trimmed.eq_ignore_ascii_case("z") || trimmed.eq_ignore_ascii_case("utc") {
        return FixedOffset::east_opt(0)
            .ok_or_else(|| BackupError::config(format!("无效的时区偏移: {text}")));
    }

    let invalid = || BackupError::config(format!("无效的时区偏移: {text}"));
    let (sign, rest) = match trimmed.as_bytes().first() {
        Some(b'+') => (1, &trimmed[1..]),
        Some(b'-') => (-1, &trimmed[1..]),
        _ => return Err(invalid()),
    };
    let (hours, minutes) = rest.split_once(':').unwrap_or((rest, "0"));
    let hours: i32 = hours.parse().map_err(|_| invalid())?;
    let minutes: i32 = minutes.parse().map_err(|_| invalid())?;
    if hours > 14 || minutes > 59 {
        return Err(invalid());
    }

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(invalid)
}
