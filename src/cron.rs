//! Cron 表达式解析与下次触发时间计算
//! Cron expression parsing and next-occurrence computation
//!
//! 支持 6 字段（秒 分 时 日 月 周）和 5 字段（省略秒，视为 `0`）格式。
//! 所有计算均在 UTC 下进行。
//!
//! Supports the 6-field (`sec min hour dom month dow`) layout and the classic
//! 5-field layout (seconds implied `0`). All computation happens in UTC.

use crate::clock::Timestamp;
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Timelike, Utc};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// 向前搜索的最大天数，超过则认为表达式永远不会匹配
/// Maximum days searched ahead before an expression is deemed unsatisfiable
const MAX_SEARCH_DAYS: i64 = 5 * 366;

const MONTH_NAMES: &[&str] = &[
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const DAY_NAMES: &[&str] = &["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Cron 表达式解析错误
/// Cron expression parse errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CronParseError {
    #[error("cron expression is empty")]
    Empty,
    #[error("expected 5 or 6 fields, found {0}")]
    FieldCount(usize),
    #[error("invalid {field} value '{value}'")]
    InvalidValue { field: &'static str, value: String },
    #[error("{field} value {value} is outside {min}-{max}")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },
    #[error("invalid step '{value}' in {field}")]
    InvalidStep { field: &'static str, value: String },
}

/// 单个字段的取值范围描述
/// Value range description of one field
struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
    name_offset: u32,
}

const SECONDS: FieldSpec = FieldSpec { name: "second", min: 0, max: 59, names: &[], name_offset: 0 };
const MINUTES: FieldSpec = FieldSpec { name: "minute", min: 0, max: 59, names: &[], name_offset: 0 };
const HOURS: FieldSpec = FieldSpec { name: "hour", min: 0, max: 23, names: &[], name_offset: 0 };
const DAYS_OF_MONTH: FieldSpec = FieldSpec { name: "day-of-month", min: 1, max: 31, names: &[], name_offset: 0 };
const MONTHS: FieldSpec = FieldSpec { name: "month", min: 1, max: 12, names: MONTH_NAMES, name_offset: 1 };
// 7 同样表示周日，解析后折叠到 0
// 7 also means Sunday and is folded into 0 after parsing
const DAYS_OF_WEEK: FieldSpec = FieldSpec { name: "day-of-week", min: 0, max: 7, names: DAY_NAMES, name_offset: 0 };

/// 已解析的 cron 表达式
/// A parsed cron expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpression {
    source: String,
    seconds: u64,
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronExpression {
    /// 解析 cron 表达式
    /// Parse a cron expression
    pub fn parse(expression: &str) -> Result<Self, CronParseError> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        let (second, rest) = match fields.as_slice() {
            [] => return Err(CronParseError::Empty),
            [_, _, _, _, _] => ("0", fields.as_slice()),
            [second, rest @ ..] if rest.len() == 5 => (*second, rest),
            other => return Err(CronParseError::FieldCount(other.len())),
        };
        let [minute, hour, dom, month, dow] = rest else {
            return Err(CronParseError::FieldCount(fields.len()));
        };

        let mut days_of_week = parse_field(dow, &DAYS_OF_WEEK)?;
        if days_of_week & (1 << 7) != 0 {
            days_of_week = (days_of_week & !(1 << 7)) | 1;
        }
        let days_of_month = parse_field(dom, &DAYS_OF_MONTH)?;

        Ok(Self {
            source: expression.trim().to_string(),
            seconds: parse_field(second, &SECONDS)?,
            minutes: parse_field(minute, &MINUTES)?,
            hours: parse_field(hour, &HOURS)?,
            days_of_month,
            months: parse_field(month, &MONTHS)?,
            days_of_week,
            // 覆盖整个取值范围的字段（`*`、`?`、`*/1`）不算限制
            // a field covering its whole range (`*`, `?`, `*/1`) is not a restriction
            dom_restricted: days_of_month != range_mask(DAYS_OF_MONTH.min, DAYS_OF_MONTH.max),
            dow_restricted: days_of_week != range_mask(0, 6),
        })
    }

    /// 原始表达式文本
    /// The original expression text
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// 计算不早于 `from` 的第一个匹配时刻（向上取整到整秒）
    /// First matching instant at or after `from`, rounded up to a whole second
    ///
    /// 表达式在搜索窗口内无法满足时返回 `None`（例如 2 月 30 日）。
    /// Returns `None` when nothing matches inside the search window (e.g. Feb 30th).
    pub fn next_after(&self, from: Timestamp) -> Option<Timestamp> {
        let seconds = i64::try_from(from.as_millis().div_ceil(1000)).ok()?;
        let mut current = DateTime::<Utc>::from_timestamp(seconds, 0)?.naive_utc();
        let limit = current.checked_add_signed(chrono::Duration::days(MAX_SEARCH_DAYS))?;

        while current <= limit {
            if !bit(self.months, current.month()) {
                current = first_of_next_month(current.date())?;
                continue;
            }
            if !self.day_matches(current.date()) {
                current = current.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !bit(self.hours, current.hour()) {
                current = current
                    .date()
                    .and_hms_opt(current.hour(), 0, 0)?
                    .checked_add_signed(chrono::Duration::hours(1))?;
                continue;
            }
            if !bit(self.minutes, current.minute()) {
                current = current
                    .date()
                    .and_hms_opt(current.hour(), current.minute(), 0)?
                    .checked_add_signed(chrono::Duration::minutes(1))?;
                continue;
            }
            if !bit(self.seconds, current.second()) {
                current = current.checked_add_signed(chrono::Duration::seconds(1))?;
                continue;
            }
            return Some(Timestamp::from_datetime(current.and_utc()));
        }
        None
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = bit(self.days_of_month, date.day());
        let dow = bit(self.days_of_week, date.weekday().num_days_from_sunday());
        if self.dom_restricted && self.dow_restricted {
            dom || dow
        } else {
            dom && dow
        }
    }
}

impl FromStr for CronExpression {
    type Err = CronParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn bit(mask: u64, value: u32) -> bool {
    value < 64 && mask & (1u64 << value) != 0
}

fn range_mask(min: u32, max: u32) -> u64 {
    (min..=max).fold(0, |mask, value| mask | (1u64 << value))
}

fn first_of_next_month(date: NaiveDate) -> Option<NaiveDateTime> {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)
}

/// 将一个字段解析为位掩码
/// Parse one field into a bit mask
fn parse_field(text: &str, spec: &FieldSpec) -> Result<u64, CronParseError> {
    let mut mask = 0u64;
    for part in text.split(',') {
        let (base, step) = match part.split_once('/') {
            Some((base, step)) => {
                let step: u32 = step
                    .parse()
                    .ok()
                    .filter(|step| (1..=spec.max).contains(step))
                    .ok_or_else(|| CronParseError::InvalidStep {
                        field: spec.name,
                        value: step.to_string(),
                    })?;
                (base, Some(step))
            }
            None => (part, None),
        };

        let (start, end) = if base == "*" || base == "?" {
            (spec.min, spec.max)
        } else if let Some((low, high)) = base.split_once('-') {
            (parse_value(low, spec)?, parse_value(high, spec)?)
        } else {
            let value = parse_value(base, spec)?;
            // `5/15` 表示从 5 开始每 15 个单位
            // `5/15` means every 15 units starting at 5
            if step.is_some() { (value, spec.max) } else { (value, value) }
        };

        if start > end {
            return Err(CronParseError::InvalidValue {
                field: spec.name,
                value: base.to_string(),
            });
        }

        let step = step.unwrap_or(1);
        let mut value = start;
        while value <= end {
            mask |= 1u64 << value;
            value += step;
        }
    }
    Ok(mask)
}

fn parse_value(text: &str, spec: &FieldSpec) -> Result<u32, CronParseError> {
    let value = match text.parse::<u32>() {
        Ok(value) => value,
        Err(_) => spec
            .names
            .iter()
            .position(|name| name.eq_ignore_ascii_case(text))
            .and_then(|index| u32::try_from(index).ok())
            .map(|index| index + spec.name_offset)
            .ok_or_else(|| CronParseError::InvalidValue {
                field: spec.name,
                value: text.to_string(),
            })?,
    };
    if value < spec.min || value > spec.max {
        return Err(CronParseError::OutOfRange {
            field: spec.name,
            value,
            min: spec.min,
            max: spec.max,
        });
    }
    Ok(value)
}
