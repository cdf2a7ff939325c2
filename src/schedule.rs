//! Time-of-day capture cadence.
//!
//! E-ink panels spend battery on every refresh, so how often a dashboard is
//! recaptured should follow the household's day: frequent while people are
//! up and about, sparse overnight. Rules are evaluated in order against the
//! configured timezone and the first match wins.
//!
//! ```yaml
//! timezone: "Europe/Berlin"
//! default_interval_secs: 300
//!
//! rules:
//!   - days: all
//!     start: "23:00"
//!     end: "06:00"
//!     interval_secs: 1800
//!   - days: weekdays
//!     start: "06:00"
//!     end: "09:00"
//!     interval_secs: 60
//! ```

use chrono::{DateTime, Datelike, NaiveTime, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::capture::Orchestrator;
use crate::config::CaptureDefaults;
use crate::device::DeviceRegistry;
use crate::error::{CaptureError, Error};

/// Day-of-week selector as written in YAML.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum DaySpec {
    /// Explicit day list, e.g. `[mon, wed, fri]`
    List(Vec<String>),
    /// A group name: `all`, `weekdays`, `weekends`, or a single day
    Named(String),
}

#[derive(Debug, Deserialize)]
struct RawRule {
    days: DaySpec,
    start: String,
    end: String,
    interval_secs: u32,
}

#[derive(Debug, Deserialize)]
struct RawSchedule {
    timezone: String,
    default_interval_secs: u32,
    #[serde(default)]
    rules: Vec<RawRule>,
}

/// One compiled rule: a weekday bitmask plus a time window.
#[derive(Debug, Clone)]
struct Rule {
    day_mask: u8,
    start: NaiveTime,
    end: NaiveTime,
    interval: Duration,
}

impl Rule {
    fn matches(&self, weekday: Weekday, time: NaiveTime) -> bool {
        if self.day_mask & (1 << weekday.num_days_from_monday()) == 0 {
            return false;
        }
        if self.start <= self.end {
            // Same-day window; end is exclusive.
            time >= self.start && time < self.end
        } else {
            // Overnight window, e.g. 23:00 to 06:00.
            time >= self.start || time < self.end
        }
    }
}

/// Compiled capture cadence.
///
/// Rules are validated when the schedule is built, so lookups never fail.
#[derive(Debug, Clone)]
pub struct CadenceSchedule {
    tz: Tz,
    default_interval: Duration,
    rules: Vec<Rule>,
}

impl CadenceSchedule {
    /// Load a schedule from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!(
                "failed to read schedule file '{}': {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_yaml(&content)
    }

    /// Parse and compile a schedule from a YAML string.
    ///
    /// Unknown timezones, unknown day names and malformed times are
    /// configuration errors reported here rather than silently skipped at
    /// match time.
    pub fn from_yaml(yaml: &str) -> Result<Self, Error> {
        let raw: RawSchedule = serde_yaml::from_str(yaml)
            .map_err(|e| Error::Config(format!("invalid schedule YAML: {e}")))?;

        let tz: Tz = raw
            .timezone
            .parse()
            .map_err(|_| Error::Config(format!("unknown timezone: {}", raw.timezone)))?;

        let mut rules = Vec::with_capacity(raw.rules.len());
        for (i, rule) in raw.rules.iter().enumerate() {
            rules.push(Rule {
                day_mask: compile_days(&rule.days)
                    .ok_or_else(|| Error::Config(format!("rule {i}: unknown day selector")))?,
                start: parse_time(&rule.start)
                    .ok_or_else(|| Error::Config(format!("rule {i}: bad start '{}'", rule.start)))?,
                end: parse_time(&rule.end)
                    .ok_or_else(|| Error::Config(format!("rule {i}: bad end '{}'", rule.end)))?,
                interval: Duration::from_secs(u64::from(rule.interval_secs)),
            });
        }

        Ok(Self {
            tz,
            default_interval: Duration::from_secs(u64::from(raw.default_interval_secs)),
            rules,
        })
    }

    /// A schedule with no rules that always yields `interval_secs`.
    pub fn fixed(interval_secs: u32) -> Self {
        Self {
            tz: chrono_tz::UTC,
            default_interval: Duration::from_secs(u64::from(interval_secs)),
            rules: Vec::new(),
        }
    }

    /// Capture interval in effect right now.
    pub fn current_interval(&self) -> Duration {
        self.interval_at(Utc::now())
    }

    /// Capture interval in effect at a specific instant.
    pub fn interval_at(&self, at: DateTime<Utc>) -> Duration {
        let local = at.with_timezone(&self.tz);
        let weekday = local.weekday();
        let time = NaiveTime::from_hms_opt(local.hour(), local.minute(), 0).unwrap_or_default();

        for rule in &self.rules {
            if rule.matches(weekday, time) {
                tracing::debug!(?weekday, %time, interval = ?rule.interval, "cadence rule matched");
                return rule.interval;
            }
        }
        self.default_interval
    }
}

/// Drive scheduled captures for every registered device.
///
/// Each tick triggers with `skip_if_busy` so a slow capture is skipped for
/// that round instead of piling up a backlog. Runs until the task is
/// dropped.
pub async fn run_cadence(
    schedule: CadenceSchedule,
    orchestrator: Orchestrator,
    registry: DeviceRegistry,
    defaults: CaptureDefaults,
) {
    loop {
        let interval = schedule.current_interval();
        tokio::time::sleep(interval).await;

        for device in registry.all() {
            let request = defaults.request_for(&device);
            match orchestrator.trigger(&device.id, request, true) {
                Ok(_) => {}
                Err(Error::Capture(CaptureError::Busy)) => {
                    tracing::debug!(device_id = %device.id, "scheduled capture skipped, device busy");
                }
                Err(err) => {
                    tracing::warn!(device_id = %device.id, error = %err, "scheduled capture rejected");
                }
            }
        }
    }
}

fn compile_days(spec: &DaySpec) -> Option<u8> {
    const ALL: u8 = 0b0111_1111;
    const WEEKDAYS: u8 = 0b0001_1111;
    const WEEKENDS: u8 = 0b0110_0000;

    match spec {
        DaySpec::Named(name) => match name.to_lowercase().as_str() {
            "all" => Some(ALL),
            "weekdays" => Some(WEEKDAYS),
            "weekends" => Some(WEEKENDS),
            day => day_bit(day),
        },
        DaySpec::List(days) => {
            let mut mask = 0u8;
            for day in days {
                mask |= day_bit(&day.to_lowercase())?;
            }
            Some(mask)
        }
    }
}

fn day_bit(day: &str) -> Option<u8> {
    let index = match day {
        "mon" | "monday" => 0,
        "tue" | "tuesday" => 1,
        "wed" | "wednesday" => 2,
        "thu" | "thursday" => 3,
        "fri" | "friday" => 4,
        "sat" | "saturday" => 5,
        "sun" | "sunday" => 6,
        _ => return None,
    };
    Some(1 << index)
}

fn parse_time(s: &str) -> Option<NaiveTime> {
    let (hour, minute) = s.split_once(':')?;
    NaiveTime::from_hms_opt(hour.parse().ok()?, minute.parse().ok()?, 0)
}
