use chrono::{DateTime, Datelike, Duration, Local, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub const MAX_THREADS: u32 = 64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleMode {
    #[default]
    Daily,
    Weekly,
}

impl ScheduleMode {
    /// Unknown modes fall back to daily.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "weekly" => ScheduleMode::Weekly,
            _ => ScheduleMode::Daily,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleDay {
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
    Sun,
}

impl ScheduleDay {
    pub const ALL: [ScheduleDay; 7] = [
        ScheduleDay::Mon,
        ScheduleDay::Tue,
        ScheduleDay::Wed,
        ScheduleDay::Thu,
        ScheduleDay::Fri,
        ScheduleDay::Sat,
        ScheduleDay::Sun,
    ];

    /// Accepts any token whose first three letters name a weekday.
    pub fn parse(token: &str) -> Option<Self> {
        let token: String = token.trim().to_lowercase().chars().take(3).collect();
        match token.as_str() {
            "mon" => Some(ScheduleDay::Mon),
            "tue" => Some(ScheduleDay::Tue),
            "wed" => Some(ScheduleDay::Wed),
            "thu" => Some(ScheduleDay::Thu),
            "fri" => Some(ScheduleDay::Fri),
            "sat" => Some(ScheduleDay::Sat),
            "sun" => Some(ScheduleDay::Sun),
            _ => None,
        }
    }

    /// 0 for Monday through 6 for Sunday.
    pub fn index(self) -> u32 {
        self as u32
    }
}

/// Wall-clock time of day, serialized as `"HH:MM"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimeOfDay {
    hour: u32,
    minute: u32,
}

impl Default for TimeOfDay {
    fn default() -> Self {
        Self { hour: 23, minute: 0 }
    }
}

impl TimeOfDay {
    pub fn new(hour: u32, minute: u32) -> Option<Self> {
        (hour <= 23 && minute <= 59).then_some(Self { hour, minute })
    }

    /// Parse `H`, `H:M`, `HH:MM`.
    pub fn parse(value: &str) -> Option<Self> {
        let mut parts = value.trim().splitn(2, ':');
        let hour = parts.next()?.trim().parse().ok()?;
        let minute = match parts.next() {
            Some(m) => m.trim().parse().ok()?,
            None => 0,
        };
        Self::new(hour, minute)
    }

    pub fn hour(&self) -> u32 {
        self.hour
    }

    pub fn minute(&self) -> u32 {
        self.minute
    }

    fn as_naive(&self) -> NaiveTime {
        NaiveTime::from_hms_opt(self.hour, self.minute, 0).unwrap_or(NaiveTime::MIN)
    }
}

impl std::fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

impl Serialize for TimeOfDay {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TimeOfDay {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(TimeOfDay::parse(&value).unwrap_or_default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LastRunStatus {
    Queued,
    Success,
    Error,
    Cancelled,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScheduleConfig {
    pub enabled: bool,
    #[serde(rename = "type")]
    pub mode: ScheduleMode,
    pub time: TimeOfDay,
    pub days: Vec<ScheduleDay>,
    pub threads: Option<u32>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_run_status: Option<LastRunStatus>,
    pub last_error: Option<String>,
    pub next_run_at: Option<DateTime<Utc>>,
}

impl ScheduleConfig {
    pub fn daily(time: TimeOfDay) -> Self {
        Self {
            enabled: true,
            mode: ScheduleMode::Daily,
            time,
            ..Default::default()
        }
    }

    pub fn weekly(time: TimeOfDay, days: Vec<ScheduleDay>) -> Self {
        Self {
            enabled: true,
            mode: ScheduleMode::Weekly,
            time,
            days,
            ..Default::default()
        }
    }

    /// Weekdays that apply under weekly mode; Monday when none are set.
    pub fn effective_days(&self) -> Vec<ScheduleDay> {
        if self.days.is_empty() {
            vec![ScheduleDay::Mon]
        } else {
            self.days.clone()
        }
    }

    /// Merge a partial update over `existing`, validating every field.
    pub fn normalize(request: &ScheduleRequest, existing: &ScheduleConfig) -> Self {
        Self::normalize_at(request, existing, &Local::now())
    }

    pub fn normalize_at<Tz: TimeZone>(
        request: &ScheduleRequest,
        existing: &ScheduleConfig,
        now: &DateTime<Tz>,
    ) -> Self {
        let mode = request
            .mode
            .as_deref()
            .map(ScheduleMode::parse)
            .unwrap_or(existing.mode);
        let time = match request.time.as_deref() {
            Some(value) => TimeOfDay::parse(value).unwrap_or_default(),
            None => existing.time,
        };

        let mut days: Vec<ScheduleDay> = Vec::new();
        match &request.days {
            Some(tokens) => {
                for day in tokens.iter().filter_map(|t| ScheduleDay::parse(t)) {
                    if !days.contains(&day) {
                        days.push(day);
                    }
                }
            }
            None => days = existing.days.clone(),
        }
        if mode == ScheduleMode::Weekly && days.is_empty() {
            days.push(ScheduleDay::Mon);
        }
        if mode == ScheduleMode::Daily {
            days.clear();
        }

        let threads = match request.threads {
            Some(t) if (1..=i64::from(MAX_THREADS)).contains(&t) => Some(t as u32),
            Some(_) => None,
            None => existing.threads,
        };

        let mut normalized = ScheduleConfig {
            enabled: request.enabled.unwrap_or(existing.enabled),
            mode,
            time,
            days,
            threads,
            last_run_at: existing.last_run_at,
            last_run_status: existing.last_run_status,
            last_error: existing.last_error.clone(),
            next_run_at: None,
        };
        normalized.next_run_at = compute_next_run(&normalized, now);
        normalized
    }
}

/// Partial schedule as accepted from clients. Missing fields keep their
/// current value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleRequest {
    pub enabled: Option<bool>,
    #[serde(rename = "type", alias = "mode")]
    pub mode: Option<String>,
    pub time: Option<String>,
    pub days: Option<Vec<String>>,
    pub threads: Option<i64>,
}

/// Map a local wall-clock time to an instant. Ambiguous times take the
/// earlier instant; times inside a DST gap move to the first valid minute.
fn localize<Tz: TimeZone>(tz: &Tz, naive: NaiveDateTime) -> Option<DateTime<Tz>> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(t) => Some(t),
        LocalResult::Ambiguous(earliest, _) => Some(earliest),
        LocalResult::None => (1..=180)
            .find_map(|m| tz.from_local_datetime(&(naive + Duration::minutes(m))).earliest()),
    }
}

/// Next instant strictly after `now` at which `schedule` fires, or `None`
/// when it is disabled.
pub fn compute_next_run<Tz: TimeZone>(schedule: &ScheduleConfig, now: &DateTime<Tz>) -> Option<DateTime<Utc>> {
    if !schedule.enabled {
        return None;
    }

    let tz = now.timezone();
    let today = now.date_naive();
    let time = schedule.time.as_naive();
    let at = |date: NaiveDate| localize(&tz, date.and_time(time));
    let on_or_after = |date: NaiveDate, step_days: i64| -> Option<DateTime<Tz>> {
        let candidate = at(date)?;
        if candidate <= *now {
            at(date + Duration::days(step_days))
        } else {
            Some(candidate)
        }
    };

    let next = match schedule.mode {
        ScheduleMode::Daily => on_or_after(today, 1),
        ScheduleMode::Weekly => {
            let current = now.weekday().num_days_from_monday();
            schedule
                .effective_days()
                .into_iter()
                .filter_map(|day| {
                    let offset = (day.index() + 7 - current) % 7;
                    on_or_after(today + Duration::days(i64::from(offset)), 7)
                })
                .min()
        }
    };
    next.map(|t| t.with_timezone(&Utc))
}
