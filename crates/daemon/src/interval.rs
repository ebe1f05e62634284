use chrono::{DateTime, TimeZone, Utc};
use rand::Rng;
use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;

use crate::error::ScheduleError;

/// The commit grid: every `k * period + offset` after the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    period: Duration,
    offset: Duration,
}

impl Schedule {
    /// Build a schedule. When `offset` is `None` it is drawn once from
    /// `[0.05 * period, 0.95 * period)`.
    pub fn new(period: Duration, offset: Option<Duration>) -> Result<Self, ScheduleError> {
        Self::with_rng(period, offset, &mut rand::thread_rng())
    }

    pub fn with_rng<R: Rng + ?Sized>(
        period: Duration,
        offset: Option<Duration>,
        rng: &mut R,
    ) -> Result<Self, ScheduleError> {
        let period_ms = period.as_millis();
        if period_ms == 0 {
            return Err(ScheduleError::ZeroPeriod);
        }

        let offset = match offset {
            Some(offset) => {
                if offset >= period {
                    return Err(ScheduleError::OffsetOutOfRange { offset, period });
                }
                offset
            }
            None => random_offset(period, rng),
        };

        Ok(Self { period, offset })
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn offset(&self) -> Duration {
        self.offset
    }

    /// Smallest grid instant strictly after `now`.
    pub fn next_trigger(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let period = self.period_ms();
        let offset = self.offset_ms();
        let t = now.timestamp_millis();

        // `base` is the last grid point at or before `t`
        let base = (t - offset).div_euclid(period) * period + offset;
        millis_to_datetime(base + period)
    }

    /// Number of grid instants in the closed range `[from, to]`.
    pub fn intervals_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> u64 {
        if to < from {
            return 0;
        }
        let period = self.period_ms();
        let offset = self.offset_ms();
        let last_at_or_before = |t: i64| (t - offset).div_euclid(period);
        // Grid index of the first point >= from
        let first = {
            let from_ms = from.timestamp_millis();
            let idx = last_at_or_before(from_ms);
            if idx * period + offset == from_ms {
                idx
            } else {
                idx + 1
            }
        };
        let last = last_at_or_before(to.timestamp_millis());
        (last - first + 1).max(0) as u64
    }

    fn period_ms(&self) -> i64 {
        self.period.as_millis() as i64
    }

    fn offset_ms(&self) -> i64 {
        self.offset.as_millis() as i64
    }
}

fn random_offset<R: Rng + ?Sized>(period: Duration, rng: &mut R) -> Duration {
    let period_ms = period.as_millis() as u64;
    let low = period_ms / 20;
    let high = period_ms - period_ms / 20;
    if high <= low {
        return Duration::from_millis(low);
    }
    Duration::from_millis(rng.gen_range(low..high))
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn duration_component_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+)\s*([dhms]?)").unwrap())
}

/// Parse `90`, `3m5s`, `1h`, `1d 2h` and similar. Units are d, h, m, s; a
/// bare number means seconds.
pub fn parse_duration(input: &str) -> Result<Duration, ScheduleError> {
    let invalid = || ScheduleError::InvalidDuration(input.to_string());
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(invalid());
    }

    let re = duration_component_re();
    let mut total: u64 = 0;
    let mut consumed = 0;
    for caps in re.captures_iter(trimmed) {
        let whole = caps.get(0).ok_or_else(invalid)?;
        // Only whitespace may separate components
        if !trimmed[consumed..whole.start()].trim().is_empty() {
            return Err(invalid());
        }
        consumed = whole.end();

        let value: u64 = caps[1].parse().map_err(|_| invalid())?;
        let unit = match &caps[2] {
            "d" => 86_400,
            "h" => 3_600,
            "m" => 60,
            _ => 1,
        };
        total = value
            .checked_mul(unit)
            .and_then(|v| total.checked_add(v))
            .ok_or_else(invalid)?;
    }

    if consumed == 0 || !trimmed[consumed..].trim().is_empty() {
        return Err(invalid());
    }

    Ok(Duration::from_secs(total))
}
