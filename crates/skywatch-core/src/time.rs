use chrono::{DateTime, Days, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, de};

const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M"];

/// Parses collector timestamps: RFC 3339 with `Z` or an offset, a space or
/// `T` separator, naive date-times (taken as UTC) and bare dates (midnight UTC).
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let raw = value.trim();
    if raw.is_empty() {
        return None;
    }

    let normalized = if raw.len() > 10 && raw.as_bytes()[10] == b' ' {
        format!("{}T{}", &raw[..10], &raw[11..])
    } else {
        raw.to_owned()
    };

    if let Ok(parsed) = DateTime::parse_from_rfc3339(&normalized) {
        return Some(parsed.with_timezone(&Utc));
    }

    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(&normalized, format) {
            return Some(naive.and_utc());
        }
    }

    NaiveDate::parse_from_str(&normalized, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Serde hook for collector timestamps; accepts everything [`parse_timestamp`] does.
pub(crate) fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw)
        .ok_or_else(|| de::Error::custom(format!("unrecognized timestamp '{raw}'")))
}

/// Like [`deserialize_timestamp`], with `null` and blank strings as `None`.
pub(crate) fn deserialize_optional_timestamp<'de, D>(
    deserializer: D,
) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let Some(raw) = Option::<String>::deserialize(deserializer)? else {
        return Ok(None);
    };
    if raw.trim().is_empty() {
        return Ok(None);
    }
    parse_timestamp(&raw)
        .map(Some)
        .ok_or_else(|| de::Error::custom(format!("unrecognized timestamp '{raw}'")))
}

/// `days` calendar days ending at `anchor`, inclusive: `anchor - days < d <= anchor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportWindow {
    pub anchor: NaiveDate,
    pub days: u32,
}

impl ReportWindow {
    pub fn new(anchor: NaiveDate, days: u32) -> Self {
        Self { anchor, days }
    }

    /// Exclusive lower bound.
    pub fn start(&self) -> NaiveDate {
        self.anchor
            .checked_sub_days(Days::new(u64::from(self.days)))
            .unwrap_or(NaiveDate::MIN)
    }

    pub fn contains_date(&self, date: NaiveDate) -> bool {
        date > self.start() && date <= self.anchor
    }

    pub fn contains_timestamp(&self, timestamp: DateTime<Utc>) -> bool {
        self.contains_date(timestamp.date_naive())
    }
}
