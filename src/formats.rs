use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
pub struct RawPage {
    pub url: String,
    pub html: String,
    pub fetched_at: DateTime<Utc>,
}

impl RawPage {
    pub fn new(url: impl Into<String>, html: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            html: html.into(),
            fetched_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReducedContent {
    pub url: String,
    pub text: String,
    pub fetched_at: DateTime<Utc>,
    /// `true` when `text` is the raw page (over-reduction fallback).
    pub unreduced: bool,
}

impl ReducedContent {
    /// Raw page markup cut to `max_chars`, used when reduction leaves nothing.
    pub fn unreduced(page: &RawPage, max_chars: usize) -> Self {
        Self {
            url: page.url.clone(),
            text: truncate_chars(&page.html, max_chars).to_owned(),
            fetched_at: page.fetched_at,
            unreduced: true,
        }
    }
}

pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Price {
    pub amount: f64,
    pub currency: Option<String>,
}

/// A validated event. Only built by the extraction boundary or by parsing
/// previously written output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "EventRecordJson", into = "EventRecordJson")]
pub struct EventRecord {
    pub name: String,
    pub venue: String,
    pub date: NaiveDate,
    pub time: Option<NaiveTime>,
    pub price: Option<Price>,
    pub url: String,
}

impl EventRecord {
    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            name: fold_key_part(&self.name),
            venue: fold_key_part(&self.venue),
            date: self.date,
        }
    }

    /// Number of populated optional fields (time, price, currency).
    pub fn completeness(&self) -> usize {
        let mut count = 0;
        if self.time.is_some() {
            count += 1;
        }
        if let Some(price) = &self.price {
            count += 1;
            if price.currency.is_some() {
                count += 1;
            }
        }
        count
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub name: String,
    pub venue: String,
    pub date: NaiveDate,
}

fn fold_key_part(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EventRecordJson {
    name: String,
    venue: String,
    date: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "hhmm")]
    time: Option<NaiveTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    currency: Option<String>,
    url: String,
}

impl From<EventRecordJson> for EventRecord {
    fn from(json: EventRecordJson) -> Self {
        let price = json.price.map(|amount| Price {
            amount,
            currency: json.currency,
        });
        Self {
            name: json.name,
            venue: json.venue,
            date: json.date,
            time: json.time,
            price,
            url: json.url,
        }
    }
}

impl From<EventRecord> for EventRecordJson {
    fn from(record: EventRecord) -> Self {
        let (price, currency) = match record.price {
            Some(price) => (Some(price.amount), price.currency),
            None => (None, None),
        };
        Self {
            name: record.name,
            venue: record.venue,
            date: record.date,
            time: record.time,
            price,
            currency,
            url: record.url,
        }
    }
}

mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize as _, Deserializer, Serializer};

    const FORMAT: &str = "%H:%M";

    pub fn serialize<S: Serializer>(
        value: &Option<NaiveTime>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(time) => serializer.serialize_str(&time.format(FORMAT).to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<NaiveTime>, D::Error> {
        let Some(raw) = Option::<String>::deserialize(deserializer)? else {
            return Ok(None);
        };
        NaiveTime::parse_from_str(&raw, FORMAT)
            .or_else(|_| NaiveTime::parse_from_str(&raw, "%H:%M:%S"))
            .map(Some)
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub query: String,
    pub pages_attempted: usize,
    pub pages_fetched: usize,
    pub pages_failed: usize,
    pub extraction_failures: usize,
    pub schema_violations: usize,
    pub reduction_fallbacks: usize,
    pub candidates_dropped: usize,
    pub records_extracted: usize,
    pub duplicates_merged: usize,
    pub records_written: usize,
    pub cancelled: bool,
}
