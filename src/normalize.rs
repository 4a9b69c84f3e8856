//! Field-level normalization for model-reported event values.
//!
//! Every function here takes the loosely formatted strings a model echoes back
//! from a listing page and returns the canonical value, or `None` when the
//! input cannot be understood.

use chrono::{Datelike as _, NaiveDate, NaiveDateTime, NaiveTime, Timelike as _};

use crate::formats::Price;

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%m/%d/%Y",
    "%m-%d-%Y",
    "%B %d %Y",
    "%b %d %Y",
    "%d %B %Y",
    "%d %b %Y",
];

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
];

const YEARLESS_DATE_FORMATS: &[&str] = &["%B %d %Y", "%b %d %Y", "%d %B %Y", "%d %b %Y"];

const WEEKDAYS: &[&str] = &[
    "monday",
    "tuesday",
    "wednesday",
    "thursday",
    "friday",
    "saturday",
    "sunday",
    "mon",
    "tue",
    "tues",
    "wed",
    "thu",
    "thur",
    "thurs",
    "fri",
    "sat",
    "sun",
];

/// Parses a date, optionally carrying a time when the input was a datetime
/// or a date followed by a time ("Sat, Nov 7 • 9:00 PM").
///
/// Year-less dates ("Oct 18") resolve to the next occurrence on or after
/// `reference`. Times are kept to the minute.
pub fn parse_date(raw: &str, reference: NaiveDate) -> Option<(NaiveDate, Option<NaiveTime>)> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(trimmed) {
        let local = dt.naive_local();
        return Some((local.date(), Some(minute_precision(local.time()))));
    }
    for format in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some((dt.date(), Some(minute_precision(dt.time()))));
        }
    }

    // Longest word prefix that reads as a date; any remainder must be a time.
    let words = date_words(trimmed);
    for split in (1..=words.len()).rev() {
        let (date_part, time_part) = words.split_at(split);
        let time = if time_part.is_empty() {
            None
        } else {
            match parse_time(&time_part.join(" ")) {
                Some(time) => Some(time),
                None => continue,
            }
        };
        if let Some(date) = parse_calendar_date(&date_part.join(" "), reference) {
            return Some((date, time));
        }
    }

    None
}

fn parse_calendar_date(text: &str, reference: NaiveDate) -> Option<NaiveDate> {
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(text, format) {
            return Some(date);
        }
    }

    let with_year = format!("{text} {}", reference.year());
    for format in YEARLESS_DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(&with_year, format) {
            if date >= reference {
                return Some(date);
            }
            return date.with_year(reference.year() + 1);
        }
    }
    None
}

/// Splits on separators and drops weekday names and "at" connectives.
fn date_words(raw: &str) -> Vec<String> {
    raw.replace(['•', '·', '|', ',', '@'], " ")
        .split_whitespace()
        .filter(|word| {
            let lowered = word.trim_end_matches('.').to_ascii_lowercase();
            lowered != "at" && !WEEKDAYS.contains(&lowered.as_str())
        })
        .map(|word| title_case(strip_ordinal_suffix(word)))
        .collect()
}

fn title_case(word: &str) -> String {
    if !word.chars().all(|c| c.is_ascii_alphabetic()) {
        return word.to_owned();
    }
    let lowered = word.to_ascii_lowercase();
    let mut chars = lowered.chars();
    match chars.next() {
        Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
        None => lowered,
    }
}

fn minute_precision(time: NaiveTime) -> NaiveTime {
    NaiveTime::from_hms_opt(time.hour(), time.minute(), 0).unwrap_or(time)
}

fn strip_ordinal_suffix(word: &str) -> &str {
    for suffix in ["st", "nd", "rd", "th"] {
        if let Some(head) = word.strip_suffix(suffix)
            && !head.is_empty()
            && head.chars().all(|c| c.is_ascii_digit())
        {
            return head;
        }
    }
    word
}

pub fn parse_time(raw: &str) -> Option<NaiveTime> {
    let cleaned = raw
        .trim()
        .to_ascii_uppercase()
        .replace("A.M.", "AM")
        .replace("P.M.", "PM")
        .replace('.', ":");
    if cleaned.is_empty() {
        return None;
    }

    for format in ["%H:%M", "%H:%M:%S", "%I:%M %p", "%I:%M%p", "%I %p", "%I%p"] {
        if let Ok(time) = NaiveTime::parse_from_str(&cleaned, format) {
            return Some(minute_precision(time));
        }
    }
    None
}

const SYMBOLS: &[(&str, &str)] = &[
    ("US$", "USD"),
    ("CA$", "CAD"),
    ("A$", "AUD"),
    ("$", "USD"),
    ("€", "EUR"),
    ("£", "GBP"),
    ("¥", "JPY"),
];

const CODES: &[&str] = &[
    "USD", "EUR", "GBP", "CAD", "AUD", "JPY", "CHF", "SEK", "NOK", "DKK", "NZD", "MXN",
];

/// Parses a price string into an amount and, when a currency symbol or code is
/// present, its ISO-4217 code. Ranges keep the lowest amount.
pub fn parse_price(raw: &str) -> Option<Price> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.eq_ignore_ascii_case("free") {
        return Some(Price {
            amount: 0.0,
            currency: None,
        });
    }

    let upper = trimmed.to_ascii_uppercase();
    let currency = SYMBOLS
        .iter()
        .find(|(symbol, _)| trimmed.contains(symbol))
        .map(|(_, code)| (*code).to_owned())
        .or_else(|| {
            CODES
                .iter()
                .find(|code| upper.contains(*code))
                .map(|code| (*code).to_owned())
        });

    let amount = numeric_tokens(trimmed)
        .into_iter()
        .filter_map(|token| parse_amount(&token))
        .fold(None, |lowest: Option<f64>, value| match lowest {
            Some(current) if current <= value => Some(current),
            _ => Some(value),
        })?;

    Some(Price { amount, currency })
}

pub fn normalize_currency(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if let Some((_, code)) = SYMBOLS.iter().find(|(symbol, _)| trimmed == *symbol) {
        return Some((*code).to_owned());
    }
    if trimmed.len() == 3 && trimmed.chars().all(|c| c.is_ascii_alphabetic()) {
        return Some(trimmed.to_ascii_uppercase());
    }
    None
}

fn numeric_tokens(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    for ch in input.chars() {
        if ch.is_ascii_digit() || ((ch == '.' || ch == ',') && !current.is_empty()) {
            current.push(ch);
        } else if !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

fn parse_amount(token: &str) -> Option<f64> {
    let token = token.trim_end_matches(['.', ',']);
    let last_dot = token.rfind('.');
    let last_comma = token.rfind(',');

    let normalized = match (last_dot, last_comma) {
        (Some(dot), Some(comma)) if comma > dot => token.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => token.replace(',', ""),
        (None, Some(comma)) if token.len() - comma - 1 == 2 => token.replace(',', "."),
        (None, Some(_)) => token.replace(',', ""),
        _ => token.to_owned(),
    };
    normalized.parse::<f64>().ok().filter(|v| v.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn parses_common_listing_date_shapes() {
        let reference = day(2026, 10, 18);
        for raw in [
            "2026-11-07",
            "Nov 7, 2026",
            "November 7th, 2026",
            "Sat, Nov 7, 2026",
            "Saturday • November 7 2026",
            "7 Nov 2026",
            "11/07/2026",
            "2026/11/07",
        ] {
            let (date, time) = parse_date(raw, reference).unwrap_or_else(|| panic!("{raw}"));
            assert_eq!(date, day(2026, 11, 7), "{raw}");
            assert_eq!(time, None, "{raw}");
        }
    }

    #[test]
    fn datetime_input_carries_time() {
        let (date, time) = parse_date("2026-11-07T21:30:00", day(2026, 1, 1)).unwrap();
        assert_eq!(date, day(2026, 11, 7));
        assert_eq!(time, NaiveTime::from_hms_opt(21, 30, 0));
    }

    #[test]
    fn datetimes_are_kept_to_the_minute() {
        let reference = day(2026, 1, 1);
        let (_, time) = parse_date("2026-11-07T21:30:45", reference).unwrap();
        assert_eq!(time, NaiveTime::from_hms_opt(21, 30, 0));
        let (_, time) = parse_date("2026-11-07T21:30:45.250+01:00", reference).unwrap();
        assert_eq!(time, NaiveTime::from_hms_opt(21, 30, 0));
        assert_eq!(parse_time("20:15:30"), NaiveTime::from_hms_opt(20, 15, 0));
    }

    #[test]
    fn date_followed_by_time_keeps_both() {
        let reference = day(2026, 10, 18);
        let nine_pm = NaiveTime::from_hms_opt(21, 0, 0);
        let eight_pm = NaiveTime::from_hms_opt(20, 0, 0);
        for (raw, time) in [
            ("Sat, Nov 7 • 9:00 PM", nine_pm),
            ("Sat, Nov 7, 2026 • 9:00 PM", nine_pm),
            ("Nov 7, 2026 8:00 PM", eight_pm),
            ("NOV 07 Sat · 8:00 PM", eight_pm),
            ("2026-11-07 20:00:00", eight_pm),
            ("November 7 at 8pm", eight_pm),
            ("11/07/2026 @ 20:00", eight_pm),
        ] {
            let parsed = parse_date(raw, reference).unwrap_or_else(|| panic!("{raw}"));
            assert_eq!(parsed, (day(2026, 11, 7), time), "{raw}");
        }
    }

    #[test]
    fn trailing_text_that_is_not_a_time_is_rejected() {
        let reference = day(2026, 10, 18);
        assert!(parse_date("Nov 7 doors open", reference).is_none());
    }

    #[test]
    fn yearless_date_rolls_to_next_occurrence() {
        let reference = day(2026, 10, 18);
        assert_eq!(parse_date("Oct 25", reference).unwrap().0, day(2026, 10, 25));
        assert_eq!(parse_date("Fri • Jan 8", reference).unwrap().0, day(2027, 1, 8));
    }

    #[test]
    fn rejects_unparseable_dates() {
        let reference = day(2026, 10, 18);
        assert!(parse_date("TBA", reference).is_none());
        assert!(parse_date("", reference).is_none());
        assert!(parse_date("2026-13-45", reference).is_none());
    }

    #[test]
    fn parses_twelve_and_twentyfour_hour_times() {
        let seven_pm = NaiveTime::from_hms_opt(19, 0, 0);
        assert_eq!(parse_time("7:00 PM"), seven_pm);
        assert_eq!(parse_time("7pm"), seven_pm);
        assert_eq!(parse_time("7:00 p.m."), seven_pm);
        assert_eq!(parse_time("19:00"), seven_pm);
        assert_eq!(parse_time("doors late"), None);
    }

    #[test]
    fn prices_keep_currency_when_symbol_present() {
        assert_eq!(
            parse_price("$45.50"),
            Some(Price {
                amount: 45.5,
                currency: Some("USD".to_owned())
            })
        );
        assert_eq!(
            parse_price("€1.250,00"),
            Some(Price {
                amount: 1250.0,
                currency: Some("EUR".to_owned())
            })
        );
        assert_eq!(
            parse_price("GBP 20"),
            Some(Price {
                amount: 20.0,
                currency: Some("GBP".to_owned())
            })
        );
    }

    #[test]
    fn prices_without_symbol_or_as_ranges() {
        assert_eq!(
            parse_price("25"),
            Some(Price {
                amount: 25.0,
                currency: None
            })
        );
        assert_eq!(parse_price("$60 - $35").map(|p| p.amount), Some(35.0));
        assert_eq!(parse_price("$1,200").map(|p| p.amount), Some(1200.0));
        assert_eq!(parse_price("Free").map(|p| p.amount), Some(0.0));
        assert_eq!(parse_price("sold out"), None);
    }

    #[test]
    fn currency_field_normalizes_codes_and_symbols() {
        assert_eq!(normalize_currency("usd").as_deref(), Some("USD"));
        assert_eq!(normalize_currency("£").as_deref(), Some("GBP"));
        assert_eq!(normalize_currency("dollars"), None);
    }
}
