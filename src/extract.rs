use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::{Map, Value};
use url::Url;

use crate::cli::{ExtractArgs, ModelArgs, RetryArgs};
use crate::config::{ModelConfig, RetryPolicy};
use crate::error::ExtractError;
use crate::formats::{EventRecord, Price, RawPage, ReducedContent};
use crate::normalize;
use crate::openai::OpenAiClient;
use crate::results::RunResult;
use crate::run::OutputSink;

#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(&self, instructions: &str, input: &str) -> Result<String, ExtractError>;
}

/// The fixed field contract sent with every extraction call.
#[derive(Debug, Clone)]
pub struct ExtractionSchema {
    pub instructions: String,
}

impl Default for ExtractionSchema {
    fn default() -> Self {
        Self {
            instructions: "You extract event listings from the text of a ticketing search results page.\n\
\n\
Input:\n\
- The page URL, then the visible page text between BEGIN_LISTING and END_LISTING.\n\
- Links appear inline as <https://...> right after their text.\n\
\n\
Rules:\n\
- Report every distinct event shown in the listing, in page order.\n\
- Use only values present in the text. Do not invent events or fields.\n\
- `date` as YYYY-MM-DD when the year is visible, otherwise copy it as written.\n\
- `time` as HH:MM (24h) when shown; omit it otherwise.\n\
- `price` as written including the currency symbol (lowest price for ranges); omit when not shown.\n\
- `url` is the link to the event or its tickets.\n\
\n\
Output:\n\
- Output ONLY a single JSON object (no markdown fences, no commentary).\n\
- Schema:\n\
  {\"events\":[{\"name\":\"...\",\"venue\":\"...\",\"date\":\"...\",\"time\":\"...\",\"price\":\"...\",\"url\":\"...\"}]}\n"
                .to_owned(),
        }
    }
}

impl ExtractionSchema {
    pub fn render_input(&self, content: &ReducedContent) -> String {
        format!(
            "Page URL: {url}\n\nBEGIN_LISTING\n{text}\nEND_LISTING\n",
            url = content.url,
            text = content.text.trim_end(),
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub records: Vec<EventRecord>,
    /// Candidates rejected by field validation.
    pub dropped: usize,
}

pub struct ExtractionAgent {
    model: Arc<dyn ModelClient>,
    retry: RetryPolicy,
}

impl ExtractionAgent {
    pub fn new(model: Arc<dyn ModelClient>, retry: RetryPolicy) -> Self {
        Self { model, retry }
    }

    pub async fn extract(
        &self,
        content: &ReducedContent,
        schema: &ExtractionSchema,
    ) -> Result<Extraction, ExtractError> {
        let input = schema.render_input(content);
        let attempts = self.retry.attempts();
        let mut attempt = 0usize;

        let raw = loop {
            attempt += 1;
            match self.model.complete(&schema.instructions, &input).await {
                Ok(raw) => break raw,
                Err(ExtractError::ModelUnavailable {
                    message,
                    rate_limited,
                    retry_after,
                }) if attempt < attempts => {
                    let delay = if rate_limited {
                        self.retry.rate_limit_backoff(attempt, retry_after)
                    } else {
                        self.retry.backoff(attempt)
                    };
                    tracing::warn!(
                        url = %content.url,
                        attempt,
                        attempts,
                        rate_limited,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "model unavailable; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        };

        parse_candidates(&raw, content)
    }
}

pub fn build_agent(model: &ModelArgs, retry: &RetryArgs) -> anyhow::Result<ExtractionAgent> {
    let config = ModelConfig::from_env(
        model.model_api,
        &model.model,
        &model.azure_api_version,
        model.temperature,
        Duration::from_secs(model.model_timeout_secs),
    )
    .context("load model config")?;
    let client = OpenAiClient::new(config)?;
    Ok(ExtractionAgent::new(Arc::new(client), RetryPolicy::from(retry)))
}

/// Runs one saved page through reduction and extraction.
pub async fn run(args: ExtractArgs) -> anyhow::Result<()> {
    let sink = match &args.out {
        Some(out) => OutputSink::from_arg(out, args.force)?,
        None => OutputSink::Stdout,
    };
    let html = std::fs::read_to_string(&args.html)
        .with_context(|| format!("read html: {}", args.html))?;
    let page = RawPage::new(args.url.as_str(), html);
    let content = crate::reduce::reduce(&page, args.max_chars).unwrap_or_else(|err| {
        tracing::warn!(error = %err, "over-reduction; using unreduced page");
        ReducedContent::unreduced(&page, args.max_chars)
    });

    let agent = build_agent(&args.model, &args.retry)?;
    let extraction = agent
        .extract(&content, &ExtractionSchema::default())
        .await
        .with_context(|| format!("extract events from {}", args.url))?;
    tracing::info!(
        records = extraction.records.len(),
        dropped = extraction.dropped,
        "records extracted"
    );

    let mut result = RunResult::new();
    for record in extraction.records {
        result.merge(record);
    }
    sink.write(&result)
}

/// Converts an untrusted model reply into validated records. Candidates that
/// fail a required-field check are dropped; a reply that is not the expected
/// shape at all is a schema violation.
pub fn parse_candidates(raw: &str, content: &ReducedContent) -> Result<Extraction, ExtractError> {
    let json = locate_json(raw)?;
    let value: Value = serde_json::from_str(json)
        .map_err(|err| ExtractError::SchemaViolation(format!("invalid JSON: {err}")))?;
    let candidates = candidate_list(value)?;

    let base = Url::parse(&content.url).ok();
    let reference = content.fetched_at.date_naive();

    let mut extraction = Extraction::default();
    for (index, candidate) in candidates.into_iter().enumerate() {
        let Value::Object(fields) = candidate else {
            tracing::warn!(url = %content.url, index, "candidate dropped: not an object");
            extraction.dropped += 1;
            continue;
        };
        match validate_candidate(&fields, base.as_ref(), reference) {
            Ok(record) => extraction.records.push(record),
            Err(reason) => {
                tracing::warn!(
                    url = %content.url,
                    index,
                    name = ?text_field(&fields, NAME_KEYS),
                    reason = %reason,
                    "candidate dropped"
                );
                extraction.dropped += 1;
            }
        }
    }
    Ok(extraction)
}

fn locate_json(text: &str) -> Result<&str, ExtractError> {
    let start = text
        .find(['{', '['])
        .ok_or_else(|| ExtractError::SchemaViolation("no JSON document in reply".to_owned()))?;
    let closer = if text[start..].starts_with('{') {
        '}'
    } else {
        ']'
    };
    let end = text
        .rfind(closer)
        .filter(|end| *end > start)
        .ok_or_else(|| ExtractError::SchemaViolation("unterminated JSON document".to_owned()))?;
    Ok(&text[start..=end])
}

fn candidate_list(value: Value) -> Result<Vec<Value>, ExtractError> {
    match value {
        Value::Array(items) => Ok(items),
        Value::Object(mut obj) => {
            if let Some(events) = obj.remove("events") {
                return match events {
                    Value::Array(items) => Ok(items),
                    Value::Null => Ok(Vec::new()),
                    other => Err(ExtractError::SchemaViolation(format!(
                        "`events` is not an array: {other}"
                    ))),
                };
            }
            if NAME_KEYS.iter().any(|k| obj.contains_key(*k)) {
                return Ok(vec![Value::Object(obj)]);
            }
            let mut arrays = obj
                .into_iter()
                .filter_map(|(_, v)| match v {
                    Value::Array(items) => Some(items),
                    _ => None,
                })
                .collect::<Vec<_>>();
            if arrays.len() == 1 {
                return Ok(arrays.remove(0));
            }
            Err(ExtractError::SchemaViolation(
                "reply has no `events` array".to_owned(),
            ))
        }
        other => Err(ExtractError::SchemaViolation(format!(
            "reply is neither an object nor an array: {other}"
        ))),
    }
}

const NAME_KEYS: &[&str] = &["name", "title", "event_name", "event"];
const VENUE_KEYS: &[&str] = &["venue", "venue_name", "location"];
const DATE_KEYS: &[&str] = &["date", "start_date", "datetime", "start"];
const TIME_KEYS: &[&str] = &["time", "start_time"];
const PRICE_KEYS: &[&str] = &["price", "min_price", "price_from"];
const URL_KEYS: &[&str] = &["url", "link", "href", "ticket_url", "event_url"];

fn validate_candidate(
    fields: &Map<String, Value>,
    base: Option<&Url>,
    reference: NaiveDate,
) -> Result<EventRecord, String> {
    let name = text_field(fields, NAME_KEYS).ok_or("missing name")?;
    let venue = venue_field(fields).ok_or("missing venue")?;
    let raw_date = text_field(fields, DATE_KEYS).ok_or("missing date")?;
    let raw_url = text_field(fields, URL_KEYS).ok_or("missing url")?;

    let (date, datetime_time) = normalize::parse_date(&raw_date, reference)
        .ok_or_else(|| format!("unparseable date {raw_date:?}"))?;
    let url = canonical_link(&raw_url, base).ok_or_else(|| format!("invalid url {raw_url:?}"))?;

    let time = match text_field(fields, TIME_KEYS) {
        Some(raw_time) => {
            let parsed = normalize::parse_time(&raw_time);
            if parsed.is_none() {
                tracing::warn!(name = %name, time = %raw_time, "unparseable time omitted");
            }
            parsed.or(datetime_time)
        }
        None => datetime_time,
    };

    let price = price_field(fields);
    let price = match (price, text_field(fields, &["currency"])) {
        (Some(mut price), Some(currency)) if price.currency.is_none() => {
            price.currency = normalize::normalize_currency(&currency);
            Some(price)
        }
        (price, _) => price,
    };

    Ok(EventRecord {
        name,
        venue,
        date,
        time,
        price,
        url,
    })
}

fn text_field(fields: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match fields.get(*key)? {
        Value::String(s) => {
            let collapsed = s.split_whitespace().collect::<Vec<_>>().join(" ");
            (!collapsed.is_empty()).then_some(collapsed)
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn venue_field(fields: &Map<String, Value>) -> Option<String> {
    for key in VENUE_KEYS {
        match fields.get(*key) {
            Some(Value::Object(venue)) => {
                if let Some(name) = text_field(venue, &["name"]) {
                    return Some(name);
                }
            }
            Some(_) => {
                if let Some(name) = text_field(fields, &[*key]) {
                    return Some(name);
                }
            }
            None => {}
        }
    }
    None
}

fn price_field(fields: &Map<String, Value>) -> Option<Price> {
    for key in PRICE_KEYS {
        match fields.get(*key) {
            Some(Value::Number(n)) => {
                if let Some(amount) = n.as_f64() {
                    return Some(Price {
                        amount,
                        currency: None,
                    });
                }
            }
            Some(Value::String(raw)) if !raw.trim().is_empty() => {
                let parsed = normalize::parse_price(raw);
                if parsed.is_none() {
                    tracing::warn!(price = %raw, "unparseable price omitted");
                }
                return parsed;
            }
            _ => {}
        }
    }

    // Category → price map, e.g. {"GA": "$30", "VIP": "$80"}.
    let Some(Value::Object(categories)) = fields.get("ticket_prices") else {
        return None;
    };
    categories
        .values()
        .filter_map(|v| match v {
            Value::Number(n) => n.as_f64().map(|amount| Price {
                amount,
                currency: None,
            }),
            Value::String(s) => normalize::parse_price(s),
            _ => None,
        })
        .min_by(|a, b| a.amount.total_cmp(&b.amount))
}

/// Accepts absolute http(s) links or path/query references resolved against
/// the page URL; free text such as "not available" is rejected.
fn canonical_link(raw: &str, base: Option<&Url>) -> Option<String> {
    let raw = raw.trim().trim_start_matches('<').trim_end_matches('>');
    let is_reference = ["/", "./", "../", "?"]
        .iter()
        .any(|prefix| raw.starts_with(prefix));
    let mut url = match Url::parse(raw) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) if is_reference => base?.join(raw).ok()?,
        Err(_) => return None,
    };
    if url.scheme() != "http" && url.scheme() != "https" {
        return None;
    }
    url.set_fragment(None);
    Some(url.to_string())
}
