use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::RETRY_AFTER;

use crate::cli::ModelApi;
use crate::config::ModelConfig;
use crate::error::ExtractError;
use crate::extract::ModelClient;

pub fn responses_endpoint(base_url: &str) -> String {
    let base_url = base_url.trim_end_matches('/');
    format!("{base_url}/responses")
}

pub fn azure_chat_endpoint(
    resource: &str,
    deployment: &str,
    api_version: &str,
) -> anyhow::Result<String> {
    let resource = resource.trim_end_matches('/');
    let endpoint = format!(
        "{resource}/openai/deployments/{deployment}/chat/completions?api-version={api_version}"
    );
    url::Url::parse(&endpoint).with_context(|| format!("parse azure endpoint: {endpoint}"))?;
    Ok(endpoint)
}

/// Hosted model client for the OpenAI Responses API and Azure OpenAI chat
/// completions. Both ask for a JSON object reply.
pub struct OpenAiClient {
    client: reqwest::Client,
    config: ModelConfig,
}

impl OpenAiClient {
    pub fn new(config: ModelConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("build model http client")?;
        Ok(Self { client, config })
    }

    fn request_body(&self, instructions: &str, input: &str) -> serde_json::Value {
        let config = &self.config;
        let mut body = match config.api {
            ModelApi::Responses => serde_json::json!({
                "model": config.model,
                "instructions": instructions,
                "input": input,
                "text": { "format": { "type": "json_object" } },
                "store": false,
            }),
            ModelApi::AzureChat => serde_json::json!({
                "messages": [
                    { "role": "system", "content": instructions },
                    { "role": "user", "content": input },
                ],
                "response_format": { "type": "json_object" },
            }),
        };

        // NOTE: GPT-5 family models reject sampling params like `temperature`.
        if !config.model.starts_with("gpt-5")
            && let Some(obj) = body.as_object_mut()
        {
            obj.insert(
                "temperature".to_owned(),
                serde_json::json!(config.temperature),
            );
        }
        body
    }
}

#[async_trait]
impl ModelClient for OpenAiClient {
    async fn complete(&self, instructions: &str, input: &str) -> Result<String, ExtractError> {
        let endpoint = &self.config.endpoint;
        let body = self.request_body(instructions, input);

        let request = self.client.post(endpoint).json(&body);
        let request = match self.config.api {
            ModelApi::Responses => request.bearer_auth(&self.config.api_key),
            ModelApi::AzureChat => request.header("api-key", &self.config.api_key),
        };

        let response = request
            .send()
            .await
            .map_err(|err| ExtractError::unavailable(format!("POST {endpoint}: {err}")))?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let raw = response
            .text()
            .await
            .map_err(|err| ExtractError::unavailable(format!("read model response: {err}")))?;

        if !status.is_success() {
            let message = parse_error_message(&raw).unwrap_or(raw);
            return Err(classify_status(status, message, retry_after));
        }

        let value: serde_json::Value = serde_json::from_str(&raw).map_err(|err| {
            ExtractError::SchemaViolation(format!("model response is not JSON: {err}"))
        })?;
        let text = match self.config.api {
            ModelApi::Responses => extract_output_text(&value),
            ModelApi::AzureChat => extract_chat_content(&value),
        }
        .map_err(|err| ExtractError::SchemaViolation(format!("{err:#}")))?;

        tracing::debug!(
            api = ?self.config.api,
            model = %self.config.model,
            chars = text.len(),
            "model replied"
        );
        Ok(text)
    }
}

fn classify_status(
    status: StatusCode,
    message: String,
    retry_after: Option<Duration>,
) -> ExtractError {
    let message = format!("API error ({status}): {message}");
    if status == StatusCode::TOO_MANY_REQUESTS {
        return ExtractError::ModelUnavailable {
            message,
            rate_limited: true,
            retry_after,
        };
    }
    if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        return ExtractError::ModelUnavailable {
            message,
            rate_limited: false,
            retry_after,
        };
    }
    ExtractError::ModelRejected {
        status: status.as_u16(),
        message,
    }
}

fn parse_error_message(raw_json: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(raw_json).ok()?;
    let message = value.get("error")?.get("message")?.as_str()?.to_owned();
    Some(message)
}

fn extract_output_text(value: &serde_json::Value) -> anyhow::Result<String> {
    let output = value
        .get("output")
        .and_then(|v| v.as_array())
        .ok_or_else(|| anyhow::anyhow!("missing `output` array in response"))?;

    let mut text = String::new();
    for item in output {
        if item.get("type").and_then(|v| v.as_str()) != Some("message") {
            continue;
        }
        let Some(content) = item.get("content").and_then(|v| v.as_array()) else {
            continue;
        };
        for part in content {
            if part.get("type").and_then(|v| v.as_str()) != Some("output_text") {
                continue;
            }
            if let Some(part_text) = part.get("text").and_then(|v| v.as_str()) {
                text.push_str(part_text);
            }
        }
    }

    if text.trim().is_empty() {
        anyhow::bail!("model output text is empty");
    }
    Ok(text)
}

fn extract_chat_content(value: &serde_json::Value) -> anyhow::Result<String> {
    let content = value
        .pointer("/choices/0/message/content")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("missing `choices[0].message.content` in response"))?;
    if content.trim().is_empty() {
        anyhow::bail!("model message content is empty");
    }
    Ok(content.to_owned())
}
