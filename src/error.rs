use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("navigation failed for {url}: {message}")]
    Navigation { url: String, message: String },

    #[error("render timeout for {url}: none of the ready markers appeared")]
    RenderTimeout { url: String },
}

/// Reduction stripped every visible character from a page.
#[derive(Debug, Clone, Error)]
#[error("reduction removed all content from {url}")]
pub struct OverReductionError {
    pub url: String,
}

#[derive(Debug, Clone, Error)]
pub enum ExtractError {
    /// Transient: network failure, timeout, 5xx or 429.
    #[error("model unavailable (rate_limited={rate_limited}): {message}")]
    ModelUnavailable {
        message: String,
        rate_limited: bool,
        retry_after: Option<Duration>,
    },

    #[error("model response violates the event schema: {0}")]
    SchemaViolation(String),

    #[error("model request rejected ({status}): {message}")]
    ModelRejected { status: u16, message: String },
}

impl ExtractError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::ModelUnavailable {
            message: message.into(),
            rate_limited: false,
            retry_after: None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ModelUnavailable { .. })
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("write run output: {0}")]
    Output(#[source] anyhow::Error),

    #[error("run budget of {budget:?} exhausted after {pages} page(s)")]
    BudgetExhausted { budget: Duration, pages: usize },
}
