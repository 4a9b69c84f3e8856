use std::time::Duration;

use anyhow::Context as _;

use crate::cli::{ModelApi, RetryArgs};

pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_AZURE_API_VERSION: &str = "2024-06-01";

/// Bounded exponential backoff shared by page fetches and model calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub rate_limit_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            rate_limit_delay: Duration::from_secs(20),
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16) as u32;
        self.base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay)
    }

    /// A server-sent `Retry-After` is honoured up to the larger of
    /// `max_delay` and `rate_limit_delay`.
    pub fn rate_limit_backoff(&self, attempt: usize, retry_after: Option<Duration>) -> Duration {
        let floor = self.rate_limit_delay.max(self.backoff(attempt));
        let ceiling = self.max_delay.max(self.rate_limit_delay);
        retry_after.map_or(floor, |after| after.clamp(floor, ceiling))
    }

    pub fn attempts(&self) -> usize {
        self.max_attempts.max(1)
    }
}

impl From<&RetryArgs> for RetryPolicy {
    fn from(args: &RetryArgs) -> Self {
        Self {
            max_attempts: args.max_attempts,
            base_delay: Duration::from_millis(args.retry_base_delay_ms),
            max_delay: Duration::from_millis(args.retry_max_delay_ms),
            rate_limit_delay: Duration::from_millis(args.rate_limit_delay_ms),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub api: ModelApi,
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
    pub timeout: Duration,
}

impl ModelConfig {
    /// Reads credentials for `api` from the environment.
    ///
    /// - responses: `OPENAI_API_KEY`, optional `OPENAI_BASE_URL`
    /// - azure-chat: `AZURE_OPENAI_API_KEY`, `AZURE_OPENAI_ENDPOINT`; `model` is
    ///   the deployment name.
    pub fn from_env(
        api: ModelApi,
        model: &str,
        azure_api_version: &str,
        temperature: f32,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let (api_key, endpoint) = match api {
            ModelApi::Responses => {
                let api_key = std::env::var("OPENAI_API_KEY")
                    .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY is not set"))?;
                let base_url = std::env::var("OPENAI_BASE_URL")
                    .unwrap_or_else(|_| DEFAULT_OPENAI_BASE_URL.to_owned());
                (api_key, crate::openai::responses_endpoint(&base_url))
            }
            ModelApi::AzureChat => {
                let api_key = std::env::var("AZURE_OPENAI_API_KEY")
                    .map_err(|_| anyhow::anyhow!("AZURE_OPENAI_API_KEY is not set"))?;
                let resource = std::env::var("AZURE_OPENAI_ENDPOINT")
                    .map_err(|_| anyhow::anyhow!("AZURE_OPENAI_ENDPOINT is not set"))?;
                let endpoint =
                    crate::openai::azure_chat_endpoint(&resource, model, azure_api_version)
                        .context("build azure chat endpoint")?;
                (api_key, endpoint)
            }
        };

        Ok(Self {
            api,
            endpoint,
            api_key,
            model: model.to_owned(),
            temperature,
            timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            rate_limit_delay: Duration::from_secs(2),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(350));
        assert_eq!(policy.backoff(60), Duration::from_millis(350));
    }

    #[test]
    fn rate_limits_wait_longer_and_honour_retry_after() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.rate_limit_backoff(1, None), Duration::from_secs(20));
        assert_eq!(
            policy.rate_limit_backoff(1, Some(Duration::from_secs(25))),
            Duration::from_secs(25)
        );
        assert!(policy.rate_limit_backoff(1, None) > policy.backoff(1));
    }

    #[test]
    fn retry_after_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.rate_limit_backoff(1, Some(Duration::from_secs(3600))),
            Duration::from_secs(30)
        );
        let slow_floor = RetryPolicy {
            rate_limit_delay: Duration::from_secs(60),
            ..RetryPolicy::default()
        };
        assert_eq!(
            slow_floor.rate_limit_backoff(1, Some(Duration::from_secs(3600))),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn zero_attempts_still_tries_once() {
        let policy = RetryPolicy {
            max_attempts: 0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.attempts(), 1);
    }
}
