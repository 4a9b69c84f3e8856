use std::io::Write as _;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE};
use tokio::io::AsyncReadExt as _;
use url::Url;

use crate::cli::{BrowserArgs, FetchArgs, FetchEngine};
use crate::config::RetryPolicy;
use crate::error::FetchError;
use crate::formats::RawPage;

const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<RawPage, FetchError>;
}

#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Upper bound for one navigation, including rendering.
    pub timeout: Duration,
    /// How long the browser lets scripts run before the DOM is dumped.
    pub render_wait: Duration,
    /// Substrings that prove dynamic content rendered; empty disables the check.
    pub ready_markers: Vec<String>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(45),
            render_wait: Duration::from_secs(5),
            ready_markers: Vec::new(),
        }
    }
}

/// Retries navigation and render failures with backoff; the last error is
/// returned once attempts run out.
pub async fn fetch_with_retry(
    fetcher: &dyn PageFetcher,
    url: &str,
    policy: &RetryPolicy,
) -> Result<RawPage, FetchError> {
    let attempts = policy.attempts();
    let mut attempt = 0usize;
    loop {
        attempt += 1;
        match fetcher.fetch(url).await {
            Ok(page) => return Ok(page),
            Err(err) if attempt < attempts => {
                let delay = policy.backoff(attempt);
                tracing::warn!(
                    url,
                    attempt,
                    attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "fetch failed; retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

fn check_navigable(url: &str) -> Result<Url, FetchError> {
    let parsed = Url::parse(url).map_err(|err| FetchError::Navigation {
        url: url.to_owned(),
        message: format!("invalid url: {err}"),
    })?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(FetchError::Navigation {
            url: url.to_owned(),
            message: "url must be http/https".to_owned(),
        });
    }
    Ok(parsed)
}

fn check_rendered(url: &str, html: &str, ready_markers: &[String]) -> Result<(), FetchError> {
    if html.trim().is_empty() {
        return Err(FetchError::Navigation {
            url: url.to_owned(),
            message: "empty document".to_owned(),
        });
    }
    if ready_markers.is_empty() || ready_markers.iter().any(|m| html.contains(m.as_str())) {
        return Ok(());
    }
    Err(FetchError::RenderTimeout {
        url: url.to_owned(),
    })
}

/// Static fetch for listings that render server-side.
pub struct HttpFetcher {
    client: reqwest::Client,
    ready_markers: Vec<String>,
}

impl HttpFetcher {
    pub fn new(options: &FetchOptions) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(options.timeout)
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .context("build page fetch http client")?;
        Ok(Self {
            client,
            ready_markers: options.ready_markers.clone(),
        })
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<RawPage, FetchError> {
        let parsed = check_navigable(url)?;
        let navigation = |message: String| FetchError::Navigation {
            url: url.to_owned(),
            message,
        };

        let response = self
            .client
            .get(parsed)
            .header(ACCEPT, "text/html,application/xhtml+xml;q=0.9,*/*;q=0.8")
            .header(ACCEPT_LANGUAGE, "en-US,en;q=0.5")
            .send()
            .await
            .map_err(|err| navigation(format!("GET failed: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(navigation(format!("HTTP {status}")));
        }
        let html = response
            .text()
            .await
            .map_err(|err| navigation(format!("read body: {err}")))?;

        check_rendered(url, &html, &self.ready_markers)?;
        tracing::debug!(url, bytes = html.len(), engine = "http", "fetched page");
        Ok(RawPage::new(url, html))
    }
}

/// Renders pages with a headless Chrome/Chromium process per call.
pub struct ChromeFetcher {
    bin: String,
    extra_args: Vec<String>,
    options: FetchOptions,
}

impl ChromeFetcher {
    pub fn new(bin: impl Into<String>, extra_args: Vec<String>, options: FetchOptions) -> Self {
        Self {
            bin: bin.into(),
            extra_args,
            options,
        }
    }

    fn browser_args(&self, url: &Url) -> Vec<String> {
        let mut args = self.extra_args.clone();
        args.extend(
            [
                "--headless=new",
                "--disable-gpu",
                "--no-first-run",
                "--no-default-browser-check",
                "--disable-extensions",
                "--mute-audio",
                "--hide-scrollbars",
            ]
            .map(str::to_owned),
        );
        args.push(format!("--user-agent={USER_AGENT}"));
        args.push(format!(
            "--virtual-time-budget={}",
            self.options.render_wait.as_millis()
        ));
        args.push("--dump-dom".to_owned());
        args.push(url.to_string());
        args
    }
}

#[async_trait]
impl PageFetcher for ChromeFetcher {
    async fn fetch(&self, url: &str) -> Result<RawPage, FetchError> {
        let parsed = check_navigable(url)?;
        let mut session = BrowserSession::launch(&self.bin, &self.browser_args(&parsed), url)?;
        let html = session.dump_dom(self.options.timeout).await?;
        drop(session);

        check_rendered(url, &html, &self.options.ready_markers)?;
        tracing::debug!(url, bytes = html.len(), engine = "chrome", "fetched page");
        Ok(RawPage::new(url, html))
    }
}

impl From<&BrowserArgs> for FetchOptions {
    fn from(args: &BrowserArgs) -> Self {
        Self {
            timeout: Duration::from_secs(args.fetch_timeout_secs),
            render_wait: Duration::from_millis(args.render_wait_ms),
            ready_markers: args.ready_markers.clone(),
        }
    }
}

pub fn build_fetcher(args: &BrowserArgs) -> anyhow::Result<Arc<dyn PageFetcher>> {
    let options = FetchOptions::from(args);
    Ok(match args.fetch_engine {
        FetchEngine::Chrome => Arc::new(ChromeFetcher::new(
            args.chrome_bin.clone(),
            args.chrome_args.clone(),
            options,
        )),
        FetchEngine::Http => Arc::new(HttpFetcher::new(&options)?),
    })
}

pub async fn run(args: FetchArgs) -> anyhow::Result<()> {
    let fetcher = build_fetcher(&args.browser)?;
    let policy = RetryPolicy::from(&args.retry);
    let page = fetch_with_retry(fetcher.as_ref(), &args.url, &policy)
        .await
        .with_context(|| format!("fetch {}", args.url))?;

    if args.out == "-" {
        let mut stdout = std::io::stdout().lock();
        stdout
            .write_all(page.html.as_bytes())
            .and_then(|()| stdout.flush())
            .context("write html to stdout")?;
    } else {
        let out = std::path::Path::new(&args.out);
        if let Some(parent) = out.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create output dir: {}", parent.display()))?;
        }
        std::fs::write(out, &page.html)
            .with_context(|| format!("write html: {}", out.display()))?;
    }

    tracing::info!(url = %page.url, bytes = page.html.len(), "page fetched");
    Ok(())
}

/// One browser process. Dropping the session kills the process if it is
/// still running, whichever way the fetch ends.
struct BrowserSession {
    child: tokio::process::Child,
    url: String,
}

impl BrowserSession {
    fn launch(bin: &str, args: &[String], url: &str) -> Result<Self, FetchError> {
        let child = tokio::process::Command::new(bin)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| FetchError::Navigation {
                url: url.to_owned(),
                message: format!("spawn browser {bin}: {err}"),
            })?;
        tracing::debug!(bin, url, pid = ?child.id(), "browser session opened");
        Ok(Self {
            child,
            url: url.to_owned(),
        })
    }

    async fn dump_dom(&mut self, timeout: Duration) -> Result<String, FetchError> {
        let url = self.url.clone();
        let navigation = |message: String| FetchError::Navigation {
            url: url.clone(),
            message,
        };

        let mut stdout = self
            .child
            .stdout
            .take()
            .ok_or_else(|| navigation("browser stdout unavailable".to_owned()))?;

        let run = async {
            let mut html = String::new();
            stdout
                .read_to_string(&mut html)
                .await
                .map_err(|err| navigation(format!("read browser output: {err}")))?;
            let status = self
                .child
                .wait()
                .await
                .map_err(|err| navigation(format!("wait browser: {err}")))?;
            if !status.success() {
                return Err(navigation(format!("browser exited with {status}")));
            }
            Ok(html)
        };

        match tokio::time::timeout(timeout, run).await {
            Ok(result) => result,
            Err(_) => Err(navigation(format!(
                "page did not load within {}ms",
                timeout.as_millis()
            ))),
        }
    }
}

impl Drop for BrowserSession {
    fn drop(&mut self) {
        if matches!(self.child.try_wait(), Ok(None)) {
            let _ = self.child.start_kill();
            tracing::debug!(url = %self.url, "browser session killed");
        } else {
            tracing::debug!(url = %self.url, "browser session closed");
        }
    }
}
