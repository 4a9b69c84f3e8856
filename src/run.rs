use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use tokio_util::sync::CancellationToken;
use tracing::Instrument as _;

use crate::cli::RunArgs;
use crate::config::RetryPolicy;
use crate::error::{ExtractError, RunError};
use crate::extract::{ExtractionAgent, ExtractionSchema, build_agent};
use crate::fetch::{PageFetcher, build_fetcher, fetch_with_retry};
use crate::formats::{RawPage, ReducedContent, RunSummary};
use crate::reduce::{next_page_hint, reduce};
use crate::results::{MergeOutcome, RunResult};

pub const DEFAULT_URL_TEMPLATE: &str = "https://www.ticketmaster.com/search?q={query}&page={page}";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageBound {
    Max(usize),
    UntilExhausted,
}

/// The query text plus pagination state. Only the orchestrator advances it.
#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub text: String,
    pub page_index: usize,
    pub has_more: bool,
    url_template: String,
    first_page: usize,
}

impl SearchQuery {
    pub fn new(text: &str, url_template: &str, first_page: usize) -> Self {
        Self {
            text: text.to_owned(),
            page_index: 0,
            has_more: true,
            url_template: url_template.to_owned(),
            first_page,
        }
    }

    pub fn page_number(&self) -> usize {
        self.first_page + self.page_index
    }

    pub fn page_url(&self) -> String {
        let encoded = url::form_urlencoded::byte_serialize(self.text.as_bytes()).collect::<String>();
        self.url_template
            .replace("{query}", &encoded)
            .replace("{page}", &self.page_number().to_string())
    }

    fn advance(&mut self) {
        self.page_index += 1;
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub query: String,
    pub url_template: String,
    pub first_page: usize,
    pub bound: PageBound,
    pub max_chars: usize,
    pub fetch_retry: RetryPolicy,
    /// Wall-clock budget for the whole run, checked between pages.
    pub budget: Option<Duration>,
}

#[derive(Debug, Clone)]
pub enum OutputSink {
    File { path: PathBuf, force: bool },
    Stdout,
}

impl OutputSink {
    /// `-` means stdout. An existing file is refused up front unless `force`.
    pub fn from_arg(out: &str, force: bool) -> anyhow::Result<Self> {
        if out == "-" {
            return Ok(Self::Stdout);
        }
        let path = PathBuf::from(out);
        if path.exists() && !force {
            anyhow::bail!(
                "output already exists: {} (pass --force to overwrite)",
                path.display()
            );
        }
        Ok(Self::File { path, force })
    }

    pub fn write(&self, result: &RunResult) -> anyhow::Result<()> {
        let json = result.to_json_pretty().context("serialize events json")?;
        match self {
            Self::File { path, force } => {
                if let Some(parent) = path.parent()
                    && !parent.as_os_str().is_empty()
                {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("create output dir: {}", parent.display()))?;
                }

                let mut options = OpenOptions::new();
                options.write(true);
                if *force {
                    options.create(true).truncate(true);
                } else {
                    options.create_new(true);
                }
                let mut out = options
                    .open(path)
                    .with_context(|| format!("open output: {}", path.display()))?;
                out.write_all(json.as_bytes())
                    .and_then(|()| out.write_all(b"\n"))
                    .with_context(|| format!("write output: {}", path.display()))?;
                out.flush().context("flush output")?;
            }
            Self::Stdout => {
                let mut stdout = std::io::stdout().lock();
                stdout
                    .write_all(json.as_bytes())
                    .and_then(|()| stdout.write_all(b"\n"))
                    .and_then(|()| stdout.flush())
                    .context("write output to stdout")?;
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct RunOutcome {
    pub result: RunResult,
    pub summary: RunSummary,
}

enum RunState {
    Start,
    FetchingPage,
    Reducing(RawPage),
    Extracting {
        content: ReducedContent,
        next_hint: bool,
    },
    Advancing {
        next_hint: bool,
        /// The page failed before we could tell whether results continue.
        inconclusive: bool,
        yielded: usize,
    },
    Finishing,
}

pub struct Orchestrator {
    fetcher: Arc<dyn PageFetcher>,
    agent: ExtractionAgent,
    schema: ExtractionSchema,
    options: RunOptions,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        fetcher: Arc<dyn PageFetcher>,
        agent: ExtractionAgent,
        options: RunOptions,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            fetcher,
            agent,
            schema: ExtractionSchema::default(),
            options,
            cancel,
        }
    }

    pub async fn run(&self, sink: &OutputSink) -> Result<RunOutcome, RunError> {
        let run_id = uuid::Uuid::new_v4();
        let span = tracing::info_span!("run", %run_id, query = %self.options.query);
        self.drive(sink).instrument(span).await
    }

    async fn drive(&self, sink: &OutputSink) -> Result<RunOutcome, RunError> {
        let started_at = Instant::now();
        let mut query = SearchQuery::new(
            &self.options.query,
            &self.options.url_template,
            self.options.first_page,
        );
        let mut result = RunResult::new();
        let mut summary = RunSummary {
            query: self.options.query.clone(),
            ..RunSummary::default()
        };

        let mut state = RunState::Start;
        loop {
            state = match state {
                RunState::Start => {
                    tracing::info!(bound = ?self.options.bound, "run started");
                    RunState::FetchingPage
                }

                RunState::FetchingPage => {
                    let url = query.page_url();
                    summary.pages_attempted += 1;
                    match fetch_with_retry(self.fetcher.as_ref(), &url, &self.options.fetch_retry)
                        .await
                    {
                        Ok(page) => {
                            summary.pages_fetched += 1;
                            tracing::info!(
                                page = query.page_number(),
                                url = %url,
                                bytes = page.html.len(),
                                "page fetched"
                            );
                            RunState::Reducing(page)
                        }
                        Err(err) => {
                            summary.pages_failed += 1;
                            tracing::warn!(
                                page = query.page_number(),
                                url = %url,
                                error = %err,
                                "page failed"
                            );
                            RunState::Advancing {
                                next_hint: false,
                                inconclusive: true,
                                yielded: 0,
                            }
                        }
                    }
                }

                RunState::Reducing(page) => {
                    let next_hint = next_page_hint(&page);
                    let content = match reduce(&page, self.options.max_chars) {
                        Ok(content) => {
                            tracing::debug!(
                                url = %page.url,
                                html_chars = page.html.len(),
                                reduced_chars = content.text.len(),
                                "page reduced"
                            );
                            content
                        }
                        Err(err) => {
                            summary.reduction_fallbacks += 1;
                            tracing::warn!(error = %err, "over-reduction; using unreduced page");
                            ReducedContent::unreduced(&page, self.options.max_chars)
                        }
                    };
                    RunState::Extracting { content, next_hint }
                }

                RunState::Extracting { content, next_hint } => {
                    match self.agent.extract(&content, &self.schema).await {
                        Ok(extraction) => {
                            let yielded = extraction.records.len();
                            summary.candidates_dropped += extraction.dropped;
                            summary.records_extracted += yielded;
                            tracing::info!(
                                page = query.page_number(),
                                records = yielded,
                                dropped = extraction.dropped,
                                "records extracted"
                            );
                            for record in extraction.records {
                                let name = record.name.clone();
                                let outcome = result.merge(record);
                                if outcome != MergeOutcome::Inserted {
                                    summary.duplicates_merged += 1;
                                    tracing::info!(
                                        name = %name,
                                        replaced = outcome == MergeOutcome::Replaced,
                                        "duplicate merged"
                                    );
                                }
                            }
                            RunState::Advancing {
                                next_hint,
                                inconclusive: false,
                                yielded,
                            }
                        }
                        Err(err) => {
                            if matches!(err, ExtractError::SchemaViolation(_)) {
                                summary.schema_violations += 1;
                            } else {
                                summary.extraction_failures += 1;
                            }
                            tracing::warn!(
                                page = query.page_number(),
                                error = %err,
                                "extraction failed; page yields no records"
                            );
                            RunState::Advancing {
                                next_hint,
                                inconclusive: true,
                                yielded: 0,
                            }
                        }
                    }
                }

                RunState::Advancing {
                    next_hint,
                    inconclusive,
                    yielded,
                } => {
                    query.has_more = has_more_pages(
                        self.options.bound,
                        query.page_index + 1,
                        next_hint,
                        inconclusive,
                        yielded,
                    );
                    if !query.has_more {
                        RunState::Finishing
                    } else if self.cancel.is_cancelled() {
                        summary.cancelled = true;
                        tracing::warn!(pages = summary.pages_attempted, "run cancelled");
                        RunState::Finishing
                    } else if let Some(budget) = self.options.budget
                        && started_at.elapsed() >= budget
                    {
                        return Err(RunError::BudgetExhausted {
                            budget,
                            pages: summary.pages_attempted,
                        });
                    } else {
                        query.advance();
                        RunState::FetchingPage
                    }
                }

                RunState::Finishing => {
                    sink.write(&result).map_err(RunError::Output)?;
                    summary.records_written = result.len();
                    tracing::info!(
                        pages_fetched = summary.pages_fetched,
                        pages_failed = summary.pages_failed,
                        records = summary.records_written,
                        duplicates = summary.duplicates_merged,
                        dropped = summary.candidates_dropped,
                        elapsed_ms = started_at.elapsed().as_millis() as u64,
                        "run finished"
                    );
                    return Ok(RunOutcome { result, summary });
                }
            };
        }
    }
}

/// Bounded runs continue while under the bound unless a page was conclusively
/// the last one; unbounded runs only follow explicit next-page hints.
fn has_more_pages(
    bound: PageBound,
    pages_done: usize,
    next_hint: bool,
    inconclusive: bool,
    yielded: usize,
) -> bool {
    match bound {
        PageBound::Max(max) => pages_done < max && (next_hint || inconclusive || yielded > 0),
        PageBound::UntilExhausted => next_hint,
    }
}

pub async fn run(args: RunArgs, cancel: CancellationToken) -> anyhow::Result<()> {
    let sink = OutputSink::from_arg(&args.out, args.force)?;

    let options = RunOptions {
        query: args.query.clone(),
        url_template: args.url_template.clone(),
        first_page: args.first_page,
        bound: if args.until_exhausted {
            PageBound::UntilExhausted
        } else {
            PageBound::Max(args.max_pages)
        },
        max_chars: args.max_chars,
        fetch_retry: RetryPolicy::from(&args.retry),
        budget: args.run_budget_secs.map(Duration::from_secs),
    };
    let fetcher = build_fetcher(&args.browser)?;
    let agent = build_agent(&args.model, &args.retry)?;

    let outcome = Orchestrator::new(fetcher, agent, options, cancel)
        .run(&sink)
        .await?;

    if let Some(path) = args.summary {
        let json =
            serde_json::to_string_pretty(&outcome.summary).context("serialize run summary")?;
        std::fs::write(&path, format!("{json}\n"))
            .with_context(|| format!("write summary: {path}"))?;
    }
    Ok(())
}
