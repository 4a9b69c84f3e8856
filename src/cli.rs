use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::reduce::DEFAULT_MAX_CHARS;
use crate::run::DEFAULT_URL_TEMPLATE;

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Search the ticketing site and write deduplicated events as JSON.
    Run(RunArgs),
    /// Fetch one page and save its rendered HTML.
    Fetch(FetchArgs),
    /// Reduce a saved HTML page to listing text.
    Reduce(ReduceArgs),
    /// Extract events from a saved HTML page with the model.
    Extract(ExtractArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FetchEngine {
    /// Headless Chrome/Chromium (executes page scripts).
    Chrome,
    /// Plain HTTP GET (server-rendered pages only).
    Http,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModelApi {
    /// OpenAI Responses API (`OPENAI_API_KEY`, `OPENAI_BASE_URL`).
    Responses,
    /// Azure OpenAI chat completions (`AZURE_OPENAI_API_KEY`, `AZURE_OPENAI_ENDPOINT`).
    AzureChat,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Search text, e.g. "techno".
    #[arg(long)]
    pub query: String,

    /// Output file for the events JSON array (`-` for stdout).
    #[arg(long)]
    pub out: String,

    /// Overwrite `--out` if it already exists.
    #[arg(long, default_value_t = false)]
    pub force: bool,

    /// Also write the run summary JSON here.
    #[arg(long)]
    pub summary: Option<String>,

    /// Search URL with `{query}` and `{page}` placeholders.
    #[arg(long, default_value = DEFAULT_URL_TEMPLATE)]
    pub url_template: String,

    /// Page number substituted for the first page.
    #[arg(long, default_value_t = 1)]
    pub first_page: usize,

    /// Maximum result pages to visit (at least 1).
    #[arg(
        long,
        default_value_t = 3,
        value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..)
    )]
    pub max_pages: usize,

    /// Keep paginating while pages advertise a next page.
    #[arg(long, default_value_t = false, conflicts_with = "max_pages")]
    pub until_exhausted: bool,

    /// Give up (without writing output) after this many seconds.
    #[arg(long)]
    pub run_budget_secs: Option<u64>,

    /// Character budget for reduced page text sent to the model.
    #[arg(long, default_value_t = DEFAULT_MAX_CHARS)]
    pub max_chars: usize,

    #[command(flatten)]
    pub browser: BrowserArgs,

    #[command(flatten)]
    pub model: ModelArgs,

    #[command(flatten)]
    pub retry: RetryArgs,
}

#[derive(Debug, Args)]
pub struct FetchArgs {
    /// Page URL (must be http/https).
    #[arg(long)]
    pub url: String,

    /// Output file for the HTML (`-` for stdout).
    #[arg(long)]
    pub out: String,

    #[command(flatten)]
    pub browser: BrowserArgs,

    #[command(flatten)]
    pub retry: RetryArgs,
}

#[derive(Debug, Args)]
pub struct ReduceArgs {
    /// Input HTML file.
    #[arg(long)]
    pub html: String,

    /// URL the page was fetched from (resolves relative links).
    #[arg(long)]
    pub url: Option<String>,

    #[arg(long, default_value_t = DEFAULT_MAX_CHARS)]
    pub max_chars: usize,

    /// Output file for the reduced text (default: stdout).
    #[arg(long)]
    pub out: Option<String>,
}

#[derive(Debug, Args)]
pub struct ExtractArgs {
    /// Input HTML file.
    #[arg(long)]
    pub html: String,

    /// URL the page was fetched from (resolves relative event links).
    #[arg(long)]
    pub url: String,

    #[arg(long, default_value_t = DEFAULT_MAX_CHARS)]
    pub max_chars: usize,

    /// Output file for the events JSON array (default: stdout).
    #[arg(long)]
    pub out: Option<String>,

    /// Overwrite `--out` if it already exists.
    #[arg(long, default_value_t = false)]
    pub force: bool,

    #[command(flatten)]
    pub model: ModelArgs,

    #[command(flatten)]
    pub retry: RetryArgs,
}

#[derive(Debug, Clone, Args)]
pub struct BrowserArgs {
    #[arg(long, value_enum, default_value_t = FetchEngine::Chrome)]
    pub fetch_engine: FetchEngine,

    /// Chrome/Chromium executable.
    #[arg(long, default_value = "chromium")]
    pub chrome_bin: String,

    /// Extra browser flag (repeatable), e.g. `--chrome-arg=--no-sandbox`.
    #[arg(long = "chrome-arg", allow_hyphen_values = true)]
    pub chrome_args: Vec<String>,

    /// Text that must appear in a rendered page (repeatable; any one suffices).
    #[arg(long = "ready-marker")]
    pub ready_markers: Vec<String>,

    /// Per-page navigation timeout.
    #[arg(long, default_value_t = 45)]
    pub fetch_timeout_secs: u64,

    /// Virtual time the browser lets page scripts run before dumping the DOM.
    #[arg(long, default_value_t = 5000)]
    pub render_wait_ms: u64,
}

#[derive(Debug, Clone, Args)]
pub struct ModelArgs {
    #[arg(long, value_enum, default_value_t = ModelApi::Responses)]
    pub model_api: ModelApi,

    /// Model name (Azure: deployment name).
    #[arg(long, default_value = "gpt-4o-mini")]
    pub model: String,

    #[arg(long, default_value_t = 0.0)]
    pub temperature: f32,

    #[arg(long, default_value_t = 120)]
    pub model_timeout_secs: u64,

    #[arg(long, default_value = crate::config::DEFAULT_AZURE_API_VERSION)]
    pub azure_api_version: String,
}

#[derive(Debug, Clone, Args)]
pub struct RetryArgs {
    /// Attempts per page fetch and per model call.
    #[arg(long, default_value_t = 3)]
    pub max_attempts: usize,

    #[arg(long, default_value_t = 1000)]
    pub retry_base_delay_ms: u64,

    #[arg(long, default_value_t = 30_000)]
    pub retry_max_delay_ms: u64,

    /// Minimum wait after a rate-limit response.
    #[arg(long, default_value_t = 20_000)]
    pub rate_limit_delay_ms: u64,
}
