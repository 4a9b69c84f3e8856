use std::collections::HashMap;
use std::path::Path;

use anyhow::Context as _;
use scraper::{ElementRef, Html, Node};
use url::Url;

use crate::cli::ReduceArgs;
use crate::error::OverReductionError;
use crate::formats::{RawPage, ReducedContent, truncate_chars};

pub const DEFAULT_MAX_CHARS: usize = 60_000;

const DROPPED_TAGS: &[&str] = &[
    "head", "script", "style", "noscript", "template", "svg", "iframe", "nav", "form", "button",
    "select", "canvas",
];

// Page chrome, unless nested in a listing item (cards often carry their own).
const CHROME_TAGS: &[&str] = &["header", "footer"];

const DROPPED_ROLES: &[&str] = &["navigation", "banner", "contentinfo", "search", "dialog"];

const HINT_TOKENS: &[&str] = &["header", "footer", "menu", "modal", "sidebar", "skip"];

const HINT_SEGMENTS: &[&str] = &[
    "nav",
    "navbar",
    "navigation",
    "cookie",
    "cookies",
    "consent",
    "breadcrumb",
    "breadcrumbs",
    "newsletter",
];

const BLOCK_TAGS: &[&str] = &[
    "address", "article", "aside", "blockquote", "dd", "div", "dl", "dt", "figcaption", "figure",
    "h1", "h2", "h3", "h4", "h5", "h6", "li", "main", "ol", "p", "section", "table", "tbody",
    "td", "th", "thead", "tr", "ul",
];

const MIN_LISTING_ITEMS: usize = 3;

/// Strips markup that carries no event information and returns the visible
/// text, with link targets kept inline as `<url>`.
pub fn reduce(page: &RawPage, max_chars: usize) -> Result<ReducedContent, OverReductionError> {
    let document = Html::parse_document(&page.html);
    let base = Url::parse(&page.url).ok();
    let root = document.root_element();

    let full = render(root, base.as_ref());
    let full_chars = full.chars().count();

    let text = if full_chars <= max_chars {
        full
    } else {
        let listing = find_listing_block(root)
            .map(|block| render(block, base.as_ref()))
            .filter(|text| !text.trim().is_empty());
        match listing {
            Some(listing) => {
                tracing::debug!(
                    url = %page.url,
                    full_chars,
                    listing_chars = listing.chars().count(),
                    "reduce: keeping listing block"
                );
                truncate_at_line(&listing, max_chars).to_owned()
            }
            None => truncate_at_line(&full, max_chars).to_owned(),
        }
    };

    if text.trim().is_empty() {
        return Err(OverReductionError {
            url: page.url.clone(),
        });
    }

    Ok(ReducedContent {
        url: page.url.clone(),
        text,
        fetched_at: page.fetched_at,
        unreduced: false,
    })
}

/// Whether the page advertises a following results page.
pub fn next_page_hint(page: &RawPage) -> bool {
    let document = Html::parse_document(&page.html);
    document
        .root_element()
        .descendants()
        .filter_map(ElementRef::wrap)
        .any(|el| {
            let element = el.value();
            let name = element.name();
            if element.attr("disabled").is_some() || element.attr("aria-disabled") == Some("true")
            {
                return false;
            }

            if (name == "a" || name == "link")
                && element
                    .attr("rel")
                    .is_some_and(|rel| rel.split_whitespace().any(|r| r.eq_ignore_ascii_case("next")))
            {
                return true;
            }

            if name == "a" || name == "button" {
                if element
                    .attr("aria-label")
                    .is_some_and(|label| label.trim().to_ascii_lowercase().starts_with("next"))
                {
                    return true;
                }
                let text = el.text().collect::<String>();
                let text = text.trim().to_ascii_lowercase();
                return text == "next" || text == "next page";
            }

            false
        })
}

#[derive(Default)]
struct TextSink {
    lines: Vec<String>,
    current: String,
}

impl TextSink {
    fn push_text(&mut self, text: &str) {
        for word in text.split_whitespace() {
            if !self.current.is_empty() {
                self.current.push(' ');
            }
            self.current.push_str(word);
        }
    }

    fn break_line(&mut self) {
        if !self.current.is_empty() {
            self.lines.push(std::mem::take(&mut self.current));
        }
    }

    fn finish(mut self) -> String {
        self.break_line();
        self.lines.join("\n")
    }
}

fn render(el: ElementRef<'_>, base: Option<&Url>) -> String {
    let mut sink = TextSink::default();
    render_children(el, false, base, &mut sink);
    sink.finish()
}

fn render_children(el: ElementRef<'_>, in_item: bool, base: Option<&Url>, sink: &mut TextSink) {
    for child in el.children() {
        match child.value() {
            Node::Text(text) => sink.push_text(text),
            Node::Element(_) => {
                let Some(child) = ElementRef::wrap(child) else {
                    continue;
                };
                if is_dropped(child, in_item) {
                    continue;
                }

                let name = child.value().name();
                if name == "br" {
                    sink.break_line();
                    continue;
                }

                let block = BLOCK_TAGS.contains(&name);
                if block {
                    sink.break_line();
                }
                let child_in_item = in_item || name == "article" || name == "li";
                render_children(child, child_in_item, base, sink);
                if name == "a"
                    && let Some(target) = link_target(child, base)
                {
                    sink.push_text(&format!("<{target}>"));
                }
                if block {
                    sink.break_line();
                }
            }
            _ => {}
        }
    }
}

fn is_dropped(el: ElementRef<'_>, in_item: bool) -> bool {
    let element = el.value();
    let name = element.name();

    if DROPPED_TAGS.contains(&name) || (!in_item && CHROME_TAGS.contains(&name)) {
        return true;
    }
    if element.attr("hidden").is_some() || element.attr("aria-hidden") == Some("true") {
        return true;
    }
    if let Some(style) = element.attr("style") {
        let style = style.replace(char::is_whitespace, "").to_ascii_lowercase();
        if style.contains("display:none") || style.contains("visibility:hidden") {
            return true;
        }
    }
    if let Some(role) = element.attr("role")
        && DROPPED_ROLES.contains(&role.trim().to_ascii_lowercase().as_str())
    {
        return true;
    }

    let hints = element
        .attr("class")
        .into_iter()
        .chain(element.attr("id"))
        .flat_map(str::split_whitespace)
        .map(str::to_ascii_lowercase);
    for token in hints {
        if HINT_TOKENS.contains(&token.as_str()) {
            return true;
        }
        if token
            .split(['-', '_'])
            .any(|segment| HINT_SEGMENTS.contains(&segment))
        {
            return true;
        }
    }

    false
}

fn link_target(el: ElementRef<'_>, base: Option<&Url>) -> Option<String> {
    let href = el.value().attr("href")?.trim();
    let lowered = href.to_ascii_lowercase();
    if href.is_empty()
        || href.starts_with('#')
        || lowered.starts_with("javascript:")
        || lowered.starts_with("mailto:")
        || lowered.starts_with("tel:")
    {
        return None;
    }

    let resolved = match base {
        Some(base) => base.join(href).ok(),
        None => Url::parse(href).ok(),
    };
    match resolved {
        Some(mut url) => {
            url.set_fragment(None);
            Some(url.to_string())
        }
        None => Some(href.to_owned()),
    }
}

/// Finds the element whose children hold the largest run of structurally
/// similar siblings (same tag and class set), weighted by their text.
fn find_listing_block(root: ElementRef<'_>) -> Option<ElementRef<'_>> {
    let mut best: Option<(usize, ElementRef<'_>)> = None;
    visit_listing_candidates(root, false, &mut best);
    best.map(|(_, el)| el)
}

fn visit_listing_candidates<'a>(
    el: ElementRef<'a>,
    in_item: bool,
    best: &mut Option<(usize, ElementRef<'a>)>,
) {
    let mut groups: HashMap<String, (usize, usize)> = HashMap::new();

    for child in el.children().filter_map(ElementRef::wrap) {
        if is_dropped(child, in_item) {
            continue;
        }
        let text_len = child.text().map(|t| t.trim().len()).sum::<usize>();
        if text_len > 0 {
            let entry = groups.entry(sibling_signature(child)).or_default();
            entry.0 += 1;
            entry.1 += text_len;
        }

        let name = child.value().name();
        visit_listing_candidates(child, in_item || name == "article" || name == "li", best);
    }

    let score = groups
        .values()
        .filter(|(count, _)| *count >= MIN_LISTING_ITEMS)
        .map(|(_, text_len)| *text_len)
        .max();
    if let Some(score) = score
        && best.as_ref().is_none_or(|(current, _)| score > *current)
    {
        *best = Some((score, el));
    }
}

fn sibling_signature(el: ElementRef<'_>) -> String {
    let mut classes = el.value().classes().collect::<Vec<_>>();
    classes.sort_unstable();
    format!("{}.{}", el.value().name(), classes.join("."))
}

fn truncate_at_line(text: &str, max_chars: usize) -> &str {
    let cut = truncate_chars(text, max_chars);
    if cut.len() == text.len() {
        return cut;
    }
    match cut.rfind('\n') {
        Some(idx) if idx > 0 => &cut[..idx],
        _ => cut,
    }
}

pub fn run(args: ReduceArgs) -> anyhow::Result<()> {
    let path = Path::new(&args.html);
    let html =
        std::fs::read_to_string(path).with_context(|| format!("read html: {}", path.display()))?;
    let url = match args.url {
        Some(url) => url,
        None => {
            let absolute = std::path::absolute(path)
                .with_context(|| format!("resolve path: {}", path.display()))?;
            Url::from_file_path(&absolute)
                .map_err(|()| anyhow::anyhow!("not a file path: {}", absolute.display()))?
                .to_string()
        }
    };

    let page = RawPage::new(url, html);
    let reduced = reduce(&page, args.max_chars)?;
    tracing::info!(
        html_chars = page.html.len(),
        reduced_chars = reduced.text.len(),
        next_page = next_page_hint(&page),
        "page reduced"
    );

    match args.out {
        Some(out) => std::fs::write(&out, format!("{}\n", reduced.text))
            .with_context(|| format!("write reduced text: {out}"))?,
        None => println!("{}", reduced.text),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(html: &str) -> RawPage {
        RawPage::new("https://tickets.example.com/search?q=techno", html)
    }

    const LISTING: &str = r#"<!doctype html>
<html>
  <head><title>Search</title><style>.x { color: red }</style></head>
  <body>
    <header class="site-header"><a href="/">Home</a> Sign in</header>
    <nav><a href="/music">Music</a><a href="/sports">Sports</a></nav>
    <div id="cookie-banner">We use cookies</div>
    <main>
      <ul class="results">
        <li class="event-card">
          <header class="card-header"><h3>Warehouse Night</h3></header>
          <span>Basement Club</span> <span>Sat, Nov 7, 2026 • 9:00 PM</span>
          <a href="/event/warehouse-night#tickets">Find tickets</a>
        </li>
        <li class="event-card">
          <h3>Dawn Sessions</h3><span>Pier 9</span><span>Nov 14, 2026</span>
          <a href="https://tickets.example.com/event/dawn">Find tickets</a>
        </li>
        <li class="event-card" style="display: none">Hidden Promo Event</li>
      </ul>
    </main>
    <script>window.__STATE__ = {"events": []}</script>
    <footer>Copyright Example Tickets</footer>
  </body>
</html>"#;

    #[test]
    fn drops_chrome_scripts_and_hidden_elements() {
        let reduced = reduce(&page(LISTING), DEFAULT_MAX_CHARS).unwrap();
        let text = reduced.text;

        assert!(text.contains("Warehouse Night"));
        assert!(text.contains("Basement Club"));
        assert!(text.contains("Dawn Sessions"));
        assert!(!text.contains("Sign in"));
        assert!(!text.contains("Sports"));
        assert!(!text.contains("cookies"));
        assert!(!text.contains("__STATE__"));
        assert!(!text.contains("color: red"));
        assert!(!text.contains("Copyright"));
        assert!(!text.contains("Hidden Promo Event"));
        assert!(!reduced.unreduced);
    }

    #[test]
    fn links_are_resolved_and_stripped_of_fragments() {
        let text = reduce(&page(LISTING), DEFAULT_MAX_CHARS).unwrap().text;
        assert!(text.contains("Find tickets <https://tickets.example.com/event/warehouse-night>"));
        assert!(text.contains("<https://tickets.example.com/event/dawn>"));
    }

    #[test]
    fn whitespace_is_collapsed_per_line() {
        let text = reduce(&page(LISTING), DEFAULT_MAX_CHARS).unwrap().text;
        for line in text.lines() {
            assert!(!line.trim().is_empty());
            assert!(!line.contains("  "), "{line:?}");
        }
    }

    #[test]
    fn reduction_is_deterministic() {
        let a = reduce(&page(LISTING), 200).unwrap().text;
        let b = reduce(&page(LISTING), 200).unwrap().text;
        assert_eq!(a, b);
    }

    #[test]
    fn only_boilerplate_is_an_over_reduction() {
        let html = r#"<html><head><title>x</title></head><body>
            <nav>Music Sports Arts</nav><script>var a = 1;</script>
            <div class="modal">Sign up now</div></body></html>"#;
        let err = reduce(&page(html), DEFAULT_MAX_CHARS).unwrap_err();
        assert_eq!(err.url, "https://tickets.example.com/search?q=techno");
    }

    #[test]
    fn visible_text_never_reduces_to_empty() {
        for html in [
            "<p>Just one line</p>",
            "<html><body><div><span>Nested</span></div></body></html>",
            "plain text without tags",
            "<table><tr><td>Cell</td></tr></table>",
        ] {
            let reduced = reduce(&page(html), DEFAULT_MAX_CHARS).unwrap();
            assert!(!reduced.text.trim().is_empty(), "{html}");
        }
    }

    #[test]
    fn over_budget_pages_keep_the_listing_block() {
        let promo = "Lorem ipsum dolor sit amet. ".repeat(40);
        let items = (1..=5)
            .map(|i| format!(r#"<div class="tile"><b>Act {i}</b> <i>Club {i}</i></div>"#))
            .collect::<String>();
        let html = format!(
            r#"<html><body><div class="promo"><p>{promo}</p></div><section class="grid">{items}</section></body></html>"#
        );

        let reduced = reduce(&page(&html), 200).unwrap();
        assert!(reduced.text.chars().count() <= 200);
        assert!(reduced.text.contains("Act 1 Club 1"));
        assert!(reduced.text.contains("Act 5 Club 5"));
        assert!(!reduced.text.contains("Lorem"));
    }

    #[test]
    fn truncates_on_line_boundary_without_listing() {
        let html = (0..50)
            .map(|i| format!("<p>paragraph number {i}</p>"))
            .collect::<String>();
        // Fifty `p` siblings form a listing too; either way the budget holds.
        let reduced = reduce(&page(&html), 100).unwrap();
        assert!(reduced.text.chars().count() <= 100);
        assert!(reduced.text.lines().all(|l| l.starts_with("paragraph number")));
    }

    #[test]
    fn detects_next_page_markers() {
        assert!(next_page_hint(&page(r#"<a rel="next" href="?page=2">2</a>"#)));
        assert!(next_page_hint(&page(
            r#"<button aria-label="Next page">›</button>"#
        )));
        assert!(next_page_hint(&page(r#"<a href="?page=3">Next</a>"#)));
        assert!(!next_page_hint(&page(
            r#"<button aria-label="Next page" disabled>›</button>"#
        )));
        assert!(!next_page_hint(&page(LISTING)));
    }
}
