//! Article resolution: redirect unwrapping, page fetching and best-effort
//! extraction of title, body text and publication date.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate};
use once_cell::sync::Lazy;
use reqwest::{Client, ClientBuilder, header::CONTENT_TYPE};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::dates::CalendarDate;
use crate::error::{AppError, Result};

/// Aggregator links embed the real target after this token.
pub const REDIRECT_MARKER: &str = "continue=";

/// Paragraphs shorter than this are treated as navigation or captions.
const MIN_PARAGRAPH_CHARS: usize = 30;

const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

// Create static selectors to avoid recompiling them each time
static OG_TITLE: Lazy<Selector> = Lazy::new(|| selector(r#"meta[property="og:title"]"#));
static TITLE: Lazy<Selector> = Lazy::new(|| selector("title"));
static H1: Lazy<Selector> = Lazy::new(|| selector("h1"));
static ARTICLE_P: Lazy<Selector> = Lazy::new(|| selector("article p"));
static BODY_P: Lazy<Selector> = Lazy::new(|| selector("body p"));
static CANONICAL: Lazy<Selector> = Lazy::new(|| selector(r#"link[rel="canonical"]"#));
static JSON_LD: Lazy<Selector> = Lazy::new(|| selector(r#"script[type="application/ld+json"]"#));
static TIME: Lazy<Selector> = Lazy::new(|| selector("time[datetime]"));
static DATE_META: Lazy<Vec<Selector>> = Lazy::new(|| {
    [
        r#"meta[property="article:published_time"]"#,
        r#"meta[property="og:published_time"]"#,
        r#"meta[name="pubdate"]"#,
        r#"meta[name="publishdate"]"#,
        r#"meta[itemprop="datePublished"]"#,
        r#"meta[name="date"]"#,
    ]
    .iter()
    .map(|s| selector(s))
    .collect()
});

fn selector(css: &str) -> Selector {
    Selector::parse(css).expect("static selector must parse")
}

/// Best-effort article content. Every field is independently nullable and is
/// serialized as `null` rather than omitted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolvedArticle {
    pub title: Option<String>,
    pub text: Option<String>,
    pub url: Option<String>,
    #[serde(rename = "date")]
    pub publish_date: Option<CalendarDate>,
}

impl ResolvedArticle {
    /// The degraded result: nothing extracted, only the URL as given.
    pub fn unresolved(url: &str) -> Self {
        Self {
            url: Some(url.to_string()),
            ..Self::default()
        }
    }
}

/// What the extraction utility could pull out of a page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractedPage {
    pub title: Option<String>,
    pub text: Option<String>,
    pub url: Option<String>,
    pub publish_date: Option<CalendarDate>,
}

#[derive(Debug, thiserror::Error)]
pub enum FetchFailure {
    #[error("network error: {0}")]
    Network(String),

    #[error("unexpected HTTP status {0}")]
    Status(u16),

    #[error("not an article: {0}")]
    NotAnArticle(String),
}

impl From<reqwest::Error> for FetchFailure {
    fn from(err: reqwest::Error) -> Self {
        FetchFailure::Network(err.to_string())
    }
}

/// Fetches a page and extracts whatever article content it can.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> std::result::Result<ExtractedPage, FetchFailure>;
}

pub struct HttpPageFetcher {
    client: Client,
}

impl HttpPageFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = ClientBuilder::new()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(5))
            .pool_max_idle_per_host(10)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| AppError::Config(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    async fn fetch(&self, url: &str) -> std::result::Result<ExtractedPage, FetchFailure> {
        let response = self.client.get(url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchFailure::Status(status.as_u16()));
        }

        if let Some(content_type) = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
        {
            if !content_type.contains("html") {
                return Err(FetchFailure::NotAnArticle(format!(
                    "content type {content_type}"
                )));
            }
        }

        let final_url = response.url().to_string();
        let html = response.text().await?;
        extract_page(&html, &final_url)
    }
}

/// Runs the independent title, text, date and canonical-URL extractors.
///
/// A page yielding neither a title nor any body text is rejected as
/// non-article content (paywall interstitials, consent walls, empty shells).
pub fn extract_page(
    html: &str,
    fetched_url: &str,
) -> std::result::Result<ExtractedPage, FetchFailure> {
    let document = Html::parse_document(html);

    let title = extract_title(&document);
    let text = extract_text(&document);
    if title.is_none() && text.is_none() {
        return Err(FetchFailure::NotAnArticle(
            "no title or body text found".to_string(),
        ));
    }

    Ok(ExtractedPage {
        title,
        text,
        url: Some(extract_canonical(&document).unwrap_or_else(|| fetched_url.to_string())),
        publish_date: extract_publish_date(&document),
    })
}

fn non_empty(s: String) -> Option<String> {
    let s = collapse_whitespace(&s);
    if s.is_empty() { None } else { Some(s) }
}

fn element_text(el: ElementRef<'_>) -> String {
    el.text().collect::<Vec<_>>().join("")
}

fn extract_title(document: &Html) -> Option<String> {
    document
        .select(&OG_TITLE)
        .filter_map(|el| el.value().attr("content"))
        .find_map(|c| non_empty(c.to_string()))
        .or_else(|| document.select(&TITLE).find_map(|el| non_empty(element_text(el))))
        .or_else(|| document.select(&H1).find_map(|el| non_empty(element_text(el))))
}

fn extract_text(document: &Html) -> Option<String> {
    let collect = |sel: &Selector| -> Vec<String> {
        document
            .select(sel)
            .map(|el| collapse_whitespace(&element_text(el)))
            .filter(|p| p.chars().count() >= MIN_PARAGRAPH_CHARS)
            .collect()
    };

    let mut paragraphs = collect(&*ARTICLE_P);
    if paragraphs.is_empty() {
        paragraphs = collect(&*BODY_P);
    }
    if paragraphs.is_empty() {
        None
    } else {
        Some(paragraphs.join("\n\n"))
    }
}

fn extract_canonical(document: &Html) -> Option<String> {
    document
        .select(&CANONICAL)
        .filter_map(|el| el.value().attr("href"))
        .map(str::trim)
        .find(|href| url::Url::parse(href).is_ok())
        .map(str::to_string)
}

fn extract_publish_date(document: &Html) -> Option<CalendarDate> {
    let from_json_ld = document.select(&JSON_LD).find_map(|script| {
        let json: Value = serde_json::from_str(element_text(script).trim()).ok()?;
        find_date_published(&json).and_then(parse_loose_date)
    });
    if from_json_ld.is_some() {
        return from_json_ld;
    }

    let from_meta = DATE_META.iter().find_map(|sel| {
        document
            .select(sel)
            .filter_map(|el| el.value().attr("content"))
            .find_map(parse_loose_date)
    });
    if from_meta.is_some() {
        return from_meta;
    }

    document
        .select(&TIME)
        .filter_map(|el| el.value().attr("datetime"))
        .find_map(parse_loose_date)
}

fn find_date_published(json: &Value) -> Option<&str> {
    match json {
        Value::Array(items) => items.iter().find_map(find_date_published),
        Value::Object(obj) => obj
            .get("datePublished")
            .and_then(Value::as_str)
            .or_else(|| obj.get("@graph").and_then(find_date_published)),
        _ => None,
    }
}

/// Accepts RFC 3339, RFC 2822, or anything starting with `YYYY-MM-DD`.
pub fn parse_loose_date(raw: &str) -> Option<CalendarDate> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.into());
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(raw) {
        return Some(dt.into());
    }
    raw.get(..10)
        .and_then(|prefix| NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok())
        .map(CalendarDate::from)
}

/// Collapses runs of whitespace, including newlines, to single spaces.
pub fn collapse_whitespace(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    for word in text.split_whitespace() {
        if !result.is_empty() {
            result.push(' ');
        }
        result.push_str(word);
    }
    result
}

/// Strips a redirect wrapper, returning the URL that should actually be fetched.
///
/// Everything up to and including the first `continue=` is dropped. A target
/// that arrives fully percent-encoded is decoded.
pub fn unwrap_redirect(url: &str) -> String {
    let Some(idx) = url.find(REDIRECT_MARKER) else {
        return url.to_string();
    };
    let target = &url[idx + REDIRECT_MARKER.len()..];
    if !target.contains("://") {
        if let Ok(decoded) = urlencoding::decode(target) {
            if decoded.contains("://") {
                return decoded.into_owned();
            }
        }
    }
    target.to_string()
}

/// Turns a possibly-wrapped URL into a [`ResolvedArticle`]. Never fails.
#[derive(Clone)]
pub struct ArticleResolver {
    fetcher: Arc<dyn PageFetcher>,
}

impl ArticleResolver {
    pub fn new(fetcher: Arc<dyn PageFetcher>) -> Self {
        Self { fetcher }
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn resolve(&self, url: &str) -> ResolvedArticle {
        if url.trim().is_empty() {
            warn!("empty article URL");
            return ResolvedArticle::unresolved(url);
        }

        let target = unwrap_redirect(url);
        if target != url {
            debug!(%target, "unwrapped redirect URL");
        }

        match self.fetcher.fetch(&target).await {
            Ok(page) => ResolvedArticle {
                title: page.title,
                text: page.text,
                url: page.url.or(Some(target)),
                publish_date: page.publish_date,
            },
            Err(e) => {
                warn!(%url, error = %e, "article resolution degraded to empty fields");
                ResolvedArticle::unresolved(url)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const ARTICLE_HTML: &str = r#"<!doctype html>
<html><head>
  <title>Fallback Title | Example News</title>
  <meta property="og:title" content="Council approves new  budget">
  <link rel="canonical" href="https://news.example.com/2023/10/budget">
  <script type="application/ld+json">
    {"@context":"https://schema.org","@graph":[{"@type":"WebPage"},
     {"@type":"NewsArticle","datePublished":"2023-10-12T08:30:00+01:00"}]}
  </script>
</head><body>
  <nav><p>Home</p></nav>
  <article>
    <h1>Council approves new budget</h1>
    <p>The city council voted on Tuesday to approve a new budget for the coming year.</p>
    <p>Short caption</p>
    <p>Opponents argued that the plan relies on optimistic
       revenue forecasts that may not hold.</p>
  </article>
</body></html>"#;

    #[derive(Default)]
    struct RecordingFetcher {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PageFetcher for RecordingFetcher {
        async fn fetch(&self, url: &str) -> std::result::Result<ExtractedPage, FetchFailure> {
            self.seen.lock().unwrap().push(url.to_string());
            extract_page(ARTICLE_HTML, url)
        }
    }

    struct FailingFetcher;

    #[async_trait]
    impl PageFetcher for FailingFetcher {
        async fn fetch(&self, _url: &str) -> std::result::Result<ExtractedPage, FetchFailure> {
            Err(FetchFailure::Network("connection refused".into()))
        }
    }

    #[test]
    fn extracts_every_field() {
        let page = extract_page(ARTICLE_HTML, "https://fetched.example.com/x").unwrap();
        assert_eq!(page.title.as_deref(), Some("Council approves new budget"));
        assert_eq!(
            page.url.as_deref(),
            Some("https://news.example.com/2023/10/budget")
        );
        assert_eq!(page.publish_date, Some(CalendarDate::new(2023, 10, 12)));

        let text = page.text.unwrap();
        assert!(text.starts_with("The city council voted"));
        assert!(text.contains("\n\nOpponents argued that the plan relies on optimistic revenue"));
        assert!(!text.contains("Short caption"));
        assert!(!text.contains("Home"));
    }

    #[test]
    fn fields_are_extracted_independently() {
        let html = r#"<html><head><title>Only a title</title></head><body><p>tiny</p></body></html>"#;
        let page = extract_page(html, "https://example.com/a").unwrap();
        assert_eq!(page.title.as_deref(), Some("Only a title"));
        assert_eq!(page.text, None);
        assert_eq!(page.publish_date, None);
        assert_eq!(page.url.as_deref(), Some("https://example.com/a"));
    }

    #[test]
    fn body_paragraphs_are_used_without_article_tag() {
        let html = r#"<html><body>
            <p>This paragraph lives directly in the body of the page text.</p>
            <time datetime="2021-05-04">May 4</time>
        </body></html>"#;
        let page = extract_page(html, "https://example.com/b").unwrap();
        assert_eq!(page.title, None);
        assert!(page.text.unwrap().starts_with("This paragraph lives"));
        assert_eq!(page.publish_date, Some(CalendarDate::new(2021, 5, 4)));
    }

    #[test]
    fn meta_publish_time_is_read() {
        let html = r#"<html><head><title>T</title>
            <meta property="article:published_time" content="2020-01-02T03:04:05Z">
        </head><body></body></html>"#;
        let page = extract_page(html, "https://example.com/c").unwrap();
        assert_eq!(page.publish_date, Some(CalendarDate::new(2020, 1, 2)));
    }

    #[test]
    fn empty_shell_is_not_an_article() {
        let html = "<html><head></head><body><div>Subscribe to continue</div></body></html>";
        assert!(matches!(
            extract_page(html, "https://example.com/paywall"),
            Err(FetchFailure::NotAnArticle(_))
        ));
    }

    #[test]
    fn loose_dates() {
        assert_eq!(
            parse_loose_date("Tue, 10 Oct 2023 14:00:00 GMT"),
            Some(CalendarDate::new(2023, 10, 10))
        );
        assert_eq!(
            parse_loose_date("2023-10-12T08:30:00"),
            Some(CalendarDate::new(2023, 10, 12))
        );
        assert_eq!(parse_loose_date("yesterday"), None);
    }

    #[test]
    fn redirect_marker_is_stripped() {
        assert_eq!(
            unwrap_redirect("https://consent.example.com/ml?continue=https://news.example.com/story?id=1"),
            "https://news.example.com/story?id=1"
        );
        assert_eq!(
            unwrap_redirect("https://consent.example.com/ml?continue=https%3A%2F%2Fnews.example.com%2Fa"),
            "https://news.example.com/a"
        );
        assert_eq!(
            unwrap_redirect("https://news.example.com/plain"),
            "https://news.example.com/plain"
        );
    }

    #[tokio::test]
    async fn resolver_fetches_only_the_wrapped_target() {
        let fetcher = Arc::new(RecordingFetcher::default());
        let resolver = ArticleResolver::new(fetcher.clone());

        resolver
            .resolve("https://consent.example.com/ml?gl=GB&continue=https://news.example.com/a")
            .await;
        resolver.resolve("https://news.example.com/b").await;

        let seen = fetcher.seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                "https://news.example.com/a".to_string(),
                "https://news.example.com/b".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn resolver_degrades_on_failure() {
        let resolver = ArticleResolver::new(Arc::new(FailingFetcher));
        let url = "https://consent.example.com/ml?continue=https://unreachable.invalid/x";
        let article = resolver.resolve(url).await;
        assert_eq!(article, ResolvedArticle::unresolved(url));

        let json = serde_json::to_value(&article).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"title": null, "text": null, "url": url, "date": null})
        );
    }

    #[tokio::test]
    async fn http_fetcher_reads_article_pages() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/story"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(ARTICLE_HTML.as_bytes().to_vec(), "text/html; charset=utf-8"),
            )
            .mount(&server)
            .await;

        let fetcher = HttpPageFetcher::new(Duration::from_secs(5)).unwrap();
        let page = fetcher.fetch(&format!("{}/story", server.uri())).await.unwrap();
        assert_eq!(page.title.as_deref(), Some("Council approves new budget"));
        assert_eq!(page.publish_date, Some(CalendarDate::new(2023, 10, 12)));
    }

    #[tokio::test]
    async fn http_fetcher_surfaces_bad_status_and_content() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/feed.json"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(b"{}".to_vec(), "application/json"))
            .mount(&server)
            .await;

        let fetcher = HttpPageFetcher::new(Duration::from_secs(5)).unwrap();
        assert!(matches!(
            fetcher.fetch(&format!("{}/gone", server.uri())).await,
            Err(FetchFailure::Status(404))
        ));
        assert!(matches!(
            fetcher.fetch(&format!("{}/feed.json", server.uri())).await,
            Err(FetchFailure::NotAnArticle(_))
        ));
    }

    #[tokio::test]
    async fn unreachable_host_resolves_to_nulls() {
        let fetcher = HttpPageFetcher::new(Duration::from_secs(2)).unwrap();
        let resolver = ArticleResolver::new(Arc::new(fetcher));
        let url = "http://127.0.0.1:9/never";
        assert_eq!(resolver.resolve(url).await, ResolvedArticle::unresolved(url));
    }
}
