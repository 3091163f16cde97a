//! News search: query normalization, the Google News RSS provider, and the
//! aggregator that resolves every candidate into a [`ResolvedArticle`].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};
use url::Url;

use crate::dates::{CalendarDate, parse_date};
use crate::error::{AppError, Result};
use crate::scraper::{ArticleResolver, ResolvedArticle, parse_loose_date};

/// Google News RSS never returns more than this many items per query.
pub const MAX_PROVIDER_RESULTS: usize = 100;

const LANGUAGES: &[(&str, &str)] = &[
    ("english", "en"),
    ("indonesian", "id"),
    ("czech", "cs"),
    ("german", "de"),
    ("spanish", "es-419"),
    ("french", "fr"),
    ("italian", "it"),
    ("latvian", "lv"),
    ("lithuanian", "lt"),
    ("hungarian", "hu"),
    ("dutch", "nl"),
    ("norwegian", "no"),
    ("polish", "pl"),
    ("portuguese brasil", "pt-419"),
    ("portuguese portugal", "pt-150"),
    ("romanian", "ro"),
    ("slovak", "sk"),
    ("slovenian", "sl"),
    ("swedish", "sv"),
    ("vietnamese", "vi"),
    ("turkish", "tr"),
    ("greek", "el"),
    ("bulgarian", "bg"),
    ("russian", "ru"),
    ("serbian", "sr"),
    ("ukrainian", "uk"),
    ("hebrew", "he"),
    ("arabic", "ar"),
    ("marathi", "mr"),
    ("hindi", "hi"),
    ("bengali", "bn"),
    ("tamil", "ta"),
    ("telugu", "te"),
    ("malyalam", "ml"),
    ("thai", "th"),
    ("chinese simplified", "zh-Hans"),
    ("chinese traditional", "zh-Hant"),
    ("japanese", "ja"),
    ("korean", "ko"),
];

const COUNTRIES: &[(&str, &str)] = &[
    ("australia", "AU"),
    ("botswana", "BW"),
    ("canada", "CA"),
    ("ethiopia", "ET"),
    ("ghana", "GH"),
    ("india", "IN"),
    ("indonesia", "ID"),
    ("ireland", "IE"),
    ("israel", "IL"),
    ("kenya", "KE"),
    ("latvia", "LV"),
    ("malaysia", "MY"),
    ("namibia", "NA"),
    ("new zealand", "NZ"),
    ("nigeria", "NG"),
    ("pakistan", "PK"),
    ("philippines", "PH"),
    ("singapore", "SG"),
    ("south africa", "ZA"),
    ("tanzania", "TZ"),
    ("uganda", "UG"),
    ("united kingdom", "GB"),
    ("united states", "US"),
    ("zimbabwe", "ZW"),
    ("czech republic", "CZ"),
    ("germany", "DE"),
    ("austria", "AT"),
    ("switzerland", "CH"),
    ("argentina", "AR"),
    ("chile", "CL"),
    ("colombia", "CO"),
    ("cuba", "CU"),
    ("mexico", "MX"),
    ("peru", "PE"),
    ("venezuela", "VE"),
    ("belgium", "BE"),
    ("france", "FR"),
    ("morocco", "MA"),
    ("senegal", "SN"),
    ("italy", "IT"),
    ("lithuania", "LT"),
    ("hungary", "HU"),
    ("netherlands", "NL"),
    ("norway", "NO"),
    ("poland", "PL"),
    ("brazil", "BR"),
    ("portugal", "PT"),
    ("romania", "RO"),
    ("slovakia", "SK"),
    ("slovenia", "SI"),
    ("sweden", "SE"),
    ("vietnam", "VN"),
    ("turkey", "TR"),
    ("greece", "GR"),
    ("bulgaria", "BG"),
    ("russia", "RU"),
    ("ukraine", "UA"),
    ("serbia", "RS"),
    ("united arab emirates", "AE"),
    ("saudi arabia", "SA"),
    ("lebanon", "LB"),
    ("egypt", "EG"),
    ("bangladesh", "BD"),
    ("thailand", "TH"),
    ("china", "CN"),
    ("taiwan", "TW"),
    ("hong kong", "HK"),
    ("japan", "JP"),
    ("republic of korea", "KR"),
];

fn lookup_code(table: &[(&str, &'static str)], raw: &str) -> Option<&'static str> {
    let needle = raw.trim();
    table
        .iter()
        .find(|(name, code)| name.eq_ignore_ascii_case(needle) || code.eq_ignore_ascii_case(needle))
        .map(|(_, code)| *code)
}

pub fn language_code(raw: &str) -> Result<&'static str> {
    lookup_code(LANGUAGES, raw)
        .ok_or_else(|| AppError::InvalidQuery(format!("unsupported language {raw:?}")))
}

pub fn country_code(raw: &str) -> Result<&'static str> {
    lookup_code(COUNTRIES, raw)
        .ok_or_else(|| AppError::InvalidQuery(format!("unsupported country {raw:?}")))
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchQuery {
    pub text: String,
    pub max_results: usize,
    pub country: Option<String>,
    pub language: Option<String>,
    pub start_date: Option<CalendarDate>,
    pub end_date: Option<CalendarDate>,
}

impl SearchQuery {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            max_results: 10,
            country: None,
            language: Some("english".to_string()),
            start_date: None,
            end_date: None,
        }
    }

    /// Builds a query from raw request parameters, normalizing the dates.
    pub fn from_params(
        text: &str,
        max_results: usize,
        country: Option<String>,
        language: Option<String>,
        start_date: Option<&str>,
        end_date: Option<&str>,
    ) -> Result<Self> {
        let query = Self {
            text: text.to_string(),
            max_results,
            country,
            language,
            start_date: parse_date(start_date)?,
            end_date: parse_date(end_date)?,
        };
        query.validate()?;
        Ok(query)
    }

    pub fn validate(&self) -> Result<()> {
        if self.text.trim().is_empty() {
            return Err(AppError::InvalidQuery("query text must not be empty".into()));
        }
        if self.max_results == 0 {
            return Err(AppError::InvalidQuery("max_results must be at least 1".into()));
        }
        if let (Some(start), Some(end)) = (self.start_date, self.end_date) {
            if start > end {
                return Err(AppError::InvalidQuery(format!(
                    "start_date {start} is after end_date {end}"
                )));
            }
        }
        Ok(())
    }
}

/// A raw search hit. The URL may still be wrapped by a redirector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateResult {
    pub url: String,
    pub title: Option<String>,
    pub publisher: Option<String>,
    pub published: Option<CalendarDate>,
}

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("provider returned status {0}")]
    Status(u16),

    #[error("could not parse feed: {0}")]
    Parse(String),
}

impl From<SearchError> for AppError {
    fn from(err: SearchError) -> Self {
        AppError::ProviderUnavailable(err.to_string())
    }
}

/// Returns candidates in ranking order, at most `query.max_results` of them.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, query: &SearchQuery) -> Result<Vec<CandidateResult>>;
}

pub struct GoogleNewsProvider {
    client: Client,
    base_url: String,
}

impl GoogleNewsProvider {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent("Mozilla/5.0 (compatible; news-bias-api/0.1)")
            .build()
            .map_err(|e| AppError::Config(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Builds the RSS search URL; dates become `after:`/`before:` operators.
    pub fn search_url(&self, query: &SearchQuery) -> Result<Url> {
        let hl = language_code(query.language.as_deref().unwrap_or("english"))?;
        let gl = country_code(query.country.as_deref().unwrap_or("US"))?;

        let mut q = query.text.trim().to_string();
        if let Some(start) = query.start_date {
            q.push_str(&format!(" after:{start}"));
        }
        if let Some(end) = query.end_date {
            q.push_str(&format!(" before:{end}"));
        }

        let mut url = Url::parse(&format!("{}/rss/search", self.base_url))
            .map_err(|e| AppError::Config(format!("Invalid NEWS_BASE_URL: {e}")))?;
        url.query_pairs_mut()
            .append_pair("q", &q)
            .append_pair("hl", hl)
            .append_pair("gl", gl)
            .append_pair("ceid", &format!("{gl}:{hl}"));
        Ok(url)
    }
}

#[async_trait]
impl SearchProvider for GoogleNewsProvider {
    #[instrument(level = "info", skip_all, fields(query = %query.text))]
    async fn search(&self, query: &SearchQuery) -> Result<Vec<CandidateResult>> {
        let url = self.search_url(query)?;
        debug!(%url, "fetching news feed");

        let response = self.client.get(url).send().await.map_err(SearchError::from)?;
        if !response.status().is_success() {
            return Err(SearchError::Status(response.status().as_u16()).into());
        }
        let body = response.bytes().await.map_err(SearchError::from)?;

        let candidates = parse_feed(&body, query.max_results.min(MAX_PROVIDER_RESULTS))?;
        info!(count = candidates.len(), "news provider returned candidates");
        Ok(candidates)
    }
}

/// Parses an RSS channel into candidates, dropping duplicate links.
pub fn parse_feed(body: &[u8], limit: usize) -> Result<Vec<CandidateResult>> {
    let channel =
        rss::Channel::read_from(body).map_err(|e| SearchError::Parse(e.to_string()))?;

    let mut seen = HashSet::new();
    let candidates = channel
        .items()
        .iter()
        .filter_map(|item| {
            let url = item.link()?.trim().to_string();
            if url.is_empty() || !seen.insert(url.clone()) {
                return None;
            }
            let publisher = item.source().and_then(|s| s.title()).map(str::to_string);
            Some(CandidateResult {
                title: item.title().map(|t| strip_publisher(t, publisher.as_deref())),
                published: item.pub_date().and_then(parse_loose_date),
                publisher,
                url,
            })
        })
        .take(limit)
        .collect();
    Ok(candidates)
}

/// Google News titles end in " - Publisher"; drop that suffix when known.
fn strip_publisher(title: &str, publisher: Option<&str>) -> String {
    publisher
        .and_then(|p| title.strip_suffix(p))
        .and_then(|t| t.trim_end().strip_suffix('-'))
        .map(|t| t.trim_end().to_string())
        .unwrap_or_else(|| title.trim().to_string())
}

/// Queries the provider and materializes every candidate's full text.
pub struct SearchAggregator {
    provider: Arc<dyn SearchProvider>,
    resolver: ArticleResolver,
    concurrency: usize,
}

impl SearchAggregator {
    pub fn new(provider: Arc<dyn SearchProvider>, resolver: ArticleResolver, concurrency: usize) -> Self {
        Self {
            provider,
            resolver,
            concurrency: concurrency.max(1),
        }
    }

    /// Raw provider candidates, capped at `max_results`.
    pub async fn candidates(&self, query: &SearchQuery) -> Result<Vec<CandidateResult>> {
        query.validate()?;
        let mut candidates = self.provider.search(query).await?;
        candidates.truncate(query.max_results);
        Ok(candidates)
    }

    /// Output `i` always corresponds to candidate `i`, even when resolution
    /// degraded to empty fields.
    #[instrument(level = "info", skip_all, fields(query = %query.text, max_results = query.max_results))]
    pub async fn search(&self, query: &SearchQuery) -> Result<Vec<ResolvedArticle>> {
        let candidates = self.candidates(query).await?;
        let articles = self.resolve_all(&candidates).await;
        info!(
            resolved = articles.iter().filter(|a| a.text.is_some()).count(),
            total = articles.len(),
            "search complete"
        );
        Ok(articles)
    }

    pub async fn resolve_article(&self, url: &str) -> ResolvedArticle {
        self.resolver.resolve(url).await
    }

    async fn resolve_all(&self, candidates: &[CandidateResult]) -> Vec<ResolvedArticle> {
        let mut slots: Vec<Option<ResolvedArticle>> = vec![None; candidates.len()];

        // Owned urls keep the buffered futures free of borrows into `candidates`.
        let urls: Vec<(usize, String)> = candidates
            .iter()
            .map(|c| c.url.clone())
            .enumerate()
            .collect();
        let resolver = &self.resolver;
        let mut completed = stream::iter(urls)
            .map(|(idx, url)| async move { (idx, resolver.resolve(&url).await) })
            .buffer_unordered(self.concurrency);

        while let Some((idx, article)) = completed.next().await {
            slots[idx] = Some(article);
        }

        slots
            .into_iter()
            .zip(candidates)
            .map(|(slot, candidate)| slot.unwrap_or_else(|| ResolvedArticle::unresolved(&candidate.url)))
            .collect()
    }
}
