//! Bias scoring: prompt construction, a single model call, and tolerant
//! extraction of the score array from free-form model output.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::error::{AppError, Result};
use crate::llm::{TextModel, complete_with_timeout, truncate_for_log};

/// The bias dimensions the model chooses from.
pub const CRITERIA: [&str; 15] = [
    "Word Choice and Tone",
    "Framing",
    "Source Diversity",
    "Balance",
    "Omission of Context",
    "Fact Selection",
    "Use of Anonymous Sources",
    "Headline Accuracy",
    "Emotional Language",
    "Labeling and Stereotyping",
    "Story Placement and Emphasis",
    "Statistical Presentation",
    "Separation of Fact and Opinion",
    "Attribution of Claims",
    "Speculation",
];

/// How many criteria the model is told to pick per article.
pub const CRITERIA_PER_ARTICLE: usize = 6;

const ARTICLE_SEPARATOR: &str = "\n\n----- ARTICLE 2 -----\n\n";

/// Criterion name (underscored) to a score in `1..=10`.
pub type ArticleScore = BTreeMap<String, u8>;

/// One [`ArticleScore`] per input article, in input order.
pub type ScoreResult = Vec<ArticleScore>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArticleCount {
    One,
    Two,
}

impl ArticleCount {
    pub fn len(self) -> usize {
        match self {
            ArticleCount::One => 1,
            ArticleCount::Two => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    Parsed(ScoreResult),
    Unparseable { raw: String, reason: String },
}

impl ParseOutcome {
    pub fn into_result(self) -> Result<ScoreResult> {
        match self {
            ParseOutcome::Parsed(scores) => Ok(scores),
            ParseOutcome::Unparseable { raw, reason } => Err(AppError::ScoringParse { reason, raw }),
        }
    }
}

fn unparseable(raw: &str, reason: impl Into<String>) -> ParseOutcome {
    ParseOutcome::Unparseable {
        raw: raw.to_string(),
        reason: reason.into(),
    }
}

/// Index of the first `[` and of the first `]` after it.
fn bracket_span(raw: &str) -> Option<(usize, usize)> {
    let open = raw.find('[')?;
    let close = open + raw[open..].find(']')?;
    Some((open, close))
}

/// Index of the first `{` and of the last `}`.
fn brace_span(raw: &str) -> Option<(usize, usize)> {
    let open = raw.find('{')?;
    let close = raw.rfind('}')?;
    (close > open).then_some((open, close))
}

/// Extracts and validates the score array from a raw model response.
///
/// For one article the `[`..`]` span is parsed as-is. For two articles the
/// model often returns only the comma-joined objects, so the text between the
/// brackets (or, with no brackets at all, the `{`..`}` span) is always
/// re-wrapped in `[` `]` before parsing.
pub fn parse_scores(raw: &str, count: ArticleCount) -> ParseOutcome {
    let candidate = match count {
        ArticleCount::One => bracket_span(raw).map(|(open, close)| raw[open..=close].to_string()),
        ArticleCount::Two => match bracket_span(raw) {
            Some((open, close)) => Some(format!("[{}]", &raw[open + 1..close])),
            None => brace_span(raw).map(|(open, close)| format!("[{}]", &raw[open..=close])),
        },
    };
    let Some(candidate) = candidate else {
        return unparseable(raw, "response contains no JSON array");
    };

    let value: Value = match serde_json::from_str(&candidate) {
        Ok(value) => value,
        Err(e) => return unparseable(raw, format!("invalid JSON: {e}")),
    };

    match validate_scores(value, count.len()) {
        Ok(scores) => ParseOutcome::Parsed(scores),
        Err(reason) => unparseable(raw, reason),
    }
}

fn validate_scores(value: Value, expected: usize) -> std::result::Result<ScoreResult, String> {
    let Value::Array(items) = value else {
        return Err("top-level value is not an array".to_string());
    };
    if items.len() != expected {
        return Err(format!("expected {expected} score objects, got {}", items.len()));
    }

    items
        .into_iter()
        .enumerate()
        .map(|(idx, item)| {
            let Value::Object(fields) = item else {
                return Err(format!("element {idx} is not an object"));
            };
            if fields.is_empty() {
                return Err(format!("element {idx} has no scores"));
            }
            let mut article = ArticleScore::new();
            for (name, score) in fields {
                let score = score
                    .as_i64()
                    .filter(|s| (1..=10).contains(s))
                    .ok_or_else(|| format!("{name:?} in element {idx} is not an integer in 1..=10"))?;
                let key = name.trim().replace(' ', "_");
                if article.insert(key, score as u8).is_some() {
                    return Err(format!("{name:?} in element {idx} duplicates another criterion"));
                }
            }
            Ok(article)
        })
        .collect()
}

/// Builds the scoring prompt for one or two article texts.
pub fn build_prompt(articles: &[&str]) -> String {
    let body = match articles {
        [single] => single.trim().to_string(),
        _ => {
            let mut joined = String::from("----- ARTICLE 1 -----\n\n");
            joined.push_str(&articles.iter().map(|a| a.trim()).collect::<Vec<_>>().join(ARTICLE_SEPARATOR));
            joined
        }
    };
    let n = articles.len();
    let catalog = CRITERIA
        .iter()
        .map(|c| format!("- {c}"))
        .collect::<Vec<_>>()
        .join("\n");

    let mut prompt = String::with_capacity(body.len() + 1500);
    prompt.push_str(&body);
    prompt.push_str("\n\n");
    prompt.push_str(&format!(
        "You are a media bias analyst. Assess the {} above against these criteria:\n{catalog}\n\n",
        if n == 1 { "news article" } else { "two news articles" },
    ));
    prompt.push_str(&format!(
        "For each article, select the {CRITERIA_PER_ARTICLE} criteria most relevant to it and score each \
         from 1 (no bias) to 10 (extreme bias). Respond with a JSON array containing exactly {n} \
         object(s), one per article in the order given. Each object maps the chosen criterion names, \
         with spaces replaced by underscores, to integer scores. Example: \
         [{{\"Word_Choice_and_Tone\": 4, \"Framing\": 6}}]. Output the JSON array and nothing else."
    ));
    prompt
}

fn related_query_prompt(text: &str) -> String {
    format!(
        "{}\n\nSuggest one short news search query a reader could use to find other coverage of the \
         same story from a different perspective. Respond with the search query only.",
        text.trim()
    )
}

fn strip_list_marker(line: &str) -> &str {
    let bulletless = line.trim_start_matches(|c: char| c == '-' || c == '*' || c == '#');
    if bulletless.len() != line.len() {
        return bulletless.trim_start();
    }
    let digitless = line.trim_start_matches(|c: char| c.is_ascii_digit());
    if digitless.len() != line.len() {
        if let Some(rest) = digitless.strip_prefix(|c: char| c == '.' || c == ')') {
            return rest.trim_start();
        }
    }
    line
}

/// Reduces a free-form answer to a bare search string.
pub fn clean_query(raw: &str) -> Option<String> {
    let line = raw.lines().map(str::trim).find(|l| !l.is_empty())?;
    let line = strip_list_marker(line);
    let line = match line.find(':') {
        Some(idx) if line[..idx].to_ascii_lowercase().contains("query") => &line[idx + 1..],
        _ => line,
    };
    let cleaned = line
        .trim()
        .trim_matches(|c| c == '"' || c == '\'' || c == '`' || c == '*')
        .trim();
    (!cleaned.is_empty()).then(|| cleaned.to_string())
}

pub struct BiasScorer {
    model: Arc<dyn TextModel>,
    timeout: Duration,
}

impl BiasScorer {
    pub fn new(model: Arc<dyn TextModel>, timeout: Duration) -> Self {
        Self { model, timeout }
    }

    pub async fn score_one(&self, article: &str) -> Result<ScoreResult> {
        self.score(&[article], ArticleCount::One).await
    }

    pub async fn score_two(&self, article1: &str, article2: &str) -> Result<ScoreResult> {
        self.score(&[article1, article2], ArticleCount::Two).await
    }

    #[instrument(level = "info", skip_all, fields(articles = count.len()))]
    async fn score(&self, articles: &[&str], count: ArticleCount) -> Result<ScoreResult> {
        if let Some(idx) = articles.iter().position(|a| a.trim().is_empty()) {
            return Err(AppError::InvalidQuery(format!("article {} is empty", idx + 1)));
        }

        let prompt = build_prompt(articles);
        debug!(prompt_chars = prompt.len(), "calling model for bias scores");
        let raw = complete_with_timeout(self.model.as_ref(), &prompt, self.timeout).await?;

        let outcome = parse_scores(&raw, count);
        match &outcome {
            ParseOutcome::Parsed(scores) => info!(articles = scores.len(), "bias scores parsed"),
            ParseOutcome::Unparseable { raw, reason } => {
                warn!(%reason, raw = %truncate_for_log(raw, 500), "model output was not a score array")
            }
        }
        outcome.into_result()
    }

    #[instrument(level = "info", skip_all)]
    pub async fn suggest_related_query(&self, text: &str) -> Result<String> {
        if text.trim().is_empty() {
            return Err(AppError::InvalidQuery("text is empty".into()));
        }
        let raw = complete_with_timeout(self.model.as_ref(), &related_query_prompt(text), self.timeout).await?;
        clean_query(&raw).ok_or_else(|| AppError::ScoringParse {
            reason: "model returned no query".to_string(),
            raw,
        })
    }
}
