use axum::{
    Router,
    extract::{Path, RawQuery, State},
    response::IntoResponse,
    routing::{get, post},
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::AppState;
use crate::api::extract::{ApiJson, ApiQuery};
use crate::api::models::{
    CompareRequest, HealthResponse, RelatedQueryRequest, RelatedQueryResponse, ScoreRequest,
    SearchParams,
};
use crate::api::response;
use crate::error::{AppError, Result};
use crate::search::SearchQuery;

pub fn create_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/search_results/:query", get(search_handler))
        .route("/search_candidates/:query", get(candidates_handler))
        .route("/read_article/*url", get(read_article_handler))
        .route("/score", post(score_handler))
        .route("/score/compare", post(compare_handler))
        .route("/related_query", post(related_query_handler))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(app_state)
}

async fn health_handler() -> impl IntoResponse {
    response::success(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

fn search_query(state: &AppState, text: &str, params: SearchParams) -> Result<SearchQuery> {
    let defaults = &state.config.search;
    SearchQuery::from_params(
        text,
        params.max_results.unwrap_or(defaults.default_max_results),
        params.country,
        params.language.or_else(|| Some(defaults.default_language.clone())),
        params.start_date.as_deref(),
        params.end_date.as_deref(),
    )
}

async fn search_handler(
    State(state): State<AppState>,
    Path(query): Path<String>,
    ApiQuery(params): ApiQuery<SearchParams>,
) -> Result<impl IntoResponse> {
    let query = search_query(&state, &query, params)?;
    let articles = state.aggregator.search(&query).await?;
    info!(query = %query.text, count = articles.len(), "search served");
    Ok(response::success(articles))
}

/// Provider records only; no article pages are fetched.
async fn candidates_handler(
    State(state): State<AppState>,
    Path(query): Path<String>,
    ApiQuery(params): ApiQuery<SearchParams>,
) -> Result<impl IntoResponse> {
    let query = search_query(&state, &query, params)?;
    let candidates = state.aggregator.candidates(&query).await?;
    info!(query = %query.text, count = candidates.len(), "candidates served");
    Ok(response::success(candidates))
}

/// The article URL is the rest of the path; its own query string arrives
/// separately and is re-attached.
async fn read_article_handler(
    State(state): State<AppState>,
    Path(url): Path<String>,
    RawQuery(raw_query): RawQuery,
) -> Result<impl IntoResponse> {
    let url = match raw_query {
        Some(q) if !q.is_empty() => format!("{url}?{q}"),
        _ => url,
    };
    if url.trim().is_empty() {
        return Err(AppError::InvalidQuery("article URL must not be empty".into()));
    }

    let article = state.aggregator.resolve_article(&url).await;
    Ok(response::success(article))
}

async fn score_handler(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<ScoreRequest>,
) -> Result<impl IntoResponse> {
    let scores = state.scorer.score_one(&req.article).await?;
    Ok(response::success(scores))
}

async fn compare_handler(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<CompareRequest>,
) -> Result<impl IntoResponse> {
    let scores = state.scorer.score_two(&req.article1, &req.article2).await?;
    Ok(response::success(scores))
}

async fn related_query_handler(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<RelatedQueryRequest>,
) -> Result<impl IntoResponse> {
    let query = state.scorer.suggest_related_query(&req.text).await?;
    Ok(response::success(RelatedQueryResponse { query }))
}
