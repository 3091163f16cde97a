use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Deserialize)]
pub struct SearchParams {
    pub max_results: Option<usize>,
    pub country: Option<String>,
    pub language: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

#[derive(Deserialize)]
pub struct ScoreRequest {
    pub article: String,
}

#[derive(Deserialize)]
pub struct CompareRequest {
    pub article1: String,
    pub article2: String,
}

#[derive(Deserialize)]
pub struct RelatedQueryRequest {
    pub text: String,
}

#[derive(Serialize)]
pub struct RelatedQueryResponse {
    pub query: String,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}
