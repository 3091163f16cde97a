pub mod api;
pub mod config;
pub mod dates;
pub mod error;
pub mod llm;
pub mod scoring;
pub mod scraper;
pub mod search;
pub mod telemetry;

use std::sync::Arc;

use config::Config;
use error::Result;
use scoring::BiasScorer;
use scraper::{ArticleResolver, HttpPageFetcher};
use search::{GoogleNewsProvider, SearchAggregator};

/// Application state that will be shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub aggregator: Arc<SearchAggregator>,
    pub scorer: Arc<BiasScorer>,
}

impl AppState {
    pub fn new(config: Config, aggregator: SearchAggregator, scorer: BiasScorer) -> Self {
        Self {
            config: Arc::new(config),
            aggregator: Arc::new(aggregator),
            scorer: Arc::new(scorer),
        }
    }

    /// Wires the production collaborators described by `config`.
    pub fn from_config(config: Config) -> Result<Self> {
        let search = &config.search;
        let provider = GoogleNewsProvider::new(&search.news_base_url, search.fetch_timeout)?;
        let fetcher = HttpPageFetcher::new(search.fetch_timeout)?;
        let aggregator = SearchAggregator::new(
            Arc::new(provider),
            ArticleResolver::new(Arc::new(fetcher)),
            search.resolve_concurrency,
        );

        let model = llm::build_model(&config.model)?;
        let scorer = BiasScorer::new(model, config.model.timeout);

        Ok(Self::new(config, aggregator, scorer))
    }
}
