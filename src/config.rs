use std::env;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{AppError, Result};

/// Which hosted model answers scoring prompts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelBackend {
    Gemini,
    OpenRouter,
}

impl ModelBackend {
    pub fn default_model(self) -> &'static str {
        match self {
            ModelBackend::Gemini => "gemini-1.5-flash",
            ModelBackend::OpenRouter => "deepseek/deepseek-chat-v3-0324",
        }
    }

    pub fn default_base_url(self) -> &'static str {
        match self {
            ModelBackend::Gemini => "https://generativelanguage.googleapis.com",
            ModelBackend::OpenRouter => "https://openrouter.ai",
        }
    }

    fn key_var(self) -> &'static str {
        match self {
            ModelBackend::Gemini => "GEMINI_API_KEY",
            ModelBackend::OpenRouter => "OPENROUTER_API_KEY",
        }
    }
}

impl FromStr for ModelBackend {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gemini" | "google" => Ok(ModelBackend::Gemini),
            "openrouter" => Ok(ModelBackend::OpenRouter),
            other => Err(AppError::Config(format!("Unknown MODEL_BACKEND: {other}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub backend: ModelBackend,
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub timeout: Duration,
    pub max_retries: usize,
}

#[derive(Debug, Clone)]
pub struct SearchConfig {
    pub news_base_url: String,
    pub fetch_timeout: Duration,
    pub resolve_concurrency: usize,
    pub default_max_results: usize,
    pub default_language: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server_addr: SocketAddr,
    pub model: ModelConfig,
    pub search: SearchConfig,
}

impl Config {
    pub fn load() -> Result<Self> {
        // Load environment variables from .env file if it exists
        dotenv::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = lookup("HOST").unwrap_or_else(|| "127.0.0.1".to_string());
        let port: u16 = parse_or(&lookup, "PORT", 3000)?;
        let ip = IpAddr::from_str(&host)
            .map_err(|e| AppError::Config(format!("Invalid host address: {}", e)))?;

        let backend = match lookup("MODEL_BACKEND") {
            Some(raw) => raw.parse()?,
            None => ModelBackend::Gemini,
        };
        let api_key = lookup(backend.key_var())
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| AppError::Config(format!("{} is not set", backend.key_var())))?;

        let model = ModelConfig {
            backend,
            api_key,
            model: lookup("MODEL_NAME").unwrap_or_else(|| backend.default_model().to_string()),
            base_url: lookup("MODEL_BASE_URL")
                .unwrap_or_else(|| backend.default_base_url().to_string()),
            timeout: Duration::from_secs(parse_or(&lookup, "MODEL_TIMEOUT_SECS", 60)?),
            max_retries: parse_or(&lookup, "MODEL_MAX_RETRIES", 0)?,
        };

        let resolve_concurrency: usize = parse_or(&lookup, "RESOLVE_CONCURRENCY", 8)?;
        if resolve_concurrency == 0 {
            return Err(AppError::Config("RESOLVE_CONCURRENCY must be at least 1".into()));
        }

        let search = SearchConfig {
            news_base_url: lookup("NEWS_BASE_URL")
                .unwrap_or_else(|| "https://news.google.com".to_string()),
            fetch_timeout: Duration::from_secs(parse_or(&lookup, "FETCH_TIMEOUT_SECS", 10)?),
            resolve_concurrency,
            default_max_results: parse_or(&lookup, "DEFAULT_MAX_RESULTS", 10)?,
            default_language: lookup("DEFAULT_LANGUAGE").unwrap_or_else(|| "english".to_string()),
        };

        Ok(Config {
            server_addr: SocketAddr::new(ip, port),
            model,
            search,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| AppError::Config(format!("Invalid {key}: {e}"))),
        None => Ok(default),
    }
}
