//! Configuration management for Recall.
//!
//! Loads configuration from environment variables (and `.env`) with support for:
//! - Multiple LLM and embedding providers with fallback priority
//! - An optional Qdrant vector store
//! - Tunables for retrieval, context assembly and extraction

use std::env;
use std::str::FromStr;
use std::sync::OnceLock;

use recall_embeddings::{EmbeddingConfig, EmbeddingProviderConfig};
use recall_llm::{LlmConfig, LlmProviderConfig};
use recall_qdrant::QdrantConfig;

/// Global configuration instance
static CONFIG: OnceLock<Config> = OnceLock::new();

/// Get the global configuration
pub fn config() -> &'static Config {
    CONFIG.get_or_init(Config::from_env)
}

/// Initialize configuration (call once at startup)
pub fn init() -> &'static Config {
    config()
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub database: DatabaseConfig,
    /// `None` when `QDRANT_URL` is unset; vector search then always falls
    /// back to keyword lookup.
    pub qdrant: Option<QdrantConfig>,
    pub embedding: EmbeddingConfig,
    pub llm: LlmConfig,
    pub memory: MemorySettings,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub format: LogFormat,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: String,
}

/// Tunables for the memory pipeline.
#[derive(Debug, Clone)]
pub struct MemorySettings {
    /// Token budget for the whole assembled context block
    pub token_budget: usize,
    /// Jaccard similarity above which an extracted fact is a duplicate
    pub dedup_threshold: f64,
    /// Number of existing memories compared against during dedup
    pub dedup_pool_size: i64,
    /// Minimum vector similarity for a hit to count
    pub score_threshold: f32,
    /// Candidates pulled from hybrid search when building context
    pub context_candidates: usize,
    pub extraction_temperature: f32,
    pub extraction_max_tokens: u32,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            token_budget: 800,
            dedup_threshold: 0.9,
            dedup_pool_size: 100,
            score_threshold: 0.7,
            context_candidates: 10,
            extraction_temperature: 0.2,
            extraction_max_tokens: 1024,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8765,
            },
            logging: LoggingConfig {
                format: LogFormat::Pretty,
            },
            database: DatabaseConfig {
                path: ":memory:".to_string(),
            },
            qdrant: None,
            embedding: EmbeddingConfig::default(),
            llm: LlmConfig::default(),
            memory: MemorySettings::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let defaults = MemorySettings::default();

        Self {
            server: ServerConfig {
                host: env_or("HOST", "0.0.0.0"),
                port: env_parse("PORT", 8765),
            },
            logging: LoggingConfig {
                format: match env_or("LOG_FORMAT", "pretty").to_lowercase().as_str() {
                    "json" => LogFormat::Json,
                    _ => LogFormat::Pretty,
                },
            },
            database: DatabaseConfig {
                path: env_or("DATABASE_PATH", "./data/recall.db"),
            },
            qdrant: env::var("QDRANT_URL")
                .ok()
                .filter(|url| !url.trim().is_empty())
                .map(|url| QdrantConfig::new(url, env_or("QDRANT_COLLECTION_PREFIX", "recall_"))),
            embedding: Self::parse_embedding_config(),
            llm: LlmConfig {
                providers: Self::parse_llm_providers(),
            },
            memory: MemorySettings {
                token_budget: env_parse("MEMORY_TOKEN_BUDGET", defaults.token_budget),
                dedup_threshold: env_parse("MEMORY_DEDUP_THRESHOLD", defaults.dedup_threshold),
                dedup_pool_size: env_parse("MEMORY_DEDUP_POOL_SIZE", defaults.dedup_pool_size),
                score_threshold: env_parse("MEMORY_SCORE_THRESHOLD", defaults.score_threshold),
                context_candidates: env_parse(
                    "MEMORY_CONTEXT_CANDIDATES",
                    defaults.context_candidates,
                ),
                extraction_temperature: env_parse(
                    "MEMORY_EXTRACTION_TEMPERATURE",
                    defaults.extraction_temperature,
                ),
                extraction_max_tokens: env_parse(
                    "MEMORY_EXTRACTION_MAX_TOKENS",
                    defaults.extraction_max_tokens,
                ),
            },
        }
    }

    /// Parse LLM providers from environment.
    /// Supports Gemini, Anthropic, OpenRouter, and OpenAI with automatic fallback ordering.
    fn parse_llm_providers() -> Vec<LlmProviderConfig> {
        let mut providers = Vec::new();

        // Gemini (priority 1 - free tier)
        if let Ok(api_key) = env::var("GOOGLE_API_KEY") {
            providers.push(LlmProviderConfig {
                name: "gemini".to_string(),
                base_url: recall_llm::default_endpoint("gemini"),
                model: env_or("GEMINI_MODEL", "gemini-1.5-flash"),
                api_key,
                priority: 1,
            });
        }

        if let Ok(api_key) = env::var("ANTHROPIC_API_KEY") {
            providers.push(LlmProviderConfig {
                name: "anthropic".to_string(),
                base_url: recall_llm::default_endpoint("anthropic"),
                model: env_or("ANTHROPIC_MODEL", "claude-3-5-haiku-20241022"),
                api_key,
                priority: 2,
            });
        }

        if let Ok(api_key) = env::var("OPENROUTER_API_KEY") {
            providers.push(LlmProviderConfig {
                name: "openrouter".to_string(),
                base_url: recall_llm::default_endpoint("openrouter"),
                model: env_or("OPENROUTER_MODEL", "meta-llama/llama-3-8b-instruct:free"),
                api_key,
                priority: 3,
            });
        }

        if let Ok(api_key) = env::var("OPENAI_API_KEY") {
            providers.push(LlmProviderConfig {
                name: "openai".to_string(),
                base_url: recall_llm::default_endpoint("openai"),
                model: env_or("OPENAI_MODEL", "gpt-4o-mini"),
                api_key,
                priority: 4,
            });
        }

        providers.sort_by_key(|p| p.priority);
        providers
    }

    /// Parse embedding providers from environment.
    /// Supports Gemini, OpenAI and a local Ollama with automatic fallback ordering.
    fn parse_embedding_config() -> EmbeddingConfig {
        let mut providers = Vec::new();

        if let Ok(api_key) = env::var("GOOGLE_API_KEY") {
            providers.push(EmbeddingProviderConfig {
                name: "gemini".to_string(),
                base_url: recall_embeddings::default_endpoint("gemini"),
                model: env_or("GEMINI_EMBEDDING_MODEL", "text-embedding-004"),
                api_key,
                priority: 1,
            });
        }

        if let Ok(api_key) = env::var("OPENAI_API_KEY") {
            providers.push(EmbeddingProviderConfig {
                name: "openai".to_string(),
                base_url: recall_embeddings::default_endpoint("openai"),
                model: env_or("OPENAI_EMBEDDING_MODEL", "text-embedding-3-small"),
                api_key,
                priority: 2,
            });
        }

        // Ollama - local/self-hosted, preferred when present
        if let Ok(ollama_url) = env::var("OLLAMA_URL") {
            providers.push(EmbeddingProviderConfig {
                name: "ollama".to_string(),
                base_url: ollama_url,
                model: env_or("OLLAMA_EMBEDDING_MODEL", "nomic-embed-text"),
                api_key: String::new(),
                priority: env_parse("OLLAMA_PRIORITY", 1),
            });
        }

        providers.sort_by_key(|p| p.priority);

        // Every provider is asked for (or natively produces) 768 dimensions
        EmbeddingConfig {
            providers,
            dimension: env_parse("EMBEDDING_DIMENSION", 768),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Parse an environment variable, falling back to `default` when unset or invalid.
fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "Invalid value in environment, using default");
            default
        }),
        Err(_) => default,
    }
}
