//! Carga y gestión de configuración de la aplicación (PostgreSQL + OpenAI).

use std::env;

use anyhow::{anyhow, Result};

/// Configuración completa de la aplicación.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database_url: String,
    pub server_addr: String,

    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub embedding_model: String,
    pub embedding_dimension: usize,
    pub chat_model: String,
    pub chat_model_fallback: String,

    pub default_top_k: usize,
    pub default_min_relevance: f64,
    pub provider_timeout_secs: u64,
    pub context_char_budget: usize,
    pub completion_max_tokens: u32,
    pub completion_temperature: f64,
}

impl AppConfig {
    /// Carga la configuración desde variables de entorno (usando .env si existe).
    ///
    /// `OPENAI_API_KEY` es opcional: sin clave el sistema arranca en modo
    /// degradado (vector de relleno para embeddings, respuesta de cortesía
    /// para el chat).
    pub fn from_env() -> Result<Self> {
        let database_url = env::var("DATABASE_URL")
            .map_err(|_| anyhow!("Falta DATABASE_URL en el entorno"))?;

        let server_addr =
            env::var("SERVER_ADDR").unwrap_or_else(|_| "127.0.0.1:3322".to_string());

        let openai_api_key = env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty());
        let openai_base_url = env::var("OPENAI_BASE_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());

        let embedding_model = env::var("LLM_EMBEDDING_MODEL")
            .unwrap_or_else(|_| "text-embedding-3-small".to_string());
        let embedding_dimension = parse_env("EMBEDDING_DIMENSION", 1536)?;

        let chat_model =
            env::var("LLM_CHAT_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
        // El modelo de reserva debe ser distinto al principal para que el
        // reintento tenga sentido.
        let chat_model_fallback =
            env::var("LLM_CHAT_MODEL_FALLBACK").unwrap_or_else(|_| "gpt-3.5-turbo".to_string());

        let default_top_k = parse_env("DEFAULT_TOP_K", 5usize)?;
        let default_min_relevance = parse_env("DEFAULT_MIN_RELEVANCE", 0.0f64)?;
        let provider_timeout_secs = parse_env("PROVIDER_TIMEOUT_SECS", 30u64)?;
        let context_char_budget = parse_env("CONTEXT_CHAR_BUDGET", 6000usize)?;
        let completion_max_tokens = parse_env("COMPLETION_MAX_TOKENS", 700u32)?;
        let completion_temperature = parse_env("COMPLETION_TEMPERATURE", 0.2f64)?;

        Ok(Self {
            database_url,
            server_addr,
            openai_api_key,
            openai_base_url,
            embedding_model,
            embedding_dimension,
            chat_model,
            chat_model_fallback,
            default_top_k,
            default_min_relevance,
            provider_timeout_secs,
            context_char_budget,
            completion_max_tokens,
            completion_temperature,
        })
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|_| anyhow!("Valor inválido para {name}: '{raw}'")),
        Err(_) => Ok(default),
    }
}
