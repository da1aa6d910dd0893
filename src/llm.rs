//! Proveedores externos de IA: embeddings y chat (API REST de OpenAI).
//!
//! Los dos proveedores se modelan como traits para poder sustituirlos por
//! dobles en los tests. Ninguno de los dos se cachea a nivel de módulo: se
//! construyen en `main` y se pasan hacia abajo.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::config::AppConfig;
use crate::models::LlmUsage;

/// Vector de relleno para el modo degradado: cuando el proveedor de
/// embeddings no está disponible, la búsqueda sigue devolviendo *algo*
/// de forma reproducible en lugar de fallar. El ranking resultante no
/// tiene sentido semántico; cada uso se registra con `warn!`.
pub fn placeholder_vector(dimension: usize) -> Vec<f64> {
    vec![0.0; dimension]
}

// ---------------------------------------------------------------------
// EMBEDDINGS
// ---------------------------------------------------------------------

/// Convierte texto en un vector de dimensión fija.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f64>>;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f64>>>;

    /// Dimensión de salida del modelo, fija para todo el sistema.
    fn dimension(&self) -> usize;
}

/// Cliente de `POST /v1/embeddings` de OpenAI.
pub struct OpenAiEmbeddings {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
    model: String,
    dimension: usize,
}

impl OpenAiEmbeddings {
    pub fn from_config(cfg: &AppConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.provider_timeout_secs))
            .build()
            .context("No se pudo construir el cliente HTTP de embeddings")?;
        Ok(Self {
            client,
            api_key: cfg.openai_api_key.clone(),
            base_url: cfg.openai_base_url.clone(),
            model: cfg.embedding_model.clone(),
            dimension: cfg.embedding_dimension,
        })
    }
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Deserialize)]
struct EmbeddingItem {
    embedding: Vec<f64>,
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddings {
    async fn embed(&self, text: &str) -> Result<Vec<f64>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| anyhow!("El proveedor devolvió una respuesta sin embeddings"))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f64>>> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| anyhow!("OPENAI_API_KEY no configurada"))?;

        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(api_key)
            .json(&json!({ "model": self.model, "input": texts }))
            .send()
            .await
            .context("No se pudo contactar con el proveedor de embeddings")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Error {status} del proveedor de embeddings: {body}");
        }

        let parsed: EmbeddingsResponse = response
            .json()
            .await
            .context("Respuesta de embeddings no parseable")?;

        if parsed.data.len() != texts.len() {
            bail!(
                "Número de embeddings ({}) distinto al número de textos ({})",
                parsed.data.len(),
                texts.len()
            );
        }

        for item in &parsed.data {
            if item.embedding.len() != self.dimension {
                bail!(
                    "Dimensión de embedding inesperada: {} (se esperaba {})",
                    item.embedding.len(),
                    self.dimension
                );
            }
        }

        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

// ---------------------------------------------------------------------
// CHAT / COMPLETION
// ---------------------------------------------------------------------

/// Respuesta de chat con los metadatos de uso que alimentan la analítica.
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub usage: LlmUsage,
}

/// Genera una respuesta de chat con un modelo concreto.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(
        &self,
        model: &str,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<Completion>;
}

/// Cliente de `POST /v1/chat/completions` de OpenAI.
pub struct OpenAiCompletions {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
    max_tokens: u32,
    temperature: f64,
}

impl OpenAiCompletions {
    pub fn from_config(cfg: &AppConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.provider_timeout_secs))
            .build()
            .context("No se pudo construir el cliente HTTP de chat")?;
        Ok(Self {
            client,
            api_key: cfg.openai_api_key.clone(),
            base_url: cfg.openai_base_url.clone(),
            max_tokens: cfg.completion_max_tokens,
            temperature: cfg.completion_temperature,
        })
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    model: Option<String>,
    system_fingerprint: Option<String>,
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    prompt_tokens: i64,
    completion_tokens: i64,
}

#[async_trait]
impl CompletionProvider for OpenAiCompletions {
    async fn complete(
        &self,
        model: &str,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<Completion> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| anyhow!("OPENAI_API_KEY no configurada"))?;

        let body = json!({
            "model": model,
            "messages": [
                { "role": "system", "content": system_prompt },
                { "role": "user", "content": user_prompt },
            ],
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .context("No se pudo contactar con el proveedor de chat")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Error {status} del proveedor de chat: {body}");
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .context("Respuesta de chat no parseable")?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("Respuesta de chat sin choices"))?;
        let text = choice
            .message
            .content
            .ok_or_else(|| anyhow!("Respuesta de chat sin contenido"))?;

        let reported_model = parsed.model.unwrap_or_else(|| model.to_string());
        let (input_tokens, output_tokens) = parsed
            .usage
            .map(|u| (u.prompt_tokens, u.completion_tokens))
            .unwrap_or((0, 0));

        let usage = LlmUsage {
            cost: completion_cost(&reported_model, input_tokens, output_tokens),
            model: reported_model,
            input_tokens,
            output_tokens,
            finish_reason: choice.finish_reason,
            system_fingerprint: parsed.system_fingerprint,
        };

        Ok(Completion { text, usage })
    }
}

/// Tarifas por millón de tokens (entrada, salida) en USD.
const MODEL_PRICES: &[(&str, f64, f64)] = &[
    ("gpt-4o-mini", 0.15, 0.60),
    ("gpt-4o", 2.50, 10.00),
    ("gpt-4.1-mini", 0.40, 1.60),
    ("gpt-3.5-turbo", 0.50, 1.50),
];

/// Coste monetario aproximado de una petición de chat. Los modelos con
/// sufijo de fecha (`gpt-4o-mini-2024-07-18`) caen en la tarifa del prefijo.
pub fn completion_cost(model: &str, input_tokens: i64, output_tokens: i64) -> f64 {
    // El orden de MODEL_PRICES importa: los nombres más largos van primero
    // para que "gpt-4o" no capture a "gpt-4o-mini".
    for (name, input_price, output_price) in MODEL_PRICES {
        if model.starts_with(name) {
            return (input_tokens as f64 * input_price + output_tokens as f64 * output_price)
                / 1_000_000.0;
        }
    }
    0.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn el_vector_de_relleno_es_reproducible() {
        assert_eq!(placeholder_vector(4), vec![0.0; 4]);
        assert_eq!(placeholder_vector(4), placeholder_vector(4));
    }

    #[test]
    fn coste_gpt_4o_mini() {
        let cost = completion_cost("gpt-4o-mini-2024-07-18", 1_000_000, 1_000_000);
        assert!((cost - 0.75).abs() < 1e-9);
    }

    #[test]
    fn coste_cero_para_modelos_desconocidos() {
        assert_eq!(completion_cost("mistral-large", 1000, 1000), 0.0);
    }

    #[test]
    fn gpt_4o_mini_no_cae_en_la_tarifa_de_gpt_4o() {
        let mini = completion_cost("gpt-4o-mini", 1_000_000, 0);
        assert!((mini - 0.15).abs() < 1e-9);
    }
}
