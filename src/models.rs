//! Modelos de dominio: documentos de la base de conocimiento, resultados de
//! búsqueda, eventos de analítica y agregados de consultas.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Un fragmento de conocimiento legal con su embedding.
///
/// `embedding = None` significa "pendiente de re-embedding": la fila existe
/// pero queda excluida del ranking semántico hasta que se recalcule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub parent_id: Option<String>,
    pub title: String,
    pub content: String,
    pub category: String,
    pub metadata: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f64>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    /// Construye un documento nuevo con id determinista y timestamps actuales.
    pub fn new(
        title: impl Into<String>,
        content: impl Into<String>,
        category: impl Into<String>,
        metadata: serde_json::Value,
        embedding: Option<Vec<f64>>,
    ) -> Self {
        let title = title.into();
        let content = content.into();
        let category = category.into();
        let now = Utc::now();
        Self {
            id: document_id(&title, &category, &content),
            parent_id: None,
            title,
            content,
            category,
            metadata,
            embedding,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Id estable de un documento: hash de título + categoría + contenido.
/// Volver a sembrar el mismo corpus produce los mismos ids.
pub fn document_id(title: &str, category: &str, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(title.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(category.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(content.as_bytes());
    let digest = hasher.finalize();
    // 16 bytes en hex bastan como clave estable y legible.
    hex_prefix(&digest, 16)
}

fn hex_prefix(bytes: &[u8], n: usize) -> String {
    bytes.iter().take(n).map(|b| format!("{b:02x}")).collect()
}

/// Documento puntuado devuelto por el vector store.
///
/// `relevance = None` indica degradación parcial: el operador de distancia
/// secundario no permite derivar `1 - distancia_coseno`, y no se inventa
/// un número.
#[derive(Debug, Clone)]
pub struct RankedDocument {
    pub id: String,
    pub title: String,
    pub content: String,
    pub category: String,
    pub metadata: serde_json::Value,
    pub relevance: Option<f64>,
}

/// Resultado público de la búsqueda semántica.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub id: String,
    pub title: String,
    pub content: String,
    pub category: String,
    pub keywords: Vec<String>,
    /// Sin recortar: puede ser negativa para vectores muy disímiles.
    pub relevance: Option<f64>,
}

/// Uso del LLM reportado por el proveedor para una petición de chat.
#[derive(Debug, Clone, Serialize)]
pub struct LlmUsage {
    pub model: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost: f64,
    pub finish_reason: Option<String>,
    pub system_fingerprint: Option<String>,
}

/// Metadatos de la petición HTTP que acompañan a cada evento.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub user_agent: Option<String>,
    pub client_ip: Option<String>,
}

/// Evento de búsqueda (tabla `search_events`, solo-inserción).
#[derive(Debug, Clone)]
pub struct SearchEvent {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub query: String,
    pub top_k: i32,
    pub min_relevance: Option<f64>,
    pub search_type: String,
    pub total: i32,
    pub result_ids: Vec<String>,
    pub response_time_ms: i64,
    pub success: bool,
    pub request: RequestContext,
}

/// Evento de pregunta RAG (tabla `ask_events`, solo-inserción).
#[derive(Debug, Clone)]
pub struct AskEvent {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub question: String,
    pub answer: String,
    pub top_k: i32,
    pub result_ids: Vec<String>,
    pub response_time_ms: i64,
    pub usage: Option<LlmUsage>,
    pub success: bool,
    pub error_message: Option<String>,
    pub request: RequestContext,
}

/// Agregado de analítica: una fila por consulta normalizada.
#[derive(Debug, Clone, Serialize)]
pub struct QueryAggregate {
    pub query_normalized: String,
    pub total_count: i64,
    pub last_seen: DateTime<Utc>,
    pub avg_response_time: f64,
    pub success_rate: f64,
    pub categories: Vec<String>,
}
