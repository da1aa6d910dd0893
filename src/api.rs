//! API HTTP del asistente legal.
//!
//! Validación de entrada en la frontera (4xx antes de tocar el núcleo);
//! los fallos esperados de proveedores/almacén nunca producen un 5xx:
//! la búsqueda siempre devuelve una lista (quizá vacía) y la pregunta
//! siempre devuelve una respuesta (quizá de cortesía).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Instant;

use axum::{
    extract::{ConnectInfo, Json, Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post},
    Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tokio::spawn;
use tracing::{error, info};
use uuid::Uuid;

use crate::{
    app_state::{AppState, Status},
    ingest,
    models::{AskEvent, Document, RequestContext, SearchEvent, SearchHit},
    rag, retrieval,
};

/// Longitud máxima aceptada para consultas y preguntas.
const MAX_QUERY_CHARS: usize = 8000;
/// Máximo `top_k` admitido por petición.
const MAX_TOP_K: usize = 50;

// --- Payloads de la API ---

#[derive(Deserialize)]
pub struct SearchPayload {
    query: String,
    top_k: Option<usize>,
    min_relevance: Option<f64>,
    session_id: Option<String>,
    user_id: Option<String>,
}

#[derive(Deserialize)]
pub struct AskPayload {
    question: String,
    top_k: Option<usize>,
    session_id: Option<String>,
    user_id: Option<String>,
}

#[derive(Deserialize)]
pub struct DocumentPayload {
    id: Option<String>,
    parent_id: Option<String>,
    title: String,
    content: String,
    category: String,
    metadata: Option<serde_json::Value>,
}

#[derive(Deserialize)]
pub struct IngestPayload {
    path: String,
}

type ApiError = (StatusCode, Json<serde_json::Value>);

fn bad_request(message: &str) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message })))
}

// --- Router ---

pub fn create_router(app_state: AppState) -> Router {
    Router::new()
        .route("/api/search", post(search_handler))
        .route("/api/ask", post(ask_handler))
        .route("/api/documents", post(upsert_document_handler))
        .route("/api/documents/:id", get(get_document_handler))
        .route("/api/documents/:id", delete(delete_document_handler))
        .route("/api/ingest", post(ingest_handler))
        .route("/api/status", get(status_handler))
        .route("/api/health", get(health_handler))
        .route("/api/stats", get(stats_handler))
        .route("/api/shutdown", post(shutdown_handler))
        .with_state(app_state)
}

// --- Contexto de la petición ---

/// Sesión/usuario del cuerpo (prioritario) o de las cabeceras
/// `x-session-id` / `x-user-id`; agente e IP para la analítica.
fn request_context(
    headers: &HeaderMap,
    addr: &SocketAddr,
    session_id: Option<String>,
    user_id: Option<String>,
) -> RequestContext {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    let client_ip = header("x-forwarded-for")
        .map(|raw| raw.split(',').next().unwrap_or(&raw).trim().to_string())
        .unwrap_or_else(|| addr.ip().to_string());

    RequestContext {
        session_id: session_id.or_else(|| header("x-session-id")),
        user_id: user_id.or_else(|| header("x-user-id")),
        user_agent: header("user-agent"),
        client_ip: Some(client_ip),
    }
}

fn validate_query(text: &str, label: &str) -> Result<(), ApiError> {
    if text.trim().is_empty() {
        return Err(bad_request(&format!("El campo '{label}' no puede estar vacío")));
    }
    if text.chars().count() > MAX_QUERY_CHARS {
        return Err(bad_request(&format!(
            "El campo '{label}' supera el máximo de {MAX_QUERY_CHARS} caracteres"
        )));
    }
    Ok(())
}

fn validate_top_k(top_k: usize) -> Result<(), ApiError> {
    if top_k == 0 || top_k > MAX_TOP_K {
        return Err(bad_request(&format!("top_k debe estar entre 1 y {MAX_TOP_K}")));
    }
    Ok(())
}

fn categories_of(hits: &[SearchHit]) -> Vec<String> {
    let mut categories = Vec::new();
    for hit in hits {
        if !categories.contains(&hit.category) {
            categories.push(hit.category.clone());
        }
    }
    categories
}

// --- Handlers principales ---

#[axum::debug_handler]
async fn search_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(payload): Json<SearchPayload>,
) -> Result<Json<serde_json::Value>, ApiError> {
    validate_query(&payload.query, "query")?;
    let top_k = payload.top_k.unwrap_or(state.config.default_top_k);
    validate_top_k(top_k)?;
    let min_relevance = payload.min_relevance.or(Some(state.config.default_min_relevance));

    let started = Instant::now();
    let results = retrieval::search(
        state.store.as_ref(),
        state.embedder.as_ref(),
        &payload.query,
        top_k,
        min_relevance,
    )
    .await;
    let elapsed_ms = started.elapsed().as_millis() as i64;

    let event = SearchEvent {
        id: Uuid::new_v4().to_string(),
        created_at: Utc::now(),
        query: payload.query.clone(),
        top_k: top_k as i32,
        min_relevance,
        search_type: "semantic".to_string(),
        total: results.len() as i32,
        result_ids: results.iter().map(|r| r.id.clone()).collect(),
        response_time_ms: elapsed_ms,
        success: true,
        request: request_context(&headers, &addr, payload.session_id, payload.user_id),
    };
    state.events.log_search(&event, &categories_of(&results)).await;

    let total = results.len();
    Ok(Json(json!({ "results": results, "total": total })))
}

#[axum::debug_handler]
async fn ask_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(payload): Json<AskPayload>,
) -> Result<Json<serde_json::Value>, ApiError> {
    validate_query(&payload.question, "question")?;
    let top_k = payload.top_k.unwrap_or(state.config.default_top_k);
    validate_top_k(top_k)?;

    let started = Instant::now();
    let outcome = rag::answer(
        state.store.as_ref(),
        state.embedder.as_ref(),
        state.completions.as_ref(),
        &state.config,
        &payload.question,
        top_k,
    )
    .await;
    let elapsed_ms = started.elapsed().as_millis() as i64;

    let event = AskEvent {
        id: Uuid::new_v4().to_string(),
        created_at: Utc::now(),
        question: payload.question.clone(),
        answer: outcome.answer.clone(),
        top_k: top_k as i32,
        result_ids: outcome.sources.iter().map(|s| s.id.clone()).collect(),
        response_time_ms: elapsed_ms,
        usage: outcome.usage.clone(),
        success: outcome.success,
        error_message: outcome.error_message.clone(),
        request: request_context(&headers, &addr, payload.session_id, payload.user_id),
    };
    state
        .events
        .log_ask(&event, &categories_of(&outcome.sources))
        .await;

    Ok(Json(json!({
        "answer": outcome.answer,
        "sources": outcome.sources,
        "processing_time_ms": elapsed_ms,
    })))
}

// --- Handlers de administración de documentos ---

/// Alta o edición de un documento. La edición recalcula el embedding en la
/// misma operación; si el proveedor está caído, la fila queda sin embedding
/// (fuera del ranking) en lugar de conservar uno obsoleto.
#[axum::debug_handler]
async fn upsert_document_handler(
    State(state): State<AppState>,
    Json(payload): Json<DocumentPayload>,
) -> Result<impl IntoResponse, ApiError> {
    validate_query(&payload.title, "title")?;
    validate_query(&payload.content, "content")?;

    let embedding = match state.embedder.embed(&payload.content).await {
        Ok(vector) => Some(vector),
        Err(e) => {
            error!("Documento sin embedding (proveedor caído): {e}");
            None
        }
    };

    let mut doc = Document::new(
        payload.title,
        payload.content,
        payload.category,
        payload.metadata.unwrap_or_else(|| json!({})),
        embedding,
    );
    doc.parent_id = payload.parent_id;

    if let Some(id) = payload.id {
        doc.id = id.clone();
        if state.store.get(&id).await.is_some() {
            if state.store.update_document(&doc).await {
                return Ok((StatusCode::OK, Json(json!({ "id": doc.id, "updated": true }))));
            }
            return Err((
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": "No se pudo actualizar el documento" })),
            ));
        }
    }

    if state.store.upsert(&doc).await {
        Ok((StatusCode::CREATED, Json(json!({ "id": doc.id, "updated": false }))))
    } else {
        Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "No se pudo guardar el documento" })),
        ))
    }
}

#[axum::debug_handler]
async fn get_document_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Document>, StatusCode> {
    state
        .store
        .get(&id)
        .await
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

#[axum::debug_handler]
async fn delete_document_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> StatusCode {
    if state.store.delete(&id).await {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

// --- Handlers de operación ---

#[axum::debug_handler]
async fn ingest_handler(
    State(state): State<AppState>,
    Json(payload): Json<IngestPayload>,
) -> Result<impl IntoResponse, ApiError> {
    let root = PathBuf::from(&payload.path);
    if !root.is_dir() {
        return Err(bad_request("La ruta proporcionada no es un directorio válido"));
    }

    if !try_begin_ingest(&state.status) {
        return Err((
            StatusCode::CONFLICT,
            Json(json!({ "error": "Ya hay una siembra en curso" })),
        ));
    }

    spawn(async move {
        let result = ingest::ingest_directory(
            state.store.as_ref(),
            state.embedder.as_ref(),
            &root,
            state.status.clone(),
        )
        .await;

        let mut status = state.status.lock().unwrap();
        status.is_busy = false;
        status.progress = 0.0;
        match result {
            Ok(summary) => {
                status.message = format!("¡Siembra completada! {summary}");
            }
            Err(err) => {
                status.message = format!("Error en la siembra: {err}");
                error!("Error de siembra: {err}");
            }
        }
    });

    Ok(StatusCode::ACCEPTED)
}

/// Reserva el estado de siembra en una única toma del lock: comprobar
/// `is_busy` y marcarlo deben ser atómicos para que dos peticiones
/// simultáneas no arranquen dos siembras.
fn try_begin_ingest(status: &std::sync::Mutex<Status>) -> bool {
    let mut status = status.lock().unwrap();
    if status.is_busy {
        return false;
    }
    status.is_busy = true;
    status.message = "Iniciando siembra de la base de conocimiento...".to_string();
    status.progress = 0.0;
    true
}

#[axum::debug_handler]
async fn status_handler(State(state): State<AppState>) -> Json<Status> {
    Json(state.status.lock().unwrap().clone())
}

#[axum::debug_handler]
async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let store_ok = state.store.ping().await;
    Json(json!({
        "status": if store_ok { "ok" } else { "degraded" },
        "store": store_ok,
        "llm_configured": state.config.openai_api_key.is_some(),
    }))
}

#[axum::debug_handler]
async fn stats_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let documents = state.store.count().await;
    let (searches, asks) = state.events.event_counts().await;
    let top_queries = state.events.top_queries(10).await;
    Json(json!({
        "documents": documents,
        "search_events": searches,
        "ask_events": asks,
        "top_queries": top_queries,
    }))
}

#[axum::debug_handler]
async fn shutdown_handler(State(state): State<AppState>) -> impl IntoResponse {
    info!("Petición de apagado recibida.");
    if let Some(sender) = state.shutdown_sender.lock().unwrap().take() {
        let _ = sender.send(());
    }
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::{try_begin_ingest, validate_query, validate_top_k, MAX_QUERY_CHARS};
    use crate::app_state::Status;

    #[test]
    fn la_consulta_vacia_o_en_blanco_se_rechaza() {
        assert!(validate_query("", "query").is_err());
        assert!(validate_query("   \t ", "query").is_err());
        assert!(validate_query("férias", "query").is_ok());
    }

    #[test]
    fn la_consulta_se_rechaza_justo_por_encima_del_maximo() {
        let al_limite = "a".repeat(MAX_QUERY_CHARS);
        assert!(validate_query(&al_limite, "query").is_ok());
        let excedida = "a".repeat(MAX_QUERY_CHARS + 1);
        assert!(validate_query(&excedida, "query").is_err());
    }

    #[test]
    fn top_k_fuera_de_rango_se_rechaza() {
        assert!(validate_top_k(0).is_err());
        assert!(validate_top_k(1).is_ok());
        assert!(validate_top_k(50).is_ok());
        assert!(validate_top_k(51).is_err());
    }

    #[test]
    fn solo_una_siembra_puede_reservar_el_estado() {
        let status = Mutex::new(Status::default());
        assert!(try_begin_ingest(&status));
        // La segunda petición encuentra el estado ya ocupado.
        assert!(!try_begin_ingest(&status));

        status.lock().unwrap().is_busy = false;
        assert!(try_begin_ingest(&status));
    }
}
