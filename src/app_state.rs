//! Estado compartido de la aplicación: configuración y servicios construidos
//! en `main` y pasados a los handlers (nada de singletons de módulo).

use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use crate::config::AppConfig;
use crate::llm::{CompletionProvider, EmbeddingProvider};
use crate::query_log::EventLog;
use crate::vector_store::DocumentStore;

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub store: Arc<dyn DocumentStore>,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub completions: Arc<dyn CompletionProvider>,
    pub events: Arc<dyn EventLog>,
    pub status: Arc<Mutex<Status>>,
    pub shutdown_sender: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

/// Estado visible de los trabajos de fondo (siembra de la base de
/// conocimiento), consultable desde `/api/status`.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct Status {
    pub is_busy: bool,
    pub message: String,
    pub progress: f32, // Valor entre 0.0 y 1.0
}
