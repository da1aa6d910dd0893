//! Tests de extremo a extremo del pipeline de búsqueda/pregunta/analítica
//! sobre las implementaciones en memoria, con proveedores simulados.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;

use legal_rag_webapp::config::AppConfig;
use legal_rag_webapp::llm::{Completion, CompletionProvider, EmbeddingProvider};
use legal_rag_webapp::memory::{MemoryDocumentStore, MemoryEventLog};
use legal_rag_webapp::models::{AskEvent, Document, LlmUsage, RequestContext, SearchEvent};
use legal_rag_webapp::query_log::{normalize_query, EventLog};
use legal_rag_webapp::rag::{self, FALLBACK_ANSWER, NO_CONTEXT_ANSWER};
use legal_rag_webapp::retrieval;
use legal_rag_webapp::vector_store::DocumentStore;

const DIM: usize = 3;

/// Proveedor de embeddings con vectores predefinidos por texto. Los textos
/// no registrados reciben un vector fijo; `set_failing` simula la caída
/// del proveedor.
#[derive(Default)]
struct FakeEmbedder {
    vectors: HashMap<String, Vec<f64>>,
    failing: AtomicBool,
}

impl FakeEmbedder {
    fn with(pairs: &[(&str, [f64; DIM])]) -> Self {
        let vectors = pairs
            .iter()
            .map(|(text, v)| (text.to_string(), v.to_vec()))
            .collect();
        Self { vectors, failing: AtomicBool::new(false) }
    }

    fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl EmbeddingProvider for FakeEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f64>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(anyhow!("proveedor de embeddings caído"));
        }
        Ok(self
            .vectors
            .get(text)
            .cloned()
            .unwrap_or_else(|| vec![0.5, 0.5, 0.5]))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f64>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    fn dimension(&self) -> usize {
        DIM
    }
}

/// Proveedor de chat que responde un texto fijo o falla siempre.
struct FakeCompletions {
    failing: bool,
}

#[async_trait]
impl CompletionProvider for FakeCompletions {
    async fn complete(&self, model: &str, _system: &str, _user: &str) -> Result<Completion> {
        if self.failing {
            return Err(anyhow!("proveedor de chat caído"));
        }
        Ok(Completion {
            text: "O trabalhador tem direito a 30 dias de férias.".to_string(),
            usage: LlmUsage {
                model: model.to_string(),
                input_tokens: 120,
                output_tokens: 40,
                cost: 0.0001,
                finish_reason: Some("stop".to_string()),
                system_fingerprint: Some("fp_test".to_string()),
            },
        })
    }
}

fn test_config() -> AppConfig {
    AppConfig {
        database_url: "postgres://unused".to_string(),
        server_addr: "127.0.0.1:0".to_string(),
        openai_api_key: None,
        openai_base_url: "http://unused".to_string(),
        embedding_model: "fake".to_string(),
        embedding_dimension: DIM,
        chat_model: "gpt-4o-mini".to_string(),
        chat_model_fallback: "gpt-3.5-turbo".to_string(),
        default_top_k: 5,
        default_min_relevance: 0.0,
        provider_timeout_secs: 5,
        context_char_budget: 6000,
        completion_max_tokens: 700,
        completion_temperature: 0.2,
    }
}

fn ferias_doc() -> Document {
    let mut doc = Document::new(
        "Férias",
        "Trabalhador tem direito a 30 dias de férias.",
        "trabalhista",
        json!({ "keywords": ["férias", "clt"] }),
        Some(vec![0.9, 0.1, 0.0]),
    );
    doc.id = "d1".to_string();
    doc
}

fn pensao_doc() -> Document {
    let mut doc = Document::new(
        "Pensão alimentícia",
        "A pensão alimentícia é devida aos filhos.",
        "familia",
        json!({ "keywords": ["pensão"] }),
        Some(vec![0.0, 1.0, 0.0]),
    );
    doc.id = "d2".to_string();
    doc
}

fn request() -> RequestContext {
    RequestContext::default()
}

#[tokio::test]
async fn el_propio_embedding_se_recupera_como_top_1() {
    let store = MemoryDocumentStore::new();
    assert!(store.upsert(&ferias_doc()).await);
    assert!(store.upsert(&pensao_doc()).await);

    let hits = store.nearest_neighbors(&[0.9, 0.1, 0.0], 1).await;
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, "d1");
    assert!((hits[0].relevance.unwrap() - 1.0).abs() < 1e-9);
}

#[tokio::test]
async fn upsert_es_insertar_o_ignorar() {
    let store = MemoryDocumentStore::new();
    let original = ferias_doc();
    assert!(store.upsert(&original).await);

    let mut rewrite = pensao_doc();
    rewrite.id = original.id.clone();
    assert!(store.upsert(&rewrite).await);

    let stored = store.get(&original.id).await.unwrap();
    assert_eq!(stored.content, original.content);
    assert_eq!(store.count().await, 1);
}

#[tokio::test]
async fn la_consulta_vacia_no_revienta() {
    let store = MemoryDocumentStore::new();
    store.upsert(&ferias_doc()).await;
    let embedder = FakeEmbedder::default();

    let hits = retrieval::search(&store, &embedder, "", 5, None).await;
    assert!(hits.len() <= 5);
}

#[tokio::test]
async fn buscar_con_el_embedder_caido_devuelve_lista() {
    let store = MemoryDocumentStore::new();
    store.upsert(&ferias_doc()).await;
    store.upsert(&pensao_doc()).await;

    let embedder = FakeEmbedder::default();
    embedder.set_failing(true);

    // Vector de relleno: ranking sin sentido, pero lista válida y sin pánico.
    let hits = retrieval::search(&store, &embedder, "qualquer consulta", 5, None).await;
    assert_eq!(hits.len(), 2);
}

#[tokio::test]
async fn el_ranking_semantico_ordena_por_afinidad() {
    let store = MemoryDocumentStore::new();
    store.upsert(&ferias_doc()).await;
    store.upsert(&pensao_doc()).await;

    let embedder = FakeEmbedder::with(&[("quantos dias de férias", [0.8, 0.2, 0.0])]);
    let hits = retrieval::search(&store, &embedder, "quantos dias de férias", 5, None).await;

    assert_eq!(hits[0].id, "d1");
    assert_eq!(hits[0].keywords, vec!["férias", "clt"]);
    assert!(hits[0].relevance.unwrap() > hits[1].relevance.unwrap());
}

#[tokio::test]
async fn el_umbral_de_relevancia_filtra_resultados() {
    let store = MemoryDocumentStore::new();
    store.upsert(&ferias_doc()).await;
    store.upsert(&pensao_doc()).await;

    let embedder = FakeEmbedder::with(&[("quantos dias de férias", [0.8, 0.2, 0.0])]);
    let hits =
        retrieval::search(&store, &embedder, "quantos dias de férias", 5, Some(0.9)).await;

    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, "d1");
}

#[tokio::test]
async fn preguntar_con_el_chat_caido_degrada_a_cortesia() {
    let store = MemoryDocumentStore::new();
    store.upsert(&ferias_doc()).await;
    let embedder = FakeEmbedder::default();
    let completions = FakeCompletions { failing: true };
    let cfg = test_config();

    let outcome = rag::answer(&store, &embedder, &completions, &cfg, "quantos dias?", 3).await;

    assert_eq!(outcome.answer, FALLBACK_ANSWER);
    assert!(!outcome.success);
    assert!(outcome.error_message.is_some());
    assert!(!outcome.sources.is_empty());

    // El evento registrado conserva el fallo y su motivo.
    let log = MemoryEventLog::new();
    let event = AskEvent {
        id: "e1".to_string(),
        created_at: Utc::now(),
        question: "quantos dias?".to_string(),
        answer: outcome.answer.clone(),
        top_k: 3,
        result_ids: outcome.sources.iter().map(|s| s.id.clone()).collect(),
        response_time_ms: 12,
        usage: outcome.usage.clone(),
        success: outcome.success,
        error_message: outcome.error_message.clone(),
        request: request(),
    };
    log.log_ask(&event, &[]).await;

    let stored = log.ask_events();
    assert_eq!(stored.len(), 1);
    assert!(!stored[0].success);
    assert!(stored[0].error_message.is_some());
}

#[tokio::test]
async fn preguntar_sin_documentos_devuelve_texto_sin_contexto() {
    let store = MemoryDocumentStore::new();
    let embedder = FakeEmbedder::default();
    let completions = FakeCompletions { failing: false };
    let cfg = test_config();

    let outcome = rag::answer(
        &store,
        &embedder,
        &completions,
        &cfg,
        "O que é direito civil?",
        3,
    )
    .await;

    assert_eq!(outcome.answer, NO_CONTEXT_ANSWER);
    assert!(outcome.sources.is_empty());
    assert!(outcome.success);
}

#[tokio::test]
async fn preguntar_con_exito_reporta_el_uso_del_llm() {
    let store = MemoryDocumentStore::new();
    store.upsert(&ferias_doc()).await;
    let embedder = FakeEmbedder::default();
    let completions = FakeCompletions { failing: false };
    let cfg = test_config();

    let outcome = rag::answer(&store, &embedder, &completions, &cfg, "férias?", 3).await;

    assert!(outcome.success);
    let usage = outcome.usage.expect("debe reportar uso");
    assert_eq!(usage.model, "gpt-4o-mini");
    assert_eq!(usage.input_tokens, 120);
    assert_eq!(usage.finish_reason.as_deref(), Some("stop"));
}

#[tokio::test]
async fn la_caida_de_la_analitica_no_bloquea_la_respuesta() {
    let store = MemoryDocumentStore::new();
    store.upsert(&ferias_doc()).await;
    let embedder = FakeEmbedder::default();
    let log = MemoryEventLog::new();
    log.set_unavailable(true);

    let hits = retrieval::search(&store, &embedder, "férias", 5, None).await;
    assert!(!hits.is_empty());

    let event = SearchEvent {
        id: "e2".to_string(),
        created_at: Utc::now(),
        query: "férias".to_string(),
        top_k: 5,
        min_relevance: None,
        search_type: "semantic".to_string(),
        total: hits.len() as i32,
        result_ids: hits.iter().map(|h| h.id.clone()).collect(),
        response_time_ms: 7,
        success: true,
        request: request(),
    };
    // No debe devolver error ni panic; la analítica simplemente se pierde.
    log.log_search(&event, &[]).await;
    assert_eq!(log.event_counts().await, (0, 0));
}

#[tokio::test]
async fn el_agregado_cuenta_cada_repeticion() {
    let log = MemoryEventLog::new();

    for i in 0..4i64 {
        let event = SearchEvent {
            id: format!("e{i}"),
            created_at: Utc::now(),
            query: if i % 2 == 0 { "  Férias   CLT ".to_string() } else { "férias clt".to_string() },
            top_k: 5,
            min_relevance: None,
            search_type: "semantic".to_string(),
            total: 1,
            result_ids: vec!["d1".to_string()],
            response_time_ms: 100 * (i + 1),
            success: true,
            request: request(),
        };
        log.log_search(&event, &["trabalhista".to_string()]).await;
    }

    // Las cuatro variantes normalizan a la misma clave.
    let agg = log.aggregate(&normalize_query("Férias CLT")).await.unwrap();
    assert_eq!(agg.total_count, 4);
    assert!((agg.avg_response_time - 250.0).abs() < 1e-9);
    assert_eq!(agg.success_rate, 1.0);
    assert_eq!(agg.categories, vec!["trabalhista"]);
}

#[tokio::test]
async fn el_almacen_caido_equivale_a_vacio() {
    let store = MemoryDocumentStore::new();
    store.upsert(&ferias_doc()).await;
    store.set_unavailable(true);

    let embedder = FakeEmbedder::default();
    let hits = retrieval::search(&store, &embedder, "férias", 5, None).await;
    assert!(hits.is_empty());
    assert!(!store.upsert(&pensao_doc()).await);
    assert!(!store.ping().await);
}

#[tokio::test]
async fn editar_un_documento_reemplaza_su_embedding() {
    let store = MemoryDocumentStore::new();
    let mut doc = ferias_doc();
    store.upsert(&doc).await;

    // Edición con el embedder caído: la fila queda sin embedding y fuera
    // del ranking hasta el backfill.
    doc.content = "Texto corregido sobre férias.".to_string();
    doc.embedding = None;
    assert!(store.update_document(&doc).await);

    let hits = store.nearest_neighbors(&[0.9, 0.1, 0.0], 5).await;
    assert!(hits.iter().all(|h| h.id != "d1"));

    let stored = store.get("d1").await.unwrap();
    assert_eq!(stored.content, "Texto corregido sobre férias.");
}
