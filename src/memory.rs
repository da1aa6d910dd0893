//! Implementaciones en memoria de [`DocumentStore`] y [`EventLog`].
//!
//! Replican el contrato del backend PostgreSQL con vectores en un `HashMap`,
//! incluida la política de fallos ("no disponible" equivale a "vacío").
//! Las usan los tests de integración y cualquier despliegue de demostración
//! sin base de datos.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::models::{AskEvent, Document, QueryAggregate, RankedDocument, SearchEvent};
use crate::query_log::{merge_running, normalize_query, EventLog};
use crate::vector_store::DocumentStore;

/// Distancia coseno entre dos vectores. Para un vector nulo la distancia
/// se define como 1 (similitud cero), igual que hace pgvector.
pub fn cosine_distance(a: &[f64], b: &[f64]) -> f64 {
    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f64 = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    1.0 - dot / (norm_a * norm_b)
}

/// Almacén de documentos en memoria.
#[derive(Default)]
pub struct MemoryDocumentStore {
    docs: Mutex<HashMap<String, Document>>,
    unavailable: AtomicBool,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simula una caída del almacén: todas las operaciones pasan a devolver
    /// vacío/`false` hasta que se restablezca.
    pub fn set_unavailable(&self, down: bool) {
        self.unavailable.store(down, Ordering::SeqCst);
    }

    fn is_down(&self) -> bool {
        self.unavailable.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn upsert(&self, doc: &Document) -> bool {
        if self.is_down() {
            return false;
        }
        let mut docs = self.docs.lock().unwrap();
        docs.entry(doc.id.clone()).or_insert_with(|| doc.clone());
        true
    }

    async fn update_document(&self, doc: &Document) -> bool {
        if self.is_down() {
            return false;
        }
        let mut docs = self.docs.lock().unwrap();
        match docs.get_mut(&doc.id) {
            Some(stored) => {
                stored.title = doc.title.clone();
                stored.content = doc.content.clone();
                stored.category = doc.category.clone();
                stored.metadata = doc.metadata.clone();
                stored.embedding = doc.embedding.clone();
                stored.updated_at = chrono::Utc::now();
                true
            }
            None => false,
        }
    }

    async fn delete(&self, id: &str) -> bool {
        if self.is_down() {
            return false;
        }
        self.docs.lock().unwrap().remove(id).is_some()
    }

    async fn get(&self, id: &str) -> Option<Document> {
        if self.is_down() {
            return None;
        }
        self.docs.lock().unwrap().get(id).cloned()
    }

    async fn nearest_neighbors(&self, query_vector: &[f64], k: usize) -> Vec<RankedDocument> {
        if self.is_down() {
            return Vec::new();
        }
        let docs = self.docs.lock().unwrap();
        let mut scored: Vec<(f64, RankedDocument)> = docs
            .values()
            .filter_map(|doc| {
                let embedding = doc.embedding.as_ref()?;
                let distance = cosine_distance(query_vector, embedding);
                Some((
                    distance,
                    RankedDocument {
                        id: doc.id.clone(),
                        title: doc.title.clone(),
                        content: doc.content.clone(),
                        category: doc.category.clone(),
                        metadata: doc.metadata.clone(),
                        relevance: Some(1.0 - distance),
                    },
                ))
            })
            .collect();

        scored.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.into_iter().take(k).map(|(_, doc)| doc).collect()
    }

    async fn count(&self) -> i64 {
        if self.is_down() {
            return 0;
        }
        self.docs.lock().unwrap().len() as i64
    }

    async fn ping(&self) -> bool {
        !self.is_down()
    }
}

/// Registro de eventos en memoria, con los mismos agregados que PostgreSQL.
#[derive(Default)]
pub struct MemoryEventLog {
    search_events: Mutex<Vec<SearchEvent>>,
    ask_events: Mutex<Vec<AskEvent>>,
    aggregates: Mutex<HashMap<String, QueryAggregate>>,
    unavailable: AtomicBool,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, down: bool) {
        self.unavailable.store(down, Ordering::SeqCst);
    }

    fn is_down(&self) -> bool {
        self.unavailable.load(Ordering::SeqCst)
    }

    pub fn search_events(&self) -> Vec<SearchEvent> {
        self.search_events.lock().unwrap().clone()
    }

    pub fn ask_events(&self) -> Vec<AskEvent> {
        self.ask_events.lock().unwrap().clone()
    }

    fn merge(
        &self,
        query: &str,
        seen_at: chrono::DateTime<chrono::Utc>,
        response_time_ms: f64,
        success: bool,
        categories: &[String],
    ) {
        let key = normalize_query(query);
        let mut aggregates = self.aggregates.lock().unwrap();
        match aggregates.get_mut(&key) {
            Some(agg) => {
                let (count, avg, rate) = merge_running(
                    agg.total_count,
                    agg.avg_response_time,
                    agg.success_rate,
                    response_time_ms,
                    if success { 1.0 } else { 0.0 },
                );
                agg.total_count = count;
                agg.avg_response_time = avg;
                agg.success_rate = rate;
                agg.last_seen = seen_at;
                for category in categories {
                    if !agg.categories.iter().any(|c| c == category) {
                        agg.categories.push(category.clone());
                    }
                }
            }
            None => {
                aggregates.insert(
                    key.clone(),
                    QueryAggregate {
                        query_normalized: key,
                        total_count: 1,
                        last_seen: seen_at,
                        avg_response_time: response_time_ms,
                        success_rate: if success { 1.0 } else { 0.0 },
                        categories: categories.to_vec(),
                    },
                );
            }
        }
    }
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn log_search(&self, event: &SearchEvent, categories: &[String]) {
        if self.is_down() {
            return;
        }
        self.merge(
            &event.query,
            event.created_at,
            event.response_time_ms as f64,
            event.success,
            categories,
        );
        self.search_events.lock().unwrap().push(event.clone());
    }

    async fn log_ask(&self, event: &AskEvent, categories: &[String]) {
        if self.is_down() {
            return;
        }
        self.merge(
            &event.question,
            event.created_at,
            event.response_time_ms as f64,
            event.success,
            categories,
        );
        self.ask_events.lock().unwrap().push(event.clone());
    }

    async fn aggregate(&self, query_normalized: &str) -> Option<QueryAggregate> {
        if self.is_down() {
            return None;
        }
        self.aggregates.lock().unwrap().get(query_normalized).cloned()
    }

    async fn top_queries(&self, limit: usize) -> Vec<QueryAggregate> {
        if self.is_down() {
            return Vec::new();
        }
        let aggregates = self.aggregates.lock().unwrap();
        let mut all: Vec<QueryAggregate> = aggregates.values().cloned().collect();
        all.sort_by(|a, b| b.total_count.cmp(&a.total_count));
        all.truncate(limit);
        all
    }

    async fn event_counts(&self) -> (i64, i64) {
        if self.is_down() {
            return (0, 0);
        }
        (
            self.search_events.lock().unwrap().len() as i64,
            self.ask_events.lock().unwrap().len() as i64,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distancia_coseno_de_vectores_identicos_es_cero() {
        let v = vec![0.3, 0.4, 0.5];
        assert!(cosine_distance(&v, &v).abs() < 1e-12);
    }

    #[test]
    fn distancia_coseno_de_vectores_opuestos_supera_uno() {
        let a = vec![1.0, 0.0];
        let b = vec![-1.0, 0.0];
        // La distancia coseno llega hasta 2; la relevancia 1 - d es negativa.
        assert!((cosine_distance(&a, &b) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn vector_nulo_tiene_distancia_uno() {
        assert_eq!(cosine_distance(&[0.0, 0.0], &[1.0, 2.0]), 1.0);
    }
}
