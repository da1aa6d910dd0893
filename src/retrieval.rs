//! Búsqueda semántica: texto libre → documentos ordenados por relevancia.
//!
//! Flujo:
//!   1. Embedding de la consulta vía el proveedor.
//!   2. Si el embedding falla por completo, vector de relleno reproducible
//!      y `warn!` (política de modo degradado: se devuelve *algún* ranking
//!      consistente en lugar de un error; la calidad queda sin sentido).
//!   3. Vecinos más cercanos en el vector store.
//!   4. Lista de keywords desde metadata, con lista vacía por defecto.
//!
//! La consulta vacía se embebe y busca como cualquier otra: el corte por
//! entrada inválida vive en la frontera de la API, no aquí.

use tracing::warn;

use crate::llm::{placeholder_vector, EmbeddingProvider};
use crate::models::{RankedDocument, SearchHit};
use crate::vector_store::DocumentStore;

/// Busca los `top_k` documentos más afines a `query`.
///
/// Los resultados van en relevancia descendente (el almacén los entrega por
/// distancia ascendente). `min_relevance` solo filtra resultados cuya
/// relevancia es conocida: en modo degradado parcial (operador secundario,
/// relevancia `None`) el filtro no aplica.
pub async fn search(
    store: &dyn DocumentStore,
    embedder: &dyn EmbeddingProvider,
    query: &str,
    top_k: usize,
    min_relevance: Option<f64>,
) -> Vec<SearchHit> {
    let query_vector = match embedder.embed(query).await {
        Ok(vector) => vector,
        Err(e) => {
            warn!("Embedding de consulta no disponible, usando vector de relleno: {e}");
            placeholder_vector(embedder.dimension())
        }
    };

    let ranked = store.nearest_neighbors(&query_vector, top_k).await;

    ranked
        .into_iter()
        .filter(|doc| match (min_relevance, doc.relevance) {
            (Some(min), Some(relevance)) => relevance >= min,
            _ => true,
        })
        .map(to_hit)
        .collect()
}

fn to_hit(doc: RankedDocument) -> SearchHit {
    let keywords = keywords_from_metadata(&doc.metadata);
    SearchHit {
        id: doc.id,
        title: doc.title,
        content: doc.content,
        category: doc.category,
        keywords,
        relevance: doc.relevance,
    }
}

/// Extrae `metadata.keywords` como lista de cadenas; metadata ausente o
/// malformada produce una lista vacía, nunca un error.
fn keywords_from_metadata(metadata: &serde_json::Value) -> Vec<String> {
    metadata
        .get("keywords")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}
