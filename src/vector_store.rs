//! Almacén de documentos sobre PostgreSQL + pgvector.
//!
//! La política de fallos del almacén es uniforme: "base de datos caída" se
//! comporta igual que "base de datos vacía". Las lecturas devuelven listas
//! vacías y las escrituras devuelven `false` tras registrar el error; nada
//! de esto se propaga como excepción al orquestador.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Row};
use tracing::{error, warn};

use crate::models::{Document, RankedDocument};

/// Estrategia de distancia para la búsqueda de vecinos, en orden de
/// preferencia. El operador coseno permite derivar la relevancia como
/// `1 - distancia`; con el operador L2 la relevancia queda desconocida
/// y se reporta como `None` en lugar de inventar una conversión.
struct DistanceStrategy {
    operator: &'static str,
    scores_relevance: bool,
}

const DISTANCE_STRATEGIES: &[DistanceStrategy] = &[
    DistanceStrategy { operator: "<=>", scores_relevance: true },
    DistanceStrategy { operator: "<->", scores_relevance: false },
];

/// Almacenamiento duradero de documentos con upsert idempotente y
/// búsqueda de vecinos más cercanos.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Inserta el documento si su id no existe; si existe, no hace nada
    /// (insertar-o-ignorar, nunca sobrescribir). Devuelve `false` solo si
    /// el almacén no está disponible.
    async fn upsert(&self, doc: &Document) -> bool;

    /// Camino explícito de edición: muta contenido/categoría/metadata y
    /// reemplaza el embedding en la misma sentencia. Un `embedding = None`
    /// deja la fila fuera del ranking hasta que se recalcule.
    async fn update_document(&self, doc: &Document) -> bool;

    async fn delete(&self, id: &str) -> bool;

    async fn get(&self, id: &str) -> Option<Document>;

    /// Hasta `k` filas ordenadas por distancia ascendente. Las filas sin
    /// embedding nunca participan.
    async fn nearest_neighbors(&self, query_vector: &[f64], k: usize) -> Vec<RankedDocument>;

    async fn count(&self) -> i64;

    /// Health check del almacén.
    async fn ping(&self) -> bool;
}

/// Literal textual de pgvector: `[1,2,3]`, pensado para un cast `::vector`.
pub fn vector_literal(vector: &[f64]) -> String {
    let parts: Vec<String> = vector.iter().map(|v| v.to_string()).collect();
    format!("[{}]", parts.join(","))
}

/// Implementación sobre PostgreSQL/pgvector.
pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn try_nearest(
        &self,
        strategy: &DistanceStrategy,
        query_vector: &[f64],
        k: usize,
    ) -> Result<Vec<RankedDocument>> {
        let sql = format!(
            "SELECT id, title, content, category, metadata,
                    (embedding {op} $1::vector) AS distance
             FROM documents
             WHERE embedding IS NOT NULL
             ORDER BY embedding {op} $1::vector
             LIMIT $2",
            op = strategy.operator
        );

        let rows = sqlx::query(&sql)
            .bind(vector_literal(query_vector))
            .bind(k as i64)
            .fetch_all(&self.pool)
            .await?;

        let mut ranked = Vec::with_capacity(rows.len());
        for row in rows {
            let distance: f64 = row.try_get("distance")?;
            ranked.push(RankedDocument {
                id: row.try_get("id")?,
                title: row.try_get("title")?,
                content: row.try_get("content")?,
                category: row.try_get("category")?,
                metadata: row.try_get("metadata")?,
                relevance: strategy.scores_relevance.then(|| 1.0 - distance),
            });
        }
        Ok(ranked)
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn upsert(&self, doc: &Document) -> bool {
        let result = sqlx::query(
            "INSERT INTO documents
                 (id, parent_id, title, content, category, metadata, embedding,
                  created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7::vector, $8, $9)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(&doc.id)
        .bind(&doc.parent_id)
        .bind(&doc.title)
        .bind(&doc.content)
        .bind(&doc.category)
        .bind(&doc.metadata)
        .bind(doc.embedding.as_deref().map(vector_literal))
        .bind(doc.created_at)
        .bind(doc.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => true,
            Err(e) => {
                error!("Fallo en upsert del documento {}: {e}", doc.id);
                false
            }
        }
    }

    async fn update_document(&self, doc: &Document) -> bool {
        let result = sqlx::query(
            "UPDATE documents
             SET title = $2, content = $3, category = $4, metadata = $5,
                 embedding = $6::vector, updated_at = $7
             WHERE id = $1",
        )
        .bind(&doc.id)
        .bind(&doc.title)
        .bind(&doc.content)
        .bind(&doc.category)
        .bind(&doc.metadata)
        .bind(doc.embedding.as_deref().map(vector_literal))
        .bind(Utc::now())
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => done.rows_affected() > 0,
            Err(e) => {
                error!("Fallo actualizando el documento {}: {e}", doc.id);
                false
            }
        }
    }

    async fn delete(&self, id: &str) -> bool {
        match sqlx::query("DELETE FROM documents WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
        {
            Ok(done) => done.rows_affected() > 0,
            Err(e) => {
                error!("Fallo borrando el documento {id}: {e}");
                false
            }
        }
    }

    async fn get(&self, id: &str) -> Option<Document> {
        let row = sqlx::query(
            "SELECT id, parent_id, title, content, category, metadata,
                    created_at, updated_at
             FROM documents WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await;

        match row {
            Ok(Some(row)) => {
                let doc = (|| -> Result<Document> {
                    Ok(Document {
                        id: row.try_get("id")?,
                        parent_id: row.try_get("parent_id")?,
                        title: row.try_get("title")?,
                        content: row.try_get("content")?,
                        category: row.try_get("category")?,
                        metadata: row.try_get("metadata")?,
                        // El vector no viaja en las lecturas puntuales.
                        embedding: None,
                        created_at: row.try_get("created_at")?,
                        updated_at: row.try_get("updated_at")?,
                    })
                })();
                match doc {
                    Ok(doc) => Some(doc),
                    Err(e) => {
                        error!("Fila de documento ilegible para {id}: {e}");
                        None
                    }
                }
            }
            Ok(None) => None,
            Err(e) => {
                error!("Fallo leyendo el documento {id}: {e}");
                None
            }
        }
    }

    async fn nearest_neighbors(&self, query_vector: &[f64], k: usize) -> Vec<RankedDocument> {
        for strategy in DISTANCE_STRATEGIES {
            match self.try_nearest(strategy, query_vector, k).await {
                Ok(ranked) => {
                    if !strategy.scores_relevance {
                        warn!(
                            "Búsqueda vectorial degradada: operador {} sin relevancia",
                            strategy.operator
                        );
                    }
                    return ranked;
                }
                Err(e) => {
                    warn!(
                        "Operador de distancia {} no disponible: {e}",
                        strategy.operator
                    );
                }
            }
        }
        error!("Búsqueda vectorial imposible: todas las estrategias fallaron");
        Vec::new()
    }

    async fn count(&self) -> i64 {
        match sqlx::query("SELECT count(*) AS n FROM documents")
            .fetch_one(&self.pool)
            .await
            .and_then(|row| row.try_get::<i64, _>("n"))
        {
            Ok(n) => n,
            Err(e) => {
                error!("Fallo contando documentos: {e}");
                0
            }
        }
    }

    async fn ping(&self) -> bool {
        crate::db::ping(&self.pool).await
    }
}

#[cfg(test)]
mod tests {
    use super::vector_literal;

    #[test]
    fn literal_de_vector_para_pgvector() {
        assert_eq!(vector_literal(&[1.0, -0.5, 0.0]), "[1,-0.5,0]");
        assert_eq!(vector_literal(&[]), "[]");
    }
}
