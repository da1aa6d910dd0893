//! Analítica de consultas: eventos de búsqueda/pregunta y agregados.
//!
//! El registro es "fire-and-forget" desde el punto de vista del handler:
//! cualquier fallo interno (conexión perdida, esquema desajustado) se
//! registra con `error!` y se traga. Perder analítica es aceptable;
//! bloquear la respuesta al usuario no lo es.
//!
//! La inserción del evento crudo y el upsert del agregado van en una única
//! transacción: los contadores de ambas tablas nunca discrepan.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::error;

use crate::models::{AskEvent, QueryAggregate, SearchEvent};

/// Longitud máxima de la clave normalizada, para acotar el espacio de claves.
const NORMALIZED_QUERY_MAX_CHARS: usize = 500;

/// Normalización determinista de una consulta: minúsculas, espacios internos
/// colapsados y truncado a 500 caracteres.
pub fn normalize_query(query: &str) -> String {
    let collapsed = query
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    collapsed.chars().take(NORMALIZED_QUERY_MAX_CHARS).collect()
}

/// Registro de eventos y mantenimiento de agregados.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Registra una búsqueda. Nunca falla ni bloquea al llamador.
    async fn log_search(&self, event: &SearchEvent, categories: &[String]);

    /// Registra una pregunta RAG. Nunca falla ni bloquea al llamador.
    async fn log_ask(&self, event: &AskEvent, categories: &[String]);

    async fn aggregate(&self, query_normalized: &str) -> Option<QueryAggregate>;

    async fn top_queries(&self, limit: usize) -> Vec<QueryAggregate>;

    /// (búsquedas, preguntas) registradas en total.
    async fn event_counts(&self) -> (i64, i64);
}

/// Implementación sobre PostgreSQL.
pub struct PgEventLog {
    pool: PgPool,
}

impl PgEventLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert_search(&self, event: &SearchEvent, categories: &[String]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO search_events
                 (id, created_at, query, top_k, min_relevance, search_type, total,
                  result_ids, session_id, user_id, user_agent, client_ip,
                  response_time_ms, success)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
        )
        .bind(&event.id)
        .bind(event.created_at)
        .bind(&event.query)
        .bind(event.top_k)
        .bind(event.min_relevance)
        .bind(&event.search_type)
        .bind(event.total)
        .bind(serde_json::json!(event.result_ids))
        .bind(&event.request.session_id)
        .bind(&event.request.user_id)
        .bind(&event.request.user_agent)
        .bind(&event.request.client_ip)
        .bind(event.response_time_ms)
        .bind(event.success)
        .execute(&mut *tx)
        .await?;

        merge_aggregate(
            &mut tx,
            &normalize_query(&event.query),
            event.created_at,
            event.response_time_ms as f64,
            event.success,
            categories,
        )
        .await?;

        tx.commit().await.context("Commit de evento de búsqueda")
    }

    async fn insert_ask(&self, event: &AskEvent, categories: &[String]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let usage = event.usage.as_ref();
        sqlx::query(
            "INSERT INTO ask_events
                 (id, created_at, question, answer, top_k, result_ids,
                  session_id, user_id, user_agent, client_ip, response_time_ms,
                  llm_model, input_tokens, output_tokens, cost, finish_reason,
                  system_fingerprint, success, error_message)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                     $14, $15, $16, $17, $18, $19)",
        )
        .bind(&event.id)
        .bind(event.created_at)
        .bind(&event.question)
        .bind(&event.answer)
        .bind(event.top_k)
        .bind(serde_json::json!(event.result_ids))
        .bind(&event.request.session_id)
        .bind(&event.request.user_id)
        .bind(&event.request.user_agent)
        .bind(&event.request.client_ip)
        .bind(event.response_time_ms)
        .bind(usage.map(|u| u.model.clone()))
        .bind(usage.map(|u| u.input_tokens))
        .bind(usage.map(|u| u.output_tokens))
        .bind(usage.map(|u| u.cost))
        .bind(usage.and_then(|u| u.finish_reason.clone()))
        .bind(usage.and_then(|u| u.system_fingerprint.clone()))
        .bind(event.success)
        .bind(&event.error_message)
        .execute(&mut *tx)
        .await?;

        merge_aggregate(
            &mut tx,
            &normalize_query(&event.question),
            event.created_at,
            event.response_time_ms as f64,
            event.success,
            categories,
        )
        .await?;

        tx.commit().await.context("Commit de evento de pregunta")
    }
}

/// Upsert-con-fusión del agregado, dentro de la transacción del evento.
/// El `FOR UPDATE` serializa los incrementos concurrentes de la misma clave.
async fn merge_aggregate(
    tx: &mut Transaction<'_, Postgres>,
    query_normalized: &str,
    seen_at: DateTime<Utc>,
    response_time_ms: f64,
    success: bool,
    categories: &[String],
) -> Result<()> {
    let existing = sqlx::query(
        "SELECT total_count, avg_response_time, success_rate, categories
         FROM query_aggregates WHERE query_normalized = $1 FOR UPDATE",
    )
    .bind(query_normalized)
    .fetch_optional(&mut **tx)
    .await?;

    let success_value = if success { 1.0 } else { 0.0 };

    match existing {
        Some(row) => {
            let count: i64 = row.try_get("total_count")?;
            let avg: f64 = row.try_get("avg_response_time")?;
            let rate: f64 = row.try_get("success_rate")?;
            let stored: serde_json::Value = row.try_get("categories")?;

            let next = merge_running(count, avg, rate, response_time_ms, success_value);
            let merged_categories = merge_categories(&stored, categories);

            sqlx::query(
                "UPDATE query_aggregates
                 SET total_count = $2, last_seen = $3, avg_response_time = $4,
                     success_rate = $5, categories = $6
                 WHERE query_normalized = $1",
            )
            .bind(query_normalized)
            .bind(next.0)
            .bind(seen_at)
            .bind(next.1)
            .bind(next.2)
            .bind(merged_categories)
            .execute(&mut **tx)
            .await?;
        }
        None => {
            sqlx::query(
                "INSERT INTO query_aggregates
                     (query_normalized, total_count, last_seen, avg_response_time,
                      success_rate, categories)
                 VALUES ($1, 1, $2, $3, $4, $5)",
            )
            .bind(query_normalized)
            .bind(seen_at)
            .bind(response_time_ms)
            .bind(success_value)
            .bind(serde_json::json!(categories))
            .execute(&mut **tx)
            .await?;
        }
    }

    Ok(())
}

/// Actualización incremental de (contador, media de latencia, tasa de éxito).
pub fn merge_running(
    count: i64,
    avg_response_time: f64,
    success_rate: f64,
    response_time_ms: f64,
    success_value: f64,
) -> (i64, f64, f64) {
    let next_count = count + 1;
    let next_avg = avg_response_time + (response_time_ms - avg_response_time) / next_count as f64;
    let next_rate = (success_rate * count as f64 + success_value) / next_count as f64;
    (next_count, next_avg, next_rate)
}

fn merge_categories(stored: &serde_json::Value, new: &[String]) -> serde_json::Value {
    let mut merged: Vec<String> = stored
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    for category in new {
        if !merged.iter().any(|c| c == category) {
            merged.push(category.clone());
        }
    }
    serde_json::json!(merged)
}

fn aggregate_from_row(row: &sqlx::postgres::PgRow) -> Result<QueryAggregate> {
    let categories: serde_json::Value = row.try_get("categories")?;
    Ok(QueryAggregate {
        query_normalized: row.try_get("query_normalized")?,
        total_count: row.try_get("total_count")?,
        last_seen: row.try_get("last_seen")?,
        avg_response_time: row.try_get("avg_response_time")?,
        success_rate: row.try_get("success_rate")?,
        categories: categories
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default(),
    })
}

#[async_trait]
impl EventLog for PgEventLog {
    async fn log_search(&self, event: &SearchEvent, categories: &[String]) {
        if let Err(e) = self.insert_search(event, categories).await {
            error!("Analítica perdida (búsqueda {}): {e}", event.id);
        }
    }

    async fn log_ask(&self, event: &AskEvent, categories: &[String]) {
        if let Err(e) = self.insert_ask(event, categories).await {
            error!("Analítica perdida (pregunta {}): {e}", event.id);
        }
    }

    async fn aggregate(&self, query_normalized: &str) -> Option<QueryAggregate> {
        let row = sqlx::query(
            "SELECT query_normalized, total_count, last_seen, avg_response_time,
                    success_rate, categories
             FROM query_aggregates WHERE query_normalized = $1",
        )
        .bind(query_normalized)
        .fetch_optional(&self.pool)
        .await;

        match row {
            Ok(Some(row)) => aggregate_from_row(&row)
                .map_err(|e| error!("Fila de agregado ilegible: {e}"))
                .ok(),
            Ok(None) => None,
            Err(e) => {
                error!("Fallo leyendo agregado: {e}");
                None
            }
        }
    }

    async fn top_queries(&self, limit: usize) -> Vec<QueryAggregate> {
        let rows = sqlx::query(
            "SELECT query_normalized, total_count, last_seen, avg_response_time,
                    success_rate, categories
             FROM query_aggregates ORDER BY total_count DESC LIMIT $1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await;

        match rows {
            Ok(rows) => rows
                .iter()
                .filter_map(|row| aggregate_from_row(row).ok())
                .collect(),
            Err(e) => {
                error!("Fallo leyendo top de consultas: {e}");
                Vec::new()
            }
        }
    }

    async fn event_counts(&self) -> (i64, i64) {
        let count = |table: &str| {
            let sql = format!("SELECT count(*) AS n FROM {table}");
            let pool = self.pool.clone();
            async move {
                sqlx::query(&sql)
                    .fetch_one(&pool)
                    .await
                    .and_then(|row| row.try_get::<i64, _>("n"))
                    .unwrap_or(0)
            }
        };
        (count("search_events").await, count("ask_events").await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizacion_insensible_a_mayusculas_y_espacios() {
        assert_eq!(normalize_query("  Férias   CLT "), normalize_query("férias clt"));
        assert_eq!(normalize_query("  Férias   CLT "), "férias clt");
    }

    #[test]
    fn normalizacion_trunca_a_500_caracteres() {
        let larga = "palavra ".repeat(200);
        assert_eq!(normalize_query(&larga).chars().count(), 500);
    }

    #[test]
    fn normalizacion_de_cadena_vacia() {
        assert_eq!(normalize_query("   "), "");
    }

    #[test]
    fn la_media_incremental_converge() {
        // Tres eventos de 100, 200 y 300 ms: media 200, éxito 2/3.
        let (c1, a1, r1) = merge_running(0, 0.0, 0.0, 100.0, 1.0);
        let (c2, a2, r2) = merge_running(c1, a1, r1, 200.0, 1.0);
        let (c3, a3, r3) = merge_running(c2, a2, r2, 300.0, 0.0);
        assert_eq!(c3, 3);
        assert!((a3 - 200.0).abs() < 1e-9);
        assert!((r3 - 2.0 / 3.0).abs() < 1e-9);
    }
}
