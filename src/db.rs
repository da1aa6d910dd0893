//! Conexión a PostgreSQL y arranque del esquema (tablas + extensión pgvector).

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use crate::config::AppConfig;

/// Abre el pool de conexiones. El pool se encarga de reconectar de forma
/// transparente; `acquire_timeout` acota la espera cuando la base de datos
/// no responde.
pub async fn connect_from_config(cfg: &AppConfig) -> Result<PgPool> {
    info!("Conectando a PostgreSQL...");
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(std::time::Duration::from_secs(5))
        .connect(&cfg.database_url)
        .await
        .context("No se pudo conectar a PostgreSQL")?;
    info!("Conexión a PostgreSQL OK");
    Ok(pool)
}

/// Crea la extensión pgvector, las tablas y los índices si no existen.
///
/// Las tablas de eventos son de solo-inserción; `query_aggregates` se
/// actualiza por upsert con una fila por consulta normalizada.
pub async fn ensure_schema(pool: &PgPool, embedding_dimension: usize) -> Result<()> {
    sqlx::query("CREATE EXTENSION IF NOT EXISTS vector")
        .execute(pool)
        .await
        .context("No se pudo crear la extensión pgvector")?;

    let documents = format!(
        "CREATE TABLE IF NOT EXISTS documents (
            id          TEXT PRIMARY KEY,
            parent_id   TEXT,
            title       TEXT NOT NULL,
            content     TEXT NOT NULL,
            category    TEXT NOT NULL,
            metadata    JSONB NOT NULL DEFAULT '{{}}'::jsonb,
            embedding   vector({embedding_dimension}),
            created_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at  TIMESTAMPTZ NOT NULL DEFAULT now()
        )"
    );

    let statements = [
        documents.as_str(),
        "CREATE TABLE IF NOT EXISTS search_events (
            id               TEXT PRIMARY KEY,
            created_at       TIMESTAMPTZ NOT NULL,
            query            TEXT NOT NULL,
            top_k            INTEGER NOT NULL,
            min_relevance    DOUBLE PRECISION,
            search_type      TEXT NOT NULL,
            total            INTEGER NOT NULL,
            result_ids       JSONB NOT NULL,
            session_id       TEXT,
            user_id          TEXT,
            user_agent       TEXT,
            client_ip        TEXT,
            response_time_ms BIGINT NOT NULL,
            success          BOOLEAN NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS ask_events (
            id                 TEXT PRIMARY KEY,
            created_at         TIMESTAMPTZ NOT NULL,
            question           TEXT NOT NULL,
            answer             TEXT NOT NULL,
            top_k              INTEGER NOT NULL,
            result_ids         JSONB NOT NULL,
            session_id         TEXT,
            user_id            TEXT,
            user_agent         TEXT,
            client_ip          TEXT,
            response_time_ms   BIGINT NOT NULL,
            llm_model          TEXT,
            input_tokens       BIGINT,
            output_tokens      BIGINT,
            cost               DOUBLE PRECISION,
            finish_reason      TEXT,
            system_fingerprint TEXT,
            success            BOOLEAN NOT NULL,
            error_message      TEXT
        )",
        "CREATE TABLE IF NOT EXISTS query_aggregates (
            query_normalized  TEXT PRIMARY KEY,
            total_count       BIGINT NOT NULL,
            last_seen         TIMESTAMPTZ NOT NULL,
            avg_response_time DOUBLE PRECISION NOT NULL,
            success_rate      DOUBLE PRECISION NOT NULL,
            categories        JSONB NOT NULL DEFAULT '[]'::jsonb
        )",
        "CREATE INDEX IF NOT EXISTS documents_category_idx ON documents (category)",
        "CREATE INDEX IF NOT EXISTS search_events_created_idx ON search_events (created_at)",
        "CREATE INDEX IF NOT EXISTS ask_events_created_idx ON ask_events (created_at)",
        // Índice aproximado para el operador coseno. Con pocas filas
        // PostgreSQL lo ignora y hace un escaneo secuencial, que es correcto.
        "CREATE INDEX IF NOT EXISTS documents_embedding_idx
         ON documents USING ivfflat (embedding vector_cosine_ops) WITH (lists = 100)",
    ];

    for stmt in statements {
        sqlx::query(stmt)
            .execute(pool)
            .await
            .with_context(|| format!("Fallo ejecutando DDL: {}", first_line(stmt)))?;
    }

    info!("Esquema de PostgreSQL asegurado (tablas e índices creados).");
    Ok(())
}

/// Health check barato: una ida y vuelta mínima al servidor.
pub async fn ping(pool: &PgPool) -> bool {
    sqlx::query("SELECT 1").execute(pool).await.is_ok()
}

fn first_line(stmt: &str) -> &str {
    stmt.lines().next().unwrap_or(stmt).trim()
}
