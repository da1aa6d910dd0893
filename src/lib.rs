//! Backend RAG de un asistente legal: búsqueda semántica sobre
//! PostgreSQL/pgvector, orquestación con un LLM y analítica de consultas.

pub mod api;
pub mod app_state;
pub mod config;
pub mod db;
pub mod ingest;
pub mod llm;
pub mod memory;
pub mod models;
pub mod query_log;
pub mod rag;
pub mod retrieval;
pub mod vector_store;
