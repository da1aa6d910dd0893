//! Siembra de la base de conocimiento desde un directorio de textos legales.
//!
//! Estructura esperada: un subdirectorio por categoría de la taxonomía
//! (`trabalhista/`, `civil/`, ...) con ficheros PDF, TXT, MD o HTML dentro.
//! Cada fichero produce un documento padre (sin embedding, fuera del
//! ranking) y un documento por chunk con su embedding. Los ids son hashes
//! del contenido, así que re-ejecutar la siembra es un no-op.

use std::{
    fs,
    path::Path,
    sync::{Arc, Mutex},
};

use anyhow::{anyhow, Result};
use mime_guess::MimeGuess;
use serde_json::json;
use tracing::{error, info, warn};
use walkdir::WalkDir;

use crate::{
    app_state::Status,
    llm::EmbeddingProvider,
    models::{document_id, Document},
    vector_store::DocumentStore,
};

/// Tamaño máximo de chunk en caracteres.
const CHUNK_MAX_CHARS: usize = 1200;

/// Resumen de los resultados de una operación de siembra.
#[derive(Debug, Default)]
pub struct IngestionSummary {
    pub files_scanned: u32,
    pub files_ingested: u32,
    pub files_skipped: u32,
    pub documents_created: usize,
    pub chunks_embedded: usize,
    pub chunks_without_embedding: usize,
}

impl std::fmt::Display for IngestionSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Resumen: {} ficheros escaneados, {} ingeridos, {} omitidos. {} documentos, {} chunks con embedding y {} pendientes.",
            self.files_scanned,
            self.files_ingested,
            self.files_skipped,
            self.documents_created,
            self.chunks_embedded,
            self.chunks_without_embedding
        )
    }
}

/// Recorre recursivamente un directorio, extrae el texto de cada fichero,
/// lo trocea, calcula embeddings en bloque y lo persiste con upsert
/// idempotente.
pub async fn ingest_directory(
    store: &dyn DocumentStore,
    embedder: &dyn EmbeddingProvider,
    root: &Path,
    status_arc: Arc<Mutex<Status>>,
) -> Result<IngestionSummary> {
    if !root.is_dir() {
        return Err(anyhow!("La ruta no es un directorio: {}", root.display()));
    }

    let mut summary = IngestionSummary::default();
    let file_entries: Vec<_> = WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .collect();

    let total_files = file_entries.len() as f32;

    for (index, entry) in file_entries.iter().enumerate() {
        summary.files_scanned += 1;
        let path = entry.path();
        let filename = path.file_name().unwrap_or_default().to_string_lossy();
        let progress = (index + 1) as f32 / total_files;

        {
            let mut status = status_arc.lock().unwrap();
            status.message = format!(
                "[{}/{}] Procesando: {}...",
                index + 1,
                total_files as u32,
                filename
            );
            status.progress = progress;
        }

        match ingest_file(store, embedder, root, path).await {
            Ok(Some(outcome)) => {
                summary.files_ingested += 1;
                summary.documents_created += outcome.documents;
                summary.chunks_embedded += outcome.embedded;
                summary.chunks_without_embedding += outcome.pending;
            }
            Ok(None) => {
                summary.files_skipped += 1;
            }
            Err(err) => {
                summary.files_skipped += 1;
                error!("Error ingiriendo {}: {err}", path.display());
                let mut status = status_arc.lock().unwrap();
                status.message = format!("ERROR en {}: {err}", path.display());
                status.progress = progress;
            }
        }
    }

    Ok(summary)
}

struct FileOutcome {
    documents: usize,
    embedded: usize,
    pending: usize,
}

async fn ingest_file(
    store: &dyn DocumentStore,
    embedder: &dyn EmbeddingProvider,
    root: &Path,
    path: &Path,
) -> Result<Option<FileOutcome>> {
    let extension = path
        .extension()
        .and_then(std::ffi::OsStr::to_str)
        .unwrap_or("");

    let text = match extension.to_lowercase().as_str() {
        "pdf" => match pdf_extract::extract_text(path) {
            Ok(content) => content,
            Err(e) => {
                warn!(
                    "No se pudo extraer texto del PDF {}: {e}. Saltando fichero.",
                    path.display()
                );
                return Ok(None);
            }
        },
        "txt" | "md" | "html" => match fs::read_to_string(path) {
            Ok(content) => content,
            Err(_) => {
                warn!("Saltando fichero no-texto o no-UTF8: {}", path.display());
                return Ok(None);
            }
        },
        _ => {
            info!(
                "Saltando fichero con extensión no soportada ('.{extension}'): {}",
                path.display()
            );
            return Ok(None);
        }
    };

    let chunks = split_into_chunks(&text, CHUNK_MAX_CHARS);
    if chunks.is_empty() {
        warn!("Fichero vacío o sin texto útil: {}", path.display());
        return Ok(None);
    }

    let category = category_of(root, path);
    let title = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string_lossy().to_string());
    let mime_type = MimeGuess::from_path(path)
        .first()
        .map(|m| m.to_string());

    // Documento padre: el texto completo, sin embedding (nunca rankea).
    let parent_id = document_id(&title, &category, &text);
    let mut parent = Document::new(
        title.clone(),
        text,
        category.clone(),
        json!({
            "source": path.to_string_lossy(),
            "mime_type": mime_type,
        }),
        None,
    );
    parent.id = parent_id.clone();

    // Embeddings en bloque. Si el proveedor está caído, los chunks se
    // guardan sin embedding para un backfill posterior.
    let embeddings = match embedder.embed_batch(&chunks).await {
        Ok(vectors) => vectors.into_iter().map(Some).collect::<Vec<_>>(),
        Err(e) => {
            warn!(
                "Siembra sin embeddings para {} (proveedor caído): {e}",
                path.display()
            );
            vec![None; chunks.len()]
        }
    };

    let mut outcome = FileOutcome { documents: 0, embedded: 0, pending: 0 };
    if store.upsert(&parent).await {
        outcome.documents += 1;
    }

    for (index, (chunk, embedding)) in chunks.into_iter().zip(embeddings).enumerate() {
        let chunk_title = format!("{title} ({})", index + 1);
        let has_embedding = embedding.is_some();
        let mut doc = Document::new(
            chunk_title,
            chunk,
            category.clone(),
            json!({
                "source": path.to_string_lossy(),
                "chunk_index": index,
                "keywords": keyword_candidates(&title),
            }),
            embedding,
        );
        doc.parent_id = Some(parent_id.clone());

        if store.upsert(&doc).await {
            outcome.documents += 1;
            if has_embedding {
                outcome.embedded += 1;
            } else {
                outcome.pending += 1;
            }
        }
    }

    info!(
        "Ingerido {} ({} documentos, {} chunks con embedding).",
        path.display(),
        outcome.documents,
        outcome.embedded
    );
    Ok(Some(outcome))
}

/// Categoría = primer componente de la ruta relativa a la raíz; los
/// ficheros sueltos en la raíz caen en "geral".
fn category_of(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .ok()
        .and_then(|relative| relative.components().next())
        .and_then(|component| {
            let name = component.as_os_str().to_string_lossy().to_string();
            // Un fichero directamente en la raíz no aporta categoría.
            if Path::new(&name) == path.file_name().map(Path::new).unwrap_or(path) {
                None
            } else {
                Some(name)
            }
        })
        .unwrap_or_else(|| "geral".to_string())
}

/// Palabras del título como keywords básicas (sin stemming ni stopwords:
/// suficiente para el filtro de la búsqueda por palabras clave).
fn keyword_candidates(title: &str) -> Vec<String> {
    title
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| word.chars().count() > 2)
        .map(|word| word.to_lowercase())
        .collect()
}

/// Troceado por párrafos hasta `max_chars` caracteres por chunk.
pub fn split_into_chunks(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();

    for paragraph in text.split("\n\n") {
        let paragraph = paragraph.trim();
        if paragraph.is_empty() {
            continue;
        }
        if current.chars().count() + paragraph.chars().count() + 2 > max_chars
            && !current.is_empty()
        {
            chunks.push(current.clone());
            current.clear();
        }
        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(paragraph);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn troceado_respeta_el_maximo() {
        let text = format!("{}\n\n{}\n\n{}", "a".repeat(500), "b".repeat(500), "c".repeat(500));
        let chunks = split_into_chunks(&text, 700);
        assert_eq!(chunks.len(), 3);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 700);
        }
    }

    #[test]
    fn parrafos_cortos_se_agrupan() {
        let chunks = split_into_chunks("uno\n\ndos\n\ntres", 1200);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0], "uno\n\ndos\n\ntres");
    }

    #[test]
    fn texto_vacio_no_produce_chunks() {
        assert!(split_into_chunks("\n\n  \n\n", 100).is_empty());
    }

    #[test]
    fn categoria_desde_el_subdirectorio() {
        let root = Path::new("/kb");
        assert_eq!(
            category_of(root, Path::new("/kb/trabalhista/ferias.md")),
            "trabalhista"
        );
        assert_eq!(category_of(root, Path::new("/kb/solo.md")), "geral");
    }

    #[test]
    fn keywords_desde_el_titulo() {
        assert_eq!(
            keyword_candidates("Férias CLT art-129"),
            vec!["férias", "clt", "art", "129"]
        );
    }
}
