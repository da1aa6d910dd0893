//! Orquestador RAG: respuesta en lenguaje natural fundamentada en los
//! documentos recuperados.
//!
//! Flujo:
//!   1. Búsqueda semántica de los top-N documentos de contexto.
//!   2. Construcción del prompt: instrucción fija + contexto concatenado en
//!      orden de relevancia descendente, truncado a un presupuesto de
//!      caracteres antes de llamar al proveedor.
//!   3. Llamada de chat con el modelo configurado; si ese modelo concreto
//!      falla, un único reintento con el modelo fijado de reserva.
//!   4. Ante cualquier fallo del proveedor, respuesta de cortesía claramente
//!      marcada y motivo del error registrado para la analítica. La petición
//!      nunca revienta.

use tracing::warn;

use crate::config::AppConfig;
use crate::llm::{CompletionProvider, EmbeddingProvider};
use crate::models::{LlmUsage, SearchHit};
use crate::retrieval;
use crate::vector_store::DocumentStore;

const SYSTEM_PROMPT: &str = "\
Eres un asistente legal. Respondes de forma clara y concisa, en el mismo \
idioma de la pregunta. Sólo puedes usar la información suministrada en el \
contexto, que proviene de una base de conocimiento jurídica. Si el contexto \
no contiene la respuesta, dilo explícitamente y recomienda consultar a un \
profesional. No inventes artículos, plazos ni referencias legales.";

/// Respuesta de cortesía cuando el proveedor de chat no está disponible.
pub const FALLBACK_ANSWER: &str = "\
Lo siento, en este momento no puedo generar una respuesta. Por favor, \
inténtalo de nuevo en unos minutos o consulta directamente las fuentes \
listadas.";

/// Respuesta cuando la base de conocimiento no aporta contexto alguno.
pub const NO_CONTEXT_ANSWER: &str = "\
No se encontró información relevante en la base de conocimiento para \
responder a esta pregunta. Te recomiendo reformularla o consultar a un \
profesional del derecho.";

/// Resultado completo de una pregunta RAG, listo para responder al cliente
/// y alimentar el evento de analítica.
#[derive(Debug)]
pub struct RagOutcome {
    pub answer: String,
    pub sources: Vec<SearchHit>,
    pub usage: Option<LlmUsage>,
    pub success: bool,
    pub error_message: Option<String>,
}

/// Responde `question` con el contexto de los `top_k` documentos más afines.
pub async fn answer(
    store: &dyn DocumentStore,
    embedder: &dyn EmbeddingProvider,
    completions: &dyn CompletionProvider,
    cfg: &AppConfig,
    question: &str,
    top_k: usize,
) -> RagOutcome {
    let sources = retrieval::search(store, embedder, question, top_k, None).await;

    if sources.is_empty() {
        return RagOutcome {
            answer: NO_CONTEXT_ANSWER.to_string(),
            sources,
            usage: None,
            success: true,
            error_message: None,
        };
    }

    let context = build_context(&sources, cfg.context_char_budget);
    let user_prompt = format!("Contexto:\n{context}\n\nPregunta:\n{question}");

    // Modelo preferido y, si ese modelo concreto falla, un único reintento
    // con el de reserva. Sin bucles.
    let mut last_error = None;
    for model in candidate_models(cfg) {
        match completions.complete(&model, SYSTEM_PROMPT, &user_prompt).await {
            Ok(completion) => {
                return RagOutcome {
                    answer: completion.text,
                    sources,
                    usage: Some(completion.usage),
                    success: true,
                    error_message: None,
                };
            }
            Err(e) => {
                warn!("El modelo {model} no respondió: {e}");
                last_error = Some(format!("{model}: {e:#}"));
            }
        }
    }

    RagOutcome {
        answer: FALLBACK_ANSWER.to_string(),
        sources,
        usage: None,
        success: false,
        error_message: last_error,
    }
}

fn candidate_models(cfg: &AppConfig) -> Vec<String> {
    let mut models = vec![cfg.chat_model.clone()];
    if cfg.chat_model_fallback != cfg.chat_model {
        models.push(cfg.chat_model_fallback.clone());
    }
    models
}

/// Concatena los documentos en orden de llegada (relevancia descendente:
/// el orden de inclusión importa para la atención del LLM) y corta el
/// conjunto al presupuesto de caracteres.
pub fn build_context(sources: &[SearchHit], char_budget: usize) -> String {
    let mut context = String::new();
    for hit in sources {
        let block = format!("### {}\n{}", hit.title, hit.content);
        if context.is_empty() {
            context.push_str(&truncate_chars(&block, char_budget));
            continue;
        }
        let remaining = char_budget.saturating_sub(context.chars().count() + 2);
        if remaining == 0 {
            break;
        }
        context.push_str("\n\n");
        context.push_str(&truncate_chars(&block, remaining));
    }
    context
}

/// Corte seguro en límites de carácter (nunca parte un UTF-8 a medias).
fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(title: &str, content: &str) -> SearchHit {
        SearchHit {
            id: title.to_string(),
            title: title.to_string(),
            content: content.to_string(),
            category: "geral".to_string(),
            keywords: Vec::new(),
            relevance: Some(0.9),
        }
    }

    #[test]
    fn el_contexto_respeta_el_presupuesto() {
        let sources = vec![hit("A", &"x".repeat(100)), hit("B", &"y".repeat(100))];
        let context = build_context(&sources, 120);
        assert!(context.chars().count() <= 120);
        // El documento más relevante entra primero y completo.
        assert!(context.starts_with("### A\n"));
    }

    #[test]
    fn el_contexto_incluye_todos_si_hay_sitio() {
        let sources = vec![hit("A", "corto"), hit("B", "también corto")];
        let context = build_context(&sources, 10_000);
        assert!(context.contains("### A"));
        assert!(context.contains("### B"));
    }

    #[test]
    fn truncado_en_limite_de_caracter_multibyte() {
        let texto = "férias férias férias";
        let cortado = truncate_chars(texto, 3);
        assert_eq!(cortado, "fér");
    }
}
