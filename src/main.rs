use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::Router;
use tokio::sync::oneshot;
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

use legal_rag_webapp::{
    api,
    app_state::{AppState, Status},
    config, db,
    llm::{OpenAiCompletions, OpenAiEmbeddings},
    query_log::PgEventLog,
    vector_store::PgDocumentStore,
};

#[tokio::main]
async fn main() {
    // 1. Cargar .env e inicializar logging
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // 2. Cargar configuración
    let cfg = config::AppConfig::from_env().expect("Error al cargar la configuración");
    if cfg.openai_api_key.is_none() {
        tracing::warn!(
            "OPENAI_API_KEY no configurada: el servidor arranca en modo degradado"
        );
    }

    // 3. Conectar a PostgreSQL y asegurar el esquema
    let pool = db::connect_from_config(&cfg)
        .await
        .expect("Error conectando a PostgreSQL");
    db::ensure_schema(&pool, cfg.embedding_dimension)
        .await
        .expect("Error asegurando el esquema de PostgreSQL");

    // 4. Construir los servicios (inyección explícita, sin singletons)
    let store = Arc::new(PgDocumentStore::new(pool.clone()));
    let events = Arc::new(PgEventLog::new(pool));
    let embedder = Arc::new(
        OpenAiEmbeddings::from_config(&cfg).expect("Error inicializando embeddings"),
    );
    let completions = Arc::new(
        OpenAiCompletions::from_config(&cfg).expect("Error inicializando el cliente de chat"),
    );

    // Canal para la señal de apagado.
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    // 5. Crear estado compartido de la aplicación
    let app_state = AppState {
        config: cfg.clone(),
        store,
        embedder,
        completions,
        events,
        status: Arc::new(Mutex::new(Status {
            is_busy: false,
            message: "Servidor listo.".to_string(),
            progress: 0.0,
        })),
        shutdown_sender: Arc::new(Mutex::new(Some(shutdown_tx))),
    };

    // 6. Configurar el router de la API y el servicio de ficheros estáticos
    let app = Router::new()
        .merge(api::create_router(app_state))
        .fallback_service(ServeDir::new("frontend"))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    // 7. Iniciar el servidor
    let listener = tokio::net::TcpListener::bind(&cfg.server_addr)
        .await
        .expect("No se pudo abrir el puerto del servidor");
    info!("🚀 Servidor escuchando en http://{}", cfg.server_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        shutdown_rx.await.ok();
        info!("Señal de apagado recibida, iniciando cierre del servidor.");
    })
    .await
    .expect("El servidor terminó con error");

    info!("✅ Servidor cerrado correctamente.");
}
