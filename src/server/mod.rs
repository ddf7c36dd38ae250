//! Combined WebSocket + REST server.
//!
//! Devices connect to the WebSocket at `/`; the REST surface under `/api`
//! exposes health and session introspection.

pub mod handler;
pub mod http;
pub mod messages;
pub mod session;

use anyhow::{Context, Result};
use axum::routing::{get, post};
use axum::Router;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::AppConfig;
use crate::mcp::{AlarmScheduler, AlarmStore, ToolRegistry};
use crate::server::session::SessionRegistry;
use crate::services::intent::IntentDetector;
use crate::services::llm::LlmService;
use crate::services::pipeline::ConversationPipeline;
use crate::services::stt::SttService;
use crate::services::tts::TtsService;

/// Shared server state handed to every route.
#[derive(Clone)]
pub struct ServerState {
    pub config: Arc<AppConfig>,
    pub sessions: SessionRegistry,
    pub pipeline: Arc<ConversationPipeline>,
    pub tts: TtsService,
    pub tools: Arc<ToolRegistry>,
}

/// Build the services, spawn the alarm scheduler and serve forever.
pub async fn start(config: AppConfig) -> Result<()> {
    let config = Arc::new(config);

    let stt = SttService::new(&config.stt);
    let llm = LlmService::new(&config.llm);
    let intent = IntentDetector::new(LlmService::new(&config.intent_llm));
    let tts = TtsService::with_http_synthesizer(&config.tts, &config.audio_output);

    let alarm_store = AlarmStore::new(PathBuf::from("alarms.json"));
    let tools = Arc::new(ToolRegistry::new(alarm_store.clone()));

    let pipeline = Arc::new(ConversationPipeline::new(
        stt,
        llm,
        tts.clone(),
        intent,
        tools.clone(),
    ));

    let sessions = SessionRegistry::default();

    let state = ServerState {
        config: config.clone(),
        sessions: sessions.clone(),
        pipeline,
        tts: tts.clone(),
        tools,
    };

    AlarmScheduler::new(alarm_store, sessions, tts).spawn();

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/", get(handler::ws_handler))
        .route("/api/health", get(http::health))
        .route("/api/sessions", get(http::list_sessions))
        .route("/api/sessions/{id}/history", get(http::session_history))
        .route("/api/mcp/tools", post(http::list_mcp_tools))
        .route("/api/mcp/call/{tool_name}", post(http::call_mcp_tool))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("Invalid bind address")?;

    info!("{}", "=".repeat(60));
    info!("Voice gateway started");
    info!("   WebSocket : ws://{}/", addr);
    info!("   REST API  : http://{}/api/", addr);
    let providers: Vec<String> = config
        .llm
        .providers
        .iter()
        .map(|p| format!("{}({})", p.name, p.model))
        .collect();
    let intent_providers: Vec<String> = config
        .intent_llm
        .providers
        .iter()
        .map(|p| format!("{}({})", p.name, p.model))
        .collect();
    info!("   LLM       : {}", providers.join(" -> "));
    info!("   Intent LLM: {}", intent_providers.join(" -> "));
    info!("   TTS model : {}", config.tts.model_path);
    info!("   TTS style : {}", config.tts.voice_style);
    info!("   Audio in  : {}Hz", config.audio_input.sample_rate);
    info!("   Audio out : {}Hz", config.audio_output.sample_rate);
    info!("{}", "=".repeat(60));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}
