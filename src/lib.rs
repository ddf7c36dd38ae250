//! Voice Gateway - streaming voice-assistant server
//!
//! A gateway for low-power embedded microphone clients:
//! - Persistent bidirectional WebSocket carrying Opus audio + JSON control
//! - Energy-based utterance segmentation (VAD)
//! - STT -> streaming LLM -> TTS pipeline with sentence-level pre-fetch
//! - Music intent fast path streaming real audio via ffmpeg / yt-dlp
//! - Alarm scheduler pushing ringtones into connected sessions
//!
//! # Example
//!
//! ```ignore
//! use voice_gateway::config::AppConfig;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AppConfig::load();
//!     voice_gateway::server::start(config).await
//! }
//! ```

pub mod audio;
pub mod cli;
pub mod config;
pub mod mcp;
pub mod prompts;
pub mod server;
pub mod services;

// Re-export the types most callers reach for.
pub use config::AppConfig;
pub use server::{start as start_server, ServerState};
pub use services::{ConversationPipeline, LlmService, SttService, TtsService};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Get the library info
pub fn info() -> String {
    format!("{} v{} - Voice Assistant Gateway", NAME, VERSION)
}
