//! Service layer: STT, LLM, TTS, intent detection and the conversation
//! pipeline that orchestrates them.

pub mod intent;
pub mod llm;
pub mod pipeline;
pub mod stt;
pub mod tts;

pub use intent::{Intent, IntentDetector, IntentResult};
pub use llm::{ChatTurn, LlmService};
pub use pipeline::{ConversationPipeline, PipelineEvents};
pub use stt::SttService;
pub use tts::TtsService;
