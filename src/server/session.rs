//! Per-connection session state and the process-wide registries.
//!
//! Each connected device gets one [`Session`]: decoder, PCM buffer, chat
//! history and VAD state. The [`SessionRegistry`] pairs every session with
//! its [`Outbound`] send handle so background tasks (alarm scheduler) can
//! push audio without touching the transport loop.

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{error, info};
use uuid::Uuid;

use crate::audio::codec::OpusDecoder;
use crate::audio::vad::{calc_rms, VadConfig, VadState, VoiceActivityDetector};
use crate::config::AppConfig;
use crate::services::llm::ChatTurn;

/// State for one connected client.
pub struct Session {
    session_id: String,
    device_id: String,
    client_id: String,

    decoder: Mutex<OpusDecoder>,
    pcm_buffer: Mutex<Vec<u8>>,
    vad: Mutex<VoiceActivityDetector>,

    history: Mutex<Vec<ChatTurn>>,
    max_history: usize,

    speaking: AtomicBool,
    aborted: AtomicBool,
    idling: AtomicBool,
}

impl Session {
    pub fn new(config: &AppConfig, device_id: &str, client_id: &str) -> anyhow::Result<Self> {
        let decoder = OpusDecoder::new(&config.audio_input)?;
        let session = Self {
            session_id: Uuid::new_v4().to_string(),
            device_id: device_id.to_string(),
            client_id: client_id.to_string(),
            decoder: Mutex::new(decoder),
            pcm_buffer: Mutex::new(Vec::new()),
            vad: Mutex::new(VoiceActivityDetector::new(VadConfig::default())),
            history: Mutex::new(Vec::new()),
            max_history: config.max_chat_history,
            speaking: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            idling: AtomicBool::new(false),
        };
        info!("[{}] Session created: {}", device_id, session.session_id);
        Ok(session)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Current PCM buffer size in bytes.
    pub fn buffer_size(&self) -> usize {
        self.pcm_buffer.lock().unwrap().len()
    }

    /// Decode one Opus frame, append the PCM to the buffer and return the
    /// frame's PCM for analysis. `None` when aborted or the frame is bad.
    pub fn append_audio(&self, opus_data: &[u8]) -> Option<Vec<u8>> {
        if self.is_aborted() {
            return None;
        }
        match self.decoder.lock().unwrap().decode(opus_data) {
            Ok(pcm) => {
                self.pcm_buffer.lock().unwrap().extend_from_slice(&pcm);
                Some(pcm)
            }
            Err(e) => {
                error!("[{}] Opus decode error: {}", self.device_id, e);
                None
            }
        }
    }

    /// Run the VAD over one decoded frame.
    pub fn check_vad(&self, pcm: &[u8]) -> VadState {
        self.vad.lock().unwrap().check(calc_rms(pcm))
    }

    pub fn has_speech(&self) -> bool {
        self.vad.lock().unwrap().has_speech()
    }

    /// Clear the audio buffer and VAD state for a fresh recording.
    pub fn reset_audio_buffer(&self) {
        self.pcm_buffer.lock().unwrap().clear();
        self.vad.lock().unwrap().reset();
        self.aborted.store(false, Ordering::SeqCst);
    }

    /// Atomically drain the whole PCM buffer.
    pub fn take_audio_buffer(&self) -> Vec<u8> {
        std::mem::take(&mut *self.pcm_buffer.lock().unwrap())
    }

    /// Record one conversation turn, evicting the oldest entries past the
    /// history bound.
    pub fn save_history(&self, user_text: &str, assistant_text: &str) {
        let mut history = self.history.lock().unwrap();
        history.push(ChatTurn::user(user_text));
        history.push(ChatTurn::assistant(assistant_text));
        let len = history.len();
        if len > self.max_history {
            history.drain(..len - self.max_history);
        }
    }

    pub fn history_snapshot(&self) -> Vec<ChatTurn> {
        self.history.lock().unwrap().clone()
    }

    pub fn history_len(&self) -> usize {
        self.history.lock().unwrap().len()
    }

    /// Stop playback immediately.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        self.speaking.store(false, Ordering::SeqCst);
    }

    pub fn clear_aborted(&self) {
        self.aborted.store(false, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn set_speaking(&self, speaking: bool) {
        self.speaking.store(speaking, Ordering::SeqCst);
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking.load(Ordering::SeqCst)
    }

    pub fn set_idling(&self, idling: bool) {
        self.idling.store(idling, Ordering::SeqCst);
    }

    pub fn is_idling(&self) -> bool {
        self.idling.load(Ordering::SeqCst)
    }
}

/// Serialized send handle for one connection.
///
/// All JSON and frame writes go through the inner mutex, so pipeline
/// output and background pushes never interleave mid-message. Once a send
/// fails the handle is marked closed and later sends become no-ops.
#[derive(Clone)]
pub struct Outbound {
    sink: Arc<tokio::sync::Mutex<Option<SplitSink<WebSocket, Message>>>>,
    closed: Arc<AtomicBool>,
}

impl Outbound {
    pub fn new(sink: SplitSink<WebSocket, Message>) -> Self {
        Self {
            sink: Arc::new(tokio::sync::Mutex::new(Some(sink))),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A handle with no socket behind it; every send is a no-op. Used by
    /// tests that exercise registry bookkeeping.
    pub fn detached() -> Self {
        Self {
            sink: Arc::new(tokio::sync::Mutex::new(None)),
            closed: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Send a JSON message with the session id attached.
    pub async fn send_json(&self, session_id: &str, mut payload: Value) {
        if self.is_closed() {
            return;
        }
        payload["session_id"] = json!(session_id);
        let text = payload.to_string();

        let mut guard = self.sink.lock().await;
        match guard.as_mut() {
            Some(sink) => {
                if sink.send(Message::Text(text.into())).await.is_err() {
                    self.closed.store(true, Ordering::SeqCst);
                }
            }
            None => self.closed.store(true, Ordering::SeqCst),
        }
    }

    /// Send one binary audio frame.
    pub async fn send_frame(&self, frame: &[u8]) {
        if self.is_closed() {
            return;
        }
        let mut guard = self.sink.lock().await;
        match guard.as_mut() {
            Some(sink) => {
                if sink.send(Message::Binary(frame.to_vec().into())).await.is_err() {
                    self.closed.store(true, Ordering::SeqCst);
                }
            }
            None => self.closed.store(true, Ordering::SeqCst),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Process-wide map of live sessions and their send handles. Registered at
/// accept, deregistered at close; the alarm scheduler reads snapshots.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RwLock<HashMap<String, (Arc<Session>, Outbound)>>>,
}

impl SessionRegistry {
    pub fn register(&self, session: Arc<Session>, outbound: Outbound) {
        self.inner
            .write()
            .unwrap()
            .insert(session.session_id().to_string(), (session, outbound));
    }

    pub fn remove(&self, session_id: &str) {
        if let Some((session, _)) = self.inner.write().unwrap().remove(session_id) {
            info!("[{}] Session removed: {}", session.device_id(), session_id);
        }
    }

    pub fn get(&self, session_id: &str) -> Option<(Arc<Session>, Outbound)> {
        self.inner.read().unwrap().get(session_id).cloned()
    }

    /// All live (session, outbound) pairs at this instant.
    pub fn snapshot(&self) -> Vec<(Arc<Session>, Outbound)> {
        self.inner.read().unwrap().values().cloned().collect()
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.inner
            .read()
            .unwrap()
            .values()
            .map(|(s, _)| s.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    fn test_config() -> AppConfig {
        // Build a config without touching the process environment.
        AppConfig {
            server: Default::default(),
            audio_input: crate::config::AudioParamsConfig::input_default(),
            audio_output: crate::config::AudioParamsConfig::output_default(),
            llm: Default::default(),
            intent_llm: Default::default(),
            stt: crate::config::SttConfig {
                provider: "groq".into(),
                api_key: String::new(),
                base_url: String::new(),
                model: String::new(),
                language: "vi".into(),
            },
            tts: crate::config::TtsConfig {
                model_path: String::new(),
                synth_url: String::new(),
                speaker_id: None,
                speed: 1.0,
                voice_style: "normal".into(),
            },
            max_chat_history: 4,
        }
    }

    #[test]
    fn test_history_bound_evicts_oldest() {
        let session = Session::new(&test_config(), "dev", "cli").unwrap();

        session.save_history("u1", "a1");
        session.save_history("u2", "a2");
        session.save_history("u3", "a3");

        let history = session.history_snapshot();
        assert_eq!(history.len(), 4);
        assert_eq!(history[0].content, "u2");
        assert_eq!(history[3].content, "a3");
        // The newest entry is always an assistant turn.
        assert_eq!(history.last().unwrap().role, "assistant");
    }

    #[test]
    fn test_take_audio_buffer_drains() {
        let session = Session::new(&test_config(), "dev", "cli").unwrap();
        session
            .pcm_buffer
            .lock()
            .unwrap()
            .extend_from_slice(&[0u8; 1920]);

        let taken = session.take_audio_buffer();
        assert_eq!(taken.len(), 1920);
        assert_eq!(taken.len() % 2, 0);
        assert_eq!(session.buffer_size(), 0);
    }

    #[test]
    fn test_abort_forces_speaking_off() {
        let session = Session::new(&test_config(), "dev", "cli").unwrap();
        session.set_speaking(true);
        session.abort();
        assert!(session.is_aborted());
        assert!(!session.is_speaking());

        // A new recording clears the abort flag.
        session.reset_audio_buffer();
        assert!(!session.is_aborted());
    }

    #[test]
    fn test_aborted_session_drops_audio() {
        let session = Session::new(&test_config(), "dev", "cli").unwrap();
        session.abort();
        assert!(session.append_audio(&[0u8; 10]).is_none());
        assert_eq!(session.buffer_size(), 0);
    }

    #[test]
    fn test_registry_lifecycle() {
        let config = test_config();
        let registry = SessionRegistry::default();
        assert!(registry.is_empty());

        let session = Arc::new(Session::new(&config, "dev", "cli").unwrap());
        let id = session.session_id().to_string();

        registry.register(session.clone(), Outbound::detached());
        assert_eq!(registry.len(), 1);
        assert!(registry.get(&id).is_some());
        assert_eq!(registry.sessions().len(), 1);

        registry.remove(&id);
        assert!(registry.is_empty());
        assert!(registry.get(&id).is_none());
    }

    #[tokio::test]
    async fn test_detached_outbound_sends_are_noops() {
        let outbound = Outbound::detached();
        outbound.send_json("sid", json!({"type": "tts"})).await;
        outbound.send_frame(&[1, 2, 3]).await;
        assert!(outbound.is_closed());
    }
}
