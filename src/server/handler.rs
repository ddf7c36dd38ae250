//! WebSocket transport handler.
//!
//! One `handle_client` per connection: text messages dispatch to typed
//! handlers, binary frames run the audio path (decode, buffer, VAD). The
//! pipeline fires exactly once per utterance — on end-of-speech, an
//! explicit `listen stop`, or as a best-effort flush at disconnect.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Response;
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::prompts::GOODBYE_TEXT;
use crate::server::messages::{AudioParams, ServerHello};
use crate::server::session::{Outbound, Session};
use crate::server::ServerState;
use crate::services::pipeline::PipelineEvents;

use crate::audio::vad::{calc_rms, VadState};
use async_trait::async_trait;

/// Frames without confirmed speech before the idle goodbye (~10 s).
const IDLE_TIMEOUT_FRAMES: u32 = 167;

/// Minimum buffered PCM worth a pipeline run (~0.1 s).
const MIN_PIPELINE_PCM_BYTES: usize = 3200;

/// Fixed pacing for the goodbye burst.
const GOODBYE_FRAME_PACING: Duration = Duration::from_millis(54);

/// Transport-loop-local state: only the connection's own task touches it.
struct ConnState {
    frame_count: u32,
    pipeline_triggered: bool,
}

/// Upgrade handler for the device WebSocket endpoint.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<ServerState>,
    headers: HeaderMap,
) -> Response {
    let device_id = header_value(&headers, "device-id");
    let client_id = header_value(&headers, "client-id");
    let proto_version: u8 = headers
        .get("protocol-version")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(1);

    ws.on_upgrade(move |socket| {
        handle_client(socket, state, device_id, client_id, proto_version)
    })
}

fn header_value(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string()
}

/// Entry point for one client connection.
async fn handle_client(
    socket: WebSocket,
    state: ServerState,
    device_id: String,
    client_id: String,
    proto_version: u8,
) {
    let (sink, mut receiver) = socket.split();
    let outbound = Outbound::new(sink);

    let session = match Session::new(&state.config, &device_id, &client_id) {
        Ok(session) => Arc::new(session),
        Err(e) => {
            error!("[{}] Failed to create session: {:#}", device_id, e);
            return;
        }
    };
    state.sessions.register(session.clone(), outbound.clone());
    info!("[{}] Connected (protocol v{})", device_id, proto_version);

    let mut conn = ConnState {
        frame_count: 0,
        pipeline_triggered: false,
    };

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                on_text(&state, &session, &outbound, &mut conn, text.as_str()).await;
            }
            Ok(Message::Binary(data)) => {
                on_binary(&state, &session, &outbound, &mut conn, &data, proto_version);
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                error!("[{}] WebSocket error: {}", device_id, e);
                break;
            }
        }
    }

    // Buffer still holds an utterance that never triggered a pipeline:
    // run it once, best-effort — the socket may already be gone and every
    // send then degrades to a no-op.
    if session.buffer_size() > MIN_PIPELINE_PCM_BYTES && !conn.pipeline_triggered {
        info!(
            "[{}] Disconnected with {} frames, buffer={} bytes -> auto-triggering STT",
            device_id,
            conn.frame_count,
            session.buffer_size()
        );
        run_pipeline(state.clone(), session.clone(), outbound.clone()).await;
    } else {
        info!(
            "[{}] Disconnected ({} frames, pipeline_already={})",
            device_id,
            conn.frame_count,
            if conn.pipeline_triggered { "yes" } else { "no" }
        );
    }

    state.sessions.remove(session.session_id());
}

/// Classify a JSON message and call the matching handler.
async fn on_text(
    state: &ServerState,
    session: &Arc<Session>,
    outbound: &Outbound,
    conn: &mut ConnState,
    raw: &str,
) {
    let msg: Value = match serde_json::from_str(raw) {
        Ok(msg) => msg,
        Err(_) => {
            warn!(
                "[{}] Invalid JSON: {}",
                session.device_id(),
                truncate(raw, 100)
            );
            return;
        }
    };

    let msg_type = msg.get("type").and_then(Value::as_str).unwrap_or("");
    info!("[{}] <- {}", session.device_id(), msg_type);

    match msg_type {
        "hello" => handle_hello(state, session, outbound).await,
        "listen" => handle_listen(state, session, outbound, conn, &msg).await,
        "abort" => {
            session.abort();
            info!("[{}] Aborted", session.device_id());
        }
        "mcp" => handle_mcp(state, session, outbound, &msg).await,
        other => {
            warn!("[{}] Unknown type: {}", session.device_id(), other);
            outbound
                .send_json(
                    session.session_id(),
                    json!({
                        "type": "error",
                        "message": format!("Unknown message type: {}", other),
                    }),
                )
                .await;
        }
    }
}

/// Reply with the server hello: session id plus outbound audio params.
async fn handle_hello(state: &ServerState, session: &Arc<Session>, outbound: &Outbound) {
    let audio = &state.config.audio_output;
    let response = ServerHello::new(
        session.session_id(),
        AudioParams::opus(audio.sample_rate, audio.channels, audio.frame_duration_ms),
    );
    outbound
        .send_json(
            session.session_id(),
            serde_json::to_value(&response).unwrap_or_default(),
        )
        .await;
    info!(
        "[{}] -> hello (session={}...)",
        session.device_id(),
        &session.session_id()[..8]
    );
}

/// The listen state machine: start/detect reset the utterance, stop forces
/// the pipeline if it has not fired yet.
async fn handle_listen(
    state: &ServerState,
    session: &Arc<Session>,
    outbound: &Outbound,
    conn: &mut ConnState,
    msg: &Value,
) {
    let listen_state = msg.get("state").and_then(Value::as_str).unwrap_or("");
    let mode = msg.get("mode").and_then(Value::as_str).unwrap_or("");
    info!(
        "[{}] listen state={} mode={}",
        session.device_id(),
        listen_state,
        mode
    );

    match listen_state {
        "start" | "detect" => {
            session.reset_audio_buffer();
            session.set_idling(false);
            conn.frame_count = 0;
            conn.pipeline_triggered = false;
            info!("[{}] Recording started (mode={})", session.device_id(), mode);
        }
        "stop" => {
            if !conn.pipeline_triggered {
                conn.pipeline_triggered = true;
                info!(
                    "[{}] Recording stopped -- {} frames, buffer={} bytes",
                    session.device_id(),
                    conn.frame_count,
                    session.buffer_size()
                );
                tokio::spawn(run_pipeline(
                    state.clone(),
                    session.clone(),
                    outbound.clone(),
                ));
            } else {
                info!(
                    "[{}] Recording stopped -- pipeline already triggered, skipping",
                    session.device_id()
                );
            }
        }
        other => {
            warn!("[{}] Unknown listen state: {}", session.device_id(), other);
        }
    }
}

/// MCP over the socket: accepts flat and payload-wrapped envelopes.
async fn handle_mcp(
    state: &ServerState,
    session: &Arc<Session>,
    outbound: &Outbound,
    msg: &Value,
) {
    let payload = msg.get("payload").cloned().unwrap_or(Value::Null);

    let op = [msg.get("op"), payload.get("op"), msg.get("method"), payload.get("method")]
        .into_iter()
        .flatten()
        .find_map(Value::as_str)
        .unwrap_or("")
        .to_string();

    match op.as_str() {
        "tools/list" | "list_tools" | "mcp.tools.list" => {
            outbound
                .send_json(
                    session.session_id(),
                    json!({
                        "type": "mcp",
                        "op": "tools/list",
                        "ok": true,
                        "tools": state.tools.list_tools(),
                    }),
                )
                .await;
        }
        "tools/call" | "call_tool" | "mcp.tools.call" => {
            let name = extract_field(msg, &payload, "name")
                .and_then(|v| v.as_str().map(String::from))
                .unwrap_or_default();
            let arguments =
                extract_field(msg, &payload, "arguments").unwrap_or_else(|| json!({}));

            let result = state.tools.call_tool(&name, &arguments).await;
            outbound
                .send_json(
                    session.session_id(),
                    json!({
                        "type": "mcp",
                        "op": "tools/call",
                        "name": name,
                        "ok": result.ok,
                        "content": result.content,
                    }),
                )
                .await;
        }
        other => {
            outbound
                .send_json(
                    session.session_id(),
                    json!({
                        "type": "mcp",
                        "ok": false,
                        "error": format!("Unsupported MCP operation: {}", other),
                    }),
                )
                .await;
        }
    }
}

/// Look a field up in the flat message, the payload wrapper, or the
/// `params` object of either.
fn extract_field(msg: &Value, payload: &Value, key: &str) -> Option<Value> {
    [
        msg.get(key),
        payload.get(key),
        msg.get("params").and_then(|p| p.get(key)),
        payload.get("params").and_then(|p| p.get(key)),
    ]
    .into_iter()
    .flatten()
    .find(|v| !v.is_null())
    .cloned()
}

/// Binary audio path: strip the transport header, decode, buffer, VAD.
fn on_binary(
    state: &ServerState,
    session: &Arc<Session>,
    outbound: &Outbound,
    conn: &mut ConnState,
    data: &[u8],
    proto_version: u8,
) {
    let opus_data = extract_opus_payload(data, proto_version);
    if opus_data.is_empty() {
        return;
    }

    let Some(pcm) = session.append_audio(opus_data) else {
        return;
    };

    conn.frame_count += 1;
    let rms = calc_rms(&pcm);
    if conn.frame_count <= 10 || conn.frame_count % 5 == 0 {
        debug!(
            "[{}] #{} rms={:.0} has_speech={} ({}B opus, {}B buf)",
            session.device_id(),
            conn.frame_count,
            rms,
            session.has_speech(),
            opus_data.len(),
            session.buffer_size()
        );
    }

    if conn.pipeline_triggered {
        return;
    }

    match session.check_vad(&pcm) {
        VadState::SilenceAfterSpeech => {
            conn.pipeline_triggered = true;
            info!(
                "[{}] VAD: silence after speech -- {} frames, buffer={} bytes -> triggering STT",
                session.device_id(),
                conn.frame_count,
                session.buffer_size()
            );
            tokio::spawn(run_pipeline(
                state.clone(),
                session.clone(),
                outbound.clone(),
            ));
        }
        _ => {
            if !session.has_speech() && conn.frame_count >= IDLE_TIMEOUT_FRAMES {
                if session.is_idling() {
                    return;
                }
                conn.pipeline_triggered = true;
                info!(
                    "[{}] Idle timeout ({} frames, ~{:.0}s) -> goodbye (enter idle)",
                    session.device_id(),
                    conn.frame_count,
                    conn.frame_count as f64 * 0.06
                );
                tokio::spawn(goodbye_and_idle(
                    state.clone(),
                    session.clone(),
                    outbound.clone(),
                ));
            }
        }
    }
}

/// Strip the optional transport header from a binary frame.
fn extract_opus_payload(data: &[u8], version: u8) -> &[u8] {
    if version == 2 && data.len() > 16 {
        &data[16..]
    } else if version == 3 && data.len() > 4 {
        let payload_size = u16::from_be_bytes([data[2], data[3]]) as usize;
        let end = (4 + payload_size).min(data.len());
        &data[4..end]
    } else {
        data
    }
}

/// Speak the goodbye, notify idle, keep the connection open.
async fn goodbye_and_idle(state: ServerState, session: Arc<Session>, outbound: Outbound) {
    session.set_idling(true);

    outbound
        .send_json(session.session_id(), json!({"type": "tts", "state": "start"}))
        .await;
    outbound
        .send_json(
            session.session_id(),
            json!({"type": "tts", "state": "sentence_start", "text": GOODBYE_TEXT}),
        )
        .await;

    info!("Goodbye TTS: {}", GOODBYE_TEXT);
    let mut frames = state.tts.synthesize(GOODBYE_TEXT);
    while let Some(frame) = frames.recv().await {
        if session.is_aborted() {
            break;
        }
        outbound.send_frame(&frame).await;
        sleep(GOODBYE_FRAME_PACING).await;
    }

    outbound
        .send_json(session.session_id(), json!({"type": "tts", "state": "stop"}))
        .await;
    outbound
        .send_json(
            session.session_id(),
            json!({"type": "idle", "message": "Server is idling (connection kept open)"}),
        )
        .await;
    info!(
        "[{}] Connection left open in idle mode",
        session.device_id()
    );

    session.reset_audio_buffer();
}

/// Pipeline event sink writing through the session's serialized outbound.
struct WsEvents {
    outbound: Outbound,
    session_id: String,
    device_id: String,
}

#[async_trait]
impl PipelineEvents for WsEvents {
    async fn on_stt_result(&self, text: &str) {
        info!("[{}] STT result: {}", self.device_id, text);
        self.outbound
            .send_json(&self.session_id, json!({"type": "stt", "text": text}))
            .await;
    }

    async fn on_tts_start(&self) {
        self.outbound
            .send_json(&self.session_id, json!({"type": "tts", "state": "start"}))
            .await;
    }

    async fn on_tts_sentence(&self, text: &str) {
        info!("[{}] TTS sentence: {}", self.device_id, text);
        self.outbound
            .send_json(
                &self.session_id,
                json!({"type": "tts", "state": "sentence_start", "text": text}),
            )
            .await;
    }

    async fn on_tts_audio(&self, frame: &[u8]) {
        self.outbound.send_frame(frame).await;
    }

    async fn on_tts_stop(&self) {
        self.outbound
            .send_json(&self.session_id, json!({"type": "tts", "state": "stop"}))
            .await;
    }

    async fn on_music_action(&self, payload: &Value) {
        let intent = payload.get("intent").and_then(Value::as_str).unwrap_or("other");
        if intent != "music" {
            info!("[{}] Intent=other, skip music tool", self.device_id);
            return;
        }

        info!(
            "[{}] Intent=music, song='{}', ok={}",
            self.device_id,
            payload.get("song_name").and_then(serde_json::Value::as_str).unwrap_or(""),
            payload.get("ok").and_then(serde_json::Value::as_bool).unwrap_or(false),
        );
        self.outbound
            .send_json(
                &self.session_id,
                json!({
                    "type": "mcp",
                    "op": "tools/call",
                    "name": "search_vietnamese_music",
                    "intent": intent,
                    "song_name": payload.get("song_name").cloned().unwrap_or(json!("")),
                    "request_body": payload.get("request_body").cloned().unwrap_or(json!({})),
                    "ok": payload.get("ok").cloned().unwrap_or(json!(false)),
                    "content": payload.get("content").cloned().unwrap_or(json!([])),
                    "error": payload.get("error").cloned().unwrap_or(Value::Null),
                }),
            )
            .await;
    }
}

/// Run the STT -> LLM -> TTS pipeline for the buffered utterance.
async fn run_pipeline(state: ServerState, session: Arc<Session>, outbound: Outbound) {
    let pcm_data = session.take_audio_buffer();
    let duration_s = pcm_data.len() as f64 / (16_000.0 * 2.0);
    info!(
        "[{}] Pipeline starting -- {} bytes ({:.1}s audio)",
        session.device_id(),
        pcm_data.len(),
        duration_s
    );

    if pcm_data.len() < MIN_PIPELINE_PCM_BYTES {
        info!(
            "[{}] Audio too short ({:.1}s), skipping",
            session.device_id(),
            duration_s
        );
        return;
    }

    session.set_speaking(true);

    let events = WsEvents {
        outbound,
        session_id: session.session_id().to_string(),
        device_id: session.device_id().to_string(),
    };
    let abort_session = session.clone();
    let is_aborted = move || abort_session.is_aborted();

    let result = state
        .pipeline
        .process(pcm_data, session.history_snapshot(), &events, &is_aborted)
        .await;

    match result {
        Some((user_text, assistant_text)) => {
            session.save_history(&user_text, &assistant_text);
            info!(
                "[{}] Pipeline done -- user: '{}' -> assistant: '{}'",
                session.device_id(),
                truncate(&user_text, 50),
                truncate(&assistant_text, 50)
            );
        }
        None => {
            warn!("[{}] Pipeline returned no result", session.device_id());
        }
    }

    session.set_speaking(false);
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        text.chars().take(max_chars).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_opus_payload_v1_raw() {
        let data = vec![1u8, 2, 3, 4, 5];
        assert_eq!(extract_opus_payload(&data, 1), &data[..]);
    }

    #[test]
    fn test_extract_opus_payload_v2_strips_prefix() {
        let mut data = vec![0u8; 16];
        data.extend_from_slice(&[9, 8, 7]);
        assert_eq!(extract_opus_payload(&data, 2), &[9, 8, 7]);
        // Too short for the prefix: passed through untouched.
        let short = vec![0u8; 10];
        assert_eq!(extract_opus_payload(&short, 2), &short[..]);
    }

    #[test]
    fn test_extract_opus_payload_v3_length_field() {
        // 2 reserved bytes, BE length 3 at [2..4), payload, trailing junk.
        let data = vec![0u8, 0, 0, 3, 0xAA, 0xBB, 0xCC, 0xFF, 0xFF];
        assert_eq!(extract_opus_payload(&data, 3), &[0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn test_extract_opus_payload_v3_length_clamped() {
        let data = vec![0u8, 0, 0xFF, 0xFF, 0xAA];
        assert_eq!(extract_opus_payload(&data, 3), &[0xAA]);
    }

    #[test]
    fn test_extract_field_all_envelopes() {
        let flat = json!({"name": "a"});
        let wrapped = json!({"payload": {"name": "b"}});
        let in_params = json!({"params": {"name": "c"}});
        let payload_params = json!({"payload": {"params": {"name": "d"}}});
        let null_payload = Value::Null;

        assert_eq!(
            extract_field(&flat, &null_payload, "name"),
            Some(json!("a"))
        );
        assert_eq!(
            extract_field(&wrapped, &wrapped["payload"], "name"),
            Some(json!("b"))
        );
        assert_eq!(
            extract_field(&in_params, &null_payload, "name"),
            Some(json!("c"))
        );
        assert_eq!(
            extract_field(&payload_params, &payload_params["payload"], "name"),
            Some(json!("d"))
        );
        assert_eq!(extract_field(&json!({}), &null_payload, "name"), None);
    }
}
