//! Conversation pipeline: STT -> LLM -> TTS.
//!
//! A producer/consumer pair connected by a bounded queue pre-fetches
//! synthesis: while the consumer is still pacing out audio for sentence
//! *n*, the producer is already synthesizing sentence *n+1*. A parallel
//! intent task can preempt generation and switch the output to music.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::info;

use crate::mcp::ToolRegistry;
use crate::services::intent::{Intent, IntentDetector};
use crate::services::llm::{ChatTurn, LlmService};
use crate::services::stt::SttService;
use crate::services::tts::TtsService;
use std::sync::Arc;

/// Characters that terminate a complete sentence.
const SENTENCE_ENDINGS: &[char] = &['.', '!', '?', ';', ',', '\n'];

/// Soft-chunk sizing, in characters.
const CHUNK_MIN_CHARS: usize = 28;
const CHUNK_HARD_LIMIT: usize = 90;

/// Secondary punctuation acceptable as a soft-chunk boundary.
const CHUNK_PUNCT_BREAKS: &[char] = &[',', '，', ':', '：', '、'];

/// Frames sent as fast as possible to prefill the device jitter buffer.
const PRE_BUFFER_FRAMES: usize = 3;

/// Extra pause between sentences so the client finishes the previous one.
const SENTENCE_GRACE: Duration = Duration::from_millis(50);

const QUEUE_CAPACITY: usize = 100;

/// Items flowing from producer to consumer.
enum QueueItem {
    /// Caption for the sentence whose frames follow.
    Sentence(String),
    /// One encoded audio frame.
    Frame(Vec<u8>),
    /// End of stream.
    Done,
}

/// Sink for everything the pipeline emits. The transport implements this by
/// writing to the session's WebSocket under its send mutex.
#[async_trait]
pub trait PipelineEvents: Send + Sync {
    async fn on_stt_result(&self, text: &str);
    async fn on_tts_start(&self);
    async fn on_tts_sentence(&self, text: &str);
    async fn on_tts_audio(&self, frame: &[u8]);
    async fn on_tts_stop(&self);
    async fn on_music_action(&self, payload: &Value);
}

/// Orchestrates one utterance end to end.
pub struct ConversationPipeline {
    stt: SttService,
    llm: LlmService,
    tts: TtsService,
    intent: IntentDetector,
    tools: Arc<ToolRegistry>,
    prefer_fast_only: bool,
}

impl ConversationPipeline {
    pub fn new(
        stt: SttService,
        llm: LlmService,
        tts: TtsService,
        intent: IntentDetector,
        tools: Arc<ToolRegistry>,
    ) -> Self {
        Self {
            stt,
            llm,
            tts,
            intent,
            tools,
            prefer_fast_only: true,
        }
    }

    /// Enable the LLM-backed parallel intent path (off by default — the
    /// rule-based fast path already covers the common commands).
    pub fn with_parallel_intent(mut self, enabled: bool) -> Self {
        self.prefer_fast_only = !enabled;
        self
    }

    /// Run the whole pipeline for one utterance.
    /// Returns `(user_text, assistant_response)` when there is something to
    /// remember in history.
    pub async fn process(
        &self,
        pcm_data: Vec<u8>,
        chat_history: Vec<ChatTurn>,
        events: &dyn PipelineEvents,
        is_aborted: &(dyn Fn() -> bool + Send + Sync),
    ) -> Option<(String, String)> {
        // Step 1: transcription.
        let Some(user_text) = self.stt.transcribe(&pcm_data).await else {
            info!("STT returned empty, skipping");
            return None;
        };
        info!("User: {}", user_text);
        events.on_stt_result(&user_text).await;

        // Fast path: a music command skips the conversational LLM entirely.
        let fast = self.intent.detect_fast(&user_text);
        if fast.intent == Intent::Music {
            info!("Fast music intent detected: {}", fast.song_name);
            events.on_tts_start().await;
            let payload = self.call_music_tool(&fast.song_name, events).await;
            self.stream_music_preview(&payload, events, is_aborted).await;
            if !is_aborted() {
                events.on_tts_stop().await;
            }
            return Some((user_text, String::new()));
        }

        // Step 2: generative reply with streaming synthesis.
        events.on_tts_start().await;

        let music_stop = AtomicBool::new(false);

        let (full_response, music_payload) = if self.prefer_fast_only {
            let full = self
                .stream_response(&user_text, &chat_history, events, is_aborted, &music_stop)
                .await;
            (full, None)
        } else {
            let response_fut =
                self.stream_response(&user_text, &chat_history, events, is_aborted, &music_stop);
            let intent_fut =
                self.detect_and_handle_music_intent(&user_text, events, &music_stop);
            let (full, payload) = tokio::join!(response_fut, intent_fut);
            (full, payload)
        };

        if let Some(payload) = music_payload {
            if payload.get("intent").and_then(Value::as_str) == Some("music") {
                self.stream_music_preview(&payload, events, is_aborted).await;
            }
        }

        if !is_aborted() {
            events.on_tts_stop().await;
        }

        if full_response.is_empty() {
            None
        } else {
            Some((user_text, full_response))
        }
    }

    /// LLM intent classification running alongside the generative stream.
    /// On a music hit the generation-stop flag flips and the tool is called.
    async fn detect_and_handle_music_intent(
        &self,
        user_text: &str,
        events: &dyn PipelineEvents,
        music_stop: &AtomicBool,
    ) -> Option<Value> {
        let intent = self.intent.detect(user_text).await;

        if intent.intent != Intent::Music {
            let payload = json!({"intent": "other"});
            events.on_music_action(&payload).await;
            return Some(payload);
        }

        music_stop.store(true, Ordering::SeqCst);
        Some(self.call_music_tool(&intent.song_name, events).await)
    }

    /// LLM streaming -> sentence split -> TTS pre-fetch -> paced sending.
    async fn stream_response(
        &self,
        user_text: &str,
        chat_history: &[ChatTurn],
        events: &dyn PipelineEvents,
        is_aborted: &(dyn Fn() -> bool + Send + Sync),
        music_stop: &AtomicBool,
    ) -> String {
        let (queue_tx, mut queue_rx) = mpsc::channel::<QueueItem>(QUEUE_CAPACITY);
        let mut delta_rx = self.llm.chat_stream(user_text, chat_history);
        let mut full_response = String::new();

        let should_stop = || is_aborted() || music_stop.load(Ordering::SeqCst);

        let producer = async {
            let mut buffer = String::new();

            while let Some(delta) = delta_rx.recv().await {
                if should_stop() {
                    break;
                }
                full_response.push_str(&delta);
                buffer.push_str(&delta);

                // Flush every complete sentence.
                loop {
                    let (sentence, rest) = extract_sentence(&buffer);
                    buffer = rest;
                    match sentence {
                        Some(s) => self.enqueue_sentence(&s, &queue_tx, is_aborted).await,
                        None => break,
                    }
                }

                // No sentence boundary yet but the buffer got long: cut a
                // soft chunk so synthesis starts early.
                while buffer.chars().count() >= CHUNK_HARD_LIMIT && !should_stop() {
                    let (chunk, rest) = extract_soft_chunk(&buffer);
                    buffer = rest;
                    match chunk {
                        Some(c) => self.enqueue_sentence(&c, &queue_tx, is_aborted).await,
                        None => break,
                    }
                }
            }

            let remaining = buffer.trim().to_string();
            if !remaining.is_empty() && !should_stop() {
                self.enqueue_sentence(&remaining, &queue_tx, is_aborted).await;
            }

            let _ = queue_tx.send(QueueItem::Done).await;
        };

        let consumer = async {
            let frame_duration = self.tts.frame_duration();
            let mut pacer = FramePacer::new(frame_duration);
            let mut total_frames = 0usize;
            let mut has_spoken_sentence = false;

            while let Some(item) = queue_rx.recv().await {
                match item {
                    QueueItem::Done => break,
                    _ if should_stop() => continue, // drain without sending
                    QueueItem::Sentence(text) => {
                        if has_spoken_sentence {
                            // Let the client's jitter buffer finish the
                            // previous sentence before the next caption.
                            sleep(frame_duration + SENTENCE_GRACE).await;
                        }
                        events.on_tts_sentence(&text).await;
                        has_spoken_sentence = true;
                    }
                    QueueItem::Frame(frame) => {
                        events.on_tts_audio(&frame).await;
                        total_frames += 1;
                        pacer.pace().await;
                    }
                }
            }

            info!("Sent total {} audio frames", total_frames);
        };

        tokio::join!(producer, consumer);

        full_response
    }

    /// Synthesize one sentence, pushing its caption then every frame onto
    /// the queue.
    async fn enqueue_sentence(
        &self,
        sentence: &str,
        queue_tx: &mpsc::Sender<QueueItem>,
        is_aborted: &(dyn Fn() -> bool + Send + Sync),
    ) {
        info!("TTS: {}", sentence);
        if queue_tx
            .send(QueueItem::Sentence(sentence.to_string()))
            .await
            .is_err()
        {
            return;
        }

        let mut frames = self.tts.synthesize(sentence);
        let mut frame_count = 0usize;
        while let Some(frame) = frames.recv().await {
            if is_aborted() {
                break;
            }
            if queue_tx.send(QueueItem::Frame(frame)).await.is_err() {
                break;
            }
            frame_count += 1;
        }
        info!("Queued {} frames for: {}", frame_count, truncate(sentence, 40));
    }

    /// Call the music search tool and publish a uniform payload.
    async fn call_music_tool(&self, song_name: &str, events: &dyn PipelineEvents) -> Value {
        let request_body = json!({
            "song_name": song_name,
            "query": song_name,
            "limit": 5,
        });
        let result = self
            .tools
            .call_tool("search_vietnamese_music", &request_body)
            .await;

        let payload = json!({
            "intent": "music",
            "song_name": song_name,
            "request_body": request_body,
            "ok": result.ok,
            "content": result.content,
        });
        events.on_music_action(&payload).await;
        payload
    }

    /// Speak the acknowledgement, then stream the full song, falling back
    /// to the 30 s preview when resolution yields nothing.
    async fn stream_music_preview(
        &self,
        payload: &Value,
        events: &dyn PipelineEvents,
        is_aborted: &(dyn Fn() -> bool + Send + Sync),
    ) {
        if is_aborted() {
            return;
        }

        let tracks = extract_tracks(payload);
        let Some(first) = tracks.first() else {
            return;
        };

        let title = non_empty_str(first.get("title"))
            .or_else(|| non_empty_str(payload.get("song_name")))
            .unwrap_or_else(|| "bài nhạc".to_string());
        let artist = non_empty_str(first.get("artist")).unwrap_or_default();
        let preview_url = non_empty_str(first.get("preview_url")).unwrap_or_default();

        let ack = if artist.is_empty() {
            format!("Đang mở bài {}.", title)
        } else {
            format!("Đang mở bài {} của {}.", title, artist)
        };
        events.on_tts_sentence(&ack).await;
        self.send_frames_with_pacing(self.tts.synthesize(&ack), events, is_aborted)
            .await;

        if preview_url.is_empty() {
            return;
        }

        // Short gap so the confirmation's last frame is not overlapped.
        sleep(self.tts.frame_duration()).await;

        events.on_tts_sentence("Đang phát bài hát.").await;
        let query = format!("{} {}", title, artist);
        let streamed = self
            .send_frames_with_pacing(
                self.tts.stream_full_song_by_query(query.trim()),
                events,
                is_aborted,
            )
            .await;

        if streamed == 0 {
            self.send_frames_with_pacing(self.tts.stream_audio_url(&preview_url), events, is_aborted)
                .await;
        }
    }

    /// Forward frames to the sink at playback rate. Returns the number of
    /// frames sent, or 0 when aborted mid-stream.
    async fn send_frames_with_pacing(
        &self,
        mut frames: mpsc::Receiver<Vec<u8>>,
        events: &dyn PipelineEvents,
        is_aborted: &(dyn Fn() -> bool + Send + Sync),
    ) -> usize {
        let mut pacer = FramePacer::new(self.tts.frame_duration());
        let mut sent = 0usize;

        while let Some(frame) = frames.recv().await {
            if is_aborted() {
                return 0;
            }
            events.on_tts_audio(&frame).await;
            sent += 1;
            pacer.pace().await;
        }
        sent
    }
}

/// Emission pacing: the first `PRE_BUFFER_FRAMES` go out immediately, then
/// a target timestamp advances by one frame duration per frame and sending
/// sleeps up to it — one 60 ms frame every 60 ms at steady state.
struct FramePacer {
    frame: Duration,
    sent: usize,
    next_at: Option<Instant>,
}

impl FramePacer {
    fn new(frame: Duration) -> Self {
        Self {
            frame,
            sent: 0,
            next_at: None,
        }
    }

    /// Call after each frame send.
    async fn pace(&mut self) {
        self.sent += 1;
        if self.sent == PRE_BUFFER_FRAMES {
            self.next_at = Some(Instant::now() + self.frame);
        } else if self.sent > PRE_BUFFER_FRAMES {
            if let Some(next) = self.next_at {
                if Instant::now() < next {
                    sleep_until(next).await;
                }
                self.next_at = Some(next + self.frame);
            }
        }
    }
}

/// Split the first complete sentence off the buffer. A sentence runs up to
/// and including the first terminator and must be at least 2 characters
/// after trimming.
fn extract_sentence(buffer: &str) -> (Option<String>, String) {
    for (idx, ch) in buffer.char_indices() {
        if SENTENCE_ENDINGS.contains(&ch) {
            let split = idx + ch.len_utf8();
            let sentence = buffer[..split].trim();
            let remaining = buffer[split..].to_string();
            if sentence.chars().count() > 1 {
                return (Some(sentence.to_string()), remaining);
            }
            return (None, remaining);
        }
    }
    (None, buffer.to_string())
}

/// Cut a soft chunk when no sentence boundary appeared: prefer secondary
/// punctuation scanning right-to-left under the hard limit, then the
/// rightmost space; never cut inside a word and never below the minimum.
fn extract_soft_chunk(buffer: &str) -> (Option<String>, String) {
    let chars: Vec<char> = buffer.chars().collect();
    if chars.len() < CHUNK_MIN_CHARS {
        return (None, buffer.to_string());
    }

    let limit = chars.len().min(CHUNK_HARD_LIMIT);

    let punct_cut = (CHUNK_MIN_CHARS..limit)
        .rev()
        .find(|&i| CHUNK_PUNCT_BREAKS.contains(&chars[i]));

    let (chunk, remaining) = if let Some(i) = punct_cut {
        let chunk: String = chars[..=i].iter().collect();
        let remaining: String = chars[i + 1..].iter().collect();
        (
            chunk.trim_end().to_string(),
            remaining.trim_start().to_string(),
        )
    } else {
        let Some(i) = (CHUNK_MIN_CHARS..limit).rev().find(|&i| chars[i] == ' ') else {
            return (None, buffer.to_string());
        };
        let chunk: String = chars[..i].iter().collect();
        let remaining: String = chars[i + 1..].iter().collect();
        (
            chunk.trim_end().to_string(),
            remaining.trim_start().to_string(),
        )
    };

    if chunk.chars().count() < CHUNK_MIN_CHARS {
        return (None, buffer.to_string());
    }
    (Some(chunk), remaining)
}

/// Pull the track list out of a music tool payload.
fn extract_tracks(payload: &Value) -> Vec<Value> {
    let Some(content) = payload.get("content").and_then(Value::as_array) else {
        return Vec::new();
    };

    for item in content {
        if item.get("type").and_then(Value::as_str) != Some("json") {
            continue;
        }
        let Some(tracks) = item
            .get("json")
            .and_then(|data| data.get("tracks"))
            .and_then(Value::as_array)
        else {
            continue;
        };
        return tracks.iter().filter(|t| t.is_object()).cloned().collect();
    }
    Vec::new()
}

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        text.chars().take(max_chars).collect()
    }
}
