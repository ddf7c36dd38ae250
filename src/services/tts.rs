//! Text-to-Speech service.
//!
//! Three sources of outbound audio, all delivered as streams of 60 ms Opus
//! frames at the wire rate: the local speech synthesizer, an arbitrary
//! audio URL transcoded by ffmpeg, and a full song resolved by yt-dlp.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::audio::codec::OpusEncoder;
use crate::audio::effects::{VoiceShaper, VoiceStyle};
use crate::audio::resample::PolyphaseResampler;
use crate::audio::wav::wav_to_samples;
use crate::config::{AudioParamsConfig, TtsConfig};

/// Capability interface for the local neural synthesizer.
///
/// Implementations push int16 PCM chunks at `sample_rate()` into the
/// bounded channel as they are produced; genuinely blocking engines should
/// do their work under `spawn_blocking`.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    fn sample_rate(&self) -> u32;

    async fn synthesize(&self, text: &str, chunks: mpsc::Sender<Vec<i16>>) -> Result<()>;
}

/// Synthesizer backed by an OpenAI-compatible `/v1/audio/speech` endpoint.
pub struct HttpSynthesizer {
    client: reqwest::Client,
    base_url: String,
    model: String,
    voice: Option<String>,
    speed: f32,
    sample_rate: u32,
}

impl HttpSynthesizer {
    pub fn new(cfg: &TtsConfig) -> Self {
        info!(
            "TTS synthesizer endpoint: {} (model {})",
            cfg.synth_url, cfg.model_path
        );
        Self {
            client: reqwest::Client::new(),
            base_url: cfg.synth_url.trim_end_matches('/').to_string(),
            model: cfg.model_path.clone(),
            voice: cfg.speaker_id.map(|id| id.to_string()),
            speed: cfg.speed,
            sample_rate: 22_050,
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for HttpSynthesizer {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    async fn synthesize(&self, text: &str, chunks: mpsc::Sender<Vec<i16>>) -> Result<()> {
        let mut request = serde_json::json!({
            "model": self.model,
            "input": text,
            "response_format": "wav",
            "speed": self.speed,
        });
        if let Some(voice) = &self.voice {
            request["voice"] = serde_json::json!(voice);
        }

        let response = self
            .client
            .post(format!("{}/v1/audio/speech", self.base_url))
            .json(&request)
            .send()
            .await
            .context("Failed to reach TTS synthesizer")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("TTS synthesizer error ({}): {}", status, body);
        }

        let wav_bytes = response
            .bytes()
            .await
            .context("Failed to read synthesizer response")?;
        let (samples, _rate) = wav_to_samples(&wav_bytes)?;

        // Feed downstream in bounded chunks so frame assembly overlaps
        // network transfer of the next request.
        for chunk in samples.chunks(4096) {
            if chunks.send(chunk.to_vec()).await.is_err() {
                break;
            }
        }
        Ok(())
    }
}

struct TtsInner {
    synth: Arc<dyn SpeechSynthesizer>,
    style: VoiceStyle,
    target_rate: u32,
    resampler: Option<PolyphaseResampler>,
    frame_bytes: usize,
    frame_duration: Duration,
    output_cfg: AudioParamsConfig,
}

/// Turns text and external audio into Opus frame streams.
#[derive(Clone)]
pub struct TtsService {
    inner: Arc<TtsInner>,
}

impl TtsService {
    pub fn new(
        tts_cfg: &TtsConfig,
        audio_cfg: &AudioParamsConfig,
        synth: Arc<dyn SpeechSynthesizer>,
    ) -> Self {
        let style = VoiceStyle::parse(&tts_cfg.voice_style);
        let source_rate = synth.sample_rate();
        let target_rate = audio_cfg.sample_rate;

        let resampler = if source_rate != target_rate {
            let r = PolyphaseResampler::new(source_rate, target_rate);
            let (up, down) = r.ratio();
            info!(
                "TTS resampling {} -> {} Hz (up={}, down={})",
                source_rate, target_rate, up, down
            );
            Some(r)
        } else {
            None
        };

        info!("TTS voice_style: {:?}", style);

        Self {
            inner: Arc::new(TtsInner {
                synth,
                style,
                target_rate,
                resampler,
                frame_bytes: audio_cfg.frame_bytes(),
                frame_duration: Duration::from_millis(audio_cfg.frame_duration_ms as u64),
                output_cfg: *audio_cfg,
            }),
        }
    }

    /// Construct with the default HTTP synthesizer backend.
    pub fn with_http_synthesizer(tts_cfg: &TtsConfig, audio_cfg: &AudioParamsConfig) -> Self {
        Self::new(tts_cfg, audio_cfg, Arc::new(HttpSynthesizer::new(tts_cfg)))
    }

    /// Duration of one outbound frame.
    pub fn frame_duration(&self) -> Duration {
        self.inner.frame_duration
    }

    /// Text -> stream of Opus frames. Frames appear as soon as enough PCM
    /// has accumulated; the tail is zero-padded to a whole frame.
    pub fn synthesize(&self, text: &str) -> mpsc::Receiver<Vec<u8>> {
        let (frame_tx, frame_rx) = mpsc::channel(32);
        let inner = self.inner.clone();
        let text = text.trim().to_string();

        tokio::spawn(async move {
            if text.is_empty() {
                return;
            }
            if let Err(e) = inner.run_synthesis(&text, frame_tx).await {
                error!("TTS synthesis error: {:#}", e);
            }
        });

        frame_rx
    }

    /// Stream audio from a URL (or local path) as Opus frames via ffmpeg.
    pub fn stream_audio_url(&self, url: &str) -> mpsc::Receiver<Vec<u8>> {
        let (tx, rx) = mpsc::channel(32);
        let inner = self.inner.clone();
        let url = url.trim().to_string();

        tokio::spawn(async move {
            if url.is_empty() {
                return;
            }
            if let Err(e) = inner.run_url_stream(&url, tx).await {
                error!("stream_audio_url error: {:#}", e);
            }
        });

        rx
    }

    /// Resolve a direct audio URL for the query and stream the whole track.
    /// Yields nothing when resolution fails.
    pub fn stream_full_song_by_query(&self, query: &str) -> mpsc::Receiver<Vec<u8>> {
        let (tx, rx) = mpsc::channel(32);
        let inner = self.inner.clone();
        let query = query.trim().to_string();

        tokio::spawn(async move {
            if query.is_empty() {
                return;
            }
            let Some(url) = resolve_audio_url(&query).await else {
                warn!("Cannot resolve full-song url for query: {}", query);
                return;
            };
            if let Err(e) = inner.run_url_stream(&url, tx).await {
                error!("full-song stream error: {:#}", e);
            }
        });

        rx
    }
}

impl TtsInner {
    async fn run_synthesis(&self, text: &str, frame_tx: mpsc::Sender<Vec<u8>>) -> Result<()> {
        let started_at = Instant::now();
        let mut first_frame_at: Option<Instant> = None;
        let mut total_pcm_bytes = 0usize;
        let mut total_frames = 0usize;

        let (chunk_tx, mut chunk_rx) = mpsc::channel::<Vec<i16>>(8);
        let synth = self.synth.clone();
        let text_owned = text.to_string();
        let producer =
            tokio::spawn(async move { synth.synthesize(&text_owned, chunk_tx).await });

        let mut encoder = OpusEncoder::new(&self.output_cfg)?;
        let mut shaper = VoiceShaper::new(self.style, self.target_rate);
        let mut pcm_buffer: Vec<u8> = Vec::new();

        while let Some(chunk) = chunk_rx.recv().await {
            let chunk = match &self.resampler {
                Some(resampler) => resampler.process(&chunk),
                None => chunk,
            };
            let chunk = shaper.process(&chunk);
            total_pcm_bytes += chunk.len() * 2;

            pcm_buffer.reserve(chunk.len() * 2);
            for s in chunk {
                pcm_buffer.extend_from_slice(&s.to_le_bytes());
            }

            while pcm_buffer.len() >= self.frame_bytes {
                let frame: Vec<u8> = pcm_buffer.drain(..self.frame_bytes).collect();
                let packet = encoder.encode(&frame)?;
                total_frames += 1;
                first_frame_at.get_or_insert_with(Instant::now);
                if frame_tx.send(packet).await.is_err() {
                    // Consumer dropped the stream — cancelled.
                    return Ok(());
                }
            }
        }

        match producer.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("TTS synthesizer failed: {:#}", e),
            Err(e) => error!("TTS synthesizer task panicked: {}", e),
        }

        // Pad and flush the residual.
        if !pcm_buffer.is_empty() {
            pcm_buffer.resize(self.frame_bytes, 0);
            let packet = encoder.encode(&pcm_buffer)?;
            total_frames += 1;
            first_frame_at.get_or_insert_with(Instant::now);
            let _ = frame_tx.send(packet).await;
        }

        let elapsed = started_at.elapsed();
        let first_frame_ms = first_frame_at
            .map(|t| (t - started_at).as_secs_f64() * 1000.0)
            .unwrap_or(-1.0);
        let audio_seconds = (total_pcm_bytes / 2) as f64 / self.target_rate as f64;
        let rtf = if audio_seconds > 0.0 {
            elapsed.as_secs_f64() / audio_seconds
        } else {
            0.0
        };
        info!(
            "TTS timing | chars={} frames={} first_frame={:.1}ms total={:.3}s audio={:.3}s rtf={:.2} style={:?}",
            text.chars().count(),
            total_frames,
            first_frame_ms,
            elapsed.as_secs_f64(),
            audio_seconds,
            rtf,
            self.style,
        );

        Ok(())
    }

    async fn run_url_stream(&self, url: &str, tx: mpsc::Sender<Vec<u8>>) -> Result<()> {
        let mut child = Command::new("ffmpeg")
            .args([
                "-hide_banner",
                "-loglevel",
                "error",
                "-reconnect",
                "1",
                "-reconnect_streamed",
                "1",
                "-reconnect_delay_max",
                "3",
                "-i",
                url,
                "-f",
                "s16le",
                "-ac",
                "1",
                "-ar",
            ])
            .arg(self.target_rate.to_string())
            .arg("pipe:1")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context("Failed to spawn ffmpeg (is it installed?)")?;

        let mut stdout = child.stdout.take().context("ffmpeg stdout missing")?;
        let mut encoder = OpusEncoder::new(&self.output_cfg)?;
        let mut buffer: Vec<u8> = Vec::new();
        let mut read_buf = [0u8; 8192];
        let mut frame_count = 0usize;

        loop {
            let n = stdout
                .read(&mut read_buf)
                .await
                .context("Failed to read ffmpeg output")?;
            if n == 0 {
                break;
            }
            buffer.extend_from_slice(&read_buf[..n]);

            while buffer.len() >= self.frame_bytes {
                let frame: Vec<u8> = buffer.drain(..self.frame_bytes).collect();
                let packet = encoder.encode(&frame)?;
                frame_count += 1;
                if tx.send(packet).await.is_err() {
                    // Cancelled; kill_on_drop reaps the decoder.
                    return Ok(());
                }
            }
        }

        if !buffer.is_empty() {
            buffer.resize(self.frame_bytes, 0);
            let packet = encoder.encode(&buffer)?;
            frame_count += 1;
            let _ = tx.send(packet).await;
        }

        let output = child
            .wait_with_output()
            .await
            .context("Failed to wait for ffmpeg")?;
        if !output.status.success() {
            warn!(
                "ffmpeg exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            );
        }
        info!("Audio url streamed: {} frames", frame_count);

        Ok(())
    }
}

/// Resolve the best audio URL for a search query via yt-dlp.
async fn resolve_audio_url(query: &str) -> Option<String> {
    let search_query = format!("ytsearch1:{} official audio", query);
    let output = Command::new("yt-dlp")
        .args(["-f", "bestaudio/best", "-g", "--no-playlist", &search_query])
        .output()
        .await;

    let output = match output {
        Ok(o) => o,
        Err(e) => {
            warn!("yt-dlp not available, full-song streaming disabled: {}", e);
            return None;
        }
    };

    if !output.status.success() {
        warn!(
            "yt-dlp failed ({}): {}",
            output.status,
            String::from_utf8_lossy(&output.stderr)
        );
        return None;
    }

    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Deterministic in-process synthesizer for tests: a fixed 220 Hz tone
    /// at 22 050 Hz, delivered in two chunks.
    struct ToneSynthesizer;

    #[async_trait]
    impl SpeechSynthesizer for ToneSynthesizer {
        fn sample_rate(&self) -> u32 {
            22_050
        }

        async fn synthesize(&self, _text: &str, chunks: mpsc::Sender<Vec<i16>>) -> Result<()> {
            let samples: Vec<i16> = (0..4410)
                .map(|i| {
                    let t = i as f32 / 22_050.0;
                    ((t * 220.0 * 2.0 * std::f32::consts::PI).sin() * 9000.0) as i16
                })
                .collect();
            chunks.send(samples[..2205].to_vec()).await.ok();
            chunks.send(samples[2205..].to_vec()).await.ok();
            Ok(())
        }
    }

    fn tone_service(style: &str) -> TtsService {
        let tts_cfg = TtsConfig {
            model_path: "test".to_string(),
            synth_url: "http://127.0.0.1:1".to_string(),
            speaker_id: None,
            speed: 1.0,
            voice_style: style.to_string(),
        };
        TtsService::new(
            &tts_cfg,
            &AudioParamsConfig::output_default(),
            Arc::new(ToneSynthesizer),
        )
    }

    async fn collect_frames(mut rx: mpsc::Receiver<Vec<u8>>) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        while let Some(frame) = rx.recv().await {
            frames.push(frame);
        }
        frames
    }

    #[tokio::test]
    async fn test_synthesize_produces_padded_frames() {
        let tts = tone_service("normal");
        let frames = collect_frames(tts.synthesize("xin chào")).await;

        // 4410 samples at 22 050 Hz resample to 4800 at 24 kHz; with
        // 1440-sample frames that is 3 whole frames plus a padded tail.
        assert_eq!(frames.len(), 4);
        for frame in &frames {
            assert!(!frame.is_empty());
        }
    }

    #[tokio::test]
    async fn test_synthesize_empty_text_yields_nothing() {
        let tts = tone_service("normal");
        let frames = collect_frames(tts.synthesize("   ")).await;
        assert!(frames.is_empty());
    }

    #[tokio::test]
    async fn test_first_frame_deterministic_per_style() {
        let tts = tone_service("robot");
        let first = collect_frames(tts.synthesize("một hai ba")).await;
        let second = collect_frames(tts.synthesize("một hai ba")).await;
        // No cross-utterance DSP state leaks: identical input must produce
        // identical frames.
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_frame_duration() {
        let tts = tone_service("normal");
        assert_eq!(tts.frame_duration(), Duration::from_millis(60));
    }
}
