//! Speech-to-Text service.
//!
//! Wraps raw PCM in a WAV container and submits it to an OpenAI-compatible
//! transcription endpoint (Groq Whisper by default — fast and accurate for
//! Vietnamese).

use anyhow::{bail, Context, Result};
use reqwest::multipart;
use serde::Deserialize;
use tracing::{debug, error, info};

use crate::audio::wav::pcm_to_wav;
use crate::config::SttConfig;

/// Utterances shorter than this (~0.5 s at 16 kHz) are not worth an API call.
pub const MIN_PCM_BYTES: usize = 16_000;

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    #[serde(default)]
    text: String,
}

/// Transcribes PCM audio via a remote Whisper API.
#[derive(Clone)]
pub struct SttService {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    language: String,
}

impl SttService {
    pub fn new(cfg: &SttConfig) -> Self {
        info!("STT provider: {} | model: {}", cfg.provider, cfg.model);
        Self {
            client: reqwest::Client::new(),
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key: cfg.api_key.clone(),
            model: cfg.model.clone(),
            language: cfg.language.clone(),
        }
    }

    /// PCM int16 mono 16 kHz -> text. Returns `None` when the audio is too
    /// short, the transcript is empty, or the remote call fails.
    pub async fn transcribe(&self, pcm_data: &[u8]) -> Option<String> {
        self.transcribe_at(pcm_data, 16_000).await
    }

    pub async fn transcribe_at(&self, pcm_data: &[u8], sample_rate: u32) -> Option<String> {
        if pcm_data.len() < MIN_PCM_BYTES {
            debug!("Audio too short ({} bytes), skipping STT", pcm_data.len());
            return None;
        }

        match self.call_api(pcm_data, sample_rate).await {
            Ok(text) => {
                let text = text.trim().to_string();
                if text.is_empty() {
                    None
                } else {
                    info!("STT result: {}", text);
                    Some(text)
                }
            }
            Err(e) => {
                error!("STT API error: {}", e);
                None
            }
        }
    }

    async fn call_api(&self, pcm_data: &[u8], sample_rate: u32) -> Result<String> {
        let wav_bytes = pcm_to_wav(pcm_data, sample_rate)?;

        let file_part = multipart::Part::bytes(wav_bytes)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .context("Failed to build WAV multipart")?;

        let form = multipart::Form::new()
            .part("file", file_part)
            .text("model", self.model.clone())
            .text("language", self.language.clone());

        let response = self
            .client
            .post(format!("{}/audio/transcriptions", self.base_url))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .context("Failed to reach transcription API")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("Transcription API error ({}): {}", status, body);
        }

        let parsed: TranscriptionResponse = response
            .json()
            .await
            .context("Failed to parse transcription response")?;
        Ok(parsed.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SttConfig;

    fn test_config() -> SttConfig {
        SttConfig {
            provider: "groq".to_string(),
            api_key: String::new(),
            base_url: "https://api.groq.example/openai/v1/".to_string(),
            model: "whisper-large-v3-turbo".to_string(),
            language: "vi".to_string(),
        }
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let stt = SttService::new(&test_config());
        assert_eq!(stt.base_url, "https://api.groq.example/openai/v1");
    }

    #[tokio::test]
    async fn test_short_audio_skipped_without_network() {
        let stt = SttService::new(&test_config());
        // 100 bytes is far below the 0.5 s minimum; no request is made.
        assert_eq!(stt.transcribe(&[0u8; 100]).await, None);
    }
}
