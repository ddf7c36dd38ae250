//! Configuration management
//!
//! Every setting is read from the environment with sensible dev defaults.
//! A `.env` file next to the working directory is pre-loaded with
//! setdefault semantics: values already present in the environment win.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

/// Bind address for the combined WebSocket + REST server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

/// Audio format on one direction of the wire.
///
/// Inbound: Opus 16 kHz mono 60 ms. Outbound: Opus 24 kHz mono 60 ms.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AudioParamsConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_duration_ms: u32,
}

impl AudioParamsConfig {
    pub fn input_default() -> Self {
        Self {
            sample_rate: 16_000,
            channels: 1,
            frame_duration_ms: 60,
        }
    }

    pub fn output_default() -> Self {
        Self {
            sample_rate: 24_000,
            channels: 1,
            frame_duration_ms: 60,
        }
    }

    /// Samples in one frame: 16000 * 60 / 1000 = 960 (input), 1440 (output).
    pub fn frame_size(&self) -> usize {
        (self.sample_rate * self.frame_duration_ms / 1000) as usize
    }

    /// PCM bytes in one frame (2 bytes per int16 sample).
    pub fn frame_bytes(&self) -> usize {
        self.frame_size() * 2
    }
}

/// One LLM completion endpoint. Position in the provider list implies
/// failover priority.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmProvider {
    pub name: String,
    pub base_url: String,
    pub model: String,
    pub api_key: String,
}

/// LLM config with fallback — providers are tried in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub providers: Vec<LlmProvider>,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
            max_tokens: 500,
            temperature: 0.7,
        }
    }
}

impl LlmConfig {
    /// Parse a provider list from `providers_env`, a semicolon-separated list
    /// of `name|base_url|model|api_key` entries. Falls back to a single
    /// provider built from the `OPENAI_*` style keys when the list is empty,
    /// so the list is never empty after load.
    pub fn from_env(
        providers_env: &str,
        default_api_key_env: &str,
        default_base_url_env: &str,
        default_model_env: &str,
    ) -> Self {
        let mut providers = Vec::new();
        let raw = env_var(providers_env);
        for entry in raw.split(';') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let parts: Vec<&str> = entry.split('|').collect();
            if parts.len() >= 3 {
                providers.push(LlmProvider {
                    name: parts[0].trim().to_string(),
                    base_url: parts[1].trim().to_string(),
                    model: parts[2].trim().to_string(),
                    api_key: parts
                        .get(3)
                        .map(|k| k.trim().to_string())
                        .filter(|k| !k.is_empty())
                        .unwrap_or_else(|| env_var(default_api_key_env)),
                });
            }
        }

        if providers.is_empty() {
            providers.push(LlmProvider {
                name: "default".to_string(),
                api_key: env_var_or(default_api_key_env, &env_var("OPENAI_API_KEY")),
                base_url: env_var_or(
                    default_base_url_env,
                    &env_var_or("OPENAI_BASE_URL", "http://127.0.0.1:8045/v1"),
                ),
                model: env_var_or(
                    default_model_env,
                    &env_var_or("OPENAI_LLM_MODEL", "claude-sonnet-4-5"),
                ),
            });
        }

        Self {
            providers,
            max_tokens: env_var_or("LLM_MAX_TOKENS", "500").parse().unwrap_or(500),
            temperature: env_var_or("LLM_TEMPERATURE", "0.7").parse().unwrap_or(0.7),
        }
    }
}

/// STT config — defaults to Groq Whisper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SttConfig {
    pub provider: String,
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub language: String,
}

impl SttConfig {
    fn from_env() -> Self {
        Self {
            provider: "groq".to_string(),
            api_key: env_var("GROQ_API_KEY"),
            base_url: "https://api.groq.com/openai/v1".to_string(),
            model: "whisper-large-v3-turbo".to_string(),
            language: "vi".to_string(),
        }
    }
}

/// TTS config for the local speech synthesizer and voice shaping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    /// Model identifier or path passed to the synthesizer backend.
    pub model_path: String,
    /// Base URL of the OpenAI-compatible `/v1/audio/speech` endpoint.
    pub synth_url: String,
    /// Speaker id for multi-speaker models.
    pub speaker_id: Option<u32>,
    pub speed: f32,
    pub voice_style: String,
}

impl TtsConfig {
    fn from_env() -> Self {
        Self {
            model_path: env_var_or("TTS_MODEL_PATH", "models/vi_VN-vais1000-medium.onnx"),
            synth_url: env_var_or("TTS_URL", "http://127.0.0.1:5000"),
            speaker_id: std::env::var("TTS_SPEAKER_ID")
                .ok()
                .and_then(|v| v.parse().ok()),
            speed: env_var_or("TTS_SPEED", "0.7").parse().unwrap_or(0.7),
            voice_style: env_var_or("TTS_VOICE_STYLE", "normal"),
        }
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub audio_input: AudioParamsConfig,
    pub audio_output: AudioParamsConfig,
    pub llm: LlmConfig,
    pub intent_llm: LlmConfig,
    pub stt: SttConfig,
    pub tts: TtsConfig,
    pub max_chat_history: usize,
}

impl AppConfig {
    /// Load the full configuration from the environment, pre-loading `.env`.
    pub fn load() -> Self {
        preload_dotenv(Path::new(".env"));

        let llm = LlmConfig::from_env(
            "LLM_PROVIDERS",
            "OPENAI_API_KEY",
            "OPENAI_BASE_URL",
            "OPENAI_LLM_MODEL",
        );

        // Intent classification defaults to the same provider chain as the
        // main LLM so it never falls back to an incompatible local endpoint.
        let intent_llm = if env_var("INTENT_LLM_PROVIDERS").trim().is_empty() {
            llm.clone()
        } else {
            LlmConfig::from_env(
                "INTENT_LLM_PROVIDERS",
                "INTENT_LLM_API_KEY",
                "INTENT_LLM_BASE_URL",
                "INTENT_LLM_MODEL",
            )
        };

        Self {
            server: ServerConfig::default(),
            audio_input: AudioParamsConfig::input_default(),
            audio_output: AudioParamsConfig::output_default(),
            llm,
            intent_llm,
            stt: SttConfig::from_env(),
            tts: TtsConfig::from_env(),
            max_chat_history: 20,
        }
    }
}

/// Read `path` as a dotenv file and apply each `KEY=VALUE` line with
/// setdefault semantics. Malformed lines and comments are skipped.
pub fn preload_dotenv(path: &Path) {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return;
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            warn!("Skipping malformed .env line: {}", line);
            continue;
        };
        let key = key.trim();
        if std::env::var(key).is_err() {
            std::env::set_var(key, value.trim());
        }
    }
}

fn env_var(key: &str) -> String {
    std::env::var(key).unwrap_or_default()
}

fn env_var_or(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => v,
        _ => default.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_sizes() {
        let input = AudioParamsConfig::input_default();
        assert_eq!(input.frame_size(), 960);
        assert_eq!(input.frame_bytes(), 1920);

        let output = AudioParamsConfig::output_default();
        assert_eq!(output.frame_size(), 1440);
        assert_eq!(output.frame_bytes(), 2880);
    }

    #[test]
    fn test_provider_list_parsing() {
        std::env::set_var(
            "TEST_LLM_PROVIDERS",
            "prim|https://one.example/v1|m1|k1; sec|https://two.example/v1|m2|k2",
        );
        let cfg = LlmConfig::from_env("TEST_LLM_PROVIDERS", "TEST_NONE", "TEST_NONE", "TEST_NONE");
        assert_eq!(cfg.providers.len(), 2);
        assert_eq!(cfg.providers[0].name, "prim");
        assert_eq!(cfg.providers[0].base_url, "https://one.example/v1");
        assert_eq!(cfg.providers[1].model, "m2");
        assert_eq!(cfg.providers[1].api_key, "k2");
    }

    #[test]
    fn test_provider_list_never_empty() {
        let cfg = LlmConfig::from_env("TEST_UNSET_PROVIDERS", "TEST_NONE", "TEST_NONE", "TEST_NONE");
        assert_eq!(cfg.providers.len(), 1);
        assert_eq!(cfg.providers[0].name, "default");
    }

    #[test]
    fn test_dotenv_setdefault() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(&path, "# comment\nTEST_DOTENV_A=from_file\nTEST_DOTENV_B=from_file\n")
            .unwrap();

        std::env::set_var("TEST_DOTENV_B", "from_env");
        preload_dotenv(&path);

        assert_eq!(std::env::var("TEST_DOTENV_A").unwrap(), "from_file");
        // Existing environment values win.
        assert_eq!(std::env::var("TEST_DOTENV_B").unwrap(), "from_env");
    }
}
