//! Typed JSON messages on the device channel.
//!
//! Inbound messages are matched field-by-field in the handler (devices are
//! loose about envelopes); the structured outbound replies live here.

use serde::{Deserialize, Serialize};

/// Audio format declaration inside a hello.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioParams {
    pub format: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_duration: u32,
}

impl AudioParams {
    pub fn opus(sample_rate: u32, channels: u16, frame_duration: u32) -> Self {
        Self {
            format: "opus".to_string(),
            sample_rate,
            channels,
            frame_duration,
        }
    }
}

/// Server's reply to the client hello.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerHello {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub transport: String,
    pub session_id: String,
    pub audio_params: AudioParams,
}

impl ServerHello {
    pub fn new(session_id: &str, audio_params: AudioParams) -> Self {
        Self {
            msg_type: "hello".to_string(),
            transport: "websocket".to_string(),
            session_id: session_id.to_string(),
            audio_params,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_hello_round_trip() {
        let hello = ServerHello::new("abc-123", AudioParams::opus(24_000, 1, 60));

        let text = serde_json::to_string(&hello).unwrap();
        let back: ServerHello = serde_json::from_str(&text).unwrap();

        assert_eq!(back, hello);
        assert_eq!(back.msg_type, "hello");
        assert_eq!(back.transport, "websocket");
        assert_eq!(back.audio_params.format, "opus");
        assert_eq!(back.audio_params.sample_rate, 24_000);
        assert_eq!(back.audio_params.frame_duration, 60);
    }

    #[test]
    fn test_server_hello_wire_shape() {
        let hello = ServerHello::new("abc-123", AudioParams::opus(24_000, 1, 60));
        let value = serde_json::to_value(&hello).unwrap();
        assert_eq!(value["type"], "hello");
        assert_eq!(value["session_id"], "abc-123");
        assert_eq!(value["audio_params"]["channels"], 1);
    }
}
