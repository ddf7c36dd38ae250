//! Integration tests for the gateway's offline surface: codec framing,
//! intent rules, tool registry and the alarm store.

use serde_json::json;
use voice_gateway::audio::{OpusDecoder, OpusEncoder};
use voice_gateway::config::AudioParamsConfig;
use voice_gateway::mcp::{AlarmStore, ToolRegistry};
use voice_gateway::services::intent::{detect_fast, Intent};

#[test]
fn test_codec_round_trip_keeps_frame_shape() {
    let cfg = AudioParamsConfig::input_default();
    let mut encoder = OpusEncoder::new(&cfg).unwrap();
    let mut decoder = OpusDecoder::new(&cfg).unwrap();

    // Three frames of a quiet tone plus a trailing partial that must drop.
    let samples: Vec<i16> = (0..960 * 3 + 100)
        .map(|i| {
            let t = i as f32 / 16_000.0;
            ((t * 330.0 * 2.0 * std::f32::consts::PI).sin() * 6000.0) as i16
        })
        .collect();
    let mut pcm = Vec::with_capacity(samples.len() * 2);
    for s in &samples {
        pcm.extend_from_slice(&s.to_le_bytes());
    }

    let frames = encoder.encode_all(&pcm).unwrap();
    assert_eq!(frames.len(), 3);

    let mut decoded_bytes = 0usize;
    for frame in &frames {
        let decoded = decoder.decode(frame).unwrap();
        assert_eq!(decoded.len(), cfg.frame_bytes());
        decoded_bytes += decoded.len();
    }
    // Whole frames survive; the partial tail is gone.
    assert_eq!(decoded_bytes, 960 * 3 * 2);
}

#[test]
fn test_music_command_end_to_end_rules() {
    let result = detect_fast("mở bài Nơi này có anh");
    assert_eq!(result.intent, Intent::Music);
    assert_eq!(result.song_name, "nơi này có anh");

    assert_eq!(detect_fast("tắt đèn giúp tôi").intent, Intent::Other);
}

#[tokio::test]
async fn test_alarm_tool_feeds_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let store = AlarmStore::new(dir.path().join("alarms.json"));
    let registry = ToolRegistry::new(store.clone());

    let descriptors = registry.list_tools();
    assert!(descriptors.iter().any(|t| t["name"] == "set_alarm"));

    let result = registry
        .call_tool(
            "set_alarm",
            &json!({"time": "2031-01-02T06:00:00", "message": "họp sáng"}),
        )
        .await;
    assert!(result.ok);

    let alarms = store.load().unwrap();
    assert_eq!(alarms.len(), 1);
    assert_eq!(alarms[0].message, "họp sáng");
    assert!(!alarms[0].triggered);
    assert_eq!(alarms[0].time.to_string(), "2031-01-02 06:00:00");
}
