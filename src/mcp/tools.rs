//! MCP tool registry.
//!
//! Tools are described with JSON-schema-shaped descriptors and dispatched
//! by name. Currently: Vietnamese music search (Deezer) and alarms.

use chrono::{Local, NaiveDateTime, NaiveTime, TimeDelta};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{error, info};
use uuid::Uuid;

use crate::mcp::alarm::{Alarm, AlarmStore};

const DEEZER_SEARCH_URL: &str = "https://api.deezer.com/search";
const DEEZER_TIMEOUT: Duration = Duration::from_secs(12);

const DEFAULT_LIMIT: i64 = 5;
const MAX_LIMIT: i64 = 20;

/// Normalized result of one tool call. `content` is an ordered list of
/// `{type:"text",text}` / `{type:"json",json}` items.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub ok: bool,
    pub content: Vec<Value>,
}

impl ToolResult {
    fn fail(text: impl Into<String>) -> Self {
        Self {
            ok: false,
            content: vec![json!({"type": "text", "text": text.into()})],
        }
    }
}

/// Registry of server-side tools.
pub struct ToolRegistry {
    client: reqwest::Client,
    alarms: AlarmStore,
}

impl ToolRegistry {
    pub fn new(alarms: AlarmStore) -> Self {
        Self {
            client: reqwest::Client::new(),
            alarms,
        }
    }

    /// Tool descriptors in near-JSON-Schema shape.
    pub fn list_tools(&self) -> Vec<Value> {
        vec![
            json!({
                "name": "search_vietnamese_music",
                "description": "Tìm nhạc Việt theo từ khóa (artist/bài hát), trả metadata và link nghe.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "song_name": {
                            "type": "string",
                            "description": "Tên bài hát cần tìm, ví dụ: Nơi này có anh",
                        },
                        "query": {
                            "type": "string",
                            "description": "Từ khóa tìm kiếm, ví dụ: Son Tung M-TP",
                        },
                        "limit": {
                            "type": "integer",
                            "description": "Số kết quả tối đa (1-20)",
                            "minimum": 1,
                            "maximum": 20,
                            "default": 5,
                        },
                    },
                    "required": [],
                },
            }),
            json!({
                "name": "set_alarm",
                "description": "Đặt báo thức: cung cấp `time` (ISO datetime hoặc HH:MM) và `message`.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "time": {
                            "type": "string",
                            "description": "Thời gian báo thức. ISO datetime (ví dụ 2026-02-18T07:30:00) hoặc giờ phút 'HH:MM' (ví dụ '07:30').",
                        },
                        "message": {"type": "string", "description": "Nội dung thông báo"},
                        "id": {"type": "string", "description": "ID tùy chọn cho báo thức"},
                    },
                    "required": ["time"],
                },
            }),
        ]
    }

    /// Dispatch one tool call by name.
    pub async fn call_tool(&self, name: &str, arguments: &Value) -> ToolResult {
        match name {
            "search_vietnamese_music" => self.search_vietnamese_music(arguments).await,
            "set_alarm" => self.set_alarm(arguments),
            _ => ToolResult::fail(format!("Tool không tồn tại: {}", name)),
        }
    }

    async fn search_vietnamese_music(&self, arguments: &Value) -> ToolResult {
        let song_name = str_arg(arguments, "song_name");
        let query = if song_name.is_empty() {
            str_arg(arguments, "query")
        } else {
            song_name.clone()
        };
        if query.is_empty() {
            return ToolResult::fail("Thiếu tham số song_name hoặc query");
        }

        let limit = clamp_limit(arguments.get("limit"));

        let limit_param = limit.to_string();
        let response = self
            .client
            .get(DEEZER_SEARCH_URL)
            .query(&[("q", query.as_str()), ("limit", limit_param.as_str())])
            .timeout(DEEZER_TIMEOUT)
            .send()
            .await;

        let data: Value = match response {
            Ok(resp) => match resp.json().await {
                Ok(data) => data,
                Err(e) => {
                    error!("MCP tool search_vietnamese_music failed: {}", e);
                    return ToolResult::fail(format!("Lỗi gọi Deezer API: {}", e));
                }
            },
            Err(e) => {
                error!("MCP tool search_vietnamese_music failed: {}", e);
                return ToolResult::fail(format!("Lỗi gọi Deezer API: {}", e));
            }
        };

        let tracks: Vec<Value> = data
            .get("data")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .take(limit as usize)
                    .map(|item| {
                        json!({
                            "title": item.get("title").cloned().unwrap_or(Value::Null),
                            "artist": item.pointer("/artist/name").cloned().unwrap_or(Value::Null),
                            "album": item.pointer("/album/title").cloned().unwrap_or(Value::Null),
                            "deezer_url": item.get("link").cloned().unwrap_or(Value::Null),
                            "preview_url": item.get("preview").cloned().unwrap_or(Value::Null),
                            "duration": item.get("duration").cloned().unwrap_or(Value::Null),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        let text = format!("Tìm thấy {} kết quả nhạc cho: {}", tracks.len(), query);
        ToolResult {
            ok: true,
            content: vec![
                json!({"type": "text", "text": text}),
                json!({
                    "type": "json",
                    "json": {
                        "request_body": {
                            "song_name": song_name,
                            "query": query,
                            "limit": limit,
                        },
                        "tracks": tracks,
                    },
                }),
            ],
        }
    }

    /// Persist an alarm. `time` is ISO datetime, or `HH:MM` applied to
    /// today (tomorrow when the moment already passed today).
    fn set_alarm(&self, arguments: &Value) -> ToolResult {
        let time_raw = str_arg(arguments, "time");
        if time_raw.is_empty() {
            return ToolResult::fail("Thiếu tham số `time`");
        }

        let message = {
            let m = str_arg(arguments, "message");
            if m.is_empty() {
                "Báo thức".to_string()
            } else {
                m
            }
        };
        let alarm_id = {
            let id = str_arg(arguments, "id");
            if id.is_empty() {
                Uuid::new_v4().to_string()
            } else {
                id
            }
        };

        let Some(alarm_dt) = parse_alarm_time(&time_raw) else {
            return ToolResult::fail("Không hiểu định dạng `time`. Dùng ISO hoặc 'HH:MM'");
        };

        // Accepted even though the schema does not declare it.
        let ringtone = {
            let r = str_arg(arguments, "ringtone");
            if r.is_empty() {
                None
            } else {
                Some(r)
            }
        };

        let alarm = Alarm {
            id: alarm_id.clone(),
            time: alarm_dt,
            message,
            ringtone,
            created_at: Local::now().naive_local(),
            triggered: false,
            play_duration: None,
        };

        match self.alarms.append(alarm.clone()) {
            Ok(()) => ToolResult {
                ok: true,
                content: vec![
                    json!({
                        "type": "text",
                        "text": format!("Đã đặt báo thức: {} (id={})", alarm.time, alarm_id),
                    }),
                    json!({"type": "json", "json": {"alarm": alarm}}),
                ],
            },
            Err(e) => {
                error!("Failed to save alarm: {:#}", e);
                ToolResult::fail(format!("Lỗi lưu báo thức: {}", e))
            }
        }
    }
}

fn str_arg(arguments: &Value, key: &str) -> String {
    arguments
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim()
        .to_string()
}

/// Clamp a requested result count into [1, 20], defaulting to 5 for
/// anything unparseable.
fn clamp_limit(raw: Option<&Value>) -> i64 {
    let parsed = match raw {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    };
    parsed.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
}

fn parse_alarm_time(raw: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = raw.parse::<NaiveDateTime>() {
        return Some(dt);
    }

    let t = NaiveTime::parse_from_str(raw, "%H:%M").ok()?;
    let now = Local::now().naive_local();
    let mut candidate = now.date().and_time(t);
    if candidate <= now {
        candidate = candidate + TimeDelta::days(1);
    }
    info!("Alarm time {} resolved to {}", raw, candidate);
    Some(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn registry(dir: &std::path::Path) -> ToolRegistry {
        ToolRegistry::new(AlarmStore::new(dir.join("alarms.json")))
    }

    #[test]
    fn test_list_tools_descriptors() {
        let dir = tempdir().unwrap();
        let tools = registry(dir.path()).list_tools();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0]["name"], "search_vietnamese_music");
        assert_eq!(tools[1]["name"], "set_alarm");
        assert_eq!(tools[1]["inputSchema"]["required"][0], "time");
        // The undocumented ringtone field stays undeclared.
        assert!(tools[1]["inputSchema"]["properties"].get("ringtone").is_none());
    }

    #[test]
    fn test_clamp_limit() {
        assert_eq!(clamp_limit(None), 5);
        assert_eq!(clamp_limit(Some(&json!(3))), 3);
        assert_eq!(clamp_limit(Some(&json!(0))), 1);
        assert_eq!(clamp_limit(Some(&json!(99))), 20);
        assert_eq!(clamp_limit(Some(&json!("7"))), 7);
        assert_eq!(clamp_limit(Some(&json!("lots"))), 5);
        assert_eq!(clamp_limit(Some(&json!(null))), 5);
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let dir = tempdir().unwrap();
        let result = registry(dir.path()).call_tool("reboot_world", &json!({})).await;
        assert!(!result.ok);
    }

    #[tokio::test]
    async fn test_search_requires_query() {
        let dir = tempdir().unwrap();
        let result = registry(dir.path())
            .call_tool("search_vietnamese_music", &json!({"limit": 5}))
            .await;
        assert!(!result.ok);
    }

    #[test]
    fn test_parse_alarm_time_iso() {
        let dt = parse_alarm_time("2030-05-01T07:30:00").unwrap();
        assert_eq!(dt.to_string(), "2030-05-01 07:30:00");
    }

    #[test]
    fn test_parse_alarm_time_hh_mm_rolls_forward() {
        let dt = parse_alarm_time("07:30").unwrap();
        assert!(dt > Local::now().naive_local() - TimeDelta::minutes(1));
        assert_eq!(dt.format("%H:%M").to_string(), "07:30");
    }

    #[test]
    fn test_parse_alarm_time_rejects_garbage() {
        assert!(parse_alarm_time("seven thirty").is_none());
        assert!(parse_alarm_time("25:99").is_none());
    }

    #[tokio::test]
    async fn test_set_alarm_persists_with_ringtone() {
        let dir = tempdir().unwrap();
        let reg = registry(dir.path());

        let result = reg
            .call_tool(
                "set_alarm",
                &json!({
                    "time": "2030-05-01T07:30:00",
                    "message": "dậy đi học",
                    "ringtone": "/tmp/bell.mp3",
                }),
            )
            .await;
        assert!(result.ok);

        let alarms = reg.alarms.load().unwrap();
        assert_eq!(alarms.len(), 1);
        assert_eq!(alarms[0].message, "dậy đi học");
        assert_eq!(alarms[0].ringtone.as_deref(), Some("/tmp/bell.mp3"));
        assert!(!alarms[0].triggered);
    }

    #[tokio::test]
    async fn test_set_alarm_requires_time() {
        let dir = tempdir().unwrap();
        let result = registry(dir.path())
            .call_tool("set_alarm", &json!({"message": "x"}))
            .await;
        assert!(!result.ok);
    }
}
