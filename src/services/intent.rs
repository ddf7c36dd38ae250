//! Intent detection for voice commands.
//!
//! Two paths: a rule-based fast path that runs on every utterance before
//! the LLM is even contacted, and an LLM-backed JSON classifier for the
//! parallel detection flow.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::info;

use crate::prompts::INTENT_PROMPT;
use crate::services::llm::LlmService;

/// Classified user intention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Music,
    Alarm,
    Other,
}

/// Detection outcome plus extracted slots.
#[derive(Debug, Clone, PartialEq)]
pub struct IntentResult {
    pub intent: Intent,
    pub song_name: String,
    pub alarm_time: Option<String>,
    pub alarm_message: Option<String>,
}

impl IntentResult {
    fn other() -> Self {
        Self {
            intent: Intent::Other,
            song_name: String::new(),
            alarm_time: None,
            alarm_message: None,
        }
    }
}

const TRIGGER_WORDS: &[&str] = &["mở", "mơ", "mỡ", "phát", "bật", "nghe", "play"];
const MUSIC_WORDS: &[&str] = &["nhạc", "bài", "bài hát", "ca sĩ", "playlist", "music"];
const ALARM_WORDS: &[&str] = &["báo thức", "đặt báo thức", "hẹn giờ", "báo", "báo cho tôi"];

/// Generic fallback query when the user asks for music without naming a song.
const DEFAULT_SONG: &str = "nhạc việt";

static SONG_STRIP_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(mở|mơ|phát|bật|nghe|cho\s+tôi|giúp\s+tôi|play|bài\s+hát|bài|nhạc|music)\b")
        .expect("song strip regex")
});

static TIME_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(\d{1,2}:\d{2})\s*(am|pm)?",
        r"(\d{1,2})\s*(am|pm)",
        r"(\d{1,2})h(?:ố?i|ờ)?\s*(\d{1,2})?",
        r"(\d{1,2})\s*giờ\s*(\d{1,2})?",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("time regex"))
    .collect()
});

static ALARM_STRIP_RES: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)\b(đặt\s+báo\s+thức|báo\s+thức|hẹn\s+giờ|báo|báo\s+cho\s+tôi)\b",
        r"(?i)\b(sáng|chiều|tối)\b",
        r"(?i)\b(am|pm)\b",
        r"\d{1,2}(:\d{2})?h?\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("alarm strip regex"))
    .collect()
});

static SPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("space regex"));
static FIRST_DIGITS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d{1,2})").expect("digits regex"));

/// Detects music/alarm intents before (or instead of) the LLM round trip.
#[derive(Clone)]
pub struct IntentDetector {
    llm: LlmService,
}

impl IntentDetector {
    pub fn new(llm: LlmService) -> Self {
        Self { llm }
    }

    /// Rule-based classification; cheap enough to run on every utterance.
    pub fn detect_fast(&self, user_text: &str) -> IntentResult {
        detect_fast(user_text)
    }

    /// LLM-backed JSON classification of the music intent.
    pub async fn detect(&self, user_text: &str) -> IntentResult {
        let data = self
            .llm
            .chat_json(user_text, INTENT_PROMPT, 120, 0.0)
            .await;

        let Some(data) = data else {
            return IntentResult::other();
        };

        let raw_intent = data
            .get("intent")
            .and_then(Value::as_str)
            .unwrap_or("other")
            .trim()
            .to_lowercase();
        let mut song_name = data
            .get("song_name")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_string();

        let intent = if raw_intent == "music" {
            Intent::Music
        } else {
            Intent::Other
        };
        if intent == Intent::Music && song_name.is_empty() {
            song_name = DEFAULT_SONG.to_string();
        }

        info!("Intent detect -> intent={:?}, song_name={}", intent, song_name);
        IntentResult {
            intent,
            song_name,
            alarm_time: None,
            alarm_message: None,
        }
    }
}

/// Rule-based detection over the lowercased utterance.
pub fn detect_fast(user_text: &str) -> IntentResult {
    let lowered = user_text.trim().to_lowercase();
    if lowered.is_empty() {
        return IntentResult::other();
    }

    let has_trigger = TRIGGER_WORDS.iter().any(|w| lowered.contains(w));
    let has_music = MUSIC_WORDS.iter().any(|w| lowered.contains(w));

    if !(has_trigger && has_music) {
        if ALARM_WORDS.iter().any(|w| lowered.contains(w)) {
            return detect_alarm(&lowered);
        }
        return IntentResult::other();
    }

    // Normalize the command into a song query.
    let cleaned = SONG_STRIP_RE.replace_all(&lowered, " ");
    let cleaned = SPACE_RE.replace_all(&cleaned, " ");
    let cleaned = cleaned.trim_matches(|c: char| " ,.!?\n\t".contains(c));
    let song_name = if cleaned.is_empty() {
        DEFAULT_SONG.to_string()
    } else {
        cleaned.to_string()
    };

    IntentResult {
        intent: Intent::Music,
        song_name,
        alarm_time: None,
        alarm_message: None,
    }
}

fn detect_alarm(lowered: &str) -> IntentResult {
    let mut time_str = TIME_PATTERNS
        .iter()
        .find_map(|p| p.captures(lowered))
        .and_then(|caps| normalize_time(&caps));

    // Infer AM/PM from time-of-day words when no explicit time matched.
    if time_str.is_none() {
        if lowered.contains("sáng") {
            time_str = FIRST_DIGITS_RE.captures(lowered).and_then(|caps| {
                let mut hh: u32 = caps[1].parse().ok()?;
                hh %= 24;
                if hh == 12 {
                    hh = 0;
                }
                Some(format!("{:02}:00", hh))
            });
        } else if lowered.contains("chiều") || lowered.contains("tối") {
            time_str = FIRST_DIGITS_RE.captures(lowered).and_then(|caps| {
                let hh: u32 = caps[1].parse().ok()?;
                Some(format!("{:02}:00", hh % 12 + 12))
            });
        }
    }

    let mut message = lowered.to_string();
    for re in ALARM_STRIP_RES.iter() {
        message = re.replace_all(&message, " ").into_owned();
    }
    let message = SPACE_RE.replace_all(&message, " ");
    let message = message
        .trim_matches(|c: char| " ,.!?\n\t".contains(c))
        .to_string();

    IntentResult {
        intent: Intent::Alarm,
        song_name: String::new(),
        alarm_time: time_str,
        alarm_message: Some(if message.is_empty() {
            "Báo thức".to_string()
        } else {
            message
        }),
    }
}

fn normalize_time(caps: &regex::Captures) -> Option<String> {
    let g1 = caps.get(1)?.as_str();
    let g2 = caps.get(2).map(|m| m.as_str());

    // HH:MM with an optional am/pm suffix.
    if let Some((hh, mm)) = g1.split_once(':') {
        let mut hh: u32 = hh.parse::<u32>().ok()? % 24;
        let mm: u32 = mm.parse::<u32>().ok()? % 60;
        match g2.map(str::to_lowercase).as_deref() {
            Some("pm") if hh < 12 => hh += 12,
            Some("am") if hh == 12 => hh = 0,
            _ => {}
        }
        return Some(format!("{:02}:{:02}", hh, mm));
    }

    // Bare hour with am/pm.
    if let Some(suffix) = g2 {
        let lower = suffix.to_lowercase();
        if lower == "am" || lower == "pm" {
            let mut hh: u32 = g1.parse::<u32>().ok()? % 12;
            if lower == "pm" {
                hh = hh % 12 + 12;
            }
            return Some(format!("{:02}:00", hh));
        }
    }

    let hh: u32 = g1.parse::<u32>().ok()? % 24;
    let mm: u32 = match g2 {
        Some(m) if m.chars().all(|c| c.is_ascii_digit()) && !m.is_empty() => {
            m.parse::<u32>().ok()?
        }
        _ => 0,
    };
    Some(format!("{:02}:{:02}", hh, mm))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_music_with_song_name() {
        let result = detect_fast("mở bài Nơi này có anh");
        assert_eq!(result.intent, Intent::Music);
        assert_eq!(result.song_name, "nơi này có anh");
    }

    #[test]
    fn test_music_generic_request() {
        let result = detect_fast("phát nhạc");
        assert_eq!(result.intent, Intent::Music);
        assert_eq!(result.song_name, "nhạc việt");
    }

    #[test]
    fn test_music_strips_fillers() {
        let result = detect_fast("mở cho tôi bài hát Chúng ta của hiện tại");
        assert_eq!(result.intent, Intent::Music);
        assert_eq!(result.song_name, "chúng ta của hiện tại");
    }

    #[test]
    fn test_other_text() {
        let result = detect_fast("thời tiết hôm nay thế nào");
        assert_eq!(result.intent, Intent::Other);
        assert!(result.song_name.is_empty());
    }

    #[test]
    fn test_trigger_without_music_word_is_other() {
        // "bật đèn" has a trigger but no music word.
        assert_eq!(detect_fast("bật đèn phòng khách").intent, Intent::Other);
    }

    #[test]
    fn test_alarm_hh_mm() {
        let result = detect_fast("đặt báo thức 7:30 dậy đi học");
        assert_eq!(result.intent, Intent::Alarm);
        assert_eq!(result.alarm_time.as_deref(), Some("07:30"));
        assert_eq!(result.alarm_message.as_deref(), Some("dậy đi học"));
    }

    #[test]
    fn test_alarm_hh_mm_pm() {
        let result = detect_fast("báo thức 7:30 pm");
        assert_eq!(result.alarm_time.as_deref(), Some("19:30"));
    }

    #[test]
    fn test_alarm_hour_am_pm() {
        let result = detect_fast("báo cho tôi 8 pm");
        assert_eq!(result.intent, Intent::Alarm);
        assert_eq!(result.alarm_time.as_deref(), Some("20:00"));
    }

    #[test]
    fn test_alarm_vietnamese_hour_forms() {
        assert_eq!(
            detect_fast("hẹn giờ 8h30").alarm_time.as_deref(),
            Some("08:30")
        );
        assert_eq!(
            detect_fast("đặt báo thức 8 giờ 30").alarm_time.as_deref(),
            Some("08:30")
        );
        assert_eq!(
            detect_fast("đặt báo thức 8 giờ").alarm_time.as_deref(),
            Some("08:00")
        );
    }

    #[test]
    fn test_alarm_afternoon_inference() {
        let result = detect_fast("báo thức lúc 5 chiều");
        assert_eq!(result.intent, Intent::Alarm);
        assert_eq!(result.alarm_time.as_deref(), Some("17:00"));
    }

    #[test]
    fn test_alarm_without_message_defaults() {
        let result = detect_fast("đặt báo thức 6:00");
        assert_eq!(result.alarm_message.as_deref(), Some("Báo thức"));
    }
}
