//! Alarm store and background scheduler.
//!
//! Alarms live in `alarms.json`. A background task polls the store every
//! few seconds and pushes due alarms into every connected session:
//! `tts/start`, a caption with the alarm message, ringtone audio frames,
//! `tts/stop`. Delivery is best-effort; a dead connection never stalls the
//! loop.

use anyhow::{Context, Result};
use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::audio::wav::write_two_tone_ringtone;
use crate::server::session::{Outbound, Session, SessionRegistry};
use crate::services::tts::TtsService;

const POLL_INTERVAL: Duration = Duration::from_secs(5);

const DEFAULT_RINGTONE_FILE: &str = "alarm_ringtone.wav";
const DEFAULT_RINGTONE_SECONDS: f32 = 3.0;
const DEFAULT_RINGTONE_RATE: u32 = 24_000;

/// One persisted alarm. `triggered` flips false -> true exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alarm {
    pub id: String,
    pub time: NaiveDateTime,
    pub message: String,
    #[serde(default)]
    pub ringtone: Option<String>,
    pub created_at: NaiveDateTime,
    pub triggered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub play_duration: Option<f64>,
}

/// JSON-file-backed alarm list.
#[derive(Clone)]
pub struct AlarmStore {
    path: Arc<PathBuf>,
}

impl AlarmStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path: Arc::new(path),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All alarms; a missing file reads as an empty list.
    pub fn load(&self) -> Result<Vec<Alarm>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let contents = std::fs::read_to_string(self.path.as_ref())
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", self.path.display()))
    }

    pub fn save(&self, alarms: &[Alarm]) -> Result<()> {
        let contents = serde_json::to_string_pretty(alarms)?;
        std::fs::write(self.path.as_ref(), contents)
            .with_context(|| format!("Failed to write {}", self.path.display()))
    }

    pub fn append(&self, alarm: Alarm) -> Result<()> {
        // A corrupt file starts over rather than blocking new alarms.
        let mut alarms = self.load().unwrap_or_default();
        alarms.push(alarm);
        self.save(&alarms)
    }
}

/// Background loop that fires due alarms into connected sessions.
pub struct AlarmScheduler {
    store: AlarmStore,
    sessions: SessionRegistry,
    tts: TtsService,
    default_ringtone: PathBuf,
}

impl AlarmScheduler {
    pub fn new(store: AlarmStore, sessions: SessionRegistry, tts: TtsService) -> Self {
        let default_ringtone = store
            .path()
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(DEFAULT_RINGTONE_FILE);
        Self {
            store,
            sessions,
            tts,
            default_ringtone,
        }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        info!("Starting alarm scheduler background task");
        tokio::spawn(self.run())
    }

    async fn run(self) {
        self.ensure_default_ringtone();

        let mut interval = tokio::time::interval(POLL_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if let Err(e) = self.tick() {
                // Store I/O problems skip this tick and retry on the next.
                error!("Alarm scheduler error: {:#}", e);
            }
        }
    }

    fn tick(&self) -> Result<()> {
        let mut alarms = self.store.load()?;
        let now = Local::now().naive_local();
        let mut changed = false;

        for alarm in alarms.iter_mut() {
            if alarm.triggered || now < alarm.time {
                continue;
            }
            // Mark first so a crash mid-delivery cannot double-fire.
            alarm.triggered = true;
            changed = true;
            info!("Alarm due: {} ({})", alarm.id, alarm.message);

            for (session, outbound) in self.sessions.snapshot() {
                let delivery = AlarmDelivery {
                    tts: self.tts.clone(),
                    default_ringtone: self.default_ringtone.clone(),
                };
                let alarm = alarm.clone();
                tokio::spawn(async move {
                    delivery.deliver(session, outbound, alarm).await;
                });
            }
        }

        if changed {
            self.store.save(&alarms)?;
        }
        Ok(())
    }

    fn ensure_default_ringtone(&self) {
        if self.default_ringtone.exists() {
            return;
        }
        info!(
            "Generating default ringtone: {}",
            self.default_ringtone.display()
        );
        if let Err(e) = write_two_tone_ringtone(
            &self.default_ringtone,
            DEFAULT_RINGTONE_SECONDS,
            DEFAULT_RINGTONE_RATE,
        ) {
            error!("Failed to generate default ringtone: {:#}", e);
        }
    }
}

struct AlarmDelivery {
    tts: TtsService,
    default_ringtone: PathBuf,
}

impl AlarmDelivery {
    /// Send one alarm into one session. Failures are logged; the session
    /// and the scheduler keep running.
    async fn deliver(&self, session: Arc<Session>, outbound: Outbound, alarm: Alarm) {
        let sid = session.session_id().to_string();

        // Wake the session up for playback.
        session.set_idling(false);
        session.set_speaking(true);
        session.clear_aborted();

        outbound
            .send_json(&sid, json!({"type": "tts", "state": "start"}))
            .await;
        outbound
            .send_json(
                &sid,
                json!({"type": "tts", "state": "sentence_start", "text": alarm.message}),
            )
            .await;

        let ringtone = self.resolve_ringtone(alarm.ringtone.as_deref());
        let frame_duration = self.tts.frame_duration();
        let mut total_played = Duration::ZERO;

        loop {
            let mut frames = self.tts.stream_audio_url(&ringtone);
            let mut sent = 0usize;
            while let Some(frame) = frames.recv().await {
                outbound.send_frame(&frame).await;
                if outbound.is_closed() {
                    warn!("Failed to send alarm frame to {}", sid);
                    break;
                }
                sent += 1;
                sleep(frame_duration).await;
            }

            if sent == 0 {
                warn!("No frames streamed for ringtone {}", ringtone);
                break;
            }
            total_played += frame_duration * sent as u32;

            // Loop the file only when a longer play duration was requested.
            let Some(play_duration) = alarm.play_duration else {
                break;
            };
            if outbound.is_closed() || total_played.as_secs_f64() >= play_duration {
                break;
            }
        }

        outbound
            .send_json(&sid, json!({"type": "tts", "state": "stop"}))
            .await;
        session.set_speaking(false);

        info!("Alarm delivered to session {}", sid);
    }

    fn resolve_ringtone(&self, configured: Option<&str>) -> String {
        match configured {
            Some(path) if !path.trim().is_empty() => {
                let p = Path::new(path.trim());
                if p.is_absolute() {
                    path.trim().to_string()
                } else {
                    // Relative paths resolve next to the default ringtone.
                    self.default_ringtone
                        .parent()
                        .unwrap_or_else(|| Path::new("."))
                        .join(p)
                        .to_string_lossy()
                        .into_owned()
                }
            }
            _ => self.default_ringtone.to_string_lossy().into_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn alarm_at(time: &str, triggered: bool) -> Alarm {
        Alarm {
            id: "a1".to_string(),
            time: time.parse().unwrap(),
            message: "dậy thôi".to_string(),
            ringtone: None,
            created_at: "2026-01-01T00:00:00".parse().unwrap(),
            triggered,
            play_duration: None,
        }
    }

    #[test]
    fn test_store_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let store = AlarmStore::new(dir.path().join("alarms.json"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_store_round_trip() {
        let dir = tempdir().unwrap();
        let store = AlarmStore::new(dir.path().join("alarms.json"));

        store.append(alarm_at("2030-05-01T07:30:00", false)).unwrap();
        store.append(alarm_at("2030-05-02T07:30:00", false)).unwrap();

        let alarms = store.load().unwrap();
        assert_eq!(alarms.len(), 2);
        assert_eq!(alarms[0].message, "dậy thôi");
        assert!(!alarms[0].triggered);
    }

    #[test]
    fn test_store_survives_corrupt_file_on_append() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("alarms.json");
        std::fs::write(&path, "not json at all").unwrap();

        let store = AlarmStore::new(path);
        store.append(alarm_at("2030-05-01T07:30:00", false)).unwrap();
        assert_eq!(store.load().unwrap().len(), 1);
    }

    #[test]
    fn test_triggered_serde_round_trip() {
        let alarm = alarm_at("2030-05-01T07:30:00", true);
        let text = serde_json::to_string(&alarm).unwrap();
        let back: Alarm = serde_json::from_str(&text).unwrap();
        assert_eq!(back, alarm);
        // play_duration stays absent in the wire form when unset.
        assert!(!text.contains("play_duration"));
    }
}
