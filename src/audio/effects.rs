//! Voice shaping applied to synthesizer output.
//!
//! The robot styles ring-modulate the signal with a square-wave carrier,
//! low-pass the result and cross-fade it with the dry signal. Carrier phase
//! and filter state persist across PCM chunks of one synthesis call so
//! chunk boundaries stay click-free; a new shaper is built at the start of
//! every synthesis call.

use tracing::warn;

/// Named voice style profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceStyle {
    Normal,
    Robot,
    RobotSoft,
    RobotDeep,
}

/// Ring-mod parameters for one style.
#[derive(Debug, Clone, Copy)]
struct StyleProfile {
    mod_hz: f32,
    mix: f32,
    lp_hz: f32,
}

impl VoiceStyle {
    /// Parse a configured style name. Unknown names fall back to `Normal`
    /// with a warning.
    pub fn parse(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "normal" => VoiceStyle::Normal,
            "robot" => VoiceStyle::Robot,
            "robot_soft" => VoiceStyle::RobotSoft,
            "robot_deep" => VoiceStyle::RobotDeep,
            other => {
                warn!("Unknown TTS voice_style='{}', fallback to 'normal'", other);
                VoiceStyle::Normal
            }
        }
    }

    fn profile(self) -> Option<StyleProfile> {
        match self {
            VoiceStyle::Normal => None,
            VoiceStyle::Robot => Some(StyleProfile {
                mod_hz: 95.0,
                mix: 0.72,
                lp_hz: 3000.0,
            }),
            VoiceStyle::RobotSoft => Some(StyleProfile {
                mod_hz: 75.0,
                mix: 0.55,
                lp_hz: 3600.0,
            }),
            VoiceStyle::RobotDeep => Some(StyleProfile {
                mod_hz: 58.0,
                mix: 0.8,
                lp_hz: 2500.0,
            }),
        }
    }
}

/// Stateful shaper for one synthesis call.
pub struct VoiceShaper {
    profile: Option<StyleProfile>,
    sample_rate: f32,
    phase: f32,
    lp_prev: f32,
}

impl VoiceShaper {
    pub fn new(style: VoiceStyle, sample_rate: u32) -> Self {
        Self {
            profile: style.profile(),
            sample_rate: sample_rate as f32,
            phase: 0.0,
            lp_prev: 0.0,
        }
    }

    /// Shape one PCM chunk, carrying carrier phase and filter state over
    /// from the previous chunk.
    pub fn process(&mut self, samples: &[i16]) -> Vec<i16> {
        let Some(profile) = self.profile else {
            return samples.to_vec();
        };
        if samples.is_empty() {
            return Vec::new();
        }

        let phase_inc = 2.0 * std::f32::consts::PI * profile.mod_hz / self.sample_rate;

        // One-pole low-pass coefficient for the wet path.
        let dt = 1.0 / self.sample_rate;
        let rc = 1.0 / (2.0 * std::f32::consts::PI * profile.lp_hz.max(10.0));
        let alpha = dt / (rc + dt);

        let mut out = Vec::with_capacity(samples.len());
        let mut phase = self.phase;
        let mut prev = self.lp_prev;

        for &s in samples {
            let dry = s as f32 / 32768.0;

            let carrier = {
                let c = phase.sin();
                if c >= 0.0 {
                    1.0
                } else {
                    -1.0
                }
            };
            let wet = dry * carrier;

            prev += alpha * (wet - prev);

            let mixed = (1.0 - profile.mix) * dry + profile.mix * prev;
            out.push((mixed * 32768.0).clamp(-32768.0, 32767.0) as i16);

            phase = (phase + phase_inc) % (2.0 * std::f32::consts::PI);
        }

        self.phase = phase;
        self.lp_prev = prev;
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_styles() {
        assert_eq!(VoiceStyle::parse("normal"), VoiceStyle::Normal);
        assert_eq!(VoiceStyle::parse("Robot"), VoiceStyle::Robot);
        assert_eq!(VoiceStyle::parse(" robot_soft "), VoiceStyle::RobotSoft);
        assert_eq!(VoiceStyle::parse("robot_deep"), VoiceStyle::RobotDeep);
    }

    #[test]
    fn test_parse_unknown_falls_back() {
        assert_eq!(VoiceStyle::parse("alien"), VoiceStyle::Normal);
        assert_eq!(VoiceStyle::parse(""), VoiceStyle::Normal);
    }

    #[test]
    fn test_normal_style_is_passthrough() {
        let mut shaper = VoiceShaper::new(VoiceStyle::Normal, 24_000);
        let samples: Vec<i16> = (0..960).map(|i| (i % 3000) as i16).collect();
        assert_eq!(shaper.process(&samples), samples);
    }

    #[test]
    fn test_robot_style_changes_signal() {
        let mut shaper = VoiceShaper::new(VoiceStyle::Robot, 24_000);
        let samples: Vec<i16> = (0..2400)
            .map(|i| {
                let t = i as f32 / 24_000.0;
                ((t * 220.0 * 2.0 * std::f32::consts::PI).sin() * 12000.0) as i16
            })
            .collect();
        let shaped = shaper.process(&samples);
        assert_eq!(shaped.len(), samples.len());
        assert_ne!(shaped, samples);
    }

    #[test]
    fn test_state_carries_across_chunks() {
        // Processing one long chunk must equal processing the same signal in
        // two halves, because phase and filter state persist.
        let samples: Vec<i16> = (0..4800)
            .map(|i| {
                let t = i as f32 / 24_000.0;
                ((t * 180.0 * 2.0 * std::f32::consts::PI).sin() * 9000.0) as i16
            })
            .collect();

        let mut whole = VoiceShaper::new(VoiceStyle::RobotDeep, 24_000);
        let expected = whole.process(&samples);

        let mut split = VoiceShaper::new(VoiceStyle::RobotDeep, 24_000);
        let mut got = split.process(&samples[..2400]);
        got.extend(split.process(&samples[2400..]));

        assert_eq!(expected, got);
    }

    #[test]
    fn test_fresh_shaper_is_deterministic() {
        let samples: Vec<i16> = (0..960).map(|i| ((i * 13) % 8000) as i16).collect();
        let a = VoiceShaper::new(VoiceStyle::Robot, 24_000).process(&samples);
        let b = VoiceShaper::new(VoiceStyle::Robot, 24_000).process(&samples);
        assert_eq!(a, b);
    }
}
