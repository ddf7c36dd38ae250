//! Energy-based voice activity detection.
//!
//! Runs on every decoded 60 ms PCM frame. A real utterance must hold
//! enough consecutive loud frames before silence counting can end it, so
//! short noise bursts never trigger the pipeline.

/// RMS above this counts toward speech confirmation.
pub const DEFAULT_SPEECH_THRESHOLD: f32 = 2500.0;

/// RMS at or below this counts as silence.
pub const DEFAULT_SILENCE_THRESHOLD: f32 = 2000.0;

/// Loud frames needed to confirm a speaker is present.
pub const DEFAULT_SPEECH_FRAMES_NEEDED: u32 = 8;

/// Silent frames after confirmed speech that end the utterance.
pub const DEFAULT_SILENCE_FRAMES_NEEDED: u32 = 10;

/// Tunable VAD thresholds.
#[derive(Debug, Clone, Copy)]
pub struct VadConfig {
    pub speech_threshold: f32,
    pub silence_threshold: f32,
    pub speech_frames_needed: u32,
    pub silence_frames_needed: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            speech_threshold: DEFAULT_SPEECH_THRESHOLD,
            silence_threshold: DEFAULT_SILENCE_THRESHOLD,
            speech_frames_needed: DEFAULT_SPEECH_FRAMES_NEEDED,
            silence_frames_needed: DEFAULT_SILENCE_FRAMES_NEEDED,
        }
    }
}

/// Per-frame classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadState {
    /// Someone is talking (or the utterance is still live).
    Speech,
    /// Quiet, no confirmed speech yet.
    Silence,
    /// Quiet long enough after confirmed speech — the utterance is over.
    SilenceAfterSpeech,
}

/// Per-utterance VAD state machine.
#[derive(Debug, Default)]
pub struct VoiceActivityDetector {
    config: VadConfig,
    silent_frames: u32,
    speech_frames: u32,
    has_speech: bool,
}

impl VoiceActivityDetector {
    pub fn new(config: VadConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    /// Classify one frame by its RMS energy.
    pub fn check(&mut self, rms: f32) -> VadState {
        if rms > self.config.speech_threshold {
            self.silent_frames = 0;
            self.speech_frames += 1;
            if self.speech_frames >= self.config.speech_frames_needed {
                self.has_speech = true;
            }
            VadState::Speech
        } else if rms > self.config.silence_threshold {
            self.silent_frames = 0;
            if self.has_speech {
                VadState::Speech
            } else {
                VadState::Silence
            }
        } else {
            self.silent_frames += 1;
            if self.has_speech && self.silent_frames >= self.config.silence_frames_needed {
                VadState::SilenceAfterSpeech
            } else {
                VadState::Silence
            }
        }
    }

    /// Whether enough loud frames confirmed a real speaker this utterance.
    pub fn has_speech(&self) -> bool {
        self.has_speech
    }

    /// Reset for the next utterance.
    pub fn reset(&mut self) {
        self.silent_frames = 0;
        self.speech_frames = 0;
        self.has_speech = false;
    }
}

/// RMS of little-endian PCM int16 bytes.
pub fn calc_rms(pcm: &[u8]) -> f32 {
    if pcm.len() < 2 {
        return 0.0;
    }
    let mut sum_sq = 0.0f64;
    let mut n = 0usize;
    for chunk in pcm.chunks_exact(2) {
        let s = i16::from_le_bytes([chunk[0], chunk[1]]) as f64;
        sum_sq += s * s;
        n += 1;
    }
    if n == 0 {
        return 0.0;
    }
    (sum_sq / n as f64).sqrt() as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm_with_amplitude(amp: i16, samples: usize) -> Vec<u8> {
        let mut pcm = Vec::with_capacity(samples * 2);
        for _ in 0..samples {
            pcm.extend_from_slice(&amp.to_le_bytes());
        }
        pcm
    }

    #[test]
    fn test_calc_rms() {
        assert_eq!(calc_rms(&[]), 0.0);
        assert_eq!(calc_rms(&[0x01]), 0.0);

        let silence = pcm_with_amplitude(0, 960);
        assert_eq!(calc_rms(&silence), 0.0);

        let loud = pcm_with_amplitude(3000, 960);
        assert!((calc_rms(&loud) - 3000.0).abs() < 1.0);
    }

    #[test]
    fn test_speech_confirmation_needs_consecutive_frames() {
        let mut vad = VoiceActivityDetector::default();

        for _ in 0..7 {
            assert_eq!(vad.check(3000.0), VadState::Speech);
        }
        assert!(!vad.has_speech());

        assert_eq!(vad.check(3000.0), VadState::Speech);
        assert!(vad.has_speech());
    }

    #[test]
    fn test_silence_after_speech_fires_once_threshold_reached() {
        let mut vad = VoiceActivityDetector::default();
        for _ in 0..8 {
            vad.check(3000.0);
        }
        assert!(vad.has_speech());

        for i in 0..9 {
            assert_eq!(vad.check(100.0), VadState::Silence, "frame {}", i);
        }
        assert_eq!(vad.check(100.0), VadState::SilenceAfterSpeech);
    }

    #[test]
    fn test_noise_burst_never_ends_in_trigger() {
        let mut vad = VoiceActivityDetector::default();

        // 5 loud frames is below the confirmation threshold.
        for _ in 0..5 {
            vad.check(4000.0);
        }
        for _ in 0..50 {
            assert_eq!(vad.check(0.0), VadState::Silence);
        }
        assert!(!vad.has_speech());
    }

    #[test]
    fn test_midband_rms_keeps_utterance_alive() {
        let mut vad = VoiceActivityDetector::default();

        // Mid-band energy before confirmation is just silence.
        assert_eq!(vad.check(2200.0), VadState::Silence);

        for _ in 0..8 {
            vad.check(3000.0);
        }
        // After confirmation the same energy reads as speech and resets the
        // silent counter.
        for _ in 0..5 {
            vad.check(100.0);
        }
        assert_eq!(vad.check(2200.0), VadState::Speech);
        for i in 0..9 {
            assert_eq!(vad.check(0.0), VadState::Silence, "frame {}", i);
        }
        assert_eq!(vad.check(0.0), VadState::SilenceAfterSpeech);
    }

    #[test]
    fn test_reset() {
        let mut vad = VoiceActivityDetector::default();
        for _ in 0..8 {
            vad.check(3000.0);
        }
        assert!(vad.has_speech());

        vad.reset();
        assert!(!vad.has_speech());
        assert_eq!(vad.check(100.0), VadState::Silence);
    }
}
