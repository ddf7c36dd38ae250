//! WAV container helpers.
//!
//! PCM is wrapped for the transcription upload and unwrapped from
//! synthesizer responses; the alarm scheduler generates its default
//! ringtone here.

use anyhow::{Context, Result};
use std::io::Cursor;
use std::path::Path;

fn mono_spec(sample_rate: u32) -> hound::WavSpec {
    hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    }
}

/// Wrap little-endian PCM int16 bytes in an in-memory WAV file.
pub fn pcm_to_wav(pcm: &[u8], sample_rate: u32) -> Result<Vec<u8>> {
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, mono_spec(sample_rate))
            .context("Failed to create WAV writer")?;
        for chunk in pcm.chunks_exact(2) {
            writer.write_sample(i16::from_le_bytes([chunk[0], chunk[1]]))?;
        }
        writer.finalize().context("Failed to finalize WAV")?;
    }
    Ok(cursor.into_inner())
}

/// Read a WAV byte buffer back into int16 samples plus its sample rate.
/// Float and 16-bit integer formats are both accepted.
pub fn wav_to_samples(bytes: &[u8]) -> Result<(Vec<i16>, u32)> {
    let mut reader =
        hound::WavReader::new(Cursor::new(bytes)).context("Failed to parse WAV data")?;
    let spec = reader.spec();

    let samples = match spec.sample_format {
        hound::SampleFormat::Int => reader
            .samples::<i16>()
            .collect::<std::result::Result<Vec<i16>, _>>()
            .context("Failed to read WAV samples")?,
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .map(|s| s.map(|f| (f * 32767.0).clamp(-32768.0, 32767.0) as i16))
            .collect::<std::result::Result<Vec<i16>, _>>()
            .context("Failed to read WAV samples")?,
    };

    Ok((samples, spec.sample_rate))
}

/// Generate a simple two-tone WAV ringtone so the repo never needs to ship
/// an audio asset.
pub fn write_two_tone_ringtone(path: &Path, duration_s: f32, sample_rate: u32) -> Result<()> {
    let mut writer = hound::WavWriter::create(path, mono_spec(sample_rate))
        .with_context(|| format!("Failed to create ringtone file {}", path.display()))?;

    let freq1 = 880.0f32;
    let freq2 = 1320.0f32;
    let amplitude = 16_000.0f32;
    let n_samples = (sample_rate as f32 * duration_s) as u32;

    for i in 0..n_samples {
        let t = i as f32 / sample_rate as f32;
        let sample = amplitude
            * 0.5
            * ((2.0 * std::f32::consts::PI * freq1 * t).sin()
                + 0.6 * (2.0 * std::f32::consts::PI * freq2 * t).sin());
        writer.write_sample(sample.clamp(-32767.0, 32767.0) as i16)?;
    }

    writer.finalize().context("Failed to finalize ringtone")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wav_round_trip() {
        let samples: Vec<i16> = (0..1600).map(|i| ((i * 7) % 12000) as i16 - 6000).collect();
        let mut pcm = Vec::with_capacity(samples.len() * 2);
        for s in &samples {
            pcm.extend_from_slice(&s.to_le_bytes());
        }

        let wav = pcm_to_wav(&pcm, 16_000).unwrap();
        let (read_back, rate) = wav_to_samples(&wav).unwrap();

        assert_eq!(rate, 16_000);
        assert_eq!(read_back, samples);
    }

    #[test]
    fn test_empty_pcm_still_valid_wav() {
        let wav = pcm_to_wav(&[], 24_000).unwrap();
        let (samples, rate) = wav_to_samples(&wav).unwrap();
        assert!(samples.is_empty());
        assert_eq!(rate, 24_000);
    }

    #[test]
    fn test_ringtone_generation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ring.wav");
        write_two_tone_ringtone(&path, 3.0, 24_000).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let (samples, rate) = wav_to_samples(&bytes).unwrap();
        assert_eq!(rate, 24_000);
        assert_eq!(samples.len(), 72_000);
        assert!(samples.iter().any(|&s| s != 0));
    }
}
