//! Opus encoder/decoder for the device audio link.
//!
//! Devices send Opus 16 kHz mono 60 ms frames; the server replies with
//! Opus 24 kHz mono 60 ms frames.

use thiserror::Error;

use crate::config::AudioParamsConfig;

/// TTS output sounds muddy at the library default, so outbound frames are
/// encoded at a fixed 32 kbps.
const OUTPUT_BITRATE_BPS: i32 = 32_000;

/// Recoverable codec failure. The session logs the error and drops the
/// offending frame; the connection stays up.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("opus error: {0}")]
    Opus(#[from] opus::Error),
    #[error("pcm frame is {got} bytes, expected {expected}")]
    BadFrameLength { got: usize, expected: usize },
}

/// Decodes Opus frames from the device into PCM int16 bytes.
pub struct OpusDecoder {
    decoder: opus::Decoder,
    frame_size: usize,
}

impl OpusDecoder {
    pub fn new(cfg: &AudioParamsConfig) -> Result<Self, CodecError> {
        let decoder = opus::Decoder::new(cfg.sample_rate, opus::Channels::Mono)?;
        Ok(Self {
            decoder,
            frame_size: cfg.frame_size(),
        })
    }

    /// Decode one Opus frame into little-endian PCM int16 bytes.
    ///
    /// A 60 ms 16 kHz frame always decodes to exactly 960 samples (1920 bytes).
    pub fn decode(&mut self, opus_data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut samples = vec![0i16; self.frame_size];
        let decoded = self.decoder.decode(opus_data, &mut samples, false)?;
        samples.truncate(decoded);

        let mut pcm = Vec::with_capacity(samples.len() * 2);
        for s in samples {
            pcm.extend_from_slice(&s.to_le_bytes());
        }
        Ok(pcm)
    }
}

/// Encodes PCM int16 into Opus frames for the device.
pub struct OpusEncoder {
    encoder: opus::Encoder,
    frame_size: usize,
    frame_bytes: usize,
}

impl OpusEncoder {
    pub fn new(cfg: &AudioParamsConfig) -> Result<Self, CodecError> {
        let mut encoder =
            opus::Encoder::new(cfg.sample_rate, opus::Channels::Mono, opus::Application::Audio)?;
        encoder.set_bitrate(opus::Bitrate::Bits(OUTPUT_BITRATE_BPS))?;
        Ok(Self {
            encoder,
            frame_size: cfg.frame_size(),
            frame_bytes: cfg.frame_bytes(),
        })
    }

    /// PCM bytes required for exactly one frame.
    pub fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }

    /// Encode one whole frame of PCM int16 bytes into an Opus packet.
    pub fn encode(&mut self, pcm_data: &[u8]) -> Result<Vec<u8>, CodecError> {
        if pcm_data.len() != self.frame_bytes {
            return Err(CodecError::BadFrameLength {
                got: pcm_data.len(),
                expected: self.frame_bytes,
            });
        }

        let samples: Vec<i16> = pcm_data
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        debug_assert_eq!(samples.len(), self.frame_size);

        let mut packet = vec![0u8; 4000];
        let written = self.encoder.encode(&samples, &mut packet)?;
        packet.truncate(written);
        Ok(packet)
    }

    /// Split a PCM buffer into whole frames and encode them all. Any
    /// trailing partial frame is silently dropped.
    pub fn encode_all(&mut self, pcm_data: &[u8]) -> Result<Vec<Vec<u8>>, CodecError> {
        let mut frames = Vec::new();
        let mut offset = 0;
        while offset + self.frame_bytes <= pcm_data.len() {
            frames.push(self.encode(&pcm_data[offset..offset + self.frame_bytes])?);
            offset += self.frame_bytes;
        }
        Ok(frames)
    }
}
