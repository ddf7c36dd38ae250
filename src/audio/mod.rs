//! Audio processing: Opus codec, resampling, voice shaping, VAD, WAV I/O.

pub mod codec;
pub mod effects;
pub mod resample;
pub mod vad;
pub mod wav;

pub use codec::{CodecError, OpusDecoder, OpusEncoder};
pub use effects::{VoiceShaper, VoiceStyle};
pub use resample::PolyphaseResampler;
pub use vad::{calc_rms, VadConfig, VadState, VoiceActivityDetector};
