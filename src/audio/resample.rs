//! Rational-ratio polyphase resampler.
//!
//! Used to bring synthesizer output (typically 22 050 Hz) up to the 24 kHz
//! wire rate. The ratio is reduced by GCD (22050 -> 24000 gives up=160,
//! down=147) and a windowed-sinc low-pass is evaluated per output phase, so
//! the conversion is a single FIR pass without materializing the upsampled
//! signal.

/// Sinc taps per side, per phase.
const HALF_TAPS: usize = 10;

pub struct PolyphaseResampler {
    up: usize,
    down: usize,
    taps: Vec<f32>,
    center: usize,
}

impl PolyphaseResampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Self {
        let g = gcd(from_rate as usize, to_rate as usize);
        let up = to_rate as usize / g;
        let down = from_rate as usize / g;

        // Anti-aliasing low-pass at the tighter of the two Nyquist limits,
        // normalized to the upsampled rate. Hamming-windowed sinc, gain `up`
        // to compensate for zero insertion.
        let len = 2 * HALF_TAPS * up + 1;
        let center = (len - 1) / 2;
        let fc = 0.5 / up.max(down) as f64;
        let mut taps = Vec::with_capacity(len);
        for k in 0..len {
            let x = k as f64 - center as f64;
            let sinc = if x == 0.0 {
                1.0
            } else {
                let px = std::f64::consts::PI * 2.0 * fc * x;
                px.sin() / px
            };
            let window = 0.54
                - 0.46 * (2.0 * std::f64::consts::PI * k as f64 / (len - 1) as f64).cos();
            taps.push((2.0 * fc * sinc * window * up as f64) as f32);
        }

        Self {
            up,
            down,
            taps,
            center,
        }
    }

    /// Upsample / downsample factors after GCD reduction.
    pub fn ratio(&self) -> (usize, usize) {
        (self.up, self.down)
    }

    /// Resample one chunk of samples. Output length is
    /// `ceil(input.len() * up / down)`; the group delay of the filter is
    /// compensated so output stays aligned with input.
    pub fn process(&self, input: &[i16]) -> Vec<i16> {
        if input.is_empty() {
            return Vec::new();
        }
        if self.up == self.down {
            return input.to_vec();
        }

        let n_out = (input.len() * self.up).div_ceil(self.down);
        let mut output = Vec::with_capacity(n_out);

        for n in 0..n_out {
            let m = n * self.down + self.center;
            let phase = m % self.up;
            let base = (m - phase) / self.up;

            let mut acc = 0.0f32;
            let mut k = phase;
            let mut j = 0usize;
            while k < self.taps.len() {
                if let Some(idx) = base.checked_sub(j) {
                    if idx < input.len() {
                        acc += self.taps[k] * input[idx] as f32;
                    }
                } else {
                    break;
                }
                k += self.up;
                j += 1;
            }

            output.push(acc.round().clamp(i16::MIN as f32, i16::MAX as f32) as i16);
        }

        output
    }
}

fn gcd(a: usize, b: usize) -> usize {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ratio_reduction() {
        let r = PolyphaseResampler::new(22_050, 24_000);
        assert_eq!(r.ratio(), (160, 147));
    }

    #[test]
    fn test_output_length() {
        let r = PolyphaseResampler::new(22_050, 24_000);
        let input = vec![0i16; 2205];
        let out = r.process(&input);
        // ceil(2205 * 160 / 147) = 2400
        assert_eq!(out.len(), 2400);
    }

    #[test]
    fn test_dc_preserved() {
        let r = PolyphaseResampler::new(22_050, 24_000);
        let input = vec![1000i16; 2205];
        let out = r.process(&input);
        // Away from the edges a constant signal must survive resampling.
        let mid = &out[200..out.len() - 200];
        for &s in mid {
            assert!((s as i32 - 1000).abs() < 20, "sample {} too far from 1000", s);
        }
    }

    #[test]
    fn test_deterministic() {
        let r = PolyphaseResampler::new(22_050, 24_000);
        let input: Vec<i16> = (0..4410).map(|i| ((i * 37) % 20000) as i16 - 10000).collect();
        assert_eq!(r.process(&input), r.process(&input));
    }

    #[test]
    fn test_identity_ratio() {
        let r = PolyphaseResampler::new(16_000, 16_000);
        let input: Vec<i16> = (0..100).map(|i| i as i16).collect();
        assert_eq!(r.process(&input), input);
    }

    #[test]
    fn test_empty_input() {
        let r = PolyphaseResampler::new(22_050, 24_000);
        assert!(r.process(&[]).is_empty());
    }
}
