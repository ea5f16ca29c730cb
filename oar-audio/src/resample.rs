//! Streaming sample-rate conversion using rubato.
//!
//! Decoders hand the resampler one codec frame at a time, so the rubato
//! resampler is kept stateful across calls. Input and output are 16-bit
//! interleaved samples; conversion to planar f32 happens internally.

use oar_common::{Error, Result};
use rubato::{FastFixedIn, PolynomialDegree, Resampler as RubatoResampler};
use tracing::debug;

/// Standard output sample rate for all playback audio
pub const TARGET_SAMPLE_RATE: u32 = 44_100;

/// Stateful streaming resampler from a fixed source rate to 44.1 kHz.
///
/// The rubato chunk size is fixed by the first frame it sees (codec frames
/// have a constant size); trailing shorter frames go through the partial
/// path.
pub struct StreamResampler {
    src_rate: u32,
    channels: usize,
    chunk: usize,
    inner: Option<FastFixedIn<f32>>,
}

impl StreamResampler {
    /// Create a resampler for the given source format.
    pub fn new(src_rate: u32, channels: u16) -> Self {
        StreamResampler {
            src_rate,
            channels: channels as usize,
            chunk: 0,
            inner: None,
        }
    }

    /// Resample one interleaved 16-bit frame of audio.
    ///
    /// Pass-through when the source is already at 44.1 kHz.
    pub fn process_i16(&mut self, samples: &[i16]) -> Result<Vec<i16>> {
        if self.src_rate == TARGET_SAMPLE_RATE {
            return Ok(samples.to_vec());
        }
        let frames = samples.len() / self.channels;
        if frames == 0 {
            return Ok(Vec::new());
        }

        let planar = deinterleave(samples, self.channels);
        let mut output: Vec<Vec<f32>> = vec![Vec::new(); self.channels];

        let mut pos = 0;
        while pos < frames {
            let remaining = frames - pos;
            // The first frame fixes the chunk size; later frames are split
            // into chunk-sized pieces with a partial tail
            let take = if self.inner.is_none() {
                remaining
            } else {
                remaining.min(self.chunk)
            };
            let slice: Vec<&[f32]> = planar.iter().map(|c| &c[pos..pos + take]).collect();

            let resampler = self.resampler_for(take)?;
            let out = if take == resampler.input_frames_next() {
                resampler
                    .process(&slice, None)
                    .map_err(|e| Error::Decode(format!("resampling failed: {}", e)))?
            } else {
                resampler
                    .process_partial(Some(&slice), None)
                    .map_err(|e| Error::Decode(format!("resampling failed: {}", e)))?
            };
            for (chan, data) in output.iter_mut().zip(out) {
                chan.extend(data);
            }
            pos += take;
        }

        Ok(interleave(&output))
    }

    fn resampler_for(&mut self, first_chunk: usize) -> Result<&mut FastFixedIn<f32>> {
        if self.inner.is_none() {
            debug!(
                "creating resampler {}Hz -> {}Hz, {} channels, chunk {}",
                self.src_rate, TARGET_SAMPLE_RATE, self.channels, first_chunk
            );
            self.chunk = first_chunk;
            let resampler = FastFixedIn::<f32>::new(
                TARGET_SAMPLE_RATE as f64 / self.src_rate as f64,
                1.0,
                PolynomialDegree::Septic,
                first_chunk,
                self.channels,
            )
            .map_err(|e| Error::Decode(format!("failed to create resampler: {}", e)))?;
            self.inner = Some(resampler);
        }
        Ok(self.inner.as_mut().expect("resampler just created"))
    }
}

/// Split interleaved 16-bit samples into planar f32 channels.
fn deinterleave(samples: &[i16], channels: usize) -> Vec<Vec<f32>> {
    let frames = samples.len() / channels;
    let mut planar = vec![Vec::with_capacity(frames); channels];
    for frame in samples.chunks_exact(channels) {
        for (chan, &sample) in planar.iter_mut().zip(frame) {
            chan.push(sample as f32 / 32768.0);
        }
    }
    planar
}

/// Merge planar f32 channels back into interleaved 16-bit samples.
fn interleave(planar: &[Vec<f32>]) -> Vec<i16> {
    let frames = planar.iter().map(|c| c.len()).min().unwrap_or(0);
    let mut samples = Vec::with_capacity(frames * planar.len());
    for i in 0..frames {
        for chan in planar {
            let value = (chan[i] * 32767.0).clamp(-32768.0, 32767.0);
            samples.push(value as i16);
        }
    }
    samples
}

/// Duplicate mono samples into interleaved stereo.
pub fn mono_to_stereo(samples: &[i16]) -> Vec<i16> {
    let mut stereo = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        stereo.push(s);
        stereo.push(s);
    }
    stereo
}

/// Reinterpret 16-bit samples as little-endian bytes.
pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        bytes.extend_from_slice(&s.to_le_bytes());
    }
    bytes
}

/// Reinterpret little-endian bytes as 16-bit samples (truncates odd tail).
pub fn bytes_to_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pass_through_at_target_rate() {
        let mut r = StreamResampler::new(44_100, 2);
        let input = vec![100i16, -100, 200, -200];
        assert_eq!(r.process_i16(&input).unwrap(), input);
    }

    #[test]
    fn test_upsample_ratio_16k_to_44k() {
        let mut r = StreamResampler::new(16_000, 1);
        let block = vec![1000i16; 1017];
        let mut total_out = 0usize;
        for _ in 0..10 {
            total_out += r.process_i16(&block).unwrap().len();
        }
        let expected = (10.0 * 1017.0 * 44_100.0 / 16_000.0) as usize;
        // Interpolator history shifts a few frames between calls
        assert!(
            total_out.abs_diff(expected) < 1017,
            "output {} far from expected {}",
            total_out,
            expected
        );
    }

    #[test]
    fn test_mono_to_stereo_duplicates() {
        assert_eq!(mono_to_stereo(&[1, 2]), vec![1, 1, 2, 2]);
    }

    #[test]
    fn test_sample_byte_round_trip() {
        let samples = vec![0i16, -1, 257, -32768];
        assert_eq!(bytes_to_samples(&samples_to_bytes(&samples)), samples);
    }
}
