//! Audio format descriptors and byte/frame/time arithmetic.
//!
//! Every PCM buffer in the pipeline is 16-bit signed little-endian; the
//! format enum fixes the sample rate and channel count. Playback always
//! uses [`AudioFormat::Stereo44k`]; recording and the ADPCM codec use
//! [`AudioFormat::Mono16k`].

/// Fixed PCM formats used by the pipeline (16-bit little-endian throughout).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    /// 16 kHz mono
    Mono16k,
    /// 44.1 kHz mono
    Mono44k,
    /// 44.1 kHz stereo
    Stereo44k,
}

impl AudioFormat {
    /// Sample rate in Hz
    pub fn sample_rate(self) -> u32 {
        match self {
            AudioFormat::Mono16k => 16_000,
            AudioFormat::Mono44k | AudioFormat::Stereo44k => 44_100,
        }
    }

    /// Number of channels
    pub fn channels(self) -> u16 {
        match self {
            AudioFormat::Mono16k | AudioFormat::Mono44k => 1,
            AudioFormat::Stereo44k => 2,
        }
    }

    /// True if the format is stereo
    pub fn is_stereo(self) -> bool {
        self.channels() == 2
    }

    /// Number of bytes per frame (one sample per channel)
    pub fn bytes_per_frame(self) -> usize {
        self.channels() as usize * 2
    }

    /// Bytes of PCM per second at this format
    pub fn bytes_per_second(self) -> u64 {
        self.sample_rate() as u64 * self.bytes_per_frame() as u64
    }

    /// Approximate number of milliseconds covered by `bytes` of PCM
    pub fn bytes_to_ms(self, bytes: usize) -> u64 {
        (bytes as u64 * 1000) / self.bytes_per_second()
    }

    /// Approximate number of milliseconds covered by `frames` frames
    pub fn frames_to_ms(self, frames: u64) -> u64 {
        (frames * 1000) / self.sample_rate() as u64
    }

    /// Suitable device buffer size in bytes (1.5 seconds of audio)
    pub fn device_buffer_bytes(self) -> usize {
        3 * self.bytes_per_second() as usize / 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stereo_arithmetic() {
        let f = AudioFormat::Stereo44k;
        assert_eq!(f.bytes_per_frame(), 4);
        assert_eq!(f.bytes_per_second(), 176_400);
        // One second of stereo 44.1kHz
        assert_eq!(f.bytes_to_ms(176_400), 1000);
        assert_eq!(f.frames_to_ms(44_100), 1000);
    }

    #[test]
    fn test_mono_16k_arithmetic() {
        let f = AudioFormat::Mono16k;
        assert_eq!(f.bytes_per_frame(), 2);
        // 3200 bytes = 1600 samples = 100ms at 16kHz
        assert_eq!(f.bytes_to_ms(3200), 100);
        assert_eq!(f.device_buffer_bytes(), 48_000);
    }
}
