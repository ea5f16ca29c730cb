//! Tuning configuration for the streaming pipeline.
//!
//! The defaults reproduce the shipped behaviour; every value can be
//! overridden from a TOML file. The speed-tier table and the 1.3 safety
//! factor are empirically tuned shipping constants, kept as configuration
//! rather than re-derived.

use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};

/// One row of the readiness schedule: connections at least `min_factor`
/// times faster than playback need `lead_seconds` of audio buffered before
/// starting.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct SpeedTier {
    /// Minimum download/playback speed ratio for this tier to apply
    pub min_factor: f64,
    /// Seconds of audio that must be buffered before playback starts
    pub lead_seconds: f64,
}

/// Pipeline tunables, loadable from TOML.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Tuning {
    /// Download chunk size in bytes
    pub chunk_size: usize,

    /// Maximum number of decoded audio blocks queued ahead of the consumer
    pub audio_block_buffer: usize,

    /// Minimum size of decoded audio blocks in bytes; smaller decoder
    /// results are coalesced until they reach this size
    pub min_decoded_block: usize,

    /// Samples that must be decoded before playback can be considered
    /// (4410 = 100ms at 44.1kHz)
    pub min_samples_before_start: u64,

    /// Number of recent chunks averaged for the download-rate estimate
    pub rate_window_chunks: usize,

    /// Readiness schedule, fastest tier first
    pub speed_tiers: Vec<SpeedTier>,

    /// Target ratio of remaining-playback-time to remaining-download-time
    /// used when the connection is slower than playback
    pub safety_factor: f64,

    /// Interval of the become-ready poll timer in milliseconds
    pub ready_poll_interval_ms: u64,

    /// Estimated hardware playback latency in milliseconds
    pub play_latency_ms: u64,

    /// If non-zero, limits downloading to this many bytes per second
    /// (simulates slow connections)
    pub simulated_download_bps: u32,

    /// If non-zero, limits uploading to this many bytes per second
    pub simulated_upload_bps: u32,
}

impl Default for Tuning {
    fn default() -> Self {
        Tuning {
            chunk_size: 2048,
            audio_block_buffer: 5,
            min_decoded_block: 4608,
            min_samples_before_start: 4410,
            rate_window_chunks: 20,
            speed_tiers: vec![
                SpeedTier { min_factor: 2.2, lead_seconds: 1.0 },
                SpeedTier { min_factor: 1.7, lead_seconds: 5.0 },
                SpeedTier { min_factor: 1.4, lead_seconds: 10.0 },
                SpeedTier { min_factor: 1.1, lead_seconds: 30.0 },
            ],
            safety_factor: 1.3,
            ready_poll_interval_ms: 50,
            play_latency_ms: 50,
            simulated_download_bps: 0,
            simulated_upload_bps: 0,
        }
    }
}

impl Tuning {
    /// Load tuning from a TOML file, filling unset fields with defaults.
    pub fn load(path: &Path) -> Result<Tuning> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text)
            .map_err(|e| Error::Config(format!("failed to parse {}: {}", path.display(), e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_shipped_constants() {
        let t = Tuning::default();
        assert_eq!(t.chunk_size, 2048);
        assert_eq!(t.audio_block_buffer, 5);
        assert_eq!(t.min_decoded_block, 4608);
        assert_eq!(t.min_samples_before_start, 4410);
        assert_eq!(t.speed_tiers.len(), 4);
        assert_eq!(t.speed_tiers[0].lead_seconds, 1.0);
        assert_eq!(t.speed_tiers[3].lead_seconds, 30.0);
    }

    #[test]
    fn test_partial_toml_overlays_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "chunk_size = 4096\nplay_latency_ms = 80").unwrap();
        let t = Tuning::load(file.path()).unwrap();
        assert_eq!(t.chunk_size, 4096);
        assert_eq!(t.play_latency_ms, 80);
        // Unset fields keep defaults
        assert_eq!(t.audio_block_buffer, 5);
        assert_eq!(t.safety_factor, 1.3);
    }
}
