//! Playback readiness estimation.
//!
//! Pure arithmetic over download/decode statistics deciding how long to
//! wait before starting playback. Three regimes:
//!
//! 1. Everything is downloaded: start now.
//! 2. The connection is comfortably faster than playback: a tiered
//!    schedule requires less buffered lead time the faster the connection
//!    is.
//! 3. The connection is slower than playback but the total length is
//!    known: solve for the moment the remaining playback time exceeds the
//!    remaining download time by the safety factor.
//!
//! Below a hard floor (two chunks, 100ms of decoded audio, a usable
//! playback-rate average) no estimate is possible at all.

use oar_common::Tuning;

/// Sample rate the decoded-samples statistics are measured at
const PLAYBACK_RATE: f64 = 44_100.0;

/// Estimated wait before playback should start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitEstimate {
    /// Start playback now
    Ready,
    /// Expected wait in milliseconds
    Wait(u64),
    /// No estimate possible yet; keep waiting
    Unknown,
}

impl WaitEstimate {
    /// Millisecond value for display purposes (`None` when unknown)
    pub fn as_ms(self) -> Option<u64> {
        match self {
            WaitEstimate::Ready => Some(0),
            WaitEstimate::Wait(ms) => Some(ms),
            WaitEstimate::Unknown => None,
        }
    }
}

/// Statistics snapshot the estimator works from.
#[derive(Debug, Clone, Copy)]
pub struct ReadinessInputs {
    /// Number of chunks downloaded so far
    pub chunk_count: usize,
    /// Bytes downloaded so far
    pub bytes_downloaded: u64,
    /// Expected total length in bytes, if known
    pub total_bytes: Option<u64>,
    /// Input bytes consumed decoding the first frame
    pub first_frame_bytes: u64,
    /// Samples produced by the first frame
    pub first_frame_samples: u64,
    /// Total samples decoded so far
    pub total_samples_decoded: u64,
    /// Average playback consumption in input bytes per second
    pub avg_playback_bps: f64,
    /// Recent download rate in bytes per second
    pub recent_download_bps: f64,
}

/// Estimate how long to wait before starting playback.
pub fn playback_delay(inputs: &ReadinessInputs, tuning: &Tuning) -> WaitEstimate {
    // Hard floor: need at least two chunks, 100ms of decoded audio and a
    // non-zero playback-rate average before any estimate applies
    if inputs.chunk_count < 2
        || inputs.total_samples_decoded <= tuning.min_samples_before_start
        || inputs.avg_playback_bps == 0.0
    {
        return WaitEstimate::Unknown;
    }
    delay_above_floor(inputs, tuning)
}

fn delay_above_floor(inputs: &ReadinessInputs, tuning: &Tuning) -> WaitEstimate {
    // Fully downloaded with at least one decoded frame: start now. Only a
    // known, reached length counts as fully downloaded.
    if let Some(total) = inputs.total_bytes {
        if inputs.bytes_downloaded >= total && inputs.total_samples_decoded > 0 {
            return WaitEstimate::Ready;
        }
    }

    // Downloading faster than playback: tiered lead-time schedule
    let speed_factor = inputs.recent_download_bps / inputs.avg_playback_bps;
    let seconds_downloaded = inputs.bytes_downloaded as f64 / inputs.avg_playback_bps;
    for tier in &tuning.speed_tiers {
        if speed_factor > tier.min_factor {
            let ms = 1000.0 * (tier.lead_seconds - seconds_downloaded) / speed_factor;
            return clamp_delay(ms);
        }
    }

    // Slower than playback, but we can still start before the end when the
    // total length is known
    if let Some(total) = inputs.total_bytes {
        let total = total as f64;
        let seconds_played = inputs.total_samples_decoded as f64 / PLAYBACK_RATE;
        let seconds_total = (total - inputs.first_frame_bytes as f64) / inputs.avg_playback_bps
            + inputs.first_frame_samples as f64 / PLAYBACK_RATE;

        // Seconds until the ratio of remaining playback time to remaining
        // download time reaches the safety factor
        let factor = tuning.safety_factor;
        let seconds_until = (seconds_total
            - seconds_played
            - factor * (total - inputs.bytes_downloaded as f64) / inputs.recent_download_bps)
            / -factor;
        return clamp_delay(seconds_until * 1000.0);
    }

    // Unknown length on a slow connection: keep waiting
    WaitEstimate::Unknown
}

fn clamp_delay(ms: f64) -> WaitEstimate {
    if ms <= 0.0 {
        WaitEstimate::Ready
    } else {
        WaitEstimate::Wait(ms as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs() -> ReadinessInputs {
        ReadinessInputs {
            chunk_count: 10,
            bytes_downloaded: 50_000,
            total_bytes: Some(1_000_000),
            first_frame_bytes: 0,
            first_frame_samples: 0,
            total_samples_decoded: 44_100,
            avg_playback_bps: 100_000.0,
            recent_download_bps: 230_000.0,
        }
    }

    #[test]
    fn test_floor_nothing_decoded_is_never_ready() {
        // Even a fully-downloaded stream is not ready before one frame
        // has been decoded
        let mut i = inputs();
        i.total_samples_decoded = 0;
        i.bytes_downloaded = 1_000_000;
        assert_eq!(playback_delay(&i, &Tuning::default()), WaitEstimate::Unknown);
    }

    #[test]
    fn test_floor_requires_two_chunks_and_average() {
        let mut i = inputs();
        i.chunk_count = 1;
        assert_eq!(playback_delay(&i, &Tuning::default()), WaitEstimate::Unknown);

        let mut i = inputs();
        i.avg_playback_bps = 0.0;
        assert_eq!(playback_delay(&i, &Tuning::default()), WaitEstimate::Unknown);
    }

    #[test]
    fn test_fully_downloaded_is_ready_immediately() {
        let mut i = inputs();
        i.bytes_downloaded = 1_000_000;
        assert_eq!(playback_delay(&i, &Tuning::default()), WaitEstimate::Ready);
    }

    #[test]
    fn test_fast_connection_uses_top_tier() {
        // 2.3x playback speed, 0.5s buffered, top tier wants 1s:
        // 1000 * (1 - 0.5) / 2.3 ~= 217ms
        let i = inputs();
        match playback_delay(&i, &Tuning::default()) {
            WaitEstimate::Wait(ms) => assert!((200..=230).contains(&ms), "got {}ms", ms),
            other => panic!("expected Wait, got {:?}", other),
        }

        // With 2 seconds buffered the top tier is satisfied
        let mut i = inputs();
        i.bytes_downloaded = 200_000;
        assert_eq!(playback_delay(&i, &Tuning::default()), WaitEstimate::Ready);
    }

    #[test]
    fn test_moderate_speed_picks_matching_tier() {
        // 1.5x speed lands in the 1.4 tier (10s lead); with only 0.5s
        // buffered the wait is substantial
        let mut i = inputs();
        i.recent_download_bps = 150_000.0;
        match playback_delay(&i, &Tuning::default()) {
            WaitEstimate::Wait(ms) => {
                // 1000 * (10 - 0.5) / 1.5 ~= 6333ms
                assert!((6000..=6700).contains(&ms), "got {}ms", ms);
            }
            other => panic!("expected Wait, got {:?}", other),
        }
    }

    #[test]
    fn test_slow_connection_crossover_solve() {
        // 1.05x speed: below every tier, falls to the crossover solve.
        // 10s total, 1s played, 8.57s of download left * 1.3 = 11.14s:
        // wait (11.14 - 9) / 1.3 ~= 1648ms
        let mut i = inputs();
        i.bytes_downloaded = 100_000;
        i.recent_download_bps = 105_000.0;
        match playback_delay(&i, &Tuning::default()) {
            WaitEstimate::Wait(ms) => assert!((1500..=1800).contains(&ms), "got {}ms", ms),
            other => panic!("expected Wait, got {:?}", other),
        }

        // Most of the file downloaded: remaining playback comfortably
        // exceeds remaining download, so start
        let mut i = inputs();
        i.bytes_downloaded = 500_000;
        i.recent_download_bps = 105_000.0;
        assert_eq!(playback_delay(&i, &Tuning::default()), WaitEstimate::Ready);
    }

    #[test]
    fn test_unknown_length_slow_connection_keeps_waiting() {
        let mut i = inputs();
        i.total_bytes = None;
        i.recent_download_bps = 90_000.0;
        assert_eq!(playback_delay(&i, &Tuning::default()), WaitEstimate::Unknown);
    }

    #[test]
    fn test_unknown_length_fast_connection_uses_tiers() {
        let mut i = inputs();
        i.total_bytes = None;
        i.bytes_downloaded = 200_000;
        assert_eq!(playback_delay(&i, &Tuning::default()), WaitEstimate::Ready);
    }

    #[test]
    fn test_instantaneous_download_rate() {
        // Zero arrival time produces an infinite rate; the top tier
        // swallows it without overflow
        let mut i = inputs();
        i.recent_download_bps = f64::INFINITY;
        i.bytes_downloaded = 10_000;
        assert_eq!(playback_delay(&i, &Tuning::default()), WaitEstimate::Ready);
    }
}
