//! Decoder task: one thread decoding ahead of the playback consumer.
//!
//! Pulls compressed data through a [`BlockReader`](crate::source), calls
//! the codec, coalesces small decoded fragments into minimum-size blocks,
//! and keeps a bounded queue of ready audio. The queue bound is the
//! backpressure point: the task blocks while the consumer has enough
//! audio in hand.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::debug;

use oar_common::StopFlag;

use crate::player::{AudioBlock, PlayerCore, StreamState};
use crate::source::BlockReader;

/// Sample rate the playback-rate statistic is computed at
const PLAYBACK_RATE: f64 = 44_100.0;

/// Bytes per decoded frame (16-bit stereo)
const BYTES_PER_FRAME: u64 = 4;

pub(crate) fn run(core: Arc<PlayerCore>, stop: StopFlag) {
    let mut decoder = (core.decoder_factory)();
    let reader = BlockReader::new(Arc::clone(&core), stop.clone());
    let position = reader.position();

    if let Err(err) = decoder.init(Box::new(reader)) {
        if stop.is_set() {
            return;
        }
        core.handler.stream_error(err);
        finish_playback(&core);
        return;
    }
    debug!("decoder task started");

    loop {
        // Backpressure: wait while the output queue is full. While parked
        // here the consumer may have drained a fully-loaded stream dry,
        // so also repair BufferEmpty.
        {
            let mut inner = core.shared.inner.lock().unwrap();
            while inner.next_audio.len() >= core.tuning.audio_block_buffer
                && !stop.is_set()
                && !inner.closing
            {
                if inner.state == StreamState::BufferEmpty {
                    core.set_state_locked(&mut inner, StreamState::FullyLoaded);
                }
                inner = core.shared.cond.wait(inner).unwrap();
            }
            if stop.is_set() || inner.closing {
                return;
            }
        }

        // Coalesce decoder output until it reaches the minimum block size
        let mut audio: Option<Vec<u8>> = None;
        let mut eof = false;
        loop {
            if stop.is_set() {
                return;
            }
            match decoder.decode() {
                Ok(None) => {
                    eof = true;
                    break;
                }
                Ok(Some(new_audio)) => {
                    // Decoders sometimes return zero-length data blocks
                    if new_audio.is_empty() {
                        continue;
                    }
                    match &mut audio {
                        None => audio = Some(new_audio),
                        Some(existing) => existing.extend_from_slice(&new_audio),
                    }
                    if audio.as_ref().map(Vec::len).unwrap_or(0) >= core.tuning.min_decoded_block
                    {
                        break;
                    }
                }
                Err(err) => {
                    // A cancelled generation reads truncated input; only a
                    // live one reports codec faults, which are fatal
                    if stop.is_set() {
                        return;
                    }
                    core.handler.stream_error(err);
                    finish_playback(&core);
                    return;
                }
            }
        }
        if stop.is_set() {
            return;
        }

        let total_bytes_decoded = position.load(Ordering::Acquire);

        let mut inner = core.shared.inner.lock().unwrap();
        if stop.is_set() || inner.closing {
            return;
        }

        let percentage_played = inner
            .length
            .map(|l| 100.0 * total_bytes_decoded as f64 / l as f64);

        if let Some(pcm) = &audio {
            inner.total_samples_decoded += pcm.len() as u64 / BYTES_PER_FRAME;
        }

        if inner.first_frame_bytes == 0 {
            // Remember the cost of the first frame so its one-time decode
            // overhead never skews the rate average
            inner.first_frame_bytes = total_bytes_decoded;
            inner.first_frame_samples = inner.total_samples_decoded;
        } else if inner.total_samples_decoded > inner.first_frame_samples {
            inner.avg_playback_bps = (total_bytes_decoded - inner.first_frame_bytes) as f64
                / ((inner.total_samples_decoded - inner.first_frame_samples) as f64
                    / PLAYBACK_RATE);
        }

        if let Some(pcm) = audio {
            inner.next_audio.push_back(AudioBlock {
                pcm,
                percentage_played,
            });
        }
        core.shared.cond.notify_all();

        if eof {
            // Flush done; close out the state machine. A stream that
            // finished decoding before ever becoming ready passes through
            // ReadyToPlay on its way to FullyLoaded.
            if inner.state == StreamState::BufferEmpty {
                core.set_state_locked(&mut inner, StreamState::FullyLoaded);
            } else if inner.state == StreamState::WaitBeforePlay {
                core.set_state_locked(&mut inner, StreamState::ReadyToPlay);
                core.set_state_locked(&mut inner, StreamState::FullyLoaded);
            }
            inner.play_finished = true;
            core.shared.cond.notify_all();
            debug!("decoder task finished at end of stream");
            return;
        }
    }
}

fn finish_playback(core: &Arc<PlayerCore>) {
    let mut inner = core.shared.inner.lock().unwrap();
    inner.play_finished = true;
    core.shared.cond.notify_all();
}
