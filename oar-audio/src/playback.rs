//! Playback device over cpal with a just-in-time feeder thread.
//!
//! The hardware callback drains a lock-free PCM ring; the feeder thread
//! keeps the ring topped up from a [`PlaybackHandler`] using latency
//! bookkeeping: hardware start is deferred until enough lead time is
//! queued that an immediate start cannot underrun, and between blocks the
//! feeder sleeps for exactly the spare time it has banked rather than
//! spinning.
//!
//! One mutex plus one condvar guard all mutable device state. The lock is
//! never held across a blocking ring or hardware interaction; the
//! real-time callback touches only atomics and the ring.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::SampleFormat;
use tracing::{debug, info, warn};

use oar_common::{AudioFormat, Error, Result};

use crate::device::{PlaybackDevice, PlaybackHandler};
use crate::resample::bytes_to_samples;
use crate::ring::{PcmConsumer, PcmProducer, PcmRing};

/// Minimum inter-block wait; shorter spare time is not worth sleeping for
const MIN_WAIT_MS: i64 = 10;

/// Poll interval for bounded waits against the lock-free ring
const RING_POLL: Duration = Duration::from_millis(10);

struct DeviceState {
    playing: bool,
    paused: bool,
    closed: bool,
    feeder_active: bool,
    feeder_thread: Option<ThreadId>,
    /// Hardware actually started for the current session
    started: bool,
}

struct DeviceShared {
    state: Mutex<DeviceState>,
    cond: Condvar,
    /// Callback consumes the ring only when set
    hw_running: AtomicBool,
    /// Callback freezes (silence, no consumption) while set
    hw_paused: AtomicBool,
    /// Callback discards all queued samples at the next tick
    flush_requested: AtomicBool,
    /// Frames consumed by the callback this session
    played_frames: AtomicU64,
    /// Frames handed to the ring this session
    sent_frames: AtomicU64,
}

/// cpal-backed playback device.
pub struct CpalPlaybackDevice {
    format: AudioFormat,
    latency_ms: u64,
    shared: Arc<DeviceShared>,
    producer: Arc<Mutex<PcmProducer>>,
    feeder: Mutex<Option<JoinHandle<()>>>,
    // Keeps the callback alive; the stream itself is never touched after
    // open, all control goes through the atomics above
    _stream: cpal::Stream,
}

impl CpalPlaybackDevice {
    /// Open the device for the given format. The hardware stream starts
    /// immediately but emits silence until playback is started.
    pub fn open(device: cpal::Device, format: AudioFormat, latency_ms: u64) -> Result<Self> {
        let supported = device
            .default_output_config()
            .map_err(|e| Error::Device(format!("failed to get output config: {}", e)))?;
        let config = cpal::StreamConfig {
            channels: format.channels(),
            sample_rate: cpal::SampleRate(format.sample_rate()),
            buffer_size: cpal::BufferSize::Default,
        };

        let shared = Arc::new(DeviceShared {
            state: Mutex::new(DeviceState {
                playing: false,
                paused: false,
                closed: false,
                feeder_active: false,
                feeder_thread: None,
                started: false,
            }),
            cond: Condvar::new(),
            hw_running: AtomicBool::new(false),
            hw_paused: AtomicBool::new(false),
            flush_requested: AtomicBool::new(false),
            played_frames: AtomicU64::new(0),
            sent_frames: AtomicU64::new(0),
        });

        // 1.5 seconds of samples between feeder and callback
        let ring = PcmRing::new(format.device_buffer_bytes() / 2);
        let (producer, consumer) = ring.split();

        let stream = match supported.sample_format() {
            SampleFormat::F32 => {
                build_stream::<f32>(&device, &config, Arc::clone(&shared), consumer)
            }
            SampleFormat::I16 => {
                build_stream::<i16>(&device, &config, Arc::clone(&shared), consumer)
            }
            SampleFormat::U16 => {
                build_stream::<u16>(&device, &config, Arc::clone(&shared), consumer)
            }
            other => {
                return Err(Error::Device(format!(
                    "unsupported output sample format {:?}",
                    other
                )))
            }
        }?;
        stream
            .play()
            .map_err(|e| Error::Device(format!("failed to start output stream: {}", e)))?;

        debug!(
            "opened playback device: {:?}, latency budget {}ms",
            format, latency_ms
        );

        Ok(CpalPlaybackDevice {
            format,
            latency_ms,
            shared,
            producer: Arc::new(Mutex::new(producer)),
            feeder: Mutex::new(None),
            _stream: stream,
        })
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    shared: Arc<DeviceShared>,
    mut consumer: PcmConsumer,
) -> Result<cpal::Stream>
where
    T: cpal::SizedSample + cpal::FromSample<i16>,
{
    let channels = config.channels as usize;
    let err_shared = Arc::clone(&shared);
    let mut scratch: Vec<i16> = Vec::new();
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _| {
                if shared.flush_requested.swap(false, Ordering::AcqRel) {
                    consumer.clear();
                }
                if !shared.hw_running.load(Ordering::Acquire)
                    || shared.hw_paused.load(Ordering::Acquire)
                {
                    data.fill(T::EQUILIBRIUM);
                    return;
                }
                scratch.resize(data.len(), 0);
                let read = consumer.pop_or_silence(&mut scratch);
                for (out, &sample) in data.iter_mut().zip(scratch.iter()) {
                    *out = T::from_sample(sample);
                }
                shared
                    .played_frames
                    .fetch_add((read / channels) as u64, Ordering::AcqRel);
            },
            move |err| {
                warn!("audio output stream error: {}", err);
                err_shared.cond.notify_all();
            },
            None,
        )
        .map_err(|e| Error::Device(format!("failed to build output stream: {}", e)))
}

/// Push PCM bytes into the ring, blocking (bounded polls) while it is full.
fn push_pcm(
    shared: &Arc<DeviceShared>,
    producer: &Arc<Mutex<PcmProducer>>,
    format: AudioFormat,
    buffer: &[u8],
) -> Result<()> {
    let samples = bytes_to_samples(buffer);
    let mut pushed = 0;
    while pushed < samples.len() {
        {
            let state = shared.state.lock().unwrap();
            if state.closed {
                return Err(Error::Closed);
            }
        }
        pushed += producer.lock().unwrap().push(&samples[pushed..]);
        if pushed < samples.len() {
            // Ring full; the callback drains it without notifying, so poll
            let state = shared.state.lock().unwrap();
            let _ = shared.cond.wait_timeout(state, RING_POLL).unwrap();
        }
    }
    let frames = (samples.len() / format.channels() as usize) as u64;
    shared.sent_frames.fetch_add(frames, Ordering::AcqRel);
    Ok(())
}

fn stop_internal(shared: &DeviceShared) {
    let mut state = shared.state.lock().unwrap();
    if !state.playing {
        return;
    }
    state.playing = false;
    state.paused = false;
    shared.hw_running.store(false, Ordering::Release);
    shared.hw_paused.store(false, Ordering::Release);
    shared.flush_requested.store(true, Ordering::Release);
    shared.cond.notify_all();
}

fn run_feeder(
    shared: Arc<DeviceShared>,
    producer: Arc<Mutex<PcmProducer>>,
    format: AudioFormat,
    latency_ms: u64,
    mut handler: Box<dyn PlaybackHandler>,
) {
    {
        let mut state = shared.state.lock().unwrap();
        state.feeder_thread = Some(thread::current().id());
    }

    let mut started = false;
    let result = feeder_loop(
        &shared,
        &producer,
        format,
        latency_ms,
        handler.as_mut(),
        &mut started,
    );
    if let Err(err) = result {
        handler.playback_error(err);
    }

    {
        let mut state = shared.state.lock().unwrap();
        state.feeder_active = false;
        state.feeder_thread = None;
        state.playing = false;
        state.paused = false;
        shared.hw_running.store(false, Ordering::Release);
        shared.cond.notify_all();
    }
    handler.playback_stopped();
}

fn feeder_loop(
    shared: &Arc<DeviceShared>,
    producer: &Arc<Mutex<PcmProducer>>,
    format: AudioFormat,
    latency_ms: u64,
    handler: &mut dyn PlaybackHandler,
    started: &mut bool,
) -> Result<()> {
    loop {
        // Manual stop or close ends the session
        {
            let mut state = shared.state.lock().unwrap();
            if state.closed || (*started && !state.playing) {
                return Ok(());
            }
            // Pause parks this thread; the callback is already frozen
            while state.paused && !state.closed {
                state = shared.cond.wait(state).unwrap();
            }
            if state.closed {
                return Ok(());
            }
        }

        let block = handler.playback_block();
        let block_ms = block
            .as_ref()
            .map(|b| format.bytes_to_ms(b.len()))
            .unwrap_or(0);

        if let Some(bytes) = &block {
            push_pcm(shared, producer, format, bytes)?;
        }

        let sent_frames = shared.sent_frames.load(Ordering::Acquire);

        // Start the hardware once enough lead time is queued that playback
        // cannot underrun immediately; a None block starts it to drain
        if !*started
            && (format.frames_to_ms(sent_frames) > block_ms + latency_ms || block.is_none())
        {
            *started = true;
            let mut state = shared.state.lock().unwrap();
            state.playing = true;
            state.started = true;
            shared.hw_running.store(true, Ordering::Release);
            shared.cond.notify_all();
        }

        // Last block: wait for the hardware to finish, then stop
        if block.is_none() {
            drain(shared);
            stop_internal(shared);
            return Ok(());
        }

        // Sleep while we have banked more audio than one block plus the
        // latency budget; re-checked every wakeup
        let played = shared.played_frames.load(Ordering::Acquire);
        let spare_ms = format.frames_to_ms(sent_frames.saturating_sub(played)) as i64;
        let delay = spare_ms - (block_ms + latency_ms) as i64;
        if delay > MIN_WAIT_MS {
            let state = shared.state.lock().unwrap();
            if !state.closed {
                let _ = shared
                    .cond
                    .wait_timeout(state, Duration::from_millis(delay as u64))
                    .unwrap();
            }
        }
    }
}

/// Wait until everything handed to the ring has been played out.
fn drain(shared: &Arc<DeviceShared>) {
    loop {
        let sent = shared.sent_frames.load(Ordering::Acquire);
        let played = shared.played_frames.load(Ordering::Acquire);
        if played >= sent {
            return;
        }
        let state = shared.state.lock().unwrap();
        if state.closed || !state.playing {
            return;
        }
        let _ = shared.cond.wait_timeout(state, RING_POLL).unwrap();
    }
}

impl PlaybackDevice for CpalPlaybackDevice {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn play(&self, handler: Box<dyn PlaybackHandler>, wait_for_start: bool) -> Result<()> {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.closed {
                return Err(Error::Closed);
            }
            if state.feeder_active {
                return Err(Error::InvalidState("already playing".into()));
            }
            state.feeder_active = true;
            state.started = false;
            // Fresh session counters; the previous session drained or flushed
            self.shared.played_frames.store(0, Ordering::Release);
            self.shared.sent_frames.store(0, Ordering::Release);
        }

        let shared = Arc::clone(&self.shared);
        let producer = Arc::clone(&self.producer);
        let format = self.format;
        let latency_ms = self.latency_ms;
        let thread = thread::Builder::new()
            .name("playback feeder".into())
            .spawn(move || run_feeder(shared, producer, format, latency_ms, handler))
            .map_err(Error::Io)?;
        *self.feeder.lock().unwrap() = Some(thread);

        if wait_for_start {
            let mut state = self.shared.state.lock().unwrap();
            while state.feeder_active && !state.started {
                state = self.shared.cond.wait(state).unwrap();
            }
        }
        Ok(())
    }

    fn add(&self, buffer: &[u8]) -> Result<()> {
        push_pcm(&self.shared, &self.producer, self.format, buffer)
    }

    fn start(&self) -> Result<()> {
        let mut state = self.shared.state.lock().unwrap();
        if state.playing {
            return Err(Error::InvalidState("already playing".into()));
        }
        state.playing = true;
        self.shared.hw_running.store(true, Ordering::Release);
        self.shared.cond.notify_all();
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        stop_internal(&self.shared);
        Ok(())
    }

    fn pause(&self) -> Result<()> {
        let mut state = self.shared.state.lock().unwrap();
        if !state.playing {
            return Err(Error::InvalidState("not currently playing".into()));
        }
        state.paused = true;
        self.shared.hw_paused.store(true, Ordering::Release);
        self.shared.cond.notify_all();
        Ok(())
    }

    fn resume(&self) -> Result<()> {
        let mut state = self.shared.state.lock().unwrap();
        if !state.paused {
            return Err(Error::InvalidState("not currently paused".into()));
        }
        state.paused = false;
        self.shared.hw_paused.store(false, Ordering::Release);
        self.shared.cond.notify_all();
        Ok(())
    }

    fn is_paused(&self) -> bool {
        self.shared.state.lock().unwrap().paused
    }

    fn is_playing(&self) -> bool {
        self.shared.state.lock().unwrap().playing
    }

    fn wait_for_end(&self) -> Result<()> {
        {
            let mut state = self.shared.state.lock().unwrap();
            if !state.playing {
                return Err(Error::InvalidState("not playing".into()));
            }
            if state.feeder_active {
                if state.feeder_thread == Some(thread::current().id()) {
                    return Err(Error::InvalidState(
                        "cannot call wait_for_end from the feeder thread".into(),
                    ));
                }
                while state.feeder_active {
                    state = self.shared.cond.wait(state).unwrap();
                }
                return Ok(());
            }
        }
        // Manual add() usage without a feeder: wait for the ring to play out
        drain(&self.shared);
        Ok(())
    }

    fn close(&self) {
        stop_internal(&self.shared);
        {
            let mut state = self.shared.state.lock().unwrap();
            state.closed = true;
            self.shared.cond.notify_all();
        }
        if let Some(thread) = self.feeder.lock().unwrap().take() {
            if thread.join().is_err() {
                warn!("playback feeder thread panicked");
            }
        }
        info!("playback device closed");
    }
}

impl Drop for CpalPlaybackDevice {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The start-gate and pacing arithmetic is what keeps the hardware from
    // underrunning; exercised here without a device.

    #[test]
    fn test_start_gate_requires_lead_time() {
        let format = AudioFormat::Stereo44k;
        let latency_ms = 50u64;
        // One 4608-byte block is ~26ms of stereo 44.1k audio: not enough
        let one_block_frames = (4608 / format.bytes_per_frame()) as u64;
        let block_ms = format.bytes_to_ms(4608);
        assert!(format.frames_to_ms(one_block_frames) <= block_ms + latency_ms);
        // Four blocks bank over 100ms: starts
        let four = one_block_frames * 4;
        assert!(format.frames_to_ms(four) > block_ms + latency_ms);
    }

    #[test]
    fn test_spare_time_delay_computation() {
        let format = AudioFormat::Stereo44k;
        let latency_ms = 50i64;
        let block_ms = format.bytes_to_ms(4608) as i64;
        // 500ms banked, 26ms block: sleep roughly the difference
        let sent = 44_100 / 2u64;
        let played = 0u64;
        let spare = format.frames_to_ms(sent - played) as i64;
        let delay = spare - (block_ms + latency_ms);
        assert!(delay > 400 && delay < 500);
        // Nothing banked: no sleep
        let delay_empty = 0 - (block_ms + latency_ms);
        assert!(delay_empty <= MIN_WAIT_MS);
    }
}
