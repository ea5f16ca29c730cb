//! Recording device over cpal producing 16 kHz mono blocks.
//!
//! The capture callback pushes native-format samples into a lock-free
//! ring; a recording thread pulls ~100ms batches, downmixes to mono,
//! resamples to 16 kHz and hands 16-bit blocks with a peak-level estimate
//! to the handler.
//!
//! A zero-sample read while recording is indistinguishable from a paused
//! line on some platforms, so the thread masks it with a fixed 100ms poll
//! retry rather than treating it as end of input.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{Sample, SampleFormat};
use tracing::{debug, warn};

use oar_common::{Error, Result};

use crate::device::{RecordingDevice, RecordingHandler};
use crate::resample::{samples_to_bytes, StreamResampler};
use crate::ring::{PcmConsumer, PcmProducer, PcmRing};

/// Target recording format: 16-bit 16 kHz mono
const RECORD_SAMPLE_RATE: u32 = 16_000;

/// Poll interval when the line delivers nothing
const IDLE_POLL: Duration = Duration::from_millis(100);

struct RecState {
    recording: bool,
    paused: bool,
    stop_requested: bool,
}

struct RecShared {
    state: Mutex<RecState>,
    cond: Condvar,
    /// Callback pushes samples only while set (cleared by pause/stop)
    capturing: AtomicBool,
}

/// cpal-backed recording device.
pub struct CpalRecordingDevice {
    device: cpal::Device,
    shared: Arc<RecShared>,
    stream: Mutex<Option<cpal::Stream>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl CpalRecordingDevice {
    /// Prepare the device; the input stream is built when recording starts.
    pub fn open(device: cpal::Device) -> Result<Self> {
        // Probe now so construction fails fast on unusable devices
        device
            .default_input_config()
            .map_err(|e| Error::Device(format!("failed to get input config: {}", e)))?;
        Ok(CpalRecordingDevice {
            device,
            shared: Arc::new(RecShared {
                state: Mutex::new(RecState {
                    recording: false,
                    paused: false,
                    stop_requested: false,
                }),
                cond: Condvar::new(),
                capturing: AtomicBool::new(false),
            }),
            stream: Mutex::new(None),
            thread: Mutex::new(None),
        })
    }
}

fn build_input_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    shared: Arc<RecShared>,
    mut producer: PcmProducer,
) -> Result<cpal::Stream>
where
    T: cpal::SizedSample,
    i16: cpal::FromSample<T>,
{
    let err_shared = Arc::clone(&shared);
    let mut scratch: Vec<i16> = Vec::new();
    device
        .build_input_stream(
            config,
            move |data: &[T], _| {
                if !shared.capturing.load(Ordering::Acquire) {
                    return;
                }
                scratch.clear();
                scratch.extend(data.iter().map(|&s| i16::from_sample(s)));
                producer.push_lossy(&scratch);
            },
            move |err| {
                warn!("audio input stream error: {}", err);
                err_shared.cond.notify_all();
            },
            None,
        )
        .map_err(|e| Error::Device(format!("failed to build input stream: {}", e)))
}

fn run_recording(
    shared: Arc<RecShared>,
    mut consumer: PcmConsumer,
    native_rate: u32,
    native_channels: usize,
    mut handler: Box<dyn RecordingHandler>,
) {
    // ~100ms of native-format samples per emitted block
    let batch_samples = (native_rate as usize / 10) * native_channels;
    let mut pending: Vec<i16> = Vec::with_capacity(batch_samples * 2);
    let mut scratch = vec![0i16; batch_samples];
    let mut resampler = StreamResampler::new(native_rate, 1);

    loop {
        let stop_requested = {
            let state = shared.state.lock().unwrap();
            state.stop_requested
        };

        let read = consumer.pop_into(&mut scratch);
        if read > 0 {
            pending.extend_from_slice(&scratch[..read]);
        }

        let stopped = read == 0 && stop_requested && consumer.occupied_len() == 0;
        if read == 0 && !stopped {
            // Paused or the platform briefly returned nothing; poll again
            let state = shared.state.lock().unwrap();
            let _ = shared.cond.wait_timeout(state, IDLE_POLL).unwrap();
            continue;
        }

        if pending.len() >= batch_samples || stopped {
            let take = if stopped {
                pending.len()
            } else {
                batch_samples
            };
            let batch: Vec<i16> = pending.drain(..take).collect();
            let mono = downmix(&batch, native_channels);
            match resampler.process_i16(&mono) {
                Ok(samples) => {
                    let level = peak_level(&samples);
                    let bytes = samples_to_bytes(&samples);
                    handler.recording_block(&bytes, level, stopped);
                }
                Err(err) => {
                    handler.recording_error(err);
                    break;
                }
            }
        }

        if stopped {
            break;
        }
    }

    let mut state = shared.state.lock().unwrap();
    state.recording = false;
    state.paused = false;
    shared.cond.notify_all();
}

/// Average interleaved channels down to mono.
fn downmix(samples: &[i16], channels: usize) -> Vec<i16> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks_exact(channels)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| s as i32).sum();
            (sum / channels as i32) as i16
        })
        .collect()
}

/// Peak level estimate in the 0-128 range, from the high byte of each sample.
fn peak_level(samples: &[i16]) -> u8 {
    samples
        .iter()
        .map(|&s| ((s >> 8) as i8).unsigned_abs())
        .max()
        .unwrap_or(0)
}

impl CpalRecordingDevice {
    fn start_capture(&self, handler: Box<dyn RecordingHandler>) -> Result<()> {
        let supported = self
            .device
            .default_input_config()
            .map_err(|e| Error::Device(format!("failed to get input config: {}", e)))?;
        let native_rate = supported.sample_rate().0;
        let native_channels = supported.channels() as usize;
        let config = cpal::StreamConfig {
            channels: supported.channels(),
            sample_rate: supported.sample_rate(),
            buffer_size: cpal::BufferSize::Default,
        };

        // Two seconds of native samples between callback and thread
        let ring = PcmRing::new(2 * native_rate as usize * native_channels);
        let (producer, consumer) = ring.split();

        let stream = match supported.sample_format() {
            SampleFormat::F32 => {
                build_input_stream::<f32>(&self.device, &config, Arc::clone(&self.shared), producer)
            }
            SampleFormat::I16 => {
                build_input_stream::<i16>(&self.device, &config, Arc::clone(&self.shared), producer)
            }
            SampleFormat::U16 => {
                build_input_stream::<u16>(&self.device, &config, Arc::clone(&self.shared), producer)
            }
            other => Err(Error::Device(format!(
                "unsupported input sample format {:?}",
                other
            ))),
        }?;
        stream
            .play()
            .map_err(|e| Error::Device(format!("failed to start input stream: {}", e)))?;
        self.shared.capturing.store(true, Ordering::Release);
        *self.stream.lock().unwrap() = Some(stream);

        debug!(
            "recording at native {}Hz x{} -> 16kHz mono",
            native_rate, native_channels
        );

        let shared = Arc::clone(&self.shared);
        let thread = thread::Builder::new()
            .name("audio recording".into())
            .spawn(move || run_recording(shared, consumer, native_rate, native_channels, handler))
            .map_err(Error::Io)?;
        *self.thread.lock().unwrap() = Some(thread);
        Ok(())
    }
}

impl RecordingDevice for CpalRecordingDevice {
    fn record(&self, handler: Box<dyn RecordingHandler>) -> Result<()> {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.recording {
                return Err(Error::InvalidState(
                    "this device is already recording".into(),
                ));
            }
            state.recording = true;
            state.paused = false;
            state.stop_requested = false;
        }

        let result = self.start_capture(handler);
        if result.is_err() {
            let mut state = self.shared.state.lock().unwrap();
            state.recording = false;
            self.shared.capturing.store(false, Ordering::Release);
            *self.stream.lock().unwrap() = None;
        }
        result
    }

    fn pause(&self) -> Result<()> {
        let mut state = self.shared.state.lock().unwrap();
        if !state.recording {
            return Err(Error::InvalidState("not currently recording".into()));
        }
        state.paused = true;
        self.shared.capturing.store(false, Ordering::Release);
        self.shared.cond.notify_all();
        Ok(())
    }

    fn resume(&self) -> Result<()> {
        let mut state = self.shared.state.lock().unwrap();
        if !state.paused {
            return Err(Error::InvalidState("not currently paused".into()));
        }
        state.paused = false;
        self.shared.capturing.store(true, Ordering::Release);
        self.shared.cond.notify_all();
        Ok(())
    }

    fn is_paused(&self) -> bool {
        self.shared.state.lock().unwrap().paused
    }

    fn stop(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            if !state.recording {
                return;
            }
            state.stop_requested = true;
            self.shared.capturing.store(false, Ordering::Release);
            self.shared.cond.notify_all();
        }
        if let Some(thread) = self.thread.lock().unwrap().take() {
            if thread.join().is_err() {
                warn!("recording thread panicked");
            }
        }
        *self.stream.lock().unwrap() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downmix_averages_channels() {
        assert_eq!(downmix(&[100, 200, -100, -200], 2), vec![150, -150]);
        assert_eq!(downmix(&[7, 8, 9], 1), vec![7, 8, 9]);
    }

    #[test]
    fn test_peak_level_range() {
        assert_eq!(peak_level(&[]), 0);
        assert_eq!(peak_level(&[0, 0]), 0);
        // Full-scale sample maps to the top of the 0-128 range
        assert_eq!(peak_level(&[i16::MIN]), 128);
        assert_eq!(peak_level(&[0x7f00]), 127);
        assert_eq!(peak_level(&[256]), 1);
    }
}
