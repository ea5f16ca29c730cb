//! Audio device contracts and backend selection.
//!
//! Devices are chosen by an explicit factory with a capability probe:
//! a preferred device is looked up by name with fallback to the default,
//! and `force_portable` skips the probe entirely and takes the default
//! path. Selection is never done by runtime symbol lookup.
//!
//! A device instance owns its hardware handle exclusively and supports one
//! active playback or recording session at a time; a second `play`/`record`
//! is an invalid-state error.

use cpal::traits::{DeviceTrait, HostTrait};
use tracing::{debug, info, warn};

use oar_common::{AudioFormat, Error, Result};

use crate::playback::CpalPlaybackDevice;
use crate::recording::CpalRecordingDevice;

/// Callbacks driving automatic playback.
pub trait PlaybackHandler: Send {
    /// Called when a new data block is required because the device is about
    /// to run out. Return `None` when playback has reached the end.
    fn playback_block(&mut self) -> Option<Vec<u8>>;

    /// Called when playback stops because the handler ran out of blocks or
    /// playback was stopped.
    fn playback_stopped(&mut self);

    /// Called if an error occurs during playback. If the error causes
    /// playback to stop, `playback_stopped` is also called.
    fn playback_error(&mut self, err: Error);
}

/// Simple playback device.
pub trait PlaybackDevice {
    /// Audio format this device was opened with
    fn format(&self) -> AudioFormat;

    /// Play data, using the handler to fetch blocks when required.
    /// With `wait_for_start`, blocks until the hardware has actually
    /// started (pause before that point is otherwise racy).
    fn play(&self, handler: Box<dyn PlaybackHandler>, wait_for_start: bool) -> Result<()>;

    /// Add a buffer to playback. Blocks while the device buffer is full.
    fn add(&self, buffer: &[u8]) -> Result<()>;

    /// Start playback. Errors if already playing.
    fn start(&self) -> Result<()>;

    /// Stop playback. Does nothing if playback is not in progress.
    fn stop(&self) -> Result<()>;

    /// Pause existing playback. Errors if not playing.
    fn pause(&self) -> Result<()>;

    /// Resume paused playback. Errors if not paused.
    fn resume(&self) -> Result<()>;

    /// True if playback is currently paused
    fn is_paused(&self) -> bool;

    /// True if playback is in progress
    fn is_playing(&self) -> bool;

    /// Wait until queued blocks finish playing. Errors if not playing or
    /// if called from the feeder thread itself.
    fn wait_for_end(&self) -> Result<()>;

    /// Stop playback and release the device.
    fn close(&self);
}

/// Callbacks receiving recorded audio.
pub trait RecordingHandler: Send {
    /// Called whenever a block of data has been recorded. Blocks are about
    /// 100ms of 16-bit 16 kHz mono audio; `level` estimates the peak in
    /// the block (range 0-128); `stopped` marks the final block.
    fn recording_block(&mut self, data: &[u8], level: u8, stopped: bool);

    /// Called if an error occurs while recording.
    fn recording_error(&mut self, err: Error);
}

/// Simple recording device.
pub trait RecordingDevice {
    /// Begin recording into the handler. Errors if already recording.
    fn record(&self, handler: Box<dyn RecordingHandler>) -> Result<()>;

    /// Pause recording. Errors if not recording.
    fn pause(&self) -> Result<()>;

    /// Resume paused recording. Errors if not paused.
    fn resume(&self) -> Result<()>;

    /// True if recording is currently paused
    fn is_paused(&self) -> bool;

    /// Stop recording. Does nothing if already stopped.
    fn stop(&self);
}

/// List available audio output device names.
pub fn list_output_devices() -> Result<Vec<String>> {
    let host = cpal::default_host();
    let devices: Vec<String> = host
        .output_devices()
        .map_err(|e| Error::Device(format!("failed to enumerate devices: {}", e)))?
        .filter_map(|device| device.name().ok())
        .collect();
    debug!("found {} output devices", devices.len());
    Ok(devices)
}

/// Open a playback device for the given format.
///
/// `preferred` selects an output device by name (with fallback to the
/// default device); `force_portable` always takes the default path.
/// `latency_ms` is the hardware latency budget used by the feeder loop.
pub fn open_playback(
    format: AudioFormat,
    preferred: Option<&str>,
    force_portable: bool,
    latency_ms: u64,
) -> Result<Box<dyn PlaybackDevice>> {
    let device = pick_output_device(preferred, force_portable)?;
    Ok(Box::new(CpalPlaybackDevice::open(device, format, latency_ms)?))
}

/// Open the recording device (16 kHz 16-bit mono block output).
pub fn open_recording(
    preferred: Option<&str>,
    force_portable: bool,
) -> Result<Box<dyn RecordingDevice>> {
    let host = cpal::default_host();
    let device = if let Some(name) = preferred.filter(|_| !force_portable) {
        let mut devices = host
            .input_devices()
            .map_err(|e| Error::Device(format!("failed to enumerate devices: {}", e)))?;
        match devices.find(|d| d.name().ok().as_deref() == Some(name)) {
            Some(dev) => {
                info!("found requested input device: {}", name);
                dev
            }
            None => {
                warn!("input device '{}' not found, falling back to default", name);
                host.default_input_device()
                    .ok_or_else(|| Error::Device("no default input device available".into()))?
            }
        }
    } else {
        host.default_input_device()
            .ok_or_else(|| Error::Device("no default input device available".into()))?
    };
    Ok(Box::new(CpalRecordingDevice::open(device)?))
}

fn pick_output_device(preferred: Option<&str>, force_portable: bool) -> Result<cpal::Device> {
    let host = cpal::default_host();
    if force_portable {
        info!("using portable audio path (default output device)");
        return host
            .default_output_device()
            .ok_or_else(|| Error::Device("no default output device available".into()));
    }
    if let Some(name) = preferred {
        let mut devices = host
            .output_devices()
            .map_err(|e| Error::Device(format!("failed to enumerate devices: {}", e)))?;
        match devices.find(|d| d.name().ok().as_deref() == Some(name)) {
            Some(dev) => {
                info!("found requested audio device: {}", name);
                return Ok(dev);
            }
            None => {
                warn!(
                    "requested device '{}' not found, falling back to default device",
                    name
                );
            }
        }
    }
    host.default_output_device()
        .ok_or_else(|| Error::Device("no default output device available".into()))
}
