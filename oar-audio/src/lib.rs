//! # OAR audio (oar-audio)
//!
//! Platform audio devices and codecs for the OAR recorder/player:
//! playback and recording over cpal, the lock-free PCM ring buffer, the
//! streaming decoder contract with its IMA ADPCM and MP3 implementations,
//! resampling, and the ADPCM WAV container.

pub mod adpcm;
pub mod decoder;
pub mod device;
pub mod mp3;
pub mod playback;
pub mod recording;
pub mod resample;
pub mod ring;

pub use decoder::{DecoderFactory, StreamDecoder};
pub use device::{
    list_output_devices, open_playback, open_recording, PlaybackDevice, PlaybackHandler,
    RecordingDevice, RecordingHandler,
};
pub use oar_common::{AudioFormat, Error, Result};
