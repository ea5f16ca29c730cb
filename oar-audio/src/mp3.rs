//! MP3 streaming decoder using symphonia.
//!
//! Converts all output to 44.1 kHz stereo 16-bit little-endian, one
//! decoded frame per `decode()` call. Reading blocks inside symphonia
//! while the input source waits for more downloaded data.

use std::io::Read;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder as SymphoniaDecoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::{MediaSourceStream, ReadOnlySource};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::debug;

use oar_common::{Error, Result};

use crate::decoder::StreamDecoder;
use crate::resample::{mono_to_stereo, samples_to_bytes, StreamResampler, TARGET_SAMPLE_RATE};

/// Streaming MP3 decoder.
pub struct Mp3Decoder {
    state: Option<Mp3State>,
    finished: bool,
}

struct Mp3State {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn SymphoniaDecoder>,
    track_id: u32,
    sample_buf: Option<SampleBuffer<i16>>,
    resampler: Option<StreamResampler>,
}

impl Mp3Decoder {
    pub fn new() -> Self {
        Mp3Decoder {
            state: None,
            finished: false,
        }
    }
}

impl Default for Mp3Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamDecoder for Mp3Decoder {
    fn init(&mut self, input: Box<dyn Read + Send + Sync>) -> Result<()> {
        if self.state.is_some() {
            return Err(Error::InvalidState("decoder already initialised".into()));
        }

        let source = ReadOnlySource::new(input);
        let stream = MediaSourceStream::new(Box::new(source), Default::default());
        let mut hint = Hint::new();
        hint.with_extension("mp3");

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                stream,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| Error::Decode(format!("cannot read MP3 stream: {}", e)))?;
        let format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| Error::Decode("cannot play empty MP3".into()))?;
        let track_id = track.id;

        let decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(|e| Error::Decode(format!("unsupported MP3 stream: {}", e)))?;

        debug!("mp3 stream probed, track {}", track_id);

        self.state = Some(Mp3State {
            format,
            decoder,
            track_id,
            sample_buf: None,
            resampler: None,
        });
        Ok(())
    }

    fn decode(&mut self) -> Result<Option<Vec<u8>>> {
        let state = self
            .state
            .as_mut()
            .ok_or_else(|| Error::InvalidState("decoder not initialised".into()))?;
        if self.finished {
            return Ok(None);
        }

        loop {
            let packet = match state.format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    self.finished = true;
                    return Ok(None);
                }
                Err(SymphoniaError::ResetRequired) => {
                    self.finished = true;
                    return Ok(None);
                }
                Err(e) => return Err(Error::Decode(format!("MP3 read failed: {}", e))),
            };
            if packet.track_id() != state.track_id {
                continue;
            }

            let decoded = state
                .decoder
                .decode(&packet)
                .map_err(|e| Error::Decode(format!("MP3 decode failed: {}", e)))?;
            let spec = *decoded.spec();
            if decoded.frames() == 0 {
                // Decoders occasionally emit empty frames; callers skip them
                return Ok(Some(Vec::new()));
            }

            let channels = spec.channels.count();
            if channels == 0 || channels > 2 {
                return Err(Error::Decode(format!(
                    "unsupported MP3 channel count: {}",
                    channels
                )));
            }

            let needed = decoded.capacity() * channels;
            if state
                .sample_buf
                .as_ref()
                .map(|b| b.capacity() < needed)
                .unwrap_or(true)
            {
                state.sample_buf = Some(SampleBuffer::<i16>::new(decoded.capacity() as u64, spec));
            }
            let sample_buf = state.sample_buf.as_mut().expect("sample buffer prepared");
            sample_buf.copy_interleaved_ref(decoded);
            let samples = sample_buf.samples();

            // Normalise the rate first, in the source channel layout
            let resampled = if spec.rate != TARGET_SAMPLE_RATE {
                let resampler = state
                    .resampler
                    .get_or_insert_with(|| StreamResampler::new(spec.rate, channels as u16));
                resampler.process_i16(samples)?
            } else {
                samples.to_vec()
            };

            let stereo = if channels == 1 {
                mono_to_stereo(&resampled)
            } else {
                resampled
            };
            return Ok(Some(samples_to_bytes(&stereo)));
        }
    }
}
