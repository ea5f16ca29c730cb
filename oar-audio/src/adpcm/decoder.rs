//! IMA ADPCM block decoder and the streaming WAV decoder built on it.

use std::io::Read;

use oar_common::{Error, Result};

use super::{
    clamp_step_index, value_adjust, BLOCK_BYTES, BLOCK_SAMPLES, SAMPLE_RATE, STEP_INCREMENT,
    STEP_SIZE, WAV_HEADER_BYTES,
};
use crate::decoder::StreamDecoder;
use crate::resample::{bytes_to_samples, mono_to_stereo, samples_to_bytes, StreamResampler};

/// Decode one compressed block into 16-bit little-endian mono samples.
pub fn decode_block(adpcm: &[u8]) -> Result<Vec<u8>> {
    if adpcm.len() < BLOCK_BYTES {
        return Err(Error::Decode(format!(
            "ADPCM block too short: {} bytes",
            adpcm.len()
        )));
    }

    let mut data = vec![0u8; BLOCK_SAMPLES * 2];
    let mut out_pos = 0;
    let mut in_pos = 0;

    // First sample travels uncompressed
    data[0] = adpcm[0];
    data[1] = adpcm[1];
    out_pos += 2;
    let mut last_output = i16::from_le_bytes([adpcm[0], adpcm[1]]) as i32;
    in_pos += 2;

    let mut step_index = clamp_step_index(adpcm[in_pos] as i32);
    in_pos += 2; // step index byte + reserved byte

    let mut high_nibble = false;
    for _ in 1..BLOCK_SAMPLES {
        let delta = if high_nibble {
            let d = (adpcm[in_pos] & 0xf0) >> 4;
            high_nibble = false;
            in_pos += 1;
            d
        } else {
            let d = adpcm[in_pos] & 0x0f;
            high_nibble = true;
            d
        };

        let step = STEP_SIZE[step_index as usize];
        let magnitude = delta & 0x07;
        let adjust = value_adjust(magnitude, step);

        if delta & 0x08 != 0 {
            last_output = (last_output - adjust).max(-0x8000);
        } else {
            last_output = (last_output + adjust).min(0x7fff);
        }

        step_index = clamp_step_index(step_index + STEP_INCREMENT[magnitude as usize]);

        let bytes = (last_output as i16).to_le_bytes();
        data[out_pos] = bytes[0];
        data[out_pos + 1] = bytes[1];
        out_pos += 2;
    }

    Ok(data)
}

/// Streaming decoder for ADPCM WAV files.
///
/// Reads the 60-byte container header once, then one 512-byte block per
/// `decode()` call, producing 44.1 kHz stereo PCM.
pub struct AdpcmDecoder {
    input: Option<Box<dyn Read + Send + Sync>>,
    header_read: bool,
    finished: bool,
    resampler: StreamResampler,
}

impl AdpcmDecoder {
    pub fn new() -> Self {
        AdpcmDecoder {
            input: None,
            header_read: false,
            finished: false,
            resampler: StreamResampler::new(SAMPLE_RATE, 1),
        }
    }
}

impl Default for AdpcmDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Read until `buf` is full or EOF; returns the number of bytes read.
fn read_full(input: &mut dyn Read, buf: &mut [u8]) -> Result<usize> {
    let mut pos = 0;
    while pos < buf.len() {
        match input.read(&mut buf[pos..]) {
            Ok(0) => break,
            Ok(n) => pos += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::Io(e)),
        }
    }
    Ok(pos)
}

impl StreamDecoder for AdpcmDecoder {
    fn init(&mut self, input: Box<dyn Read + Send + Sync>) -> Result<()> {
        if self.input.is_some() {
            return Err(Error::InvalidState("decoder already initialised".into()));
        }
        self.input = Some(input);
        Ok(())
    }

    fn decode(&mut self) -> Result<Option<Vec<u8>>> {
        let input = self
            .input
            .as_mut()
            .ok_or_else(|| Error::InvalidState("decoder not initialised".into()))?;
        if self.finished {
            return Ok(None);
        }

        if !self.header_read {
            let mut header = [0u8; WAV_HEADER_BYTES];
            let read = read_full(input.as_mut(), &mut header)?;
            if read != header.len() {
                return Err(Error::Decode("unexpected EOF in ADPCM header".into()));
            }
            // Byte 20 is the format tag
            if header[20] != 17 {
                return Err(Error::Decode(
                    "does not appear to be an ADPCM WAV file".into(),
                ));
            }
            self.header_read = true;
        }

        let mut block = [0u8; BLOCK_BYTES];
        let read = read_full(input.as_mut(), &mut block)?;
        if read == 0 {
            self.finished = true;
            return Ok(None);
        }
        if read != block.len() {
            return Err(Error::Decode("unexpected EOF in ADPCM decoding".into()));
        }

        let decoded = decode_block(&block)?;
        let samples = bytes_to_samples(&decoded);
        let resampled = self.resampler.process_i16(&samples)?;
        Ok(Some(samples_to_bytes(&mono_to_stereo(&resampled))))
    }
}

#[cfg(test)]
mod tests {
    use super::super::{encode_to_wav, BLOCK_SAMPLES};
    use super::*;
    use std::io::Cursor;

    fn silent_wav(samples: usize) -> Vec<u8> {
        let pcm = vec![0u8; samples * 2];
        let mut wav = Vec::new();
        encode_to_wav(&pcm, &mut wav).unwrap();
        wav
    }

    #[test]
    fn test_streaming_decode_of_whole_file() {
        let wav = silent_wav(BLOCK_SAMPLES * 2);
        let mut decoder = AdpcmDecoder::new();
        decoder.init(Box::new(Cursor::new(wav))).unwrap();

        let mut blocks = 0;
        let mut total_bytes = 0;
        while let Some(pcm) = decoder.decode().unwrap() {
            blocks += 1;
            total_bytes += pcm.len();
            // 44.1kHz stereo output is silent too
            assert!(pcm.iter().all(|&b| b == 0));
        }
        assert_eq!(blocks, 2);
        // 16k mono upsampled to 44.1k stereo: 4 bytes per output frame
        let expected = (2.0 * BLOCK_SAMPLES as f64 * 44_100.0 / 16_000.0) as usize * 4;
        assert!(total_bytes.abs_diff(expected) < BLOCK_SAMPLES);
        // EOF is sticky
        assert!(decoder.decode().unwrap().is_none());
    }

    #[test]
    fn test_rejects_non_adpcm_header() {
        let mut bogus = silent_wav(BLOCK_SAMPLES);
        bogus[20] = 1; // plain PCM format tag
        let mut decoder = AdpcmDecoder::new();
        decoder.init(Box::new(Cursor::new(bogus))).unwrap();
        assert!(decoder.decode().is_err());
    }

    #[test]
    fn test_truncated_block_is_an_error() {
        let mut wav = silent_wav(BLOCK_SAMPLES);
        wav.truncate(wav.len() - 10);
        let mut decoder = AdpcmDecoder::new();
        decoder.init(Box::new(Cursor::new(wav))).unwrap();
        assert!(decoder.decode().is_err());
    }
}
