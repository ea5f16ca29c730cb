//! IMA ADPCM block encoder.

use oar_common::{Error, Result};

use super::{clamp_step_index, value_adjust, BLOCK_BYTES, BLOCK_SAMPLES, STEP_INCREMENT, STEP_SIZE};

/// One encoded block, with the level statistics gathered while encoding
/// (used by waveform displays).
#[derive(Debug, Clone)]
pub struct Block {
    data: [u8; BLOCK_BYTES],
    max_level: i32,
    min_level: i32,
}

impl Block {
    /// Compressed data, ready for the WAV `data` chunk
    pub fn data(&self) -> &[u8; BLOCK_BYTES] {
        &self.data
    }

    /// Maximum sample value seen in the block
    pub fn max_level(&self) -> i32 {
        self.max_level
    }

    /// Minimum sample value seen in the block
    pub fn min_level(&self) -> i32 {
        self.min_level
    }
}

/// Encode one block of 16-bit little-endian mono samples.
///
/// Input shorter than a whole block is zero-padded; longer input is an
/// error.
pub fn encode_block(input: &[u8]) -> Result<Block> {
    if input.len() > BLOCK_SAMPLES * 2 {
        return Err(Error::InvalidState(format!(
            "cannot encode block larger than {} samples",
            BLOCK_SAMPLES
        )));
    }
    let mut data = [0u8; BLOCK_SAMPLES * 2];
    data[..input.len()].copy_from_slice(input);

    let mut adpcm = [0u8; BLOCK_BYTES];
    let mut out_pos = 0;

    // Initial sample is stored uncompressed
    let mut last_output = i16::from_le_bytes([data[0], data[1]]) as i32;
    adpcm[out_pos] = data[0];
    adpcm[out_pos + 1] = data[1];
    out_pos += 2;
    let mut max_level = last_output;
    let mut min_level = last_output;

    // Pick the initial step index closest to the first transition
    let next_sample = i16::from_le_bytes([data[2], data[3]]) as i32;
    let initial_difference = (next_sample - last_output).abs();
    let mut step_index = STEP_SIZE
        .iter()
        .position(|&step| step > initial_difference)
        .unwrap_or(STEP_SIZE.len()) as i32;
    if step_index > 0 {
        step_index -= 1;
    }
    adpcm[out_pos] = step_index as u8;
    out_pos += 1;

    // Reserved byte
    adpcm[out_pos] = 0;
    out_pos += 1;

    let mut high_nibble = false;
    for i in (2..data.len()).step_by(2) {
        let target = i16::from_le_bytes([data[i], data[i + 1]]) as i32;
        max_level = max_level.max(target);
        min_level = min_level.min(target);

        let difference = target - last_output;
        let step = STEP_SIZE[step_index as usize];

        let mut delta = ((difference.abs() << 2) / step).min(7) as u8;
        if difference < 0 {
            delta |= 0x08;
        }

        if high_nibble {
            adpcm[out_pos] |= (delta & 0xf) << 4;
            high_nibble = false;
            out_pos += 1;
        } else {
            adpcm[out_pos] = delta & 0xf;
            high_nibble = true;
        }

        // Track the value the decoder will reconstruct
        let magnitude = delta & 0x07;
        let adjust = value_adjust(magnitude, step);
        if delta & 0x08 != 0 {
            last_output = (last_output - adjust).max(-0x8000);
        } else {
            last_output = (last_output + adjust).min(0x7fff);
        }

        step_index = clamp_step_index(step_index + STEP_INCREMENT[magnitude as usize]);
    }

    debug_assert_eq!(out_pos, adpcm.len());

    Ok(Block {
        data: adpcm,
        max_level,
        min_level,
    })
}
