//! RIFF/WAVE container writer for ADPCM recordings.
//!
//! The header layout is fixed at 60 bytes: a 20-byte `fmt ` chunk with
//! format tag 17 and two extra bytes carrying the samples-per-block count,
//! a `fact` chunk with the total sample count, then the `data` chunk of
//! whole compressed blocks.

use std::io::Write;

use oar_common::Result;

use super::{encode_block, Block, BLOCK_BYTES, BLOCK_SAMPLES, SAMPLE_RATE};

/// Total header size up to and including the `data` chunk length field
pub const WAV_HEADER_BYTES: usize = 60;

/// Write the WAV header for a file of `samples` samples.
///
/// Returns the number of whole blocks the data chunk is sized for.
pub fn write_wav_header<W: Write>(output: &mut W, samples: u32) -> Result<u32> {
    let block_samples = BLOCK_SAMPLES as u32;
    let block_bytes = BLOCK_BYTES as u32;
    let blocks = samples.div_ceil(block_samples);
    let bytes = blocks * block_bytes;

    output.write_all(b"RIFF")?;
    write_u32(output, 52 + bytes)?; // total file size after this field
    output.write_all(b"WAVE")?;
    output.write_all(b"fmt ")?;
    write_u32(output, 20)?; // fmt chunk size
    write_u16(output, 17)?; // format tag (IMA ADPCM)
    write_u16(output, 1)?; // channels
    write_u32(output, SAMPLE_RATE)?;
    // Average bytes per second, rounded to nearest
    write_u32(
        output,
        (SAMPLE_RATE * block_bytes + block_samples / 2) / block_samples,
    )?;
    write_u16(output, block_bytes as u16)?; // block align
    write_u16(output, 4)?; // bits per sample
    write_u16(output, 2)?; // extra fmt bytes
    write_u16(output, block_samples as u16)?; // samples per block
    output.write_all(b"fact")?;
    write_u32(output, 4)?; // fact chunk size
    write_u32(output, samples)?;
    output.write_all(b"data")?;
    write_u32(output, bytes)?;
    Ok(blocks)
}

/// Write already-encoded blocks as a complete WAV file.
pub fn write_blocks_to_wav<W: Write>(blocks: &[Block], output: &mut W) -> Result<()> {
    let samples = (blocks.len() * BLOCK_SAMPLES) as u32;
    let expected = write_wav_header(output, samples)?;
    debug_assert_eq!(expected as usize, blocks.len());
    for block in blocks {
        output.write_all(block.data())?;
    }
    Ok(())
}

/// Compress raw 16-bit 16 kHz mono PCM into a complete WAV file.
pub fn encode_to_wav<W: Write>(pcm: &[u8], output: &mut W) -> Result<()> {
    let samples = (pcm.len() / 2) as u32;
    let blocks = write_wav_header(output, samples)?;

    let mut pos = 0;
    for _ in 0..blocks {
        let size = (BLOCK_SAMPLES * 2).min(pcm.len() - pos);
        let block = encode_block(&pcm[pos..pos + size])?;
        output.write_all(block.data())?;
        pos += size;
    }
    Ok(())
}

fn write_u16<W: Write>(output: &mut W, value: u16) -> Result<()> {
    output.write_all(&value.to_le_bytes())?;
    Ok(())
}

fn write_u32<W: Write>(output: &mut W, value: u32) -> Result<()> {
    output.write_all(&value.to_le_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn u32_at(bytes: &[u8], offset: usize) -> u32 {
        u32::from_le_bytes([
            bytes[offset],
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
        ])
    }

    fn u16_at(bytes: &[u8], offset: usize) -> u16 {
        u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
    }

    #[test]
    fn test_header_for_two_full_blocks() {
        let mut header = Vec::new();
        let blocks = write_wav_header(&mut header, 2034).unwrap();
        assert_eq!(blocks, 2);
        assert_eq!(header.len(), WAV_HEADER_BYTES);

        let data_bytes = 2 * BLOCK_BYTES as u32;
        // RIFF total size
        assert_eq!(&header[0..4], b"RIFF");
        assert_eq!(u32_at(&header, 4), 52 + data_bytes);
        // Format tag 17, mono, 16kHz, block align 512, 4 bits per sample
        assert_eq!(u16_at(&header, 20), 17);
        assert_eq!(u16_at(&header, 22), 1);
        assert_eq!(u32_at(&header, 24), 16_000);
        assert_eq!(u16_at(&header, 32), 512);
        assert_eq!(u16_at(&header, 34), 4);
        assert_eq!(u16_at(&header, 36), 2);
        assert_eq!(u16_at(&header, 38), 1017);
        // fact chunk carries the sample count
        assert_eq!(&header[40..44], b"fact");
        assert_eq!(u32_at(&header, 48), 2034);
        // data chunk size
        assert_eq!(&header[52..56], b"data");
        assert_eq!(u32_at(&header, 56), data_bytes);
    }

    #[test]
    fn test_partial_block_rounds_up() {
        let mut header = Vec::new();
        let blocks = write_wav_header(&mut header, 2035).unwrap();
        assert_eq!(blocks, 3);
        assert_eq!(u32_at(&header, 56), 3 * BLOCK_BYTES as u32);
    }

    #[test]
    fn test_encode_to_wav_writes_whole_blocks() {
        let pcm = vec![0u8; 2034 * 2];
        let mut wav = Vec::new();
        encode_to_wav(&pcm, &mut wav).unwrap();
        assert_eq!(wav.len(), WAV_HEADER_BYTES + 2 * BLOCK_BYTES);
    }
}
