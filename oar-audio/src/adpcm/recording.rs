//! Stores the compressed blocks of a recording in progress.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::sync::Mutex;

use oar_common::Result;

use super::{encode_block, write_blocks_to_wav, Block, BLOCK_SAMPLES};

/// Thread-safe append-only store of encoded blocks, fed by the recording
/// handler and written out as a WAV file when recording finishes.
pub struct AdpcmRecording {
    inner: Mutex<Inner>,
}

struct Inner {
    blocks: Vec<Block>,
    /// PCM bytes waiting until a whole block has accumulated
    pending: Vec<u8>,
}

impl AdpcmRecording {
    pub fn new() -> Self {
        AdpcmRecording {
            inner: Mutex::new(Inner {
                blocks: Vec::new(),
                pending: Vec::new(),
            }),
        }
    }

    /// Append an already-encoded block.
    pub fn add_block(&self, block: Block) {
        self.inner.lock().unwrap().blocks.push(block);
    }

    /// Append raw 16-bit 16 kHz mono PCM, encoding every whole block as it
    /// accumulates. Leftover samples wait for the next call or `finish`.
    pub fn append_pcm(&self, pcm: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.pending.extend_from_slice(pcm);
        while inner.pending.len() >= BLOCK_SAMPLES * 2 {
            let chunk: Vec<u8> = inner.pending.drain(..BLOCK_SAMPLES * 2).collect();
            let block = encode_block(&chunk)?;
            inner.blocks.push(block);
        }
        Ok(())
    }

    /// Encode any leftover samples as a final zero-padded block.
    pub fn finish(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.pending.is_empty() {
            let chunk: Vec<u8> = inner.pending.drain(..).collect();
            let block = encode_block(&chunk)?;
            inner.blocks.push(block);
        }
        Ok(())
    }

    /// Discard the recording.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.blocks.clear();
        inner.pending.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().blocks.is_empty()
    }

    pub fn block_count(&self) -> usize {
        self.inner.lock().unwrap().blocks.len()
    }

    /// Total recording time in milliseconds (16 samples per ms at 16 kHz)
    pub fn duration_ms(&self) -> u64 {
        (BLOCK_SAMPLES as u64 * self.block_count() as u64) / 16
    }

    /// Start time of a block in milliseconds since the start of the file
    pub fn block_time_ms(index: usize) -> u64 {
        (BLOCK_SAMPLES as u64 * index as u64) / 16
    }

    /// Snapshot of a range of blocks (for display or output); clamps the
    /// count to what is available.
    pub fn blocks(&self, start: usize, count: usize) -> Vec<Block> {
        let inner = self.inner.lock().unwrap();
        let end = (start + count).min(inner.blocks.len());
        if start >= end {
            return Vec::new();
        }
        inner.blocks[start..end].to_vec()
    }

    /// Snapshot of all blocks.
    pub fn all_blocks(&self) -> Vec<Block> {
        self.inner.lock().unwrap().blocks.clone()
    }

    /// Serialize the recording as a WAV file.
    pub fn write_to<W: std::io::Write>(&self, output: &mut W) -> Result<()> {
        let blocks = self.all_blocks();
        write_blocks_to_wav(&blocks, output)
    }

    /// Save the recording as a .wav file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut output = BufWriter::new(File::create(path)?);
        self.write_to(&mut output)
    }

    /// Serialize the recording to memory (for upload).
    pub fn to_wav_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        self.write_to(&mut bytes)?;
        Ok(bytes)
    }
}

impl Default for AdpcmRecording {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::super::{BLOCK_BYTES, WAV_HEADER_BYTES};
    use super::*;

    #[test]
    fn test_append_pcm_encodes_whole_blocks() {
        let recording = AdpcmRecording::new();
        // One and a half blocks of silence
        recording
            .append_pcm(&vec![0u8; BLOCK_SAMPLES * 2])
            .unwrap();
        recording.append_pcm(&vec![0u8; BLOCK_SAMPLES]).unwrap();
        assert_eq!(recording.block_count(), 1);
        recording.finish().unwrap();
        assert_eq!(recording.block_count(), 2);
    }

    #[test]
    fn test_duration_arithmetic() {
        let recording = AdpcmRecording::new();
        recording
            .append_pcm(&vec![0u8; BLOCK_SAMPLES * 2 * 16])
            .unwrap();
        assert_eq!(recording.block_count(), 16);
        // 16 blocks of 1017 samples at 16 samples/ms
        assert_eq!(recording.duration_ms(), 1017);
        assert_eq!(AdpcmRecording::block_time_ms(16), 1017);
    }

    #[test]
    fn test_save_round_trips_through_file() {
        let recording = AdpcmRecording::new();
        recording
            .append_pcm(&vec![0u8; BLOCK_SAMPLES * 2 * 2])
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.wav");
        recording.save(&path).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), WAV_HEADER_BYTES + 2 * BLOCK_BYTES);
        assert_eq!(&bytes[0..4], b"RIFF");
        assert_eq!(bytes[20], 17);
    }

    #[test]
    fn test_block_range_clamps() {
        let recording = AdpcmRecording::new();
        recording
            .append_pcm(&vec![0u8; BLOCK_SAMPLES * 2 * 3])
            .unwrap();
        assert_eq!(recording.blocks(1, 10).len(), 2);
        assert_eq!(recording.blocks(5, 2).len(), 0);
    }
}
