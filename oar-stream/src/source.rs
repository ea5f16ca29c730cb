//! Retained download blocks and the blocking sequential reader over them.
//!
//! Blocks are kept for the lifetime of the player so that rewinding can
//! re-decode from position zero without re-downloading. The reader holds
//! a `(block, offset)` cursor and standard short-read semantics: it
//! blocks (releasing the player lock) only while no data at all is
//! available at the cursor, and returns EOF once the download has
//! finished and the cursor has consumed everything.

use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use oar_common::StopFlag;

use crate::player::PlayerCore;

/// One downloaded chunk plus the wall-clock delta since the previous one
/// (the raw material of the download-rate estimate).
pub(crate) struct DataBlock {
    pub(crate) bytes: Vec<u8>,
    pub(crate) arrival_delta_ms: u64,
}

/// Sequential blocking reader over the retained block sequence.
///
/// Each decoder generation gets its own reader starting at position zero;
/// the generation's stop flag turns pending and future reads into EOF so
/// a cancelled decoder can wind down.
pub(crate) struct BlockReader {
    core: Arc<PlayerCore>,
    stop: StopFlag,
    block_pos: usize,
    inner_pos: usize,
    total_pos: Arc<AtomicU64>,
}

impl BlockReader {
    pub(crate) fn new(core: Arc<PlayerCore>, stop: StopFlag) -> Self {
        BlockReader {
            core,
            stop,
            block_pos: 0,
            inner_pos: 0,
            total_pos: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Shared counter of bytes consumed through this reader; readable
    /// after the reader has been handed to a decoder.
    pub(crate) fn position(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.total_pos)
    }
}

impl Read for BlockReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let shared = &self.core.shared;
        let mut inner = shared.inner.lock().unwrap();

        // No data at the cursor: wait for the downloader, unless the
        // download is complete or this generation was cancelled
        while self.block_pos == inner.blocks.len() {
            if inner.download_finished || inner.closing || self.stop.is_set() {
                return Ok(0);
            }
            inner = shared.cond.wait(inner).unwrap();
            if inner.closing || self.stop.is_set() {
                return Ok(0);
            }
        }

        // Some data exists; serve as much as is already here (short reads
        // are expected)
        let mut total_read = 0;
        let mut off = 0;
        let mut len = buf.len();
        while self.block_pos < inner.blocks.len() && len > 0 {
            let current = &inner.blocks[self.block_pos];
            let available = current.bytes.len() - self.inner_pos;

            if available >= len {
                buf[off..off + len]
                    .copy_from_slice(&current.bytes[self.inner_pos..self.inner_pos + len]);
                self.inner_pos += len;
                total_read += len;
                if self.inner_pos == current.bytes.len() {
                    self.inner_pos = 0;
                    self.block_pos += 1;
                }
                len = 0;
            } else {
                buf[off..off + available].copy_from_slice(&current.bytes[self.inner_pos..]);
                total_read += available;
                off += available;
                len -= available;
                self.inner_pos = 0;
                self.block_pos += 1;
            }
        }

        self.total_pos.fetch_add(total_read as u64, Ordering::AcqRel);
        Ok(total_read)
    }
}
