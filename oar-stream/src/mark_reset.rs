//! Reader adding mark/reset (rewind-to-mark) support to any byte source.
//!
//! Bytes read after `mark` are recorded up to the given limit; `reset`
//! rewinds the cursor to the mark point, replaying recorded bytes before
//! handing reads back to the live source. Reading past the limit abandons
//! the mark. Not thread-safe.

use std::io::Read;

use oar_common::{Error, Result};

pub struct MarkResetReader<R: Read> {
    original: R,
    marking: bool,
    mark_limit: usize,
    mark_buffer: Vec<u8>,
    replaying: bool,
    replay_buffer: Vec<u8>,
    replay_pos: usize,
}

impl<R: Read> MarkResetReader<R> {
    pub fn new(original: R) -> Self {
        MarkResetReader {
            original,
            marking: false,
            mark_limit: 0,
            mark_buffer: Vec::new(),
            replaying: false,
            replay_buffer: Vec::new(),
            replay_pos: 0,
        }
    }

    /// Record up to `readlimit` bytes from this position so that `reset`
    /// can rewind to it. A new mark discards the previous one.
    pub fn mark(&mut self, readlimit: usize) {
        self.mark_limit = readlimit;
        self.mark_buffer.clear();
        self.marking = true;
    }

    /// Rewind to the mark point. Errors if no mark is in effect (never
    /// set, or abandoned because the limit was exceeded).
    pub fn reset(&mut self) -> Result<()> {
        if !self.marking {
            return Err(Error::InvalidState("reset without an active mark".into()));
        }
        self.replay_buffer = self.mark_buffer.clone();
        self.replay_pos = 0;
        self.replaying = true;
        Ok(())
    }

    /// Unwrap the underlying reader.
    pub fn into_inner(self) -> R {
        self.original
    }

    fn record(&mut self, bytes: &[u8]) {
        if !self.marking {
            return;
        }
        if self.mark_buffer.len() + bytes.len() <= self.mark_limit {
            self.mark_buffer.extend_from_slice(bytes);
        } else {
            // Read past the limit: the mark can no longer be honoured
            self.marking = false;
        }
    }
}

impl<R: Read> Read for MarkResetReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        if self.replaying {
            let left = self.replay_buffer.len() - self.replay_pos;
            if left >= buf.len() {
                buf.copy_from_slice(&self.replay_buffer[self.replay_pos..self.replay_pos + buf.len()]);
                self.replay_pos += buf.len();
                if self.replay_pos == self.replay_buffer.len() {
                    self.replaying = false;
                    self.replay_buffer = Vec::new();
                }
                return Ok(buf.len());
            }

            // Drain the replay buffer, then top up from the live source
            buf[..left].copy_from_slice(&self.replay_buffer[self.replay_pos..]);
            self.replaying = false;
            self.replay_buffer = Vec::new();
            let live = self.original.read(&mut buf[left..])?;
            if live > 0 {
                let recorded: Vec<u8> = buf[left..left + live].to_vec();
                self.record(&recorded);
            }
            return Ok(left + live);
        }

        let read = self.original.read(buf)?;
        if read > 0 {
            let recorded: Vec<u8> = buf[..read].to_vec();
            self.record(&recorded);
        }
        Ok(read)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_mark_then_reset_rewinds_exactly() {
        let data: Vec<u8> = (1..=10).collect();
        let mut reader = MarkResetReader::new(Cursor::new(data));

        let mut one = [0u8; 1];
        reader.read(&mut one).unwrap();
        assert_eq!(one, [1]);

        reader.mark(100);

        let mut six = [0u8; 6];
        reader.read(&mut six).unwrap();
        assert_eq!(six, [2, 3, 4, 5, 6, 7]);

        reader.reset().unwrap();

        let mut four = [0u8; 4];
        reader.read(&mut four).unwrap();
        assert_eq!(four, [2, 3, 4, 5]);
    }

    #[test]
    fn test_reset_without_mark_is_an_error() {
        let mut reader = MarkResetReader::new(Cursor::new(vec![1u8, 2, 3]));
        assert!(reader.reset().is_err());
    }

    #[test]
    fn test_replay_then_live_continues_in_order() {
        let data: Vec<u8> = (1..=10).collect();
        let mut reader = MarkResetReader::new(Cursor::new(data));

        reader.mark(100);
        let mut three = [0u8; 3];
        reader.read(&mut three).unwrap();
        assert_eq!(three, [1, 2, 3]);
        reader.reset().unwrap();

        // Ask for more than the replay holds: replayed bytes then live
        let mut five = [0u8; 5];
        let read = reader.read(&mut five).unwrap();
        assert_eq!(read, 5);
        assert_eq!(five, [1, 2, 3, 4, 5]);

        // A second reset replays from the same mark point
        reader.reset().unwrap();
        let mut two = [0u8; 2];
        reader.read(&mut two).unwrap();
        assert_eq!(two, [1, 2]);
    }

    #[test]
    fn test_exceeding_limit_abandons_mark() {
        let data: Vec<u8> = (1..=10).collect();
        let mut reader = MarkResetReader::new(Cursor::new(data));

        reader.mark(2);
        let mut four = [0u8; 4];
        reader.read(&mut four).unwrap();
        assert!(reader.reset().is_err());
    }
}
