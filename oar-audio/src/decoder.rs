//! Streaming decoder contract.
//!
//! A [`StreamDecoder`] adapts one compressed audio container to the
//! pipeline's fixed PCM output format. Implementations block inside
//! `decode()` while waiting for input bytes; the caller runs them on a
//! dedicated thread.

use std::io::Read;
use std::sync::Arc;

use oar_common::Result;

/// Incremental decoder producing 16-bit little-endian 44.1 kHz stereo PCM.
///
/// `init` must be called exactly once before the first `decode`; a decoder
/// cannot be reused after it has returned `None` (end of stream).
pub trait StreamDecoder: Send {
    /// Attach the input byte source. Called exactly once.
    fn init(&mut self, input: Box<dyn Read + Send + Sync>) -> Result<()>;

    /// Decode the next frame. Blocks until sufficient input is available.
    ///
    /// Returns `Some(pcm)` with 44.1 kHz stereo 16-bit little-endian data
    /// (possibly empty, which callers treat as a no-op), or `None` at end
    /// of stream.
    fn decode(&mut self) -> Result<Option<Vec<u8>>>;
}

/// Factory constructing a fresh decoder for each playback pass.
///
/// Rewinding re-decodes the retained download from the start, so the
/// player needs to mint new decoder instances on demand.
pub type DecoderFactory = Arc<dyn Fn() -> Box<dyn StreamDecoder> + Send + Sync>;
