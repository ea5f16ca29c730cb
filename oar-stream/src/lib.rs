//! # OAR stream core (oar-stream)
//!
//! The streaming playback pipeline: a downloader appends fixed-size
//! chunks to a retained block sequence, a decoder task turns them into
//! bounded queues of playable PCM, a readiness estimator decides when
//! playback can start without running dry, and [`StreamPlayer`] ties the
//! three together behind one lock and one state machine. Also home to the
//! recording uploader and the mark/reset reader utility.

mod decode_task;
mod downloader;
pub mod mark_reset;
pub mod player;
pub mod readiness;
mod source;
pub mod upload;

pub use mark_reset::MarkResetReader;
pub use player::{AudioBlock, Stats, StreamHandler, StreamPlayer, StreamState};
pub use readiness::{playback_delay, ReadinessInputs, WaitEstimate};
pub use upload::{UploadHandler, Uploader};
