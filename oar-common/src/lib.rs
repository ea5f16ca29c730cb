//! # OAR common types (oar-common)
//!
//! Shared leaf types for the OAR streaming audio recorder/player:
//! the workspace error enum, audio format arithmetic, the
//! cancellable-background-task abstraction, and the tuning configuration.

pub mod cancel;
pub mod error;
pub mod format;
pub mod tuning;

pub use cancel::{StopFlag, TaskHandle};
pub use error::{Error, Result};
pub use format::AudioFormat;
pub use tuning::{SpeedTier, Tuning};
