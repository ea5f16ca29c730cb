//! Download loop: read the input in fixed-size chunks and hand them to
//! the player.
//!
//! A partial chunk at EOF is delivered as the final block; EOF with
//! nothing pending still signals completion so waiters wake up. I/O
//! faults funnel through the player's error callback.

use std::io::Read;
use std::sync::Arc;

use tracing::debug;

use oar_common::{Error, StopFlag};

use crate::player::PlayerCore;

pub(crate) fn run(core: Arc<PlayerCore>, mut input: Box<dyn Read + Send>, stop: StopFlag) {
    debug!("downloader started");
    loop {
        let mut buffer = vec![0u8; core.tuning.chunk_size];

        // Fill a whole chunk, or as much as exists before EOF
        let mut pos = 0;
        loop {
            match input.read(&mut buffer[pos..]) {
                Ok(0) => {
                    if pos != 0 {
                        buffer.truncate(pos);
                        PlayerCore::add_block(&core, Some(buffer), true, &stop);
                    } else {
                        PlayerCore::add_block(&core, None, true, &stop);
                    }
                    debug!("download finished");
                    return;
                }
                Ok(read) => {
                    if stop.is_set() {
                        return;
                    }
                    pos += read;
                    if pos == buffer.len() {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    core.handler.stream_error(Error::Io(e));
                    return;
                }
            }
        }

        PlayerCore::add_block(&core, Some(buffer), false, &stop);
        if stop.is_set() {
            return;
        }
    }
}
