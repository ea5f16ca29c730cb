//! Stream player: download, decode ahead, and hand out playable audio.
//!
//! One player owns three background loops (downloader, decoder task and,
//! when needed, a become-ready poll timer). A single mutex guards every
//! piece of mutable state; a single condvar carries "state changed,
//! re-check your wait" wakeups for all of them. Handler callbacks are
//! invoked while that lock is held and must not call back into the
//! player; implementations are expected to be quick or to marshal work
//! elsewhere.

use std::collections::VecDeque;
use std::io::Read;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info, trace};

use oar_audio::DecoderFactory;
use oar_common::{Error, Result, StopFlag, TaskHandle, Tuning};

use crate::decode_task;
use crate::downloader;
use crate::readiness::{self, ReadinessInputs, WaitEstimate};
use crate::source::DataBlock;

/// States the stream can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Downloading but not yet ready to play
    WaitBeforePlay,
    /// Downloaded enough that playback should be able to start
    ReadyToPlay,
    /// Completely downloaded
    FullyLoaded,
    /// Fully loaded, but the audio queue is empty
    BufferEmpty,
    /// Closed (no more playback possible)
    Closed,
}

/// A block of decoded audio handed to the playback consumer.
pub struct AudioBlock {
    /// 44.1 kHz stereo 16-bit little-endian PCM
    pub pcm: Vec<u8>,
    /// Percentage of the input played up to and including this block
    /// (`None` when the total length is unknown)
    pub percentage_played: Option<f64>,
}

/// Periodic statistics snapshot for the handler.
#[derive(Debug, Clone, Copy)]
pub struct Stats {
    /// Bytes downloaded so far
    pub downloaded_bytes: u64,
    /// Expected total length, if known
    pub total_bytes: Option<u64>,
    /// Percentage downloaded (`None` when the length is unknown)
    pub percent: Option<f64>,
    /// Recent download rate in bytes per second
    pub download_bps: u64,
    /// Average playback consumption in bytes per second
    pub playback_bps: u64,
    /// Expected wait before the player becomes ready
    pub estimated_wait: WaitEstimate,
}

/// Receives callbacks when the player changes state.
///
/// Callbacks run with the player lock held: do not call back into the
/// player from them.
pub trait StreamHandler: Send + Sync {
    /// Called on a fatal error; the player will not progress any further.
    fn stream_error(&self, err: Error);

    /// Called when the stream changes to a different state.
    fn stream_state(&self, state: StreamState);

    /// Called periodically with updated statistics.
    fn stream_stats(&self, stats: Stats);
}

pub(crate) struct PlayerShared {
    pub(crate) inner: Mutex<PlayerInner>,
    pub(crate) cond: Condvar,
}

pub(crate) struct PlayerInner {
    pub(crate) blocks: Vec<DataBlock>,
    pub(crate) data_bytes: u64,
    pub(crate) download_finished: bool,
    pub(crate) play_finished: bool,
    pub(crate) next_audio: VecDeque<AudioBlock>,
    pub(crate) state: StreamState,
    pub(crate) closing: bool,
    pub(crate) total_samples_decoded: u64,
    pub(crate) first_frame_bytes: u64,
    pub(crate) first_frame_samples: u64,
    pub(crate) avg_playback_bps: f64,
    pub(crate) recent_download_bps: f64,
    pub(crate) last_block: Instant,
    pub(crate) length: Option<u64>,
    pub(crate) timer_active: bool,
}

struct PlayerTasks {
    download: Option<TaskHandle>,
    decode: Option<TaskHandle>,
    timer: Option<TaskHandle>,
}

pub(crate) struct PlayerCore {
    pub(crate) shared: PlayerShared,
    pub(crate) handler: Arc<dyn StreamHandler>,
    pub(crate) tuning: Tuning,
    pub(crate) decoder_factory: DecoderFactory,
    /// Rate limiting applies to real streams, not in-memory replays
    pub(crate) throttle: bool,
    tasks: Mutex<PlayerTasks>,
}

/// Handles streaming, delaying playback as necessary, and replay of the
/// downloaded data at a later point.
pub struct StreamPlayer {
    core: Arc<PlayerCore>,
}

impl StreamPlayer {
    /// Construct the player and begin downloading and decoding.
    ///
    /// `length` is the expected input size in bytes, if known.
    pub fn new(
        input: Box<dyn Read + Send>,
        length: Option<u64>,
        decoder_factory: DecoderFactory,
        handler: Arc<dyn StreamHandler>,
        tuning: Tuning,
    ) -> Result<StreamPlayer> {
        Self::build(input, length, decoder_factory, handler, tuning, true)
    }

    /// Construct a player over bytes already in memory (no download
    /// throttling is ever applied).
    pub fn from_memory(
        bytes: Vec<u8>,
        decoder_factory: DecoderFactory,
        handler: Arc<dyn StreamHandler>,
        tuning: Tuning,
    ) -> Result<StreamPlayer> {
        let length = Some(bytes.len() as u64);
        Self::build(
            Box::new(std::io::Cursor::new(bytes)),
            length,
            decoder_factory,
            handler,
            tuning,
            false,
        )
    }

    fn build(
        input: Box<dyn Read + Send>,
        length: Option<u64>,
        decoder_factory: DecoderFactory,
        handler: Arc<dyn StreamHandler>,
        tuning: Tuning,
        throttle: bool,
    ) -> Result<StreamPlayer> {
        let core = Arc::new(PlayerCore {
            shared: PlayerShared {
                inner: Mutex::new(PlayerInner {
                    blocks: Vec::new(),
                    data_bytes: 0,
                    download_finished: false,
                    play_finished: false,
                    next_audio: VecDeque::new(),
                    state: StreamState::WaitBeforePlay,
                    closing: false,
                    total_samples_decoded: 0,
                    first_frame_bytes: 0,
                    first_frame_samples: 0,
                    avg_playback_bps: 0.0,
                    recent_download_bps: 0.0,
                    last_block: Instant::now(),
                    length,
                    timer_active: false,
                }),
                cond: Condvar::new(),
            },
            handler,
            tuning,
            decoder_factory,
            throttle,
            tasks: Mutex::new(PlayerTasks {
                download: None,
                decode: None,
                timer: None,
            }),
        });

        let download = {
            let task_core = Arc::clone(&core);
            TaskHandle::spawn(
                "stream downloader",
                wake(&core),
                move |stop| downloader::run(task_core, input, stop),
            )?
        };
        core.tasks.lock().unwrap().download = Some(download);
        PlayerCore::spawn_decoder(&core)?;

        info!("stream player started (length: {:?})", length);
        Ok(StreamPlayer { core })
    }

    /// Current player state.
    pub fn state(&self) -> StreamState {
        self.core.shared.inner.lock().unwrap().state
    }

    /// Number of decoded audio blocks currently queued ahead of the
    /// consumer.
    pub fn queued_blocks(&self) -> usize {
        self.core.shared.inner.lock().unwrap().next_audio.len()
    }

    /// True if `get_next_audio` will succeed: either more audio is queued
    /// or the end of the stream has been reached. Observing an empty
    /// queue on a fully-loaded stream transitions to `BufferEmpty`.
    pub fn has_next_audio(&self) -> bool {
        let mut inner = self.core.shared.inner.lock().unwrap();
        if inner.next_audio.is_empty()
            && inner.state == StreamState::FullyLoaded
            && !inner.play_finished
        {
            self.core.set_state_locked(&mut inner, StreamState::BufferEmpty);
        }
        inner.play_finished || !inner.next_audio.is_empty()
    }

    /// Retrieve the next audio block without blocking.
    ///
    /// Returns `None` at the genuine end of the stream; calling with
    /// nothing available and the stream unfinished is a caller error.
    pub fn get_next_audio(&self) -> Result<Option<AudioBlock>> {
        let mut inner = self.core.shared.inner.lock().unwrap();
        if inner.next_audio.is_empty() {
            if inner.play_finished {
                return Ok(None);
            }
            return Err(Error::InvalidState("no more audio available".into()));
        }
        let block = inner.next_audio.pop_front();
        self.core.shared.cond.notify_all();
        Ok(block)
    }

    /// Rewind, ready to play the stream back from the start again.
    ///
    /// Re-decodes from the retained download; nothing is re-downloaded.
    pub fn rewind(&self) -> Result<()> {
        debug!("rewinding stream");
        let old = self.core.tasks.lock().unwrap().decode.take();
        if let Some(mut task) = old {
            task.close();
        }
        {
            let mut inner = self.core.shared.inner.lock().unwrap();
            if inner.closing {
                return Err(Error::Closed);
            }
            inner.play_finished = false;
            inner.total_samples_decoded = 0;
            inner.first_frame_bytes = 0;
            inner.first_frame_samples = 0;
            inner.next_audio.clear();
            self.core.shared.cond.notify_all();
        }
        PlayerCore::spawn_decoder(&self.core)
    }

    /// Close all background threads and abort any download in progress.
    /// Blocks until every thread has exited; calling twice is harmless.
    pub fn close(&self) {
        {
            let mut inner = self.core.shared.inner.lock().unwrap();
            if !inner.closing {
                inner.closing = true;
                self.core.set_state_locked(&mut inner, StreamState::Closed);
            }
            self.core.shared.cond.notify_all();
        }
        // Join outside the state lock so the workers can finish
        let taken = {
            let mut tasks = self.core.tasks.lock().unwrap();
            [
                tasks.download.take(),
                tasks.decode.take(),
                tasks.timer.take(),
            ]
        };
        for task in taken.into_iter().flatten() {
            let mut task = task;
            task.close();
        }
        info!("stream player closed");
    }
}

impl Drop for StreamPlayer {
    fn drop(&mut self) {
        self.close();
    }
}

/// Wake closure broadcasting on the player condvar.
fn wake(core: &Arc<PlayerCore>) -> impl Fn() + Send + Sync + 'static {
    let core = Arc::clone(core);
    move || core.shared.cond.notify_all()
}

impl PlayerCore {
    pub(crate) fn set_state_locked(&self, inner: &mut PlayerInner, state: StreamState) {
        inner.state = state;
        self.handler.stream_state(state);
        trace!("stream state: {:?}", state);
    }

    pub(crate) fn readiness_inputs(&self, inner: &PlayerInner) -> ReadinessInputs {
        ReadinessInputs {
            chunk_count: inner.blocks.len(),
            bytes_downloaded: inner.data_bytes,
            total_bytes: inner.length,
            first_frame_bytes: inner.first_frame_bytes,
            first_frame_samples: inner.first_frame_samples,
            total_samples_decoded: inner.total_samples_decoded,
            avg_playback_bps: inner.avg_playback_bps,
            recent_download_bps: inner.recent_download_bps,
        }
    }

    pub(crate) fn playback_delay_locked(&self, inner: &PlayerInner) -> WaitEstimate {
        readiness::playback_delay(&self.readiness_inputs(inner), &self.tuning)
    }

    fn stats_locked(&self, inner: &PlayerInner, estimated_wait: WaitEstimate) -> Stats {
        Stats {
            downloaded_bytes: inner.data_bytes,
            total_bytes: inner.length,
            percent: inner
                .length
                .map(|l| 100.0 * inner.data_bytes as f64 / l as f64),
            download_bps: if inner.recent_download_bps.is_finite() {
                inner.recent_download_bps as u64
            } else {
                u64::MAX
            },
            playback_bps: inner.avg_playback_bps as u64,
            estimated_wait,
        }
    }

    /// Called by the downloader when a new block becomes available.
    pub(crate) fn add_block(
        core: &Arc<PlayerCore>,
        block: Option<Vec<u8>>,
        finished: bool,
        stop: &StopFlag,
    ) {
        // Optional simulated-slow-connection delay, interruptible by close
        if core.throttle && core.tuning.simulated_download_bps > 0 {
            if let Some(bytes) = &block {
                let pause = Duration::from_millis(
                    bytes.len() as u64 * 1000 / core.tuning.simulated_download_bps as u64,
                );
                let deadline = Instant::now() + pause;
                let mut inner = core.shared.inner.lock().unwrap();
                loop {
                    let now = Instant::now();
                    if now >= deadline || inner.closing || stop.is_set() {
                        break;
                    }
                    let (guard, _) = core
                        .shared
                        .cond
                        .wait_timeout(inner, deadline - now)
                        .unwrap();
                    inner = guard;
                }
            }
        }

        let mut needs_timer = false;
        {
            let mut inner = core.shared.inner.lock().unwrap();
            if inner.closing || stop.is_set() {
                return;
            }

            let now = Instant::now();
            let arrival_delta_ms = now.duration_since(inner.last_block).as_millis() as u64;
            if let Some(bytes) = block {
                inner.data_bytes += bytes.len() as u64;
                inner.blocks.push(DataBlock {
                    bytes,
                    arrival_delta_ms,
                });
            }
            inner.last_block = now;
            core.shared.cond.notify_all();

            if finished {
                inner.download_finished = true;
            }

            // Only send FullyLoaded if we are already in ReadyToPlay
            if finished && inner.state == StreamState::ReadyToPlay {
                let stats = core.stats_locked(&inner, WaitEstimate::Ready);
                core.handler.stream_stats(stats);
                core.set_state_locked(&mut inner, StreamState::FullyLoaded);
                return;
            }

            // Rolling mean over the most recent chunk arrival times
            let window: Vec<u64> = inner
                .blocks
                .iter()
                .rev()
                .take(core.tuning.rate_window_chunks)
                .map(|b| b.arrival_delta_ms)
                .collect();
            let total_ms: u64 = window.iter().sum();
            inner.recent_download_bps = if total_ms == 0 {
                f64::INFINITY
            } else {
                (window.len() * core.tuning.chunk_size) as f64 * 1000.0 / total_ms as f64
            };

            let estimate = core.playback_delay_locked(&inner);
            let ready = estimate == WaitEstimate::Ready;

            let stats = core.stats_locked(&inner, estimate);
            core.handler.stream_stats(stats);

            // May yo-yo between WaitBeforePlay and ReadyToPlay; consumers
            // should not stop on WaitBeforePlay, only when audio runs out
            if inner.state == StreamState::WaitBeforePlay && ready {
                core.set_state_locked(&mut inner, StreamState::ReadyToPlay);
                if finished {
                    core.set_state_locked(&mut inner, StreamState::FullyLoaded);
                }
            } else if inner.state == StreamState::ReadyToPlay && !ready {
                core.set_state_locked(&mut inner, StreamState::WaitBeforePlay);
            } else if inner.state == StreamState::WaitBeforePlay && finished && !inner.timer_active
            {
                // Download finished before the decoder warmed up: poll
                // until the estimate clears
                inner.timer_active = true;
                needs_timer = true;
            }
        }
        if needs_timer {
            PlayerCore::spawn_ready_timer(core);
        }
    }

    /// Start a fresh decoder generation over the retained blocks.
    pub(crate) fn spawn_decoder(core: &Arc<PlayerCore>) -> Result<()> {
        let task_core = Arc::clone(core);
        let task = TaskHandle::spawn("audio decoder", wake(core), move |stop| {
            decode_task::run(task_core, stop)
        })?;
        PlayerCore::store_task(core, task, |tasks| &mut tasks.decode);
        Ok(())
    }

    fn spawn_ready_timer(core: &Arc<PlayerCore>) {
        let task_core = Arc::clone(core);
        let interval = Duration::from_millis(core.tuning.ready_poll_interval_ms);
        let task = TaskHandle::spawn("stream ready timer", wake(core), move |stop| {
            let core = task_core;
            let mut inner = core.shared.inner.lock().unwrap();
            loop {
                let (guard, _) = core.shared.cond.wait_timeout(inner, interval).unwrap();
                inner = guard;
                if stop.is_set() || inner.closing {
                    break;
                }
                // The decoder may have finished the job while we slept;
                // never walk an already-advanced state backwards
                if inner.state != StreamState::WaitBeforePlay {
                    break;
                }
                if core.playback_delay_locked(&inner) == WaitEstimate::Ready {
                    core.set_state_locked(&mut inner, StreamState::ReadyToPlay);
                    core.set_state_locked(&mut inner, StreamState::FullyLoaded);
                    break;
                }
            }
            inner.timer_active = false;
            core.shared.cond.notify_all();
        });
        match task {
            Ok(task) => PlayerCore::store_task(core, task, |tasks| &mut tasks.timer),
            Err(err) => {
                core.shared.inner.lock().unwrap().timer_active = false;
                core.handler.stream_error(err);
            }
        }
    }

    /// Store a task handle, closing it instead when the player is already
    /// shutting down (close may have drained the task list concurrently).
    fn store_task(
        core: &Arc<PlayerCore>,
        task: TaskHandle,
        slot: impl Fn(&mut PlayerTasks) -> &mut Option<TaskHandle>,
    ) {
        {
            let mut tasks = core.tasks.lock().unwrap();
            *slot(&mut *tasks) = Some(task);
        }
        let closing = core.shared.inner.lock().unwrap().closing;
        if closing {
            let taken = {
                let mut tasks = core.tasks.lock().unwrap();
                slot(&mut *tasks).take()
            };
            if let Some(mut task) = taken {
                task.close();
            }
        }
    }
}
