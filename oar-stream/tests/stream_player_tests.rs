//! Integration tests for the stream player pipeline: a scripted decoder
//! and controllable byte sources drive the full download → decode →
//! consume path on real threads.

use std::io::Read;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use oar_audio::StreamDecoder;
use oar_common::{Error, Result, Tuning};
use oar_stream::{Stats, StreamHandler, StreamPlayer, StreamState};

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Decoder that passes input bytes through unchanged, so output order and
/// content can be compared against the original stream.
struct PassthroughDecoder {
    input: Option<Box<dyn Read + Send + Sync>>,
    chunk: usize,
    delay: Duration,
}

impl PassthroughDecoder {
    fn factory(chunk: usize, delay: Duration) -> oar_audio::DecoderFactory {
        Arc::new(move || -> Box<dyn StreamDecoder> {
            Box::new(PassthroughDecoder {
                input: None,
                chunk,
                delay,
            })
        })
    }
}

impl StreamDecoder for PassthroughDecoder {
    fn init(&mut self, input: Box<dyn Read + Send + Sync>) -> Result<()> {
        self.input = Some(input);
        Ok(())
    }

    fn decode(&mut self) -> Result<Option<Vec<u8>>> {
        let input = self
            .input
            .as_mut()
            .ok_or_else(|| Error::InvalidState("decoder not initialised".into()))?;
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        let mut buf = vec![0u8; self.chunk];
        let read = input.read(&mut buf).map_err(Error::Io)?;
        if read == 0 {
            return Ok(None);
        }
        buf.truncate(read);
        Ok(Some(buf))
    }
}

/// Decoder that always fails, to exercise the error funnel.
struct FailingDecoder;

impl StreamDecoder for FailingDecoder {
    fn init(&mut self, _input: Box<dyn Read + Send + Sync>) -> Result<()> {
        Ok(())
    }

    fn decode(&mut self) -> Result<Option<Vec<u8>>> {
        Err(Error::Decode("scripted failure".into()))
    }
}

/// Byte source fed from a channel; reads block until data or sender drop.
struct ChannelReader {
    rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
}

impl ChannelReader {
    fn new() -> (Sender<Vec<u8>>, ChannelReader) {
        let (tx, rx) = channel();
        (
            tx,
            ChannelReader {
                rx,
                pending: Vec::new(),
            },
        )
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.pending.is_empty() {
            match self.rx.recv() {
                Ok(bytes) => self.pending = bytes,
                Err(_) => return Ok(0), // sender dropped: EOF
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

#[derive(Default)]
struct TestHandler {
    states: Mutex<Vec<StreamState>>,
    errors: Mutex<Vec<String>>,
    stats: Mutex<Vec<Stats>>,
}

impl StreamHandler for TestHandler {
    fn stream_error(&self, err: Error) {
        self.errors.lock().unwrap().push(err.to_string());
    }

    fn stream_state(&self, state: StreamState) {
        self.states.lock().unwrap().push(state);
    }

    fn stream_stats(&self, stats: Stats) {
        self.stats.lock().unwrap().push(stats);
    }
}

impl TestHandler {
    fn states(&self) -> Vec<StreamState> {
        self.states.lock().unwrap().clone()
    }
}

fn test_input(len: usize) -> Vec<u8> {
    // Deterministic pseudo-random bytes
    let mut state = 0x2545f491u32;
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(1664525).wrapping_add(1013904223);
            (state >> 24) as u8
        })
        .collect()
}

/// Drain the player, asserting the misuse contract is never violated.
fn collect_all(player: &StreamPlayer) -> Vec<u8> {
    let deadline = Instant::now() + TEST_TIMEOUT;
    let mut out = Vec::new();
    loop {
        assert!(Instant::now() < deadline, "timed out draining player");
        if !player.has_next_audio() {
            std::thread::sleep(Duration::from_millis(2));
            continue;
        }
        match player.get_next_audio().expect("guarded by has_next_audio") {
            Some(block) => out.extend_from_slice(&block.pcm),
            None => return out,
        }
    }
}

#[test]
fn test_sequential_delivery_reassembles_input() {
    let input = test_input(100_000);
    let handler = Arc::new(TestHandler::default());
    let player = StreamPlayer::from_memory(
        input.clone(),
        PassthroughDecoder::factory(4608, Duration::ZERO),
        handler.clone(),
        Tuning::default(),
    )
    .unwrap();

    let produced = collect_all(&player);
    assert_eq!(produced, input, "decoder must consume blocks in order");

    assert_eq!(player.state(), StreamState::FullyLoaded);
    assert!(handler.errors.lock().unwrap().is_empty());
    player.close();
}

#[test]
fn test_backpressure_never_exceeds_queue_bound() {
    let input = test_input(500_000);
    let handler = Arc::new(TestHandler::default());
    let tuning = Tuning::default();
    let bound = tuning.audio_block_buffer;
    let player = StreamPlayer::from_memory(
        input,
        PassthroughDecoder::factory(4608, Duration::ZERO),
        handler,
        tuning,
    )
    .unwrap();

    // Give the decoder every chance to run ahead, then consume slowly,
    // sampling the queue depth throughout
    std::thread::sleep(Duration::from_millis(100));
    let deadline = Instant::now() + TEST_TIMEOUT;
    loop {
        assert!(Instant::now() < deadline, "timed out");
        assert!(
            player.queued_blocks() <= bound,
            "queue grew past the backpressure bound"
        );
        if player.has_next_audio() {
            match player.get_next_audio().unwrap() {
                Some(_) => std::thread::sleep(Duration::from_millis(1)),
                None => break,
            }
        }
    }
    player.close();
}

#[test]
fn test_state_machine_reaches_fully_loaded_through_ready() {
    let input = test_input(60_000);
    let handler = Arc::new(TestHandler::default());
    let player = StreamPlayer::from_memory(
        input,
        PassthroughDecoder::factory(4608, Duration::ZERO),
        handler.clone(),
        Tuning::default(),
    )
    .unwrap();

    let _ = collect_all(&player);
    let states = handler.states();
    let ready = states
        .iter()
        .position(|s| *s == StreamState::ReadyToPlay)
        .expect("must pass through ReadyToPlay");
    let loaded = states
        .iter()
        .position(|s| *s == StreamState::FullyLoaded)
        .expect("must reach FullyLoaded");
    assert!(ready < loaded, "ReadyToPlay must precede FullyLoaded");
    player.close();
}

#[test]
fn test_close_is_idempotent() {
    let input = test_input(50_000);
    let handler = Arc::new(TestHandler::default());
    let player = StreamPlayer::from_memory(
        input,
        PassthroughDecoder::factory(4608, Duration::ZERO),
        handler.clone(),
        Tuning::default(),
    )
    .unwrap();

    player.close();
    player.close();

    let states = handler.states();
    let closed_count = states
        .iter()
        .filter(|s| **s == StreamState::Closed)
        .count();
    assert_eq!(closed_count, 1, "closing twice must notify once");
    assert_eq!(player.state(), StreamState::Closed);
}

#[test]
fn test_rewind_replays_identical_audio() {
    let input = test_input(80_000);
    let handler = Arc::new(TestHandler::default());
    let player = StreamPlayer::from_memory(
        input.clone(),
        PassthroughDecoder::factory(4608, Duration::ZERO),
        handler,
        Tuning::default(),
    )
    .unwrap();

    let first = collect_all(&player);
    assert_eq!(first, input);

    player.rewind().unwrap();
    let second = collect_all(&player);
    assert_eq!(second, input, "rewind must re-decode from the start");
    player.close();
}

#[test]
fn test_get_next_audio_misuse_is_an_error() {
    let (tx, reader) = ChannelReader::new();
    let handler = Arc::new(TestHandler::default());
    let player = StreamPlayer::new(
        Box::new(reader),
        None,
        PassthroughDecoder::factory(4608, Duration::ZERO),
        handler,
        Tuning::default(),
    )
    .unwrap();

    // Nothing downloaded yet: the queue is empty and the stream is not
    // finished, so asking for audio is a caller error
    assert!(player.get_next_audio().is_err());

    drop(tx);
    player.close();
}

#[test]
fn test_buffer_empty_yo_yo_while_decoder_lags() {
    let input = test_input(120_000);
    let handler = Arc::new(TestHandler::default());
    // A slow decoder guarantees the consumer can outrun it
    let player = StreamPlayer::from_memory(
        input,
        PassthroughDecoder::factory(4608, Duration::from_millis(20)),
        handler.clone(),
        Tuning::default(),
    )
    .unwrap();

    let _ = collect_all(&player);

    let states = handler.states();
    assert!(
        states.contains(&StreamState::BufferEmpty),
        "draining a lagging decoder must surface BufferEmpty, saw {:?}",
        states
    );
    assert_eq!(player.state(), StreamState::FullyLoaded);
    player.close();
}

#[test]
fn test_decoder_failure_funnels_to_stream_error() {
    let input = test_input(50_000);
    let handler = Arc::new(TestHandler::default());
    let player = StreamPlayer::from_memory(
        input,
        Arc::new(|| -> Box<dyn StreamDecoder> { Box::new(FailingDecoder) }),
        handler.clone(),
        Tuning::default(),
    )
    .unwrap();

    let deadline = Instant::now() + TEST_TIMEOUT;
    while handler.errors.lock().unwrap().is_empty() {
        assert!(Instant::now() < deadline, "error never surfaced");
        std::thread::sleep(Duration::from_millis(2));
    }
    // Playback is marked finished so consumers see end-of-stream
    assert!(player.has_next_audio());
    assert!(player.get_next_audio().unwrap().is_none());
    player.close();
}

#[test]
fn test_streamed_source_with_unknown_length_completes() {
    let input = test_input(64_000);
    let (tx, reader) = ChannelReader::new();
    let handler = Arc::new(TestHandler::default());
    let player = StreamPlayer::new(
        Box::new(reader),
        None,
        PassthroughDecoder::factory(4608, Duration::ZERO),
        handler.clone(),
        Tuning::default(),
    )
    .unwrap();

    // Feed in uneven slices from another thread, then close the source
    let feeder_input = input.clone();
    let feeder = std::thread::spawn(move || {
        for slice in feeder_input.chunks(7001) {
            tx.send(slice.to_vec()).unwrap();
            std::thread::sleep(Duration::from_millis(1));
        }
        drop(tx);
    });

    let produced = collect_all(&player);
    feeder.join().unwrap();
    assert_eq!(produced, input);
    // Unknown length: percentage statistics stay unknown throughout
    assert!(handler
        .stats
        .lock()
        .unwrap()
        .iter()
        .all(|s| s.percent.is_none()));
    player.close();
}
