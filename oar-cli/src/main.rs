//! OAR command line - stream audio to the speakers, or record the
//! microphone to an ADPCM WAV and upload it.
//!
//! This binary is the consumer of every callback surface the library
//! exposes: the play path wires a stream player into a playback device
//! through the delivery-loop handler, the record path wires the recording
//! device into the block store and the uploader.

use std::io::Read;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use oar_audio::adpcm::{AdpcmDecoder, AdpcmRecording};
use oar_audio::mp3::Mp3Decoder;
use oar_audio::{
    open_playback, open_recording, AudioFormat, DecoderFactory, PlaybackHandler, RecordingHandler,
    StreamDecoder,
};
use oar_common::Tuning;
use oar_stream::{
    MarkResetReader, Stats, StreamHandler, StreamPlayer, StreamState, UploadHandler, Uploader,
};

/// Streaming audio recorder/player
#[derive(Parser, Debug)]
#[command(name = "oar")]
#[command(about = "Stream, record and upload compressed audio")]
#[command(version)]
struct Args {
    /// Tuning configuration file (TOML)
    #[arg(long, env = "OAR_CONFIG")]
    config: Option<PathBuf>,

    /// Always use the portable (default-device) audio path
    #[arg(long)]
    portable_audio: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stream an ADPCM WAV or MP3 from a URL or file and play it
    Play {
        /// http(s) URL or local path
        source: String,

        /// Output device name (default device if omitted)
        #[arg(long)]
        device: Option<String>,

        /// Simulate a slow connection at this many bytes per second
        #[arg(long)]
        simulate_bps: Option<u32>,
    },

    /// Record from the microphone into an ADPCM WAV file
    Record {
        /// Output .wav path
        output: PathBuf,

        /// Recording length in seconds
        #[arg(long, default_value = "10")]
        seconds: u64,

        /// Input device name (default device if omitted)
        #[arg(long)]
        device: Option<String>,

        /// Upload the recording to this URL when done
        #[arg(long)]
        upload: Option<String>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "oar=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let mut tuning = match &args.config {
        Some(path) => Tuning::load(path).context("loading tuning configuration")?,
        None => Tuning::default(),
    };

    match args.command {
        Command::Play {
            source,
            device,
            simulate_bps,
        } => {
            if let Some(bps) = simulate_bps {
                tuning.simulated_download_bps = bps;
                info!("simulating downloads at {} bytes/s", bps);
            }
            play(&source, device.as_deref(), args.portable_audio, tuning)
        }
        Command::Record {
            output,
            seconds,
            device,
            upload,
        } => record(
            &output,
            seconds,
            device.as_deref(),
            upload.as_deref(),
            args.portable_audio,
            tuning,
        ),
    }
}

// ---------------------------------------------------------------------------
// play
// ---------------------------------------------------------------------------

/// Signals shared between the stream handler, the delivery handler and
/// the main thread.
#[derive(Default)]
struct Signals {
    state: Mutex<Progress>,
    cond: Condvar,
}

#[derive(Default)]
struct Progress {
    ready: bool,
    finished: bool,
    failed: bool,
}

impl Signals {
    fn mark(&self, f: impl FnOnce(&mut Progress)) {
        let mut progress = self.state.lock().unwrap();
        f(&mut progress);
        self.cond.notify_all();
    }
}

struct CliStreamHandler {
    signals: Arc<Signals>,
}

impl StreamHandler for CliStreamHandler {
    fn stream_error(&self, err: oar_common::Error) {
        warn!("stream error: {}", err);
        self.signals.mark(|p| p.failed = true);
    }

    fn stream_state(&self, state: StreamState) {
        info!("stream state: {:?}", state);
        if matches!(state, StreamState::ReadyToPlay | StreamState::FullyLoaded) {
            self.signals.mark(|p| p.ready = true);
        }
    }

    fn stream_stats(&self, stats: Stats) {
        let wait = stats
            .estimated_wait
            .as_ms()
            .map(|ms| format!("{}ms", ms))
            .unwrap_or_else(|| "unknown".into());
        tracing::debug!(
            "downloaded {} of {} ({}), {} B/s down, {} B/s playback, wait {}",
            stats.downloaded_bytes,
            stats
                .total_bytes
                .map(|t| t.to_string())
                .unwrap_or_else(|| "?".into()),
            stats
                .percent
                .map(|p| format!("{:.1}%", p))
                .unwrap_or_else(|| "?".into()),
            stats.download_bps,
            stats.playback_bps,
            wait
        );
    }
}

/// Feeds the playback device from the player; the device calls this from
/// its delivery thread whenever it is about to run out.
struct PlayerFeed {
    player: Arc<StreamPlayer>,
    signals: Arc<Signals>,
}

impl PlaybackHandler for PlayerFeed {
    fn playback_block(&mut self) -> Option<Vec<u8>> {
        loop {
            {
                let progress = self.signals.state.lock().unwrap();
                if progress.failed {
                    return None;
                }
            }
            if self.player.has_next_audio() {
                match self.player.get_next_audio() {
                    Ok(Some(block)) => {
                        if let Some(percent) = block.percentage_played {
                            tracing::trace!("played {:.1}%", percent);
                        }
                        return Some(block.pcm);
                    }
                    Ok(None) => return None,
                    Err(err) => {
                        warn!("playback feed error: {}", err);
                        return None;
                    }
                }
            }
            // The decoder is momentarily behind; idle briefly rather than
            // ending playback (state may yo-yo on slow connections)
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    fn playback_stopped(&mut self) {
        self.signals.mark(|p| p.finished = true);
    }

    fn playback_error(&mut self, err: oar_common::Error) {
        warn!("playback error: {}", err);
        self.signals.mark(|p| p.failed = true);
    }
}

fn open_source(source: &str) -> Result<(Box<dyn Read + Send>, Option<u64>)> {
    if source.starts_with("http://") || source.starts_with("https://") {
        let response = reqwest::blocking::get(source).context("requesting stream")?;
        if !response.status().is_success() {
            bail!("server returned {}", response.status());
        }
        let length = response.content_length();
        Ok((Box::new(response), length))
    } else {
        let file = std::fs::File::open(source).context("opening input file")?;
        let length = file.metadata().ok().map(|m| m.len());
        Ok((Box::new(file), length))
    }
}

/// Pick a decoder by content: ADPCM WAV files start with a RIFF header,
/// anything else is treated as MP3.
fn sniff_decoder(input: Box<dyn Read + Send>) -> Result<(Box<dyn Read + Send>, DecoderFactory)> {
    let mut reader = MarkResetReader::new(input);
    reader.mark(16);
    let mut magic = [0u8; 4];
    let mut pos = 0;
    while pos < magic.len() {
        let n = reader.read(&mut magic[pos..]).context("sniffing stream")?;
        if n == 0 {
            break;
        }
        pos += n;
    }
    reader
        .reset()
        .map_err(|e| anyhow::anyhow!("rewinding sniffed stream: {}", e))?;

    let factory: DecoderFactory = if &magic == b"RIFF" {
        info!("detected ADPCM WAV stream");
        Arc::new(|| Box::new(AdpcmDecoder::new()) as Box<dyn StreamDecoder>)
    } else {
        info!("assuming MP3 stream");
        Arc::new(|| Box::new(Mp3Decoder::new()) as Box<dyn StreamDecoder>)
    };
    Ok((Box::new(reader), factory))
}

fn play(source: &str, device: Option<&str>, portable: bool, tuning: Tuning) -> Result<()> {
    let (input, length) = open_source(source)?;
    let (input, factory) = sniff_decoder(input)?;

    let signals = Arc::new(Signals::default());
    let handler = Arc::new(CliStreamHandler {
        signals: Arc::clone(&signals),
    });

    let playback = open_playback(
        AudioFormat::Stereo44k,
        device,
        portable,
        tuning.play_latency_ms,
    )
    .map_err(|e| anyhow::anyhow!("opening playback device: {}", e))?;

    let player = Arc::new(
        StreamPlayer::new(input, length, factory, handler, tuning)
            .map_err(|e| anyhow::anyhow!("starting stream: {}", e))?,
    );

    // Hold off until the readiness estimator clears playback to start
    {
        let mut progress = signals.state.lock().unwrap();
        while !progress.ready && !progress.failed {
            progress = signals.cond.wait(progress).unwrap();
        }
        if progress.failed {
            player.close();
            bail!("stream failed before playback could start");
        }
    }

    info!("starting playback");
    playback
        .play(
            Box::new(PlayerFeed {
                player: Arc::clone(&player),
                signals: Arc::clone(&signals),
            }),
            true,
        )
        .map_err(|e| anyhow::anyhow!("starting playback: {}", e))?;

    // Wait for the feeder to drain the stream
    {
        let mut progress = signals.state.lock().unwrap();
        while !progress.finished && !progress.failed {
            progress = signals.cond.wait(progress).unwrap();
        }
    }

    playback.close();
    player.close();

    let failed = signals.state.lock().unwrap().failed;
    if failed {
        bail!("playback did not complete cleanly");
    }
    info!("playback finished");
    Ok(())
}

// ---------------------------------------------------------------------------
// record
// ---------------------------------------------------------------------------

struct RecorderSink {
    recording: Arc<AdpcmRecording>,
    signals: Arc<Signals>,
    blocks_seen: u64,
}

impl RecordingHandler for RecorderSink {
    fn recording_block(&mut self, data: &[u8], level: u8, stopped: bool) {
        if let Err(err) = self.recording.append_pcm(data) {
            warn!("dropping recorded block: {}", err);
        }
        self.blocks_seen += 1;
        // A simple text level meter, once a second
        if self.blocks_seen % 10 == 0 {
            info!("recording... level {:>3}/128", level);
        }
        if stopped {
            self.signals.mark(|p| p.finished = true);
        }
    }

    fn recording_error(&mut self, err: oar_common::Error) {
        warn!("recording error: {}", err);
        self.signals.mark(|p| p.failed = true);
    }
}

struct UploadProgress;

impl UploadHandler for UploadProgress {
    fn upload_error(&self, err: oar_common::Error) {
        warn!("upload error: {}", err);
    }

    fn upload_status(&self, transferred: u64, total: u64) {
        tracing::debug!("uploaded {}/{} bytes", transferred, total);
    }
}

fn record(
    output: &std::path::Path,
    seconds: u64,
    device: Option<&str>,
    upload: Option<&str>,
    portable: bool,
    tuning: Tuning,
) -> Result<()> {
    let recorder = open_recording(device, portable)
        .map_err(|e| anyhow::anyhow!("opening recording device: {}", e))?;
    let recording = Arc::new(AdpcmRecording::new());
    let signals = Arc::new(Signals::default());

    info!("recording for {} seconds", seconds);
    recorder
        .record(Box::new(RecorderSink {
            recording: Arc::clone(&recording),
            signals: Arc::clone(&signals),
            blocks_seen: 0,
        }))
        .map_err(|e| anyhow::anyhow!("starting recording: {}", e))?;

    std::thread::sleep(Duration::from_secs(seconds));
    recorder.stop();

    {
        let progress = signals.state.lock().unwrap();
        if progress.failed {
            bail!("recording failed");
        }
    }

    recording
        .finish()
        .map_err(|e| anyhow::anyhow!("finalising recording: {}", e))?;
    recording
        .save(output)
        .map_err(|e| anyhow::anyhow!("saving {}: {}", output.display(), e))?;
    info!(
        "saved {} ({} blocks, {}ms)",
        output.display(),
        recording.block_count(),
        recording.duration_ms()
    );

    if let Some(url) = upload {
        info!("uploading to {}", url);
        let bytes = recording
            .to_wav_bytes()
            .map_err(|e| anyhow::anyhow!("serialising recording: {}", e))?;
        let uploader = Uploader::new(Arc::new(UploadProgress), url, bytes, &tuning)
            .map_err(|e| anyhow::anyhow!("starting upload: {}", e))?;
        if !uploader.wait() {
            bail!("upload failed");
        }
        info!("upload complete");
    }

    Ok(())
}
