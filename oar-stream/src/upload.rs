//! Upload of recorded audio as a multipart/form-data POST.
//!
//! The multipart body is assembled by hand (field `audio`, filename
//! `adpcm.wav`) and streamed in adaptive chunks so progress callbacks
//! stay meaningful on slow links: the chunk size drops to 1 KiB when
//! writes are observed to be slow and climbs back to 4 KiB when they are
//! fast. Cancellation aborts the in-flight request and joins the thread.

use std::io::Read;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::{debug, info};

use oar_common::{Error, Result, StopFlag, TaskHandle, Tuning};

/// Upload chunk sizes
const LARGE_BUFFER_SIZE: usize = 4096;
const SMALL_BUFFER_SIZE: usize = 1024;

/// Receives upload progress callbacks.
pub trait UploadHandler: Send + Sync {
    /// Called if there is an error during the upload process.
    fn upload_error(&self, err: Error);

    /// Called as bytes go out on the wire.
    fn upload_status(&self, transferred: u64, total: u64);
}

struct UploadState {
    cancelled: bool,
    finished: bool,
    succeeded: bool,
}

struct UploadShared {
    state: Mutex<UploadState>,
    cond: Condvar,
}

/// Posts data to a URL on a background thread.
pub struct Uploader {
    shared: Arc<UploadShared>,
    task: Mutex<Option<TaskHandle>>,
}

impl Uploader {
    /// Start uploading `data` to `url`. Progress and errors arrive on the
    /// handler from the upload thread.
    pub fn new(
        handler: Arc<dyn UploadHandler>,
        url: &str,
        data: Vec<u8>,
        tuning: &Tuning,
    ) -> Result<Uploader> {
        let shared = Arc::new(UploadShared {
            state: Mutex::new(UploadState {
                cancelled: false,
                finished: false,
                succeeded: false,
            }),
            cond: Condvar::new(),
        });

        let task_shared = Arc::clone(&shared);
        let wake_shared = Arc::clone(&shared);
        let url = url.to_string();
        let throttle_bps = tuning.simulated_upload_bps;
        let task = TaskHandle::spawn(
            "data uploader",
            move || wake_shared.cond.notify_all(),
            move |stop| run_upload(task_shared, handler, url, data, throttle_bps, stop),
        )?;

        Ok(Uploader {
            shared,
            task: Mutex::new(Some(task)),
        })
    }

    /// Cancel the upload and close the connection. Blocks briefly until
    /// the current chunk finishes.
    pub fn cancel(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.cancelled = true;
            self.shared.cond.notify_all();
        }
        if let Some(mut task) = self.task.lock().unwrap().take() {
            task.close();
        }
    }

    /// Block until the upload finishes; true on success.
    pub fn wait(&self) -> bool {
        let mut state = self.shared.state.lock().unwrap();
        while !state.finished {
            state = self.shared.cond.wait(state).unwrap();
        }
        state.succeeded
    }
}

/// Assemble the multipart/form-data body around the payload.
fn build_multipart_body(boundary: &str, data: &[u8]) -> Vec<u8> {
    let header = format!(
        "--{boundary}\r\n\
         Content-Disposition: form-data; name=\"audio\"; filename=\"adpcm.wav\"\r\n\
         Content-Type: audio/x-wav\r\n\
         Content-Transfer-Encoding: binary\r\n\r\n"
    );
    let footer = format!("\r\n--{boundary}--\r\n");
    let mut body = Vec::with_capacity(header.len() + data.len() + footer.len());
    body.extend_from_slice(header.as_bytes());
    body.extend_from_slice(data);
    body.extend_from_slice(footer.as_bytes());
    body
}

fn run_upload(
    shared: Arc<UploadShared>,
    handler: Arc<dyn UploadHandler>,
    url: String,
    data: Vec<u8>,
    throttle_bps: u32,
    stop: StopFlag,
) {
    let result = send(
        &shared,
        Arc::clone(&handler),
        &url,
        data,
        throttle_bps,
        stop.clone(),
    );

    let mut state = shared.state.lock().unwrap();
    match result {
        Ok(()) => {
            state.succeeded = true;
            info!("upload complete");
        }
        Err(err) => {
            // A cancelled upload is not an error worth reporting
            if !state.cancelled && !stop.is_set() {
                drop(state);
                handler.upload_error(err);
                state = shared.state.lock().unwrap();
            }
        }
    }
    state.finished = true;
    shared.cond.notify_all();
}

fn send(
    shared: &Arc<UploadShared>,
    handler: Arc<dyn UploadHandler>,
    url: &str,
    data: Vec<u8>,
    throttle_bps: u32,
    stop: StopFlag,
) -> Result<()> {
    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let boundary = format!("oar{:032x}", seed);
    let body = build_multipart_body(&boundary, &data);
    let total = body.len() as u64;
    debug!("uploading {} bytes to {}", total, url);

    let reader = ChunkedReader {
        body,
        pos: 0,
        chunk_size: SMALL_BUFFER_SIZE,
        last_read: Instant::now(),
        throttle_bps,
        shared: Arc::clone(shared),
        handler,
        stop,
        total,
    };

    let client = reqwest::blocking::Client::new();
    let response = client
        .post(url)
        .header(
            "Content-Type",
            format!("multipart/form-data; boundary={}", boundary),
        )
        .body(reqwest::blocking::Body::sized(reader, total))
        .send()
        .map_err(|e| Error::Http(format!("upload failed: {}", e)))?;

    let status = response.status().as_u16();
    if status != 200 {
        return Err(Error::Http(format!(
            "unexpected server response code: {}",
            status
        )));
    }
    Ok(())
}

/// Read adapter feeding the HTTP body in paced, progress-reporting chunks.
struct ChunkedReader {
    body: Vec<u8>,
    pos: usize,
    chunk_size: usize,
    last_read: Instant,
    throttle_bps: u32,
    shared: Arc<UploadShared>,
    handler: Arc<dyn UploadHandler>,
    stop: StopFlag,
    total: u64,
}

impl Read for ChunkedReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.stop.is_set() || self.shared.state.lock().unwrap().cancelled {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Interrupted,
                "upload cancelled",
            ));
        }
        if self.pos >= self.body.len() {
            return Ok(0);
        }

        // Adapt the chunk size to the observed pace: a modem-speed link
        // gets small chunks so progress still moves, a fast one gets
        // larger writes
        let now = Instant::now();
        let since_last = now.duration_since(self.last_read);
        if since_last > Duration::from_millis(500) && self.chunk_size == LARGE_BUFFER_SIZE {
            self.chunk_size = SMALL_BUFFER_SIZE;
        } else if since_last < Duration::from_millis(100) && self.chunk_size == SMALL_BUFFER_SIZE {
            self.chunk_size = LARGE_BUFFER_SIZE;
        }
        self.last_read = now;

        let n = buf
            .len()
            .min(self.chunk_size)
            .min(self.body.len() - self.pos);
        buf[..n].copy_from_slice(&self.body[self.pos..self.pos + n]);
        self.pos += n;

        if self.throttle_bps > 0 {
            let pause = Duration::from_millis(n as u64 * 1000 / self.throttle_bps as u64);
            let deadline = Instant::now() + pause;
            let mut state = self.shared.state.lock().unwrap();
            loop {
                let now = Instant::now();
                if now >= deadline || state.cancelled || self.stop.is_set() {
                    break;
                }
                let (guard, _) = self
                    .shared
                    .cond
                    .wait_timeout(state, deadline - now)
                    .unwrap();
                state = guard;
            }
        }

        self.handler.upload_status(self.pos as u64, self.total);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multipart_body_layout() {
        let body = build_multipart_body("bnd", b"WAVDATA");
        let text = String::from_utf8_lossy(&body);
        assert!(text.starts_with("--bnd\r\n"));
        assert!(text.contains("name=\"audio\""));
        assert!(text.contains("filename=\"adpcm.wav\""));
        assert!(text.contains("Content-Type: audio/x-wav"));
        assert!(text.contains("WAVDATA"));
        assert!(text.ends_with("\r\n--bnd--\r\n"));
    }

    #[test]
    fn test_chunked_reader_reports_progress() {
        struct Progress(Mutex<Vec<u64>>);
        impl UploadHandler for Progress {
            fn upload_error(&self, _err: Error) {}
            fn upload_status(&self, transferred: u64, _total: u64) {
                self.0.lock().unwrap().push(transferred);
            }
        }

        let shared = Arc::new(UploadShared {
            state: Mutex::new(UploadState {
                cancelled: false,
                finished: false,
                succeeded: false,
            }),
            cond: Condvar::new(),
        });
        let progress = Arc::new(Progress(Mutex::new(Vec::new())));
        let body = vec![7u8; 3000];
        let total = body.len() as u64;
        let mut reader = ChunkedReader {
            body,
            pos: 0,
            chunk_size: SMALL_BUFFER_SIZE,
            last_read: Instant::now(),
            throttle_bps: 0,
            shared,
            handler: Arc::clone(&progress) as Arc<dyn UploadHandler>,
            stop: StopFlag::new(),
            total,
        };

        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out.len(), 3000);
        let seen = progress.0.lock().unwrap();
        assert_eq!(*seen.last().unwrap(), 3000);
        // Monotone progress
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_cancelled_reader_aborts() {
        struct Quiet;
        impl UploadHandler for Quiet {
            fn upload_error(&self, _err: Error) {}
            fn upload_status(&self, _transferred: u64, _total: u64) {}
        }

        let shared = Arc::new(UploadShared {
            state: Mutex::new(UploadState {
                cancelled: true,
                finished: false,
                succeeded: false,
            }),
            cond: Condvar::new(),
        });
        let mut reader = ChunkedReader {
            body: vec![0u8; 100],
            pos: 0,
            chunk_size: SMALL_BUFFER_SIZE,
            last_read: Instant::now(),
            throttle_bps: 0,
            shared,
            handler: Arc::new(Quiet),
            stop: StopFlag::new(),
            total: 100,
        };
        let mut buf = [0u8; 10];
        assert!(reader.read(&mut buf).is_err());
    }
}
