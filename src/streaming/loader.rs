//! Stream I/O off the real-time path.
//!
//! The streaming layer sends chunk refill requests over a channel; the loader reads
//! them from the stream's reader and sends the filled chunk back. Chunk buffers travel
//! with the request and come back with the result, so the mixing side never
//! allocates for a refill.

use super::StreamId;
use super::reader::StreamReader;
use crate::error::{CitySonicError, Result, lock};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

pub(crate) type SharedReader = Arc<Mutex<Box<dyn StreamReader>>>;

/// Fill one chunk with `frames` frames starting at `start_frame`.
pub(crate) struct LoadRequest {
    pub stream: StreamId,
    pub chunk: usize,
    pub epoch: u64,
    pub start_frame: u64,
    pub frames: usize,
    /// Stereo interleaved destination, `2 * frames` long on return.
    pub buffer: Vec<f32>,
    pub reader: SharedReader,
}

pub(crate) struct LoadResult {
    pub stream: StreamId,
    pub chunk: usize,
    pub epoch: u64,
    pub buffer: Vec<f32>,
    pub frames: usize,
    pub error: Option<String>,
}

/// Services refill requests, either on a dedicated thread or when pumped.
pub struct StreamLoader {
    requests: Receiver<LoadRequest>,
    results: Sender<LoadResult>,
    scratch: Vec<f32>,
}

impl StreamLoader {
    pub(crate) fn new(requests: Receiver<LoadRequest>, results: Sender<LoadResult>) -> Self {
        Self {
            requests,
            results,
            scratch: Vec::new(),
        }
    }

    /// Service every queued request on the calling thread. Returns how many were handled.
    pub fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(request) = self.requests.try_recv() {
            self.handle(request);
            handled += 1;
        }
        handled
    }

    fn handle(&mut self, request: LoadRequest) {
        let result = self.service(request);
        if self.results.send(result).is_err() {
            log::debug!("Streaming layer gone, dropping load result");
        }
    }

    fn service(&mut self, request: LoadRequest) -> LoadResult {
        let LoadRequest {
            stream,
            chunk,
            epoch,
            start_frame,
            frames,
            mut buffer,
            reader,
        } = request;

        let outcome = read_stereo(&reader, start_frame, frames, &mut buffer, &mut self.scratch);
        let (frames, error) = match outcome {
            Ok(frames) => (frames, None),
            Err(e) => {
                log::error!("Stream {} read failed: {}", stream, e);
                (0, Some(e.to_string()))
            }
        };
        LoadResult {
            stream,
            chunk,
            epoch,
            buffer,
            frames,
            error,
        }
    }

    /// Move the loader onto a named I/O thread.
    pub fn spawn(mut self) -> Result<LoaderThread> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let handle = std::thread::Builder::new()
            .name("citysonic-stream-io".into())
            .spawn(move || {
                log::debug!("Stream I/O thread started");
                while flag.load(Ordering::Relaxed) {
                    match self.requests.recv_timeout(Duration::from_millis(20)) {
                        Ok(request) => self.handle(request),
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                log::debug!("Stream I/O thread stopped");
            })
            .map_err(|e| CitySonicError::Engine(format!("Failed to spawn stream I/O thread: {}", e)))?;
        Ok(LoaderThread {
            running,
            handle: Some(handle),
        })
    }
}

/// Handle to a spawned loader. Stops and joins the thread on drop.
pub struct LoaderThread {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for LoaderThread {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Stream I/O thread panicked");
            }
        }
    }
}

/// Read up to `frames` frames at `start_frame` into `buffer` as stereo interleaved.
/// Mono is duplicated to both sides; channels past the second are dropped.
fn read_stereo(
    reader: &SharedReader,
    start_frame: u64,
    frames: usize,
    buffer: &mut Vec<f32>,
    scratch: &mut Vec<f32>,
) -> Result<usize> {
    let mut reader = lock(reader, "stream reader")?;
    let channels = reader.format().channels.max(1) as usize;
    if reader.position() != start_frame {
        reader.seek(start_frame)?;
    }

    scratch.clear();
    scratch.resize(frames * channels, 0.0);
    let mut read = 0;
    while read < frames {
        let n = reader.read(&mut scratch[read * channels..])?;
        if n == 0 {
            break;
        }
        read += n;
    }

    buffer.clear();
    buffer.reserve(frames * 2);
    for frame in scratch[..read * channels].chunks_exact(channels) {
        let left = frame[0];
        let right = if channels > 1 { frame[1] } else { left };
        buffer.push(left);
        buffer.push(right);
    }
    Ok(read)
}
