//! MJPEG-over-HTTP capture for network cameras.
//!
//! The response body is scanned for JPEG start/end markers rather than
//! parsing multipart boundaries, which tolerates the many cameras that get
//! the multipart headers subtly wrong.

use crate::camera::{CameraError, Capture};
use crate::frame::{self, Frame};
use std::io::Read;
use std::time::{Duration, Instant};

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];
const READ_CHUNK: usize = 16 * 1024;
/// Drop buffered bytes past this size when no complete JPEG has been found.
const MAX_BUFFERED: usize = 8 * 1024 * 1024;

pub struct MjpegStream {
    source: String,
    reader: Box<dyn Read + Send>,
    buf: Vec<u8>,
    sequence: u64,
    opened_at: Instant,
    last_frame: Option<Instant>,
    stale_after: Duration,
}

fn find(haystack: &[u8], needle: &[u8; 2], from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(2)
        .position(|w| w == needle)
        .map(|p| p + from)
}

impl MjpegStream {
    /// Issue the GET request and keep the body open as the frame stream.
    pub fn open(
        client: &reqwest::blocking::Client,
        url: &str,
        stale_after: Duration,
    ) -> Result<Self, CameraError> {
        let response = client
            .get(url)
            .send()
            .map_err(|e| CameraError::Http(format!("{url}: {e}")))?;
        if !response.status().is_success() {
            return Err(CameraError::Http(format!("{url}: HTTP {}", response.status())));
        }

        tracing::info!(
            url,
            content_type = ?response.headers().get(reqwest::header::CONTENT_TYPE),
            "opened MJPEG stream"
        );
        Ok(Self::from_reader(url, Box::new(response), stale_after))
    }

    pub fn from_reader(source: &str, reader: Box<dyn Read + Send>, stale_after: Duration) -> Self {
        Self {
            source: source.to_string(),
            reader,
            buf: Vec::with_capacity(READ_CHUNK * 4),
            sequence: 0,
            opened_at: Instant::now(),
            last_frame: None,
            stale_after,
        }
    }

    /// Next complete JPEG from the body.
    fn next_jpeg(&mut self) -> Result<Vec<u8>, CameraError> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(start) = find(&self.buf, &SOI, 0) {
                if let Some(end) = find(&self.buf, &EOI, start + 2) {
                    let jpeg = self.buf[start..end + 2].to_vec();
                    self.buf.drain(..end + 2);
                    return Ok(jpeg);
                }
            }

            if self.buf.len() > MAX_BUFFERED {
                tracing::warn!(source = %self.source, bytes = self.buf.len(), "discarding unterminated MJPEG data");
                self.buf.clear();
            }

            let n = self
                .reader
                .read(&mut chunk)
                .map_err(|e| CameraError::CaptureFailed(format!("{}: {e}", self.source)))?;
            if n == 0 {
                return Err(CameraError::EndOfStream);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

impl Capture for MjpegStream {
    fn read_frame(&mut self) -> Result<Frame, CameraError> {
        let jpeg = self.next_jpeg()?;
        let (rgb, width, height) = frame::decode_jpeg(&jpeg)?;
        self.sequence += 1;
        self.last_frame = Some(Instant::now());
        Ok(Frame::new(rgb, width, height, self.sequence))
    }

    fn check_health(&mut self) -> bool {
        let last = self.last_frame.unwrap_or(self.opened_at);
        last.elapsed() < self.stale_after
    }
}
