//! Stand-ins for inference, capture and storage used across daemon tests.

use rollcall_core::{
    AttendanceEvent, BoundingBox, DetectFaces, DetectorError, Embedding, EventSink, ExtractEmbedding, Identity,
    IdentityTable, RecognizerError, RgbView, SinkError,
};
use rollcall_hw::Frame;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Instant;

/// One full-frame face whenever the image is not pure black.
pub struct ColorDetector;

impl DetectFaces for ColorDetector {
    fn detect_faces(&mut self, image: RgbView<'_>, _max_faces: usize) -> Result<Vec<BoundingBox>, DetectorError> {
        if !image.is_complete() {
            return Err(DetectorError::InvalidFrame("short buffer".into()));
        }
        if image.data.iter().all(|&p| p == 0) {
            return Ok(vec![]);
        }
        Ok(vec![BoundingBox {
            x: 0.0,
            y: 0.0,
            width: image.width as f32,
            height: image.height as f32,
            confidence: 0.9,
            landmarks: None,
        }])
    }
}

/// Embedding is the colour of the top-left pixel.
pub struct ColorRecognizer;

impl ExtractEmbedding for ColorRecognizer {
    fn extract_embedding(&mut self, image: RgbView<'_>, _face: &BoundingBox) -> Result<Embedding, RecognizerError> {
        Ok(Embedding::new(image.pixel(0, 0).iter().map(|&c| c as f32).collect()))
    }
}

pub const RED: [u8; 3] = [255, 0, 0];
pub const GREEN: [u8; 3] = [0, 255, 0];
pub const BLUE: [u8; 3] = [0, 0, 255];
pub const BLACK: [u8; 3] = [0, 0, 0];

pub fn solid_frame(color: [u8; 3], timestamp: Instant) -> Frame {
    let data = color.iter().copied().cycle().take(4 * 4 * 3).collect();
    let mut frame = Frame::new(data, 4, 4, 0);
    frame.timestamp = timestamp;
    frame
}

/// Identity whose single embedding is `color`.
pub fn identity(name: &str, color: [u8; 3]) -> Identity {
    Identity::new(name, vec![Embedding::new(color.iter().map(|&c| c as f32).collect())])
}

pub fn table(entries: &[(&str, [u8; 3])], generation: u64) -> IdentityTable {
    IdentityTable::new(entries.iter().map(|(n, c)| identity(n, *c)).collect(), generation)
}

pub fn write_face(root: &Path, person: &str, file: &str, color: [u8; 3]) {
    let dir = root.join(person);
    std::fs::create_dir_all(&dir).unwrap();
    image::RgbImage::from_pixel(8, 8, image::Rgb(color)).save(dir.join(file)).unwrap();
}

/// In-memory `EventSink` that can be told to fail.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<AttendanceEvent>>,
    failing: AtomicBool,
}

impl MemorySink {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<AttendanceEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl EventSink for MemorySink {
    fn log_event(&self, event: &AttendanceEvent) -> Result<(), SinkError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SinkError::Write("disk full".into()));
        }
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}
