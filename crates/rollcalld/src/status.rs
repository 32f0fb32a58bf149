use chrono::{DateTime, Utc};
use rollcall_hw::SessionState;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

/// What one camera worker last reported.
#[derive(Debug, Clone, Serialize)]
pub struct CameraStatus {
    pub source: String,
    pub state: SessionState,
    pub consecutive_failures: u32,
    pub frames_read: u64,
    pub frames_processed: u64,
    pub frame_errors: u64,
    pub events_emitted: u64,
    pub table_generation: u64,
    pub last_event_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl CameraStatus {
    fn new(source: String) -> Self {
        Self {
            source,
            state: SessionState::Disconnected,
            consecutive_failures: 0,
            frames_read: 0,
            frames_processed: 0,
            frame_errors: 0,
            events_emitted: 0,
            table_generation: 0,
            last_event_at: None,
            last_error: None,
        }
    }
}

/// Per-camera status written by workers, read by the D-Bus status call.
#[derive(Default)]
pub struct StatusBoard {
    cameras: Mutex<BTreeMap<String, CameraStatus>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, camera: &str, source: &str) {
        self.cameras
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(camera.to_string(), CameraStatus::new(source.to_string()));
    }

    /// Apply `f` to a registered camera's entry; unknown cameras are ignored.
    pub fn update(&self, camera: &str, f: impl FnOnce(&mut CameraStatus)) {
        if let Some(status) = self.cameras.lock().unwrap_or_else(PoisonError::into_inner).get_mut(camera) {
            f(status);
        }
    }

    pub fn get(&self, camera: &str) -> Option<CameraStatus> {
        self.cameras.lock().unwrap_or_else(PoisonError::into_inner).get(camera).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<String, CameraStatus> {
        self.cameras.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}
