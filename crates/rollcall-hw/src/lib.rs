//! rollcall-hw: Camera capture for attendance pipelines.
//!
//! Local cameras go through V4L2, network cameras through MJPEG over HTTP or,
//! with the `rtsp` feature, RTSP decoded by FFmpeg.
//! [`CameraSession`] wraps either behind a reconnecting state machine.

pub mod camera;
pub mod frame;
pub mod mjpeg;
#[cfg(feature = "rtsp")]
pub mod rtsp;
pub mod session;

pub use camera::{Camera, CameraError, CameraSource, Capture, Connector, DeviceInfo, PixelFormat, SystemConnector};
pub use frame::{Frame, FrameError};
pub use mjpeg::MjpegStream;
#[cfg(feature = "rtsp")]
pub use rtsp::RtspStream;
pub use session::{CameraSession, SessionPolicy, SessionState};
