//! Camera sources and capture handles.
//!
//! A [`Connector`] turns a [`CameraSource`] into an exclusively owned
//! [`Capture`] handle. The system connector speaks V4L2 (via the `v4l` crate)
//! for local devices, MJPEG over HTTP for network cameras, and RTSP through
//! FFmpeg when built with the `rtsp` feature.

use crate::frame::{self, Frame, FrameError};
use crate::mjpeg::MjpegStream;
#[cfg(feature = "rtsp")]
use crate::rtsp::RtspStream;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture as _;
use v4l::FourCC;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
    #[error("stream request failed: {0}")]
    Http(String),
    #[error("end of stream")]
    EndOfStream,
    #[error("health check failed")]
    HealthCheckFailed,
    #[error("not connected")]
    NotConnected,
    #[error("unsupported camera source: {0} (use a device index, /dev/videoN, an http(s) MJPEG URL or an rtsp:// URL)")]
    UnsupportedSource(String),
    #[error("{0} needs a build with the `rtsp` feature")]
    RtspDisabled(String),
    #[error("bad frame: {0}")]
    Frame(#[from] FrameError),
}

impl CameraError {
    /// A bad frame leaves the connection usable; everything else means the handle is lost.
    pub fn is_transient(&self) -> bool {
        matches!(self, CameraError::Frame(_))
    }
}

/// Where frames come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CameraSource {
    /// Local V4L2 device path, e.g. `/dev/video0`.
    V4l2(String),
    /// Network camera serving `multipart/x-mixed-replace` JPEG frames.
    Mjpeg(String),
    /// Network camera speaking RTSP, e.g. an IP camera's `/streaming/channels/101/`.
    Rtsp(String),
}

impl FromStr for CameraSource {
    type Err = CameraError;

    /// `0` → `/dev/video0`, `/dev/...` → V4L2, `http(s)://...` → MJPEG,
    /// `rtsp(s)://...` → RTSP.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(index) = s.parse::<u32>() {
            return Ok(CameraSource::V4l2(format!("/dev/video{index}")));
        }
        if s.starts_with("/dev/") {
            return Ok(CameraSource::V4l2(s.to_string()));
        }
        if s.starts_with("http://") || s.starts_with("https://") {
            return Ok(CameraSource::Mjpeg(s.to_string()));
        }
        if s.starts_with("rtsp://") || s.starts_with("rtsps://") {
            if cfg!(feature = "rtsp") {
                return Ok(CameraSource::Rtsp(s.to_string()));
            }
            return Err(CameraError::RtspDisabled(s.to_string()));
        }
        Err(CameraError::UnsupportedSource(s.to_string()))
    }
}

impl fmt::Display for CameraSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CameraSource::V4l2(path) => write!(f, "{path}"),
            CameraSource::Mjpeg(url) | CameraSource::Rtsp(url) => write!(f, "{url}"),
        }
    }
}

/// An open, exclusively owned capture handle. Dropping it releases the device.
pub trait Capture: Send {
    /// Block until the next frame is available.
    fn read_frame(&mut self) -> Result<Frame, CameraError>;
    /// Cheap liveness probe, run on the session's health-check interval.
    fn check_health(&mut self) -> bool;
}

/// Opens capture handles for camera sources.
pub trait Connector: Send {
    fn connect(&mut self, source: &CameraSource) -> Result<Box<dyn Capture>, CameraError>;
}

/// Connector for real hardware and network streams.
pub struct SystemConnector {
    http: reqwest::blocking::Client,
    stale_after: Duration,
}

impl SystemConnector {
    /// `stale_after` bounds how long a network stream may go without a frame
    /// before its health check fails, and how long a single read may block.
    pub fn new(connect_timeout: Duration, stale_after: Duration) -> Result<Self, CameraError> {
        let http = reqwest::blocking::Client::builder()
            .connect_timeout(connect_timeout)
            // The blocking client applies this to each read of the body, not to the whole stream.
            .timeout(stale_after)
            .build()
            .map_err(|e| CameraError::Http(e.to_string()))?;
        Ok(Self { http, stale_after })
    }
}

impl Connector for SystemConnector {
    fn connect(&mut self, source: &CameraSource) -> Result<Box<dyn Capture>, CameraError> {
        match source {
            CameraSource::V4l2(path) => Ok(Box::new(Camera::open(path)?)),
            CameraSource::Mjpeg(url) => Ok(Box::new(MjpegStream::open(&self.http, url, self.stale_after)?)),
            #[cfg(feature = "rtsp")]
            CameraSource::Rtsp(url) => Ok(Box::new(RtspStream::open(url, self.stale_after)?)),
            #[cfg(not(feature = "rtsp"))]
            CameraSource::Rtsp(url) => Err(CameraError::RtspDisabled(url.clone())),
        }
    }
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel).
    Yuyv,
    /// Motion JPEG, one JPEG per buffer.
    Mjpeg,
    /// 8-bit grayscale.
    Grey,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"MJPG" => Some(PixelFormat::Mjpeg),
            b"GREY" => Some(PixelFormat::Grey),
            _ => None,
        }
    }

    fn to_rgb(self, buf: &[u8], width: u32, height: u32) -> Result<(Vec<u8>, u32, u32), FrameError> {
        match self {
            PixelFormat::Yuyv => Ok((frame::yuyv_to_rgb(buf, width, height)?, width, height)),
            PixelFormat::Grey => Ok((frame::grey_to_rgb(buf, width, height)?, width, height)),
            PixelFormat::Mjpeg => frame::decode_jpeg(buf),
        }
    }
}

/// V4L2 camera device handle.
///
/// The mmap stream is started once in [`Camera::open`] and kept for the life
/// of the handle; dropping the camera stops streaming.
pub struct Camera {
    device: Device,
    stream: MmapStream<'static>,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
    sequence: u64,
}

impl Camera {
    /// Open a V4L2 camera device by path (e.g., "/dev/video0") at 640×480.
    pub fn open(device_path: &str) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            if e.to_string().contains("busy") || e.to_string().contains("EBUSY") {
                CameraError::DeviceBusy
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }

        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = 640;
        fmt.height = 480;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;
        let pixel_format = PixelFormat::from_fourcc(negotiated.fourcc).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {:?} (need YUYV, MJPG or GREY)",
                negotiated.fourcc
            ))
        })?;

        let stream = MmapStream::with_buffers(&device, BufType::VideoCapture, 4)
            .map_err(|e| CameraError::CaptureFailed(format!("failed to create mmap stream: {e}")))?;

        tracing::info!(
            device = device_path,
            card = %caps.card,
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?negotiated.fourcc,
            "opened camera"
        );

        Ok(Self {
            device,
            stream,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            fourcc: negotiated.fourcc,
            pixel_format,
            sequence: 0,
        })
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        (0..16)
            .filter_map(|i| {
                let path = format!("/dev/video{i}");
                if !Path::new(&path).exists() {
                    return None;
                }
                let caps = Device::with_path(&path).ok()?.query_caps().ok()?;
                if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                    return None;
                }
                Some(DeviceInfo {
                    path,
                    name: caps.card.clone(),
                    driver: caps.driver.clone(),
                    bus: caps.bus.clone(),
                })
            })
            .collect()
    }
}

impl Capture for Camera {
    fn read_frame(&mut self) -> Result<Frame, CameraError> {
        let (buf, _meta) = self
            .stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;

        let (rgb, width, height) = self.pixel_format.to_rgb(buf, self.width, self.height)?;
        self.sequence += 1;
        Ok(Frame::new(rgb, width, height, self.sequence))
    }

    fn check_health(&mut self) -> bool {
        Path::new(&self.device_path).exists() && self.device.query_caps().is_ok()
    }
}
