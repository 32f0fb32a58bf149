//! RTSP capture through FFmpeg, built with the `rtsp` feature.
//!
//! The demuxer runs over TCP with a socket timeout of `stale_after`, so a
//! camera that stops sending fails the read instead of blocking it. Decoded
//! pictures are converted to packed RGB24 with a cached swscale context.

use crate::camera::{CameraError, Capture};
use crate::frame::Frame;
use ffmpeg_sys_next::{
    av_dict_free, av_dict_set, av_find_best_stream, av_frame_alloc, av_frame_free, av_frame_unref,
    av_packet_alloc, av_packet_free, av_packet_unref, av_read_frame, av_strerror, avcodec_alloc_context3,
    avcodec_find_decoder, avcodec_free_context, avcodec_open2, avcodec_parameters_to_context,
    avcodec_receive_frame, avcodec_send_packet, avformat_close_input, avformat_find_stream_info,
    avformat_network_init, avformat_open_input, sws_freeContext, sws_getCachedContext, sws_scale, AVCodecContext,
    AVDictionary, AVFormatContext, AVFrame, AVMediaType, AVPacket, AVPixelFormat, SwsContext, AVERROR,
    AVERROR_EOF, EAGAIN, SWS_BILINEAR,
};
use std::ffi::{c_char, c_int, CStr, CString};
use std::ptr;
use std::sync::Once;
use std::time::{Duration, Instant};

static NETWORK_INIT: Once = Once::new();

fn av_error(code: c_int) -> String {
    let mut buf = [0 as c_char; 128];
    if unsafe { av_strerror(code, buf.as_mut_ptr(), buf.len()) } < 0 {
        return format!("ffmpeg error {code}");
    }
    unsafe { CStr::from_ptr(buf.as_ptr()) }.to_string_lossy().into_owned()
}

fn check(code: c_int, url: &str, what: &str) -> Result<c_int, CameraError> {
    if code < 0 {
        return Err(CameraError::CaptureFailed(format!("{url}: {what}: {}", av_error(code))));
    }
    Ok(code)
}

fn c_string(value: &str) -> Result<CString, CameraError> {
    CString::new(value).map_err(|_| CameraError::UnsupportedSource(value.to_string()))
}

pub struct RtspStream {
    url: String,
    format: *mut AVFormatContext,
    codec: *mut AVCodecContext,
    scaler: *mut SwsContext,
    packet: *mut AVPacket,
    frame: *mut AVFrame,
    stream_index: c_int,
    sequence: u64,
    opened_at: Instant,
    last_frame: Option<Instant>,
    stale_after: Duration,
}

// SAFETY: every FFmpeg object is owned by the stream and only touched through `&mut self`.
unsafe impl Send for RtspStream {}

impl RtspStream {
    pub fn open(url: &str, stale_after: Duration) -> Result<Self, CameraError> {
        NETWORK_INIT.call_once(|| unsafe {
            avformat_network_init();
        });

        // Fields start null so `Drop` releases whatever was set up before a failure.
        let mut stream = Self {
            url: url.to_string(),
            format: ptr::null_mut(),
            codec: ptr::null_mut(),
            scaler: ptr::null_mut(),
            packet: ptr::null_mut(),
            frame: ptr::null_mut(),
            stream_index: -1,
            sequence: 0,
            opened_at: Instant::now(),
            last_frame: None,
            stale_after,
        };

        let c_url = c_string(url)?;
        let transport_key = c_string("rtsp_transport")?;
        let transport = c_string("tcp")?;
        let timeout_key = c_string("timeout")?;
        let socket_timeout = c_string(&stale_after.as_micros().max(1).to_string())?;
        let mut options: *mut AVDictionary = ptr::null_mut();
        let opened = unsafe {
            av_dict_set(&mut options, transport_key.as_ptr(), transport.as_ptr(), 0);
            // Socket I/O timeout in microseconds.
            av_dict_set(&mut options, timeout_key.as_ptr(), socket_timeout.as_ptr(), 0);
            let ret = avformat_open_input(&mut stream.format, c_url.as_ptr(), ptr::null(), &mut options);
            av_dict_free(&mut options);
            ret
        };
        check(opened, url, "open input")?;
        check(
            unsafe { avformat_find_stream_info(stream.format, ptr::null_mut()) },
            url,
            "read stream info",
        )?;

        stream.stream_index = check(
            unsafe {
                av_find_best_stream(
                    stream.format,
                    AVMediaType::AVMEDIA_TYPE_VIDEO,
                    -1,
                    -1,
                    ptr::null_mut(),
                    0,
                )
            },
            url,
            "find video stream",
        )?;

        unsafe {
            let video = *(*stream.format).streams.offset(stream.stream_index as isize);
            let params = (*video).codecpar;
            let decoder = avcodec_find_decoder((*params).codec_id);
            if decoder.is_null() {
                return Err(CameraError::CaptureFailed(format!("{url}: no decoder for video stream")));
            }
            stream.codec = avcodec_alloc_context3(decoder);
            if stream.codec.is_null() {
                return Err(CameraError::CaptureFailed(format!("{url}: codec context allocation failed")));
            }
            check(avcodec_parameters_to_context(stream.codec, params), url, "copy codec parameters")?;
            check(avcodec_open2(stream.codec, decoder, ptr::null_mut()), url, "open decoder")?;

            stream.packet = av_packet_alloc();
            stream.frame = av_frame_alloc();
        }
        if stream.packet.is_null() || stream.frame.is_null() {
            return Err(CameraError::CaptureFailed(format!("{url}: frame allocation failed")));
        }

        tracing::info!(
            url,
            width = unsafe { (*stream.codec).width },
            height = unsafe { (*stream.codec).height },
            "opened RTSP stream"
        );
        Ok(stream)
    }

    /// Convert the decoded picture in `self.frame` to packed RGB.
    fn frame_to_rgb(&mut self) -> Result<(Vec<u8>, u32, u32), CameraError> {
        let (width, height, pix_fmt) = unsafe { ((*self.frame).width, (*self.frame).height, (*self.codec).pix_fmt) };
        if width <= 0 || height <= 0 {
            return Err(CameraError::CaptureFailed(format!("{}: empty picture", self.url)));
        }

        self.scaler = unsafe {
            sws_getCachedContext(
                self.scaler,
                width,
                height,
                pix_fmt,
                width,
                height,
                AVPixelFormat::AV_PIX_FMT_RGB24,
                SWS_BILINEAR as c_int,
                ptr::null_mut(),
                ptr::null_mut(),
                ptr::null(),
            )
        };
        if self.scaler.is_null() {
            return Err(CameraError::CaptureFailed(format!("{}: no RGB conversion for {pix_fmt:?}", self.url)));
        }

        let stride = width * 3;
        let mut rgb = vec![0u8; (stride * height) as usize];
        let dst = [rgb.as_mut_ptr(), ptr::null_mut(), ptr::null_mut(), ptr::null_mut()];
        let dst_stride = [stride, 0, 0, 0];
        unsafe {
            sws_scale(
                self.scaler,
                (*self.frame).data.as_ptr() as *const *const u8,
                (*self.frame).linesize.as_ptr(),
                0,
                height,
                dst.as_ptr(),
                dst_stride.as_ptr(),
            );
            av_frame_unref(self.frame);
        }
        Ok((rgb, width as u32, height as u32))
    }
}

impl Capture for RtspStream {
    fn read_frame(&mut self) -> Result<Frame, CameraError> {
        loop {
            match unsafe { avcodec_receive_frame(self.codec, self.frame) } {
                0 => {
                    let (rgb, width, height) = self.frame_to_rgb()?;
                    self.sequence += 1;
                    self.last_frame = Some(Instant::now());
                    return Ok(Frame::new(rgb, width, height, self.sequence));
                }
                AVERROR_EOF => return Err(CameraError::EndOfStream),
                ret if ret == AVERROR(EAGAIN) => {}
                ret => {
                    return Err(CameraError::CaptureFailed(format!("{}: decode: {}", self.url, av_error(ret))));
                }
            }

            match unsafe { av_read_frame(self.format, self.packet) } {
                AVERROR_EOF => return Err(CameraError::EndOfStream),
                ret if ret < 0 => {
                    return Err(CameraError::CaptureFailed(format!("{}: read: {}", self.url, av_error(ret))));
                }
                _ => {}
            }

            let sent = unsafe {
                let sent = if (*self.packet).stream_index == self.stream_index {
                    avcodec_send_packet(self.codec, self.packet)
                } else {
                    0
                };
                av_packet_unref(self.packet);
                sent
            };
            // A damaged packet only costs its own picture.
            if sent < 0 && sent != AVERROR(EAGAIN) {
                tracing::debug!(url = %self.url, error = %av_error(sent), "dropping undecodable packet");
            }
        }
    }

    fn check_health(&mut self) -> bool {
        let last = self.last_frame.unwrap_or(self.opened_at);
        last.elapsed() < self.stale_after
    }
}

impl Drop for RtspStream {
    fn drop(&mut self) {
        unsafe {
            if !self.scaler.is_null() {
                sws_freeContext(self.scaler);
                self.scaler = ptr::null_mut();
            }
            if !self.frame.is_null() {
                av_frame_free(&mut self.frame);
            }
            if !self.packet.is_null() {
                av_packet_free(&mut self.packet);
            }
            if !self.codec.is_null() {
                avcodec_free_context(&mut self.codec);
            }
            if !self.format.is_null() {
                avformat_close_input(&mut self.format);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unreachable_camera_fails_to_open() {
        let started = Instant::now();
        let err = RtspStream::open("rtsp://127.0.0.1:1/streaming/channels/101/", Duration::from_secs(2))
            .err()
            .expect("nothing listens on port 1");
        assert!(!err.is_transient(), "got {err:?}");
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_av_error_has_text() {
        assert!(!av_error(AVERROR_EOF).is_empty());
    }
}
