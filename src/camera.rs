//! camera capture: a device seam plus a single-owner stream handle.
//!
//! opening is async (a browser asks the user for permission first), so the
//! plugin starts it with `CameraCapture::request_open` and polls
//! `poll_open` each frame. on wasm the default device is the browser camera
//! (`WebCamera`); native builds default to `NoCamera` and hosts plug in their
//! own device with `CameraCapture::new(device)`.

use bevy::prelude::*;
use bevy::tasks::{IoTaskPool, Task};
use futures_lite::future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::attachment::Attachment;

/// shown (blocking) when the camera cannot be opened.
pub const CAMERA_NOTICE: &str = "Camera access denied or not available.";

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("camera permission denied: {0}")]
    Denied(String),
    #[error("no camera available")]
    Unavailable,
    #[error("camera is not open")]
    NotOpen,
    #[error("failed to grab frame: {0}")]
    Frame(String),
    #[error("failed to encode frame: {0}")]
    Encode(#[from] image::ImageError),
}

/// one rgba8 video frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

impl Frame {
    /// re-encodes the frame as png and wraps it as an attachment.
    pub fn to_png_attachment(&self) -> Result<Attachment, CaptureError> {
        let img = image::RgbaImage::from_raw(self.width, self.height, self.rgba.clone())
            .ok_or_else(|| CaptureError::Frame(format!(
                "buffer of {} bytes does not fit {}x{}",
                self.rgba.len(), self.width, self.height
            )))?;
        let mut png = std::io::Cursor::new(Vec::new());
        img.write_to(&mut png, image::ImageFormat::Png)?;
        Ok(Attachment::from_bytes(&png.into_inner(), "image/png"))
    }
}

/// an open capture stream. dropping it without `stop_tracks` may leave the
/// device busy, so `CameraCapture` always stops before dropping.
pub trait CameraStream: Send + Sync {
    fn frame(&mut self) -> Result<Frame, CaptureError>;
    /// number of tracks still live.
    fn live_tracks(&self) -> usize;
    fn stop_tracks(&mut self);
}

#[cfg_attr(target_arch = "wasm32", async_trait::async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait::async_trait)]
pub trait CameraDevice: Send + Sync {
    /// requests access and starts a stream. must not leave anything open on
    /// failure.
    async fn open(&self) -> Result<Box<dyn CameraStream>, CaptureError>;
}

/// always unavailable.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCamera;

#[cfg_attr(target_arch = "wasm32", async_trait::async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait::async_trait)]
impl CameraDevice for NoCamera {
    async fn open(&self) -> Result<Box<dyn CameraStream>, CaptureError> {
        Err(CaptureError::Unavailable)
    }
}

/// synthetic device producing a moving gradient; handy for demos and for
/// exercising the capture path without hardware.
#[derive(Debug, Clone)]
pub struct TestPatternCamera {
    pub width: u32,
    pub height: u32,
    opened: Arc<AtomicUsize>,
}

impl TestPatternCamera {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height, opened: Arc::new(AtomicUsize::new(0)) }
    }

    /// streams currently holding the device (across clones).
    pub fn open_streams(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait::async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait::async_trait)]
impl CameraDevice for TestPatternCamera {
    async fn open(&self) -> Result<Box<dyn CameraStream>, CaptureError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(TestPatternStream {
            width: self.width,
            height: self.height,
            tick: 0,
            live: true,
            opened: self.opened.clone(),
        }))
    }
}

struct TestPatternStream {
    width: u32,
    height: u32,
    tick: u32,
    live: bool,
    opened: Arc<AtomicUsize>,
}

impl CameraStream for TestPatternStream {
    fn frame(&mut self) -> Result<Frame, CaptureError> {
        if !self.live {
            return Err(CaptureError::NotOpen);
        }
        self.tick = self.tick.wrapping_add(1);
        let mut rgba = Vec::with_capacity((self.width * self.height * 4) as usize);
        for y in 0..self.height {
            for x in 0..self.width {
                rgba.extend_from_slice(&[
                    ((x + self.tick) % 256) as u8,
                    (y % 256) as u8,
                    (self.tick % 256) as u8,
                    255,
                ]);
            }
        }
        Ok(Frame { width: self.width, height: self.height, rgba })
    }

    fn live_tracks(&self) -> usize {
        usize::from(self.live)
    }

    fn stop_tracks(&mut self) {
        if self.live {
            self.live = false;
            self.opened.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

type OpenTask = Task<Result<Box<dyn CameraStream>, CaptureError>>;

/// sole owner of the active camera stream.
#[derive(Resource)]
pub struct CameraCapture {
    device: Arc<dyn CameraDevice>,
    stream: Option<Box<dyn CameraStream>>,
    opening: Option<OpenTask>,
    // close() ran while `opening` was still pending
    discard_opening: bool,
}

impl Default for CameraCapture {
    fn default() -> Self {
        #[cfg(target_arch = "wasm32")]
        {
            Self::new(crate::web_camera::WebCamera)
        }
        #[cfg(not(target_arch = "wasm32"))]
        {
            Self::new(NoCamera)
        }
    }
}

impl CameraCapture {
    pub fn new(device: impl CameraDevice + 'static) -> Self {
        Self { device: Arc::new(device), stream: None, opening: None, discard_opening: false }
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// an open request is waiting on the device (or the user's permission).
    pub fn is_opening(&self) -> bool {
        self.opening.is_some()
    }

    pub fn live_tracks(&self) -> usize {
        self.stream.as_ref().map_or(0, |s| s.live_tracks())
    }

    fn install(&mut self, stream: Box<dyn CameraStream>) {
        info!(target: "bevy_gemini_chat", "camera opened (tracks={})", stream.live_tracks());
        self.stream = Some(stream);
    }

    /// acquires the device and waits for it. an already-open stream is reused.
    pub async fn open(&mut self) -> Result<(), CaptureError> {
        if self.stream.is_some() {
            return Ok(());
        }
        let device = self.device.clone();
        let stream = device.open().await?;
        self.install(stream);
        Ok(())
    }

    /// starts acquiring the device on the io task pool. returns false when a
    /// stream is already open or an open is already pending.
    pub fn request_open(&mut self) -> bool {
        if self.stream.is_some() || self.opening.is_some() {
            return false;
        }
        let device = self.device.clone();
        self.discard_opening = false;
        self.opening = Some(IoTaskPool::get().spawn(async move { device.open().await }));
        true
    }

    /// finishes a pending `request_open`. `None` while still waiting, or when
    /// the request was cancelled by `close`.
    pub fn poll_open(&mut self) -> Option<Result<(), CaptureError>> {
        let task = self.opening.as_mut()?;
        let result = future::block_on(future::poll_once(task))?;
        self.opening = None;
        if std::mem::take(&mut self.discard_opening) {
            if let Ok(mut stream) = result {
                stream.stop_tracks();
                debug!(target: "bevy_gemini_chat", "camera opened after close; released");
            }
            return None;
        }
        Some(result.map(|stream| self.install(stream)))
    }

    /// next frame for the live preview.
    pub fn frame(&mut self) -> Result<Frame, CaptureError> {
        self.stream.as_mut().ok_or(CaptureError::NotOpen)?.frame()
    }

    /// grabs one frame as a png attachment and releases the device.
    pub fn capture(&mut self) -> Result<Attachment, CaptureError> {
        let frame = self.frame()?;
        let attachment = frame.to_png_attachment()?;
        self.close();
        Ok(attachment)
    }

    /// stops every track and drops the stream. safe to call when closed;
    /// returns whether a stream was released. a pending open is cancelled.
    pub fn close(&mut self) -> bool {
        if self.opening.is_some() {
            self.discard_opening = true;
        }
        match self.stream.take() {
            Some(mut stream) => {
                stream.stop_tracks();
                info!(target: "bevy_gemini_chat", "camera released");
                true
            }
            None => false,
        }
    }
}

impl Drop for CameraCapture {
    fn drop(&mut self) {
        self.close();
        if let Some(task) = self.opening.take()
            && let Some(Ok(mut stream)) = future::block_on(future::poll_once(task))
        {
            stream.stop_tracks();
        }
    }
}
