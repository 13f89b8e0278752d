//! browser camera via `getUserMedia`.
//!
//! the js handles (stream, hidden `<video>`, scratch canvas) are not `Send`,
//! so they live in a thread-local table on the (single) wasm thread and the
//! stream handed to `CameraCapture` only carries the table key.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;

use wasm_bindgen::{JsCast, JsValue};
use wasm_bindgen_futures::JsFuture;
use web_sys::{
    CanvasRenderingContext2d, HtmlCanvasElement, HtmlVideoElement, MediaStream,
    MediaStreamConstraints, MediaStreamTrack, MediaStreamTrackState,
};

use crate::camera::{CameraDevice, CameraStream, CaptureError, Frame};

struct WebParts {
    stream: MediaStream,
    video: HtmlVideoElement,
    canvas: HtmlCanvasElement,
    ctx: CanvasRenderingContext2d,
}

thread_local! {
    static STREAMS: RefCell<HashMap<u32, WebParts>> = RefCell::new(HashMap::new());
    static NEXT_ID: Cell<u32> = const { Cell::new(0) };
}

fn js_err(err: JsValue) -> String {
    err.as_string()
        .or_else(|| err.dyn_ref::<js_sys::Error>().map(|e| String::from(e.message())))
        .unwrap_or_else(|| format!("{err:?}"))
}

fn tracks(stream: &MediaStream) -> Vec<MediaStreamTrack> {
    let all = stream.get_tracks();
    (0..all.length())
        .filter_map(|i| all.get(i).dyn_into::<MediaStreamTrack>().ok())
        .collect()
}

fn stop_all(stream: &MediaStream) {
    for track in tracks(stream) {
        track.stop();
    }
}

/// the page's default video input.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebCamera;

impl WebCamera {
    async fn acquire() -> Result<MediaStream, CaptureError> {
        let window = web_sys::window().ok_or(CaptureError::Unavailable)?;
        let devices = window
            .navigator()
            .media_devices()
            .map_err(|_| CaptureError::Unavailable)?;
        let constraints = MediaStreamConstraints::new();
        constraints.set_video(&JsValue::TRUE);
        let promise = devices
            .get_user_media_with_constraints(&constraints)
            .map_err(|e| CaptureError::Denied(js_err(e)))?;
        let stream = JsFuture::from(promise)
            .await
            .map_err(|e| CaptureError::Denied(js_err(e)))?;
        stream
            .dyn_into::<MediaStream>()
            .map_err(|_| CaptureError::Unavailable)
    }

    fn elements() -> Result<(HtmlVideoElement, HtmlCanvasElement, CanvasRenderingContext2d), JsValue> {
        let document = web_sys::window()
            .and_then(|w| w.document())
            .ok_or_else(|| JsValue::from_str("no document"))?;
        let video: HtmlVideoElement = document.create_element("video")?.dyn_into()?;
        video.set_autoplay(true);
        video.set_muted(true);
        video.set_attribute("playsinline", "")?;
        let canvas: HtmlCanvasElement = document.create_element("canvas")?.dyn_into()?;
        let ctx: CanvasRenderingContext2d = canvas
            .get_context("2d")?
            .ok_or_else(|| JsValue::from_str("no 2d context"))?
            .dyn_into()?;
        Ok((video, canvas, ctx))
    }
}

#[async_trait::async_trait(?Send)]
impl CameraDevice for WebCamera {
    async fn open(&self) -> Result<Box<dyn CameraStream>, CaptureError> {
        let stream = Self::acquire().await?;
        let (video, canvas, ctx) = match Self::elements() {
            Ok(parts) => parts,
            Err(err) => {
                stop_all(&stream);
                return Err(CaptureError::Frame(js_err(err)));
            }
        };
        video.set_src_object(Some(&stream));
        if let Ok(play) = video.play() {
            // frames are simply skipped until playback starts
            let _ = JsFuture::from(play).await;
        }

        let id = NEXT_ID.with(|n| {
            n.set(n.get().wrapping_add(1));
            n.get()
        });
        STREAMS.with(|s| s.borrow_mut().insert(id, WebParts { stream, video, canvas, ctx }));
        Ok(Box::new(WebCameraStream { id }))
    }
}

struct WebCameraStream {
    id: u32,
}

impl CameraStream for WebCameraStream {
    fn frame(&mut self) -> Result<Frame, CaptureError> {
        STREAMS.with(|s| {
            let streams = s.borrow();
            let parts = streams.get(&self.id).ok_or(CaptureError::NotOpen)?;
            let (width, height) = (parts.video.video_width(), parts.video.video_height());
            if width == 0 || height == 0 {
                return Err(CaptureError::Frame("video not ready".into()));
            }
            parts.canvas.set_width(width);
            parts.canvas.set_height(height);
            parts
                .ctx
                .draw_image_with_html_video_element(&parts.video, 0.0, 0.0)
                .map_err(|e| CaptureError::Frame(js_err(e)))?;
            let data = parts
                .ctx
                .get_image_data(0.0, 0.0, width as f64, height as f64)
                .map_err(|e| CaptureError::Frame(js_err(e)))?;
            Ok(Frame { width, height, rgba: data.data().0 })
        })
    }

    fn live_tracks(&self) -> usize {
        STREAMS.with(|s| {
            s.borrow().get(&self.id).map_or(0, |parts| {
                tracks(&parts.stream)
                    .into_iter()
                    .filter(|t| t.ready_state() == MediaStreamTrackState::Live)
                    .count()
            })
        })
    }

    fn stop_tracks(&mut self) {
        if let Some(parts) = STREAMS.with(|s| s.borrow_mut().remove(&self.id)) {
            stop_all(&parts.stream);
            parts.video.set_src_object(None);
        }
    }
}
