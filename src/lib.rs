//! bevy_gemini_chat: a popup chat widget for bevy backed by gemini's
//! `generateContent` endpoint.
//!
//! - text + one optional image per message (picked file, dropped file or
//!   camera frame).
//! - the whole conversation is sent with every request; no streaming.
//! - one request in flight at a time; sends are refused while busy.
//! - never blocks the main thread: on native the request runs on a tiny
//!   tokio runtime (ureq on its blocking pool); on wasm it is awaited on
//!   bevy's async pool, which yields to the browser event loop.
//!
//! plugin wiring:
//!   - inputs:  `SubmitMessage`, `PickFile`, `AttachFile`, `AttachDataUrl`,
//!              `CancelAttachment`, `OpenCamera`, `CapturePhoto`, `CloseCamera`, `ToggleChat`, `CloseChat`
//!   - outputs: `ChatStarted`, `ChatReplyEvt`, `ChatErrorEvt`, `AttachmentReadyEvt`,
//!              `CameraNoticeEvt`

use bevy::prelude::*;
use bevy::input::keyboard::KeyboardInput;
use bevy::tasks::{AsyncComputeTaskPool, IoTaskPool, Task};
use bevy::window::FileDragAndDrop;
use flume::{Receiver, Sender, TryRecvError};
use futures_lite::future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub mod attachment;
pub mod camera;
pub mod client;
pub mod conversation;
pub mod picker;
pub mod session;
#[cfg(target_arch = "wasm32")]
pub mod web_camera;
pub mod widget;

pub use attachment::{
    Attachment, AttachmentBuffer, AttachmentError, AttachmentSource, load_bytes, load_file,
};
pub use camera::{
    CAMERA_NOTICE, CameraCapture, CameraDevice, CameraStream, CaptureError, Frame, NoCamera,
    TestPatternCamera,
};
pub use client::{
    CompletionClient, CompletionError, CompletionTransport, DEFAULT_BASE_URL, DEFAULT_MODEL,
    HttpResponse, clean_reply, default_transport, parse_response,
};
pub use conversation::{ConversationHistory, ConversationTurn, GenerateContentRequest, Part, Role};
pub use picker::{ChatFilePicker, FilePicker, PickedFile, RfdPicker};
#[cfg(target_arch = "wasm32")]
pub use web_camera::WebCamera;
pub use session::{ChatSession, ModelTurnContent, PendingTurn, ReplyOutcome};
pub use widget::{ChatInput, Notice, Placeholder, render_outgoing, render_placeholder, resolve_placeholder};

use widget::ChatBody;

// ---------------------- config ----------------------

/// endpoint and widget behaviour. inserted from the environment by the
/// plugin unless the host provides one first.
#[derive(Resource, Clone, Debug)]
pub struct ChatConfig {
    pub api_key: String,
    pub model: String,
    /// api root, without the `/models/...` suffix.
    pub base_url: String,
    /// pause between the user's bubble and the thinking placeholder; the
    /// request is sent when the placeholder appears.
    pub placeholder_delay: Duration,
    /// enter submits only on windows wider than this.
    pub desktop_min_width: f32,
    pub model_turn: ModelTurnContent,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            placeholder_delay: Duration::from_millis(600),
            desktop_min_width: 768.0,
            model_turn: ModelTurnContent::default(),
        }
    }
}

impl ChatConfig {
    /// reads `GEMINI_API_KEY`, `GEMINI_MODEL` and `GEMINI_BASE_URL`.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(key) = std::env::var("GEMINI_API_KEY") {
            cfg.api_key = key;
        }
        if let Ok(model) = std::env::var("GEMINI_MODEL")
            && !model.is_empty() {
                cfg.model = model;
        }
        if let Ok(base) = std::env::var("GEMINI_BASE_URL")
            && !base.is_empty() {
                cfg.base_url = base;
        }
        cfg
    }

    /// `{base}/models/{model}:generateContent?key={api_key}`
    pub fn endpoint(&self) -> String {
        format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url.trim_end_matches('/'),
            self.model,
            self.api_key
        )
    }
}

/// http transport used for completions.
#[derive(Resource, Clone)]
pub struct ChatTransport(pub Arc<dyn CompletionTransport>);

impl Default for ChatTransport {
    fn default() -> Self {
        Self(default_transport())
    }
}

/// native only: one worker thread is enough, there is never more than one
/// request in flight. ureq's blocking call lands on its blocking pool.
#[cfg(not(target_arch = "wasm32"))]
#[derive(Resource, Clone)]
pub struct TokioRt(pub Arc<tokio::runtime::Runtime>);

#[cfg(not(target_arch = "wasm32"))]
impl Default for TokioRt {
    fn default() -> Self {
        info!(target: "bevy_gemini_chat", "GeminiChat: initializing Tokio multi-thread runtime (native)");
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .expect("tokio runtime");
        Self(Arc::new(rt))
    }
}

// ---------------------- state ----------------------

struct QueuedSend {
    turn: PendingTurn,
    ready_at: Duration,
}

/// the widget's session: conversation, attachment buffer, and the send
/// currently queued or in flight.
#[derive(Resource, Default)]
pub struct ChatState {
    pub session: ChatSession,
    queued: Option<QueuedSend>,
    in_flight: bool,
}

impl ChatState {
    /// true from submit until the reply (or error) is rendered.
    pub fn is_busy(&self) -> bool {
        self.queued.is_some() || self.in_flight || self.session.is_busy()
    }
}

/// system ordering so uis can run after we emit events
#[derive(SystemSet, Debug, Hash, PartialEq, Eq, Clone)]
pub enum ChatSet {
    /// keyboard, buttons and drops turn into chat events
    Input,
    /// attachments, camera, submissions and request dispatch
    Submit,
    /// replies are applied and Chat* events emitted here (in `Update`)
    Drain,
}

// ---------------------- events ----------------------

/// send `text` (trimmed) with the buffered attachment.
#[derive(Event, Debug, Clone)]
pub struct SubmitMessage {
    pub text: String,
}

/// open the file picker; the chosen image goes into the attachment buffer.
#[derive(Event, Debug, Clone, Copy, Default)]
pub struct PickFile;

/// load an image file into the attachment buffer.
#[derive(Event, Debug, Clone)]
pub struct AttachFile {
    pub path: PathBuf,
}

/// attach an image given as a `data:` url (e.g. from a browser file input).
#[derive(Event, Debug, Clone)]
pub struct AttachDataUrl {
    pub url: String,
}

#[derive(Event, Debug, Clone, Copy, Default)]
pub struct CancelAttachment;
#[derive(Event, Debug, Clone, Copy, Default)]
pub struct OpenCamera;
#[derive(Event, Debug, Clone, Copy, Default)]
pub struct CapturePhoto;
#[derive(Event, Debug, Clone, Copy, Default)]
pub struct CloseCamera;
#[derive(Event, Debug, Clone, Copy, Default)]
pub struct ToggleChat;
#[derive(Event, Debug, Clone, Copy, Default)]
pub struct CloseChat;

#[derive(Event, Debug)]
pub struct ChatStarted {
    pub placeholder: Option<Placeholder>,
}
#[derive(Event, Debug)]
pub struct ChatReplyEvt {
    pub placeholder: Option<Placeholder>,
    pub text: String,
}
#[derive(Event, Debug)]
pub struct ChatErrorEvt {
    pub placeholder: Option<Placeholder>,
    pub error: String,
}
#[derive(Event, Debug)]
pub struct AttachmentReadyEvt {
    pub source: AttachmentSource,
    pub mime_type: String,
}
#[derive(Event, Debug)]
pub struct CameraNoticeEvt {
    pub notice: String,
}

// ---------------------- inbox ----------------------

struct ReplyMsg {
    placeholder: Option<Placeholder>,
    result: Result<String, CompletionError>,
}

/// cross-thread inbox for replies; the request task sends, main thread drains.
#[derive(Resource, Clone)]
struct ReplyInbox {
    tx: Sender<ReplyMsg>,
    rx: Receiver<ReplyMsg>,
}

impl Default for ReplyInbox {
    fn default() -> Self {
        let (tx, rx) = flume::bounded(16);
        Self { tx, rx }
    }
}

// at most one reply is outstanding, so the bound is never reached; a closed
// inbox only happens while the app shuts down.
fn push_inbox(tx: &Sender<ReplyMsg>, msg: ReplyMsg) {
    if tx.send(msg).is_err() {
        debug!(target: "bevy_gemini_chat", "reply dropped: inbox closed");
    }
}

/// file reads and picker dialogs in progress. `None` means the picker was
/// dismissed.
#[derive(Resource, Default)]
struct FileLoads(Vec<Task<Option<Result<Attachment, AttachmentError>>>>);

// ---------------------- plugin ----------------------

/// bevy plugin: wires systems, events, resources and spawns the widget.
/// insert `ChatConfig`, `ChatTransport`, `ChatFilePicker` or `CameraCapture`
/// before adding it
/// to override the defaults.
pub struct GeminiChatPlugin;

impl Plugin for GeminiChatPlugin {
    fn build(&self, app: &mut App) {
        info!(target: "bevy_gemini_chat", "GeminiChatPlugin: build()");
        if !app.world().contains_resource::<ChatConfig>() {
            app.insert_resource(ChatConfig::from_env());
        }
        if app.world().resource::<ChatConfig>().api_key.is_empty() {
            warn!(target: "bevy_gemini_chat", "no GEMINI_API_KEY configured; requests will be rejected");
        }

        app.init_resource::<ChatTransport>()
            .init_resource::<ChatFilePicker>()
            .init_resource::<CameraCapture>()
            .init_resource::<ChatState>()
            .init_resource::<ChatInput>()
            .init_resource::<Notice>()
            .init_resource::<ReplyInbox>()
            .init_resource::<FileLoads>()
            .init_resource::<ButtonInput<KeyCode>>()
            .add_event::<KeyboardInput>()
            .add_event::<FileDragAndDrop>()
            .add_event::<SubmitMessage>()
            .add_event::<PickFile>()
            .add_event::<AttachFile>()
            .add_event::<AttachDataUrl>()
            .add_event::<CancelAttachment>()
            .add_event::<OpenCamera>()
            .add_event::<CapturePhoto>()
            .add_event::<CloseCamera>()
            .add_event::<ToggleChat>()
            .add_event::<CloseChat>()
            .add_event::<ChatStarted>()
            .add_event::<ChatReplyEvt>()
            .add_event::<ChatErrorEvt>()
            .add_event::<AttachmentReadyEvt>()
            .add_event::<CameraNoticeEvt>()
            .configure_sets(Update, (ChatSet::Input, ChatSet::Submit, ChatSet::Drain).chain())
            .add_systems(Startup, widget::spawn_widget)
            .add_systems(
                Update,
                (widget::handle_text_input, widget::handle_buttons, forward_dropped_files)
                    .in_set(ChatSet::Input),
            )
            .add_systems(
                Update,
                (
                    spawn_file_picks,
                    spawn_file_loads,
                    poll_file_loads,
                    attach_data_urls,
                    handle_camera,
                    cancel_attachment,
                    handle_submit,
                    dispatch_queued,
                )
                    .chain()
                    .in_set(ChatSet::Submit),
            )
            .add_systems(Update, drain_replies.in_set(ChatSet::Drain))
            .add_systems(
                Update,
                (
                    widget::toggle_popup,
                    widget::animate_thinking,
                    widget::refresh_input,
                    widget::refresh_send_button,
                    widget::refresh_attachment_tray,
                    widget::sync_overlays,
                    widget::stream_camera_preview,
                )
                    .after(ChatSet::Drain),
            );

        #[cfg(not(target_arch = "wasm32"))]
        if app.world().get_resource::<TokioRt>().is_none() {
            app.insert_resource(TokioRt::default());
        }
    }
}

// ---------------------- attachments ----------------------

fn forward_dropped_files(mut ev_drop: EventReader<FileDragAndDrop>, mut ev_attach: EventWriter<AttachFile>) {
    for ev in ev_drop.read() {
        if let FileDragAndDrop::DroppedFile { path_buf, .. } = ev {
            ev_attach.write(AttachFile { path: path_buf.clone() });
        }
    }
}

/// runs the picker dialog on the io pool. repeated clicks in one frame open
/// a single dialog.
fn spawn_file_picks(
    mut ev: EventReader<PickFile>,
    picker: Res<ChatFilePicker>,
    mut loads: ResMut<FileLoads>,
) {
    if ev.read().count() == 0 {
        return;
    }
    info!(target: "bevy_gemini_chat", "file picker opened");
    let picker = picker.0.clone();
    loads.0.push(IoTaskPool::get().spawn(async move {
        let file = picker.pick_image().await?;
        debug!(target: "bevy_gemini_chat", "picked {} ({} bytes)", file.name, file.bytes.len());
        Some(load_bytes(&file.bytes))
    }));
}

/// reads files on the io pool.
fn spawn_file_loads(mut ev: EventReader<AttachFile>, mut loads: ResMut<FileLoads>) {
    for AttachFile { path } in ev.read() {
        info!(target: "bevy_gemini_chat", "attach file -> {}", path.display());
        let path = path.clone();
        loads.0.push(IoTaskPool::get().spawn(async move { Some(load_file(&path)) }));
    }
}

fn store_attachment(
    state: &mut ChatState,
    camera: &mut CameraCapture,
    ev_ready: &mut EventWriter<AttachmentReadyEvt>,
    attachment: Attachment,
    source: AttachmentSource,
) {
    info!(target: "bevy_gemini_chat",
        "attachment ready: source={:?} mime={} bytes(b64)={}",
        source, attachment.mime_type, attachment.data.len()
    );
    // only one acquisition path at a time
    if source == AttachmentSource::File {
        camera.close();
    }
    let mime_type = attachment.mime_type.clone();
    if state.session.attachment_mut().set(attachment, source).is_some() {
        debug!(target: "bevy_gemini_chat", "previous attachment discarded");
    }
    ev_ready.write(AttachmentReadyEvt { source, mime_type });
}

fn poll_file_loads(
    mut loads: ResMut<FileLoads>,
    mut state: ResMut<ChatState>,
    mut camera: ResMut<CameraCapture>,
    mut ev_ready: EventWriter<AttachmentReadyEvt>,
) {
    if loads.0.is_empty() {
        return;
    }
    loads.0.retain_mut(|task| match future::block_on(future::poll_once(task)) {
        None => true,
        Some(None) => {
            debug!(target: "bevy_gemini_chat", "file picker dismissed");
            false
        }
        Some(Some(Ok(attachment))) => {
            store_attachment(&mut state, &mut camera, &mut ev_ready, attachment, AttachmentSource::File);
            false
        }
        Some(Some(Err(err))) => {
            warn!(target: "bevy_gemini_chat", "attachment rejected: {}", err);
            false
        }
    });
}

fn attach_data_urls(
    mut ev: EventReader<AttachDataUrl>,
    mut state: ResMut<ChatState>,
    mut camera: ResMut<CameraCapture>,
    mut ev_ready: EventWriter<AttachmentReadyEvt>,
) {
    for AttachDataUrl { url } in ev.read() {
        match Attachment::from_data_url(url) {
            Ok(a) => store_attachment(&mut state, &mut camera, &mut ev_ready, a, AttachmentSource::File),
            Err(err) => warn!(target: "bevy_gemini_chat", "attachment rejected: {}", err),
        }
    }
}

fn cancel_attachment(mut ev: EventReader<CancelAttachment>, mut state: ResMut<ChatState>) {
    if ev.read().count() > 0 {
        debug!(target: "bevy_gemini_chat", "attachment cancelled");
        state.session.attachment_mut().clear();
    }
}

// ---------------------- camera ----------------------

fn handle_camera(
    mut ev_open: EventReader<OpenCamera>,
    mut ev_capture: EventReader<CapturePhoto>,
    mut ev_close: EventReader<CloseCamera>,
    mut camera: ResMut<CameraCapture>,
    mut state: ResMut<ChatState>,
    mut notice: ResMut<Notice>,
    mut ev_notice: EventWriter<CameraNoticeEvt>,
    mut ev_ready: EventWriter<AttachmentReadyEvt>,
) {
    if ev_open.read().count() > 0 && camera.request_open() {
        info!(target: "bevy_gemini_chat", "camera requested");
    }

    // polling a pending open must not mark the camera changed
    if let Some(opened) = camera.bypass_change_detection().poll_open() {
        camera.set_changed();
        if let Err(err) = opened {
            error!(target: "bevy_gemini_chat", "camera open failed: {}", err);
            notice.0 = Some(CAMERA_NOTICE.to_string());
            ev_notice.write(CameraNoticeEvt { notice: CAMERA_NOTICE.to_string() });

            #[cfg(target_arch = "wasm32")]
            if let Some(window) = web_sys::window() {
                let _ = window.alert_with_message(CAMERA_NOTICE);
            }
        }
    }

    if ev_capture.read().count() > 0 {
        match camera.capture() {
            Ok(attachment) => {
                store_attachment(&mut state, &mut camera, &mut ev_ready, attachment, AttachmentSource::Camera);
            }
            Err(err) => warn!(target: "bevy_gemini_chat", "capture failed: {}", err),
        }
    }

    if ev_close.read().count() > 0 {
        camera.close();
    }
}

// ---------------------- submission ----------------------

/// renders the user's bubble and queues the request behind the
/// placeholder delay.
fn handle_submit(
    mut commands: Commands,
    mut ev: EventReader<SubmitMessage>,
    time: Res<Time>,
    config: Res<ChatConfig>,
    mut state: ResMut<ChatState>,
    mut images: Option<ResMut<Assets<Image>>>,
    q_body: Query<Entity, With<ChatBody>>,
) {
    for SubmitMessage { text } in ev.read() {
        if state.is_busy() {
            warn!(target: "bevy_gemini_chat", "submit ignored: a request is already in flight");
            continue;
        }
        let Some(turn) = state.session.stage(text) else {
            debug!(target: "bevy_gemini_chat", "submit ignored: blank message");
            continue;
        };
        info!(target: "bevy_gemini_chat",
            "submit -> len={} attachment={} history={}",
            turn.text.len(), turn.attachment.is_some(), state.session.history().len()
        );

        if let Ok(body) = q_body.single() {
            let preview = match (&turn.attachment, images.as_deref_mut()) {
                (Some(a), Some(images)) => widget::preview_image(images, a),
                _ => None,
            };
            render_outgoing(&mut commands, body, &turn.text, preview);
        }
        state.queued = Some(QueuedSend { turn, ready_at: time.elapsed() + config.placeholder_delay });
    }
}

/// once the delay passes: shows the placeholder, records the user turn and
/// spawns the request.
fn dispatch_queued(
    mut commands: Commands,
    time: Res<Time>,
    config: Res<ChatConfig>,
    transport: Res<ChatTransport>,
    inbox: Res<ReplyInbox>,
    mut state: ResMut<ChatState>,
    q_body: Query<Entity, With<ChatBody>>,
    mut ev_start: EventWriter<ChatStarted>,

    // native-only: small runtime to drive the request future
    #[cfg(not(target_arch = "wasm32"))] rt: Res<TokioRt>,
) {
    if !state.queued.as_ref().is_some_and(|q| time.elapsed() >= q.ready_at) {
        return;
    }
    let Some(QueuedSend { turn, .. }) = state.queued.take() else { return };

    let placeholder = q_body.single().ok().map(|body| render_placeholder(&mut commands, body));
    state.session.set_model_turn(config.model_turn);
    let request = state.session.begin(turn);
    state.in_flight = true;
    ev_start.write(ChatStarted { placeholder });

    let inbox_tx = inbox.tx.clone();
    #[cfg(not(target_arch = "wasm32"))]
    let panic_tx = inbox_tx.clone();
    let body = match request {
        Ok(body) => body,
        Err(err) => {
            error!(target: "bevy_gemini_chat", "request encoding failed: {}", err);
            push_inbox(&inbox_tx, ReplyMsg { placeholder, result: Err(err) });
            return;
        }
    };

    info!(target: "bevy_gemini_chat",
        "dispatch -> model={} turns={} body_len={}",
        config.model, state.session.history().len(), body.len()
    );
    let client = CompletionClient::new(config.endpoint(), transport.0.clone());
    let run = async move {
        let result = client.send(body).await;
        match &result {
            Ok(text) => info!(target: "bevy_gemini_chat", "reply received: len={}", text.len()),
            Err(err) => error!(target: "bevy_gemini_chat", "completion error: {}", err),
        }
        push_inbox(&inbox_tx, ReplyMsg { placeholder, result });
    };

    let pool = AsyncComputeTaskPool::get();
    #[cfg(not(target_arch = "wasm32"))]
    let rt = rt.0.clone();

    pool.spawn(async move {
        #[cfg(target_arch = "wasm32")]
        run.await;

        // a request task that dies still answers, or `in_flight` never clears
        #[cfg(not(target_arch = "wasm32"))]
        if let Err(join_err) = rt.spawn(run).await {
            error!(target: "bevy_gemini_chat", "request task failed: {}", join_err);
            push_inbox(&panic_tx, ReplyMsg {
                placeholder,
                result: Err(CompletionError::Transport(join_err.to_string())),
            });
        }
    })
    .detach();
}

/// applies finished requests: history, placeholder, events.
fn drain_replies(
    mut commands: Commands,
    inbox: Res<ReplyInbox>,
    mut state: ResMut<ChatState>,
    mut ev_reply: EventWriter<ChatReplyEvt>,
    mut ev_err: EventWriter<ChatErrorEvt>,
) {
    loop {
        let msg = match inbox.rx.try_recv() {
            Ok(m) => m,
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
        };
        let outcome = state.session.finish(msg.result);
        state.in_flight = false;

        if let Some(placeholder) = msg.placeholder {
            resolve_placeholder(&mut commands, placeholder, &outcome.text, outcome.is_error);
        }
        if outcome.is_error {
            ev_err.write(ChatErrorEvt { placeholder: msg.placeholder, error: outcome.text });
        } else {
            ev_reply.write(ChatReplyEvt { placeholder: msg.placeholder, text: outcome.text });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testing::{CannedTransport, reply};
    use bevy::input::ButtonState;
    use bevy::input::keyboard::Key;
    use bevy::window::{PrimaryWindow, WindowResolution};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::io::Write;

    #[derive(Resource, Default)]
    struct Seen {
        started: usize,
        replies: Vec<String>,
        errors: Vec<String>,
        notices: Vec<String>,
        ready: Vec<AttachmentSource>,
    }

    fn collect(
        mut seen: ResMut<Seen>,
        mut ev_start: EventReader<ChatStarted>,
        mut ev_reply: EventReader<ChatReplyEvt>,
        mut ev_err: EventReader<ChatErrorEvt>,
        mut ev_notice: EventReader<CameraNoticeEvt>,
        mut ev_ready: EventReader<AttachmentReadyEvt>,
    ) {
        seen.started += ev_start.read().count();
        seen.replies.extend(ev_reply.read().map(|e| e.text.clone()));
        seen.errors.extend(ev_err.read().map(|e| e.error.clone()));
        seen.notices.extend(ev_notice.read().map(|e| e.notice.clone()));
        seen.ready.extend(ev_ready.read().map(|e| e.source));
    }

    fn app_with(transport: Arc<dyn CompletionTransport>) -> App {
        let mut app = App::new();
        app.add_plugins(MinimalPlugins);
        app.insert_resource(ChatConfig {
            api_key: "test-key".into(),
            placeholder_delay: Duration::ZERO,
            ..default()
        });
        app.insert_resource(ChatTransport(transport));
        app.add_plugins(GeminiChatPlugin);
        app.init_resource::<Seen>();
        app.add_systems(Update, collect.after(ChatSet::Drain));
        app.update();
        app
    }

    fn submit(app: &mut App, text: &str) {
        app.world_mut().send_event(SubmitMessage { text: text.into() });
    }

    /// runs frames until the in-flight request (if any) is applied.
    fn settle(app: &mut App) {
        for _ in 0..500 {
            app.update();
            if !app.world().resource::<ChatState>().is_busy() {
                app.update();
                return;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        panic!("request never completed");
    }

    /// runs frames until `done` holds; io-pool work lands on other threads.
    fn update_until(app: &mut App, done: impl Fn(&World) -> bool) {
        for _ in 0..500 {
            app.update();
            if done(app.world()) {
                return;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        panic!("condition never met");
    }

    fn tiny_png() -> Vec<u8> {
        let img = image::RgbaImage::from_pixel(1, 1, image::Rgba([0, 0, 0, 255]));
        let mut out = std::io::Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Png).unwrap();
        out.into_inner()
    }

    fn press(app: &mut App, key_code: KeyCode, logical_key: Key, text: Option<&str>) {
        app.world_mut().send_event(KeyboardInput {
            key_code,
            logical_key,
            state: ButtonState::Pressed,
            text: text.map(Into::into),
            repeat: false,
            window: Entity::PLACEHOLDER,
        });
    }

    fn type_text(app: &mut App, text: &str) {
        for c in text.chars() {
            let c = c.to_string();
            // only the produced text matters for printable keys
            press(app, KeyCode::KeyA, Key::Character(c.as_str().into()), Some(&c));
        }
    }

    fn press_enter(app: &mut App) {
        press(app, KeyCode::Enter, Key::Enter, Some("\r"));
    }

    fn open_popup(app: &mut App) {
        app.world_mut().send_event(ToggleChat);
        app.update();
        assert_eq!(popup_visibility(app), Visibility::Inherited);
    }

    fn popup_visibility(app: &mut App) -> Visibility {
        let world = app.world_mut();
        *world.query_filtered::<&Visibility, With<widget::ChatRoot>>().single(world).unwrap()
    }

    fn input_radius(app: &mut App) -> Val {
        let world = app.world_mut();
        world
            .query_filtered::<&BorderRadius, With<widget::InputBox>>()
            .single(world)
            .unwrap()
            .top_left
    }

    fn press_button(app: &mut App, kind: widget::WidgetButton) {
        let world = app.world_mut();
        let mut q = world.query::<(&widget::WidgetButton, &mut Interaction)>();
        for (k, mut interaction) in q.iter_mut(world) {
            if *k == kind {
                *interaction = Interaction::Pressed;
            }
        }
    }

    fn input_text(app: &App) -> String {
        app.world().resource::<ChatInput>().text.clone()
    }

    fn request_count(transport: &CannedTransport) -> usize {
        transport.requests.lock().unwrap().len()
    }

    struct CannedPicker(Option<PickedFile>);

    #[async_trait::async_trait]
    impl FilePicker for CannedPicker {
        async fn pick_image(&self) -> Option<PickedFile> {
            self.0.clone()
        }
    }

    struct PanickingTransport;

    #[async_trait::async_trait]
    impl CompletionTransport for PanickingTransport {
        async fn post_json(&self, _url: &str, _body: String) -> Result<HttpResponse, CompletionError> {
            panic!("transport blew up");
        }
    }

    fn message_texts(app: &mut App, kind: widget::MessageBubble) -> Vec<(String, Color)> {
        let world = app.world_mut();
        let mut q_bubbles = world.query::<(&widget::MessageBubble, &Children)>();
        let bubbles: Vec<Vec<Entity>> = q_bubbles
            .iter(world)
            .filter(|(k, _)| **k == kind)
            .map(|(_, c)| c.to_vec())
            .collect();
        let mut q_text = world.query_filtered::<(&Text, &TextColor), With<widget::MessageText>>();
        bubbles
            .into_iter()
            .flatten()
            .filter_map(|e| q_text.get(world, e).ok())
            .map(|(t, c)| (t.0.clone(), c.0))
            .collect()
    }

    #[test]
    fn endpoint_embeds_model_and_key() {
        let cfg = ChatConfig {
            api_key: "abc".into(),
            base_url: "https://example.test/v1beta/".into(),
            ..default()
        };
        assert_eq!(
            cfg.endpoint(),
            "https://example.test/v1beta/models/gemini-2.0-flash:generateContent?key=abc"
        );
    }

    #[test]
    fn hello_renders_cleaned_reply() {
        let transport = CannedTransport::ok(reply("**Hello!**"));
        let mut app = app_with(transport.clone());

        submit(&mut app, "  hello ");
        settle(&mut app);

        let seen = app.world().resource::<Seen>();
        assert_eq!(seen.started, 1);
        assert_eq!(seen.replies, vec!["Hello!".to_string()]);
        assert!(seen.errors.is_empty());

        assert_eq!(message_texts(&mut app, widget::MessageBubble::User), vec![("hello".to_string(), widget::TEXT)]);
        let bot = message_texts(&mut app, widget::MessageBubble::Bot);
        assert!(bot.contains(&("Hello!".to_string(), widget::TEXT)), "{bot:?}");
        assert!(bot.iter().all(|(t, _)| !t.starts_with('.')));

        let state = app.world().resource::<ChatState>();
        assert_eq!(state.session.history().len(), 2);
        assert!(state.session.attachment().is_empty());

        let requests = transport.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].0.ends_with(":generateContent?key=test-key"));
    }

    #[test]
    fn remote_error_renders_in_error_style() {
        let transport = CannedTransport::status(400, json!({ "error": { "message": "X" } }));
        let mut app = app_with(transport);

        submit(&mut app, "hi");
        settle(&mut app);

        assert_eq!(app.world().resource::<Seen>().errors, vec!["X".to_string()]);
        let bot = message_texts(&mut app, widget::MessageBubble::Bot);
        assert!(bot.contains(&("X".to_string(), widget::ERROR_TEXT)), "{bot:?}");

        // widget stays usable after a failure
        assert!(!app.world().resource::<ChatState>().is_busy());
    }

    #[test]
    fn blank_submit_sends_nothing() {
        let transport = CannedTransport::ok(reply("unused"));
        let mut app = app_with(transport.clone());

        submit(&mut app, "   ");
        for _ in 0..3 {
            app.update();
        }

        assert_eq!(app.world().resource::<Seen>().started, 0);
        assert!(transport.requests.lock().unwrap().is_empty());
        assert!(message_texts(&mut app, widget::MessageBubble::User).is_empty());
    }

    #[test]
    fn overlapping_submit_is_refused() {
        let transport = CannedTransport::ok(reply("ok"));
        let mut app = app_with(transport.clone());

        submit(&mut app, "first");
        submit(&mut app, "second");
        settle(&mut app);

        assert_eq!(transport.requests.lock().unwrap().len(), 1);
        let users = message_texts(&mut app, widget::MessageBubble::User);
        assert_eq!(users, vec![("first".to_string(), widget::TEXT)]);
    }

    #[test]
    fn data_url_attachment_rides_along_once() {
        let transport = CannedTransport::ok(reply("a cat"));
        let mut app = app_with(transport.clone());

        let png = {
            let img = image::RgbaImage::from_pixel(1, 1, image::Rgba([0, 0, 0, 255]));
            let mut out = std::io::Cursor::new(Vec::new());
            img.write_to(&mut out, image::ImageFormat::Png).unwrap();
            Attachment::from_bytes(&out.into_inner(), "image/png")
        };
        app.world_mut().send_event(AttachDataUrl { url: png.data_url() });
        app.update();
        assert_eq!(app.world().resource::<Seen>().ready, vec![AttachmentSource::File]);

        submit(&mut app, "what is this?");
        settle(&mut app);
        submit(&mut app, "and now?");
        settle(&mut app);

        let bodies = transport.bodies();
        assert_eq!(bodies[0]["contents"][0]["parts"][1]["inlineData"]["data"], png.data.as_str());
        let last = bodies[1]["contents"].as_array().unwrap().last().unwrap().clone();
        assert_eq!(last, json!({ "role": "user", "parts": [{ "text": "and now?" }] }));
        assert!(app.world().resource::<ChatState>().session.attachment().is_empty());
    }

    #[test]
    fn camera_denied_shows_notice() {
        let mut app = app_with(CannedTransport::ok(reply("unused")));

        app.world_mut().send_event(OpenCamera);
        update_until(&mut app, |w| !w.resource::<Seen>().notices.is_empty());

        assert_eq!(app.world().resource::<Seen>().notices, vec![CAMERA_NOTICE.to_string()]);
        assert_eq!(app.world().resource::<Notice>().0.as_deref(), Some(CAMERA_NOTICE));
        assert!(!app.world().resource::<CameraCapture>().is_open());
        assert!(app.world().resource::<ChatState>().session.attachment().is_empty());
    }

    #[test]
    fn camera_capture_fills_buffer_and_releases() {
        let device = TestPatternCamera::new(16, 12);
        let mut app = App::new();
        app.add_plugins(MinimalPlugins);
        app.insert_resource(ChatConfig { placeholder_delay: Duration::ZERO, ..default() });
        app.insert_resource(ChatTransport(CannedTransport::ok(reply("unused"))));
        app.insert_resource(CameraCapture::new(device.clone()));
        app.add_plugins(GeminiChatPlugin);
        app.update();

        app.world_mut().send_event(OpenCamera);
        update_until(&mut app, |w| w.resource::<CameraCapture>().is_open());
        assert_eq!(device.open_streams(), 1);

        app.world_mut().send_event(CapturePhoto);
        app.update();

        let state = app.world().resource::<ChatState>();
        assert_eq!(state.session.attachment().source(), Some(AttachmentSource::Camera));
        assert_eq!(state.session.attachment().get().map(|a| a.mime_type.as_str()), Some("image/png"));
        assert!(!app.world().resource::<CameraCapture>().is_open());
        assert_eq!(device.open_streams(), 0);

        // closing again is harmless
        app.world_mut().send_event(CloseCamera);
        app.update();
        assert_eq!(device.open_streams(), 0);

        app.world_mut().send_event(CancelAttachment);
        app.update();
        assert!(app.world().resource::<ChatState>().session.attachment().is_empty());
    }

    #[test]
    fn enter_submits_typed_text_on_wide_window() {
        let transport = CannedTransport::ok(reply("hey"));
        let mut app = app_with(transport.clone());
        open_popup(&mut app);

        type_text(&mut app, "hi");
        press_enter(&mut app);
        app.update();
        settle(&mut app);

        assert_eq!(request_count(&transport), 1);
        assert_eq!(input_text(&app), "");
        let users = message_texts(&mut app, widget::MessageBubble::User);
        assert_eq!(users, vec![("hi".to_string(), widget::TEXT)]);
    }

    #[test]
    fn keys_are_ignored_while_the_popup_is_closed() {
        let transport = CannedTransport::ok(reply("unused"));
        let mut app = app_with(transport.clone());

        type_text(&mut app, "hi");
        press_enter(&mut app);
        app.update();

        assert_eq!(input_text(&app), "");
        assert_eq!(request_count(&transport), 0);
    }

    #[test]
    fn enter_on_narrow_window_inserts_newline() {
        let transport = CannedTransport::ok(reply("unused"));
        let mut app = app_with(transport.clone());
        app.world_mut().spawn((
            Window { resolution: WindowResolution::new(600.0, 800.0), ..default() },
            PrimaryWindow,
        ));
        open_popup(&mut app);
        assert_eq!(input_radius(&mut app), Val::Px(32.0));

        type_text(&mut app, "hi");
        press_enter(&mut app);
        app.update();

        assert_eq!(input_text(&app), "hi\n");
        assert_eq!(request_count(&transport), 0);
        assert_eq!(input_radius(&mut app), Val::Px(15.0));

        press(&mut app, KeyCode::Backspace, Key::Backspace, None);
        app.update();
        assert_eq!(input_text(&app), "hi");
        assert_eq!(input_radius(&mut app), Val::Px(32.0));

        // the send button still submits on narrow windows
        press_button(&mut app, widget::WidgetButton::Send);
        app.update();
        settle(&mut app);
        assert_eq!(request_count(&transport), 1);
    }

    #[test]
    fn shift_enter_inserts_newline() {
        let transport = CannedTransport::ok(reply("unused"));
        let mut app = app_with(transport.clone());
        open_popup(&mut app);
        app.world_mut().resource_mut::<ButtonInput<KeyCode>>().press(KeyCode::ShiftLeft);

        type_text(&mut app, "a");
        press_enter(&mut app);
        type_text(&mut app, "b");
        app.update();

        assert_eq!(input_text(&app), "a\nb");
        assert_eq!(request_count(&transport), 0);
    }

    #[test]
    fn enter_on_whitespace_sends_nothing() {
        let transport = CannedTransport::ok(reply("unused"));
        let mut app = app_with(transport.clone());
        open_popup(&mut app);

        type_text(&mut app, "   ");
        press_enter(&mut app);
        for _ in 0..3 {
            app.update();
        }

        assert_eq!(request_count(&transport), 0);
        assert_eq!(app.world().resource::<Seen>().started, 0);
        assert!(message_texts(&mut app, widget::MessageBubble::User).is_empty());
    }

    #[test]
    fn send_button_submits_and_clears_input() {
        let transport = CannedTransport::ok(reply("done"));
        let mut app = app_with(transport.clone());
        open_popup(&mut app);
        app.world_mut().resource_mut::<ChatInput>().text = "  hello ".into();

        press_button(&mut app, widget::WidgetButton::Send);
        app.update();
        settle(&mut app);

        assert_eq!(request_count(&transport), 1);
        assert_eq!(input_text(&app), "");
        assert_eq!(app.world().resource::<Seen>().replies, vec!["done".to_string()]);
    }

    #[test]
    fn toggle_and_close_drive_popup_visibility() {
        let mut app = app_with(CannedTransport::ok(reply("unused")));
        assert_eq!(popup_visibility(&mut app), Visibility::Hidden);

        // an even number of toggles in one frame cancels out
        app.world_mut().send_event(ToggleChat);
        app.world_mut().send_event(ToggleChat);
        app.update();
        assert_eq!(popup_visibility(&mut app), Visibility::Hidden);

        press_button(&mut app, widget::WidgetButton::Toggle);
        app.update();
        assert_eq!(popup_visibility(&mut app), Visibility::Inherited);

        app.world_mut().send_event(CloseChat);
        app.update();
        assert_eq!(popup_visibility(&mut app), Visibility::Hidden);

        app.world_mut().send_event(ToggleChat);
        app.world_mut().send_event(CloseChat);
        app.update();
        assert_eq!(popup_visibility(&mut app), Visibility::Hidden);
    }

    #[test]
    fn attach_file_loads_on_the_io_pool() {
        let mut app = app_with(CannedTransport::ok(reply("unused")));
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&tiny_png()).unwrap();

        app.world_mut().send_event(AttachFile { path: f.path().to_path_buf() });
        update_until(&mut app, |w| !w.resource::<Seen>().ready.is_empty());

        let state = app.world().resource::<ChatState>();
        assert_eq!(state.session.attachment().source(), Some(AttachmentSource::File));
        assert_eq!(state.session.attachment().get().map(|a| a.mime_type.as_str()), Some("image/png"));
    }

    #[test]
    fn dropped_file_is_attached() {
        let mut app = app_with(CannedTransport::ok(reply("unused")));
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&tiny_png()).unwrap();

        app.world_mut().send_event(FileDragAndDrop::DroppedFile {
            window: Entity::PLACEHOLDER,
            path_buf: f.path().to_path_buf(),
        });
        update_until(&mut app, |w| !w.resource::<Seen>().ready.is_empty());

        assert_eq!(app.world().resource::<Seen>().ready, vec![AttachmentSource::File]);
    }

    #[test]
    fn non_image_file_is_rejected() {
        let mut app = app_with(CannedTransport::ok(reply("unused")));
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"plain notes").unwrap();

        app.world_mut().send_event(AttachFile { path: f.path().to_path_buf() });
        update_until(&mut app, |w| w.resource::<FileLoads>().0.is_empty());

        assert!(app.world().resource::<Seen>().ready.is_empty());
        assert!(app.world().resource::<ChatState>().session.attachment().is_empty());
    }

    #[test]
    fn attach_button_runs_the_picker() {
        let mut app = app_with(CannedTransport::ok(reply("unused")));
        let picked = PickedFile { name: "cat.png".into(), bytes: tiny_png() };
        app.insert_resource(ChatFilePicker(Arc::new(CannedPicker(Some(picked)))));
        open_popup(&mut app);

        press_button(&mut app, widget::WidgetButton::AttachFile);
        update_until(&mut app, |w| !w.resource::<Seen>().ready.is_empty());

        let state = app.world().resource::<ChatState>();
        assert_eq!(
            state.session.attachment().get(),
            Some(&Attachment::from_bytes(&tiny_png(), "image/png"))
        );
    }

    #[test]
    fn dismissed_picker_attaches_nothing() {
        let mut app = app_with(CannedTransport::ok(reply("unused")));
        app.insert_resource(ChatFilePicker(Arc::new(CannedPicker(None))));

        app.world_mut().send_event(PickFile);
        app.update();
        update_until(&mut app, |w| w.resource::<FileLoads>().0.is_empty());

        assert!(app.world().resource::<Seen>().ready.is_empty());
        assert!(app.world().resource::<ChatState>().session.attachment().is_empty());
    }

    #[test]
    fn crashed_request_task_still_frees_the_widget() {
        let mut app = app_with(Arc::new(PanickingTransport));

        submit(&mut app, "hello");
        settle(&mut app);

        assert_eq!(app.world().resource::<Seen>().errors.len(), 1);
        let bot = message_texts(&mut app, widget::MessageBubble::Bot);
        assert!(bot.iter().any(|(_, color)| *color == widget::ERROR_TEXT), "{bot:?}");
    }
}
