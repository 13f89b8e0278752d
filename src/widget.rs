//! the popup chat widget: message bubbles, the input line, the attachment
//! tray, the camera panel and the blocking notice.
//!
//! `render_outgoing`, `render_placeholder` and `resolve_placeholder` only
//! need `Commands`, so hosts with their own layout can reuse them against
//! any scrollable node.

use bevy::input::ButtonState;
use bevy::input::keyboard::{KeyCode, KeyboardInput};
use bevy::asset::RenderAssetUsages;
use bevy::prelude::*;
use bevy::render::render_resource::{Extent3d, TextureDimension, TextureFormat};
use bevy::ui::ScrollPosition;
use bevy::window::PrimaryWindow;

use crate::attachment::Attachment;
use crate::camera::{CameraCapture, Frame};
use crate::{
    CancelAttachment, CapturePhoto, ChatConfig, ChatState, CloseCamera, CloseChat, OpenCamera,
    PickFile, SubmitMessage, ToggleChat,
};

pub const ACCENT: Color = Color::srgb(0.365, 0.247, 0.827);
pub const PANEL: Color = Color::srgb(0.10, 0.10, 0.12);
pub const BOT_BUBBLE: Color = Color::srgb(0.18, 0.18, 0.22);
pub const TEXT: Color = Color::WHITE;
pub const ERROR_TEXT: Color = Color::srgb(1.0, 0.0, 0.0);
const MUTED: Color = Color::srgb(0.55, 0.55, 0.6);

const FONT_SIZE: f32 = 16.0;
const LINE_HEIGHT: f32 = 20.0;
const MAX_INPUT_LINES: usize = 5;
const PREVIEW_WIDTH: f32 = 160.0;

// ---------------------- components & resources ----------------------

/// popup container, hidden until toggled.
#[derive(Component)]
pub struct ChatRoot;

/// scrollable message list.
#[derive(Component)]
pub struct ChatBody;

#[derive(Component, Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageBubble {
    User,
    Bot,
}

#[derive(Component)]
pub struct MessageText;

/// bot bubble still waiting for its reply.
#[derive(Component)]
pub struct Pending;

/// animated dots on a pending bubble's text.
#[derive(Component)]
pub struct Thinking {
    timer: Timer,
    dots: usize,
}

impl Default for Thinking {
    fn default() -> Self {
        Self { timer: Timer::from_seconds(0.3, TimerMode::Repeating), dots: 1 }
    }
}

#[derive(Component)]
pub struct InputBox;
#[derive(Component)]
pub struct InputText;
#[derive(Component)]
pub struct SendButton;
#[derive(Component)]
pub struct AttachmentTray;
#[derive(Component)]
pub struct AttachmentThumb;
#[derive(Component)]
pub struct CameraPanel;
#[derive(Component)]
pub struct CameraView;
#[derive(Component)]
pub struct NoticePanel;
#[derive(Component)]
pub struct NoticeText;

#[derive(Component, Clone, Copy, Debug, PartialEq, Eq)]
pub enum WidgetButton {
    Toggle,
    Close,
    Send,
    CancelAttachment,
    AttachFile,
    OpenCamera,
    Capture,
    CloseCamera,
    DismissNotice,
}

/// text typed into the input line.
#[derive(Resource, Default, Debug, Clone)]
pub struct ChatInput {
    pub text: String,
}

/// a blocking, user-facing notice. input is ignored while it is shown.
#[derive(Resource, Default, Debug, Clone)]
pub struct Notice(pub Option<String>);

/// handle to a pending bot bubble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placeholder {
    pub body: Entity,
    pub bubble: Entity,
    pub text: Entity,
}

// ---------------------- rendering ----------------------

fn scroll_to_newest(commands: &mut Commands, body: Entity) {
    // layout clamps this to the real content height
    commands.entity(body).insert(ScrollPosition { offset_x: 0.0, offset_y: f32::MAX });
}

fn spawn_bubble(commands: &mut Commands, body: Entity, kind: MessageBubble) -> Entity {
    let (bg, align) = match kind {
        MessageBubble::User => (ACCENT, AlignSelf::FlexEnd),
        MessageBubble::Bot => (BOT_BUBBLE, AlignSelf::FlexStart),
    };
    let bubble = commands
        .spawn((
            kind,
            Node {
                max_width: Val::Percent(75.0),
                align_self: align,
                flex_direction: FlexDirection::Column,
                row_gap: Val::Px(6.0),
                padding: UiRect::axes(Val::Px(14.0), Val::Px(10.0)),
                ..default()
            },
            BackgroundColor(bg),
            BorderRadius::all(Val::Px(13.0)),
        ))
        .id();
    commands.entity(body).add_child(bubble);
    bubble
}

fn message_text(commands: &mut Commands, bubble: Entity, text: &str) -> Entity {
    let id = commands
        .spawn((
            MessageText,
            Text::new(text),
            TextFont { font_size: FONT_SIZE, ..default() },
            TextColor(TEXT),
        ))
        .id();
    commands.entity(bubble).add_child(id);
    id
}

/// appends a user bubble with `text` and an optional image preview.
pub fn render_outgoing(
    commands: &mut Commands,
    body: Entity,
    text: &str,
    preview: Option<Handle<Image>>,
) -> Entity {
    let bubble = spawn_bubble(commands, body, MessageBubble::User);
    message_text(commands, bubble, text);
    if let Some(image) = preview {
        let img = commands
            .spawn((
                ImageNode::new(image),
                Node { width: Val::Px(PREVIEW_WIDTH), ..default() },
                BorderRadius::all(Val::Px(8.0)),
            ))
            .id();
        commands.entity(bubble).add_child(img);
    }
    scroll_to_newest(commands, body);
    bubble
}

/// appends a bot bubble in the pending state.
pub fn render_placeholder(commands: &mut Commands, body: Entity) -> Placeholder {
    let bubble = spawn_bubble(commands, body, MessageBubble::Bot);
    commands.entity(bubble).insert(Pending);
    let text = message_text(commands, bubble, ".");
    commands.entity(text).insert((Thinking::default(), TextColor(MUTED)));
    scroll_to_newest(commands, body);
    Placeholder { body, bubble, text }
}

/// swaps the thinking indicator for the final text.
pub fn resolve_placeholder(commands: &mut Commands, placeholder: Placeholder, text: &str, is_error: bool) {
    let color = if is_error { ERROR_TEXT } else { TEXT };
    commands
        .entity(placeholder.text)
        .remove::<Thinking>()
        .insert((Text::new(text), TextColor(color)));
    commands.entity(placeholder.bubble).remove::<Pending>();
    scroll_to_newest(commands, placeholder.body);
}

/// decodes an attachment into a ui image.
pub fn preview_image(images: &mut Assets<Image>, attachment: &Attachment) -> Option<Handle<Image>> {
    match attachment.decode_image() {
        Ok(img) => Some(images.add(Image::from_dynamic(img, true, RenderAssetUsages::default()))),
        Err(err) => {
            warn!(target: "bevy_gemini_chat", "attachment preview unavailable: {}", err);
            None
        }
    }
}

fn frame_image(frame: Frame) -> Image {
    Image::new(
        Extent3d { width: frame.width, height: frame.height, depth_or_array_layers: 1 },
        TextureDimension::D2,
        frame.rgba,
        TextureFormat::Rgba8UnormSrgb,
        RenderAssetUsages::default(),
    )
}

// ---------------------- setup ----------------------

fn button(p: &mut ChildSpawnerCommands, kind: WidgetButton, label: &str, size: Vec2, bg: Color) {
    p.spawn((
        Button,
        kind,
        Node {
            width: Val::Px(size.x),
            height: Val::Px(size.y),
            align_items: AlignItems::Center,
            justify_content: JustifyContent::Center,
            ..default()
        },
        BackgroundColor(bg),
        BorderRadius::all(Val::Px(size.y / 2.0)),
    ))
    .with_children(|b| {
        b.spawn((Text::new(label), TextFont { font_size: 14.0, ..default() }, TextColor(TEXT)));
    });
}

pub(crate) fn spawn_widget(mut commands: Commands) {
    info!(target: "bevy_gemini_chat", "spawning chat widget");

    // launcher
    commands
        .spawn(Node {
            position_type: PositionType::Absolute,
            right: Val::Px(24.0),
            bottom: Val::Px(24.0),
            ..default()
        })
        .with_children(|p| button(p, WidgetButton::Toggle, "chat", Vec2::splat(56.0), ACCENT));

    // popup
    commands
        .spawn((
            ChatRoot,
            Node {
                position_type: PositionType::Absolute,
                right: Val::Px(24.0),
                bottom: Val::Px(96.0),
                width: Val::Px(380.0),
                height: Val::Px(560.0),
                flex_direction: FlexDirection::Column,
                ..default()
            },
            BackgroundColor(PANEL),
            BorderRadius::all(Val::Px(15.0)),
            Visibility::Hidden,
        ))
        .with_children(|root| {
            // header
            root.spawn((
                Node {
                    justify_content: JustifyContent::SpaceBetween,
                    align_items: AlignItems::Center,
                    padding: UiRect::axes(Val::Px(18.0), Val::Px(12.0)),
                    ..default()
                },
                BackgroundColor(ACCENT),
                BorderRadius::top(Val::Px(15.0)),
            ))
            .with_children(|h| {
                h.spawn((Text::new("Chatbot"), TextFont { font_size: 20.0, ..default() }, TextColor(TEXT)));
                button(h, WidgetButton::Close, "x", Vec2::splat(32.0), ACCENT);
            });

            // messages
            root.spawn((
                ChatBody,
                Node {
                    flex_grow: 1.0,
                    flex_direction: FlexDirection::Column,
                    row_gap: Val::Px(12.0),
                    padding: UiRect::all(Val::Px(16.0)),
                    overflow: Overflow::scroll_y(),
                    ..default()
                },
                ScrollPosition::default(),
            ))
            .with_children(|b| {
                b.spawn((
                    MessageBubble::Bot,
                    Node {
                        max_width: Val::Percent(75.0),
                        padding: UiRect::axes(Val::Px(14.0), Val::Px(10.0)),
                        ..default()
                    },
                    BackgroundColor(BOT_BUBBLE),
                    BorderRadius::all(Val::Px(13.0)),
                ))
                .with_children(|m| {
                    m.spawn((
                        MessageText,
                        Text::new("Hey there! How can I help you today?"),
                        TextFont { font_size: FONT_SIZE, ..default() },
                        TextColor(TEXT),
                    ));
                });
            });

            // attachment tray
            root.spawn((
                AttachmentTray,
                Node {
                    align_items: AlignItems::Center,
                    column_gap: Val::Px(8.0),
                    padding: UiRect::horizontal(Val::Px(16.0)),
                    ..default()
                },
                Visibility::Hidden,
            ))
            .with_children(|t| {
                t.spawn((
                    AttachmentThumb,
                    ImageNode::default(),
                    Node { width: Val::Px(48.0), height: Val::Px(48.0), ..default() },
                    BorderRadius::all(Val::Px(6.0)),
                ));
                button(t, WidgetButton::CancelAttachment, "x", Vec2::splat(24.0), BOT_BUBBLE);
            });

            // input line
            root.spawn((
                InputBox,
                Node {
                    margin: UiRect::all(Val::Px(12.0)),
                    padding: UiRect::axes(Val::Px(16.0), Val::Px(12.0)),
                    column_gap: Val::Px(8.0),
                    align_items: AlignItems::FlexEnd,
                    height: Val::Px(input_height(1)),
                    border: UiRect::all(Val::Px(1.0)),
                    ..default()
                },
                BorderColor(MUTED),
                BorderRadius::all(Val::Px(32.0)),
            ))
            .with_children(|f| {
                f.spawn((
                    InputText,
                    Text::new(""),
                    TextFont { font_size: FONT_SIZE, ..default() },
                    TextColor(MUTED),
                    Node { flex_grow: 1.0, ..default() },
                ));
                button(f, WidgetButton::AttachFile, "file", Vec2::new(44.0, 24.0), BOT_BUBBLE);
                button(f, WidgetButton::OpenCamera, "cam", Vec2::new(44.0, 24.0), BOT_BUBBLE);
                f.spawn((
                    SendButton,
                    Button,
                    WidgetButton::Send,
                    Node {
                        width: Val::Px(52.0),
                        height: Val::Px(24.0),
                        align_items: AlignItems::Center,
                        justify_content: JustifyContent::Center,
                        ..default()
                    },
                    BackgroundColor(ACCENT),
                    BorderRadius::all(Val::Px(12.0)),
                ))
                .with_children(|b| {
                    b.spawn((Text::new("send"), TextFont { font_size: 14.0, ..default() }, TextColor(TEXT)));
                });
            });
        });

    // camera panel
    commands
        .spawn((
            CameraPanel,
            Node {
                position_type: PositionType::Absolute,
                left: Val::Percent(50.0),
                top: Val::Percent(50.0),
                margin: UiRect { left: Val::Px(-170.0), top: Val::Px(-150.0), ..default() },
                width: Val::Px(340.0),
                flex_direction: FlexDirection::Column,
                row_gap: Val::Px(8.0),
                padding: UiRect::all(Val::Px(10.0)),
                ..default()
            },
            BackgroundColor(PANEL),
            BorderRadius::all(Val::Px(12.0)),
            GlobalZIndex(5),
            Visibility::Hidden,
        ))
        .with_children(|c| {
            c.spawn((
                CameraView,
                ImageNode::default(),
                Node { width: Val::Px(320.0), height: Val::Px(240.0), ..default() },
            ));
            c.spawn(Node { justify_content: JustifyContent::SpaceEvenly, ..default() })
                .with_children(|row| {
                    button(row, WidgetButton::Capture, "capture", Vec2::new(96.0, 28.0), ACCENT);
                    button(row, WidgetButton::CloseCamera, "close", Vec2::new(96.0, 28.0), BOT_BUBBLE);
                });
        });

    // blocking notice
    commands
        .spawn((
            NoticePanel,
            Node {
                position_type: PositionType::Absolute,
                width: Val::Percent(100.0),
                height: Val::Percent(100.0),
                align_items: AlignItems::Center,
                justify_content: JustifyContent::Center,
                ..default()
            },
            BackgroundColor(Color::srgba(0.0, 0.0, 0.0, 0.6)),
            GlobalZIndex(10),
            Visibility::Hidden,
        ))
        .with_children(|n| {
            n.spawn((
                Node {
                    flex_direction: FlexDirection::Column,
                    align_items: AlignItems::Center,
                    row_gap: Val::Px(12.0),
                    padding: UiRect::all(Val::Px(20.0)),
                    ..default()
                },
                BackgroundColor(PANEL),
                BorderRadius::all(Val::Px(12.0)),
            ))
            .with_children(|b| {
                b.spawn((NoticeText, Text::new(""), TextFont { font_size: FONT_SIZE, ..default() }, TextColor(TEXT)));
                button(b, WidgetButton::DismissNotice, "ok", Vec2::new(72.0, 28.0), ACCENT);
            });
        });
}

fn input_height(lines: usize) -> f32 {
    24.0 + LINE_HEIGHT * lines.clamp(1, MAX_INPUT_LINES) as f32
}

// ---------------------- input ----------------------

fn popup_open(q_root: &Query<&Visibility, With<ChatRoot>>) -> bool {
    q_root.iter().any(|v| *v != Visibility::Hidden)
}

/// typing, backspace and enter for the input line.
///
/// enter sends on desktop widths unless shift is held; on narrow windows it
/// inserts a newline (the send button is the way to submit there).
pub(crate) fn handle_text_input(
    mut ev_kbd: EventReader<KeyboardInput>,
    keys: Res<ButtonInput<KeyCode>>,
    config: Res<ChatConfig>,
    state: Res<ChatState>,
    notice: Res<Notice>,
    windows: Query<&Window, With<PrimaryWindow>>,
    q_root: Query<&Visibility, With<ChatRoot>>,
    mut input: ResMut<ChatInput>,
    mut ev_submit: EventWriter<SubmitMessage>,
) {
    if notice.0.is_some() || !popup_open(&q_root) {
        ev_kbd.clear();
        return;
    }
    let desktop = windows.single().map_or(true, |w| w.width() > config.desktop_min_width);
    let shift = keys.any_pressed([KeyCode::ShiftLeft, KeyCode::ShiftRight]);

    for ev in ev_kbd.read() {
        if ev.state != ButtonState::Pressed {
            continue;
        }
        match ev.key_code {
            KeyCode::Enter => {
                if desktop && !shift {
                    if !input.text.trim().is_empty() && !state.is_busy() {
                        let text = std::mem::take(&mut input.text);
                        ev_submit.write(SubmitMessage { text });
                    }
                } else {
                    input.text.push('\n');
                }
            }
            KeyCode::Backspace => {
                input.text.pop();
            }
            _ => {
                if let Some(txt) = &ev.text {
                    input.text.extend(txt.chars().filter(|c| !c.is_control()));
                }
            }
        }
    }
}

/// maps button presses to widget events.
pub(crate) fn handle_buttons(
    q: Query<(&Interaction, &WidgetButton), Changed<Interaction>>,
    state: Res<ChatState>,
    mut input: ResMut<ChatInput>,
    mut notice: ResMut<Notice>,
    mut ev_submit: EventWriter<SubmitMessage>,
    mut ev_toggle: EventWriter<ToggleChat>,
    mut ev_close: EventWriter<CloseChat>,
    mut ev_cancel: EventWriter<CancelAttachment>,
    mut ev_pick: EventWriter<PickFile>,
    mut ev_open_cam: EventWriter<OpenCamera>,
    mut ev_capture: EventWriter<CapturePhoto>,
    mut ev_close_cam: EventWriter<CloseCamera>,
) {
    for (interaction, kind) in &q {
        if *interaction != Interaction::Pressed {
            continue;
        }
        debug!(target: "bevy_gemini_chat", "button pressed: {:?}", kind);
        if notice.0.is_some() && *kind != WidgetButton::DismissNotice {
            continue;
        }
        match kind {
            WidgetButton::Toggle => {
                ev_toggle.write(ToggleChat);
            }
            WidgetButton::Close => {
                ev_close.write(CloseChat);
            }
            WidgetButton::Send => {
                if !state.is_busy() && !input.text.trim().is_empty() {
                    let text = std::mem::take(&mut input.text);
                    ev_submit.write(SubmitMessage { text });
                }
            }
            WidgetButton::CancelAttachment => {
                ev_cancel.write(CancelAttachment);
            }
            WidgetButton::AttachFile => {
                ev_pick.write(PickFile);
            }
            WidgetButton::OpenCamera => {
                ev_open_cam.write(OpenCamera);
            }
            WidgetButton::Capture => {
                ev_capture.write(CapturePhoto);
            }
            WidgetButton::CloseCamera => {
                ev_close_cam.write(CloseCamera);
            }
            WidgetButton::DismissNotice => notice.0 = None,
        }
    }
}

pub(crate) fn toggle_popup(
    mut ev_toggle: EventReader<ToggleChat>,
    mut ev_close: EventReader<CloseChat>,
    mut q_root: Query<&mut Visibility, With<ChatRoot>>,
) {
    let toggles = ev_toggle.read().count();
    let close = ev_close.read().count() > 0;
    if toggles == 0 && !close {
        return;
    }
    for mut vis in &mut q_root {
        if toggles % 2 == 1 {
            *vis = if *vis == Visibility::Hidden { Visibility::Inherited } else { Visibility::Hidden };
        }
        if close {
            *vis = Visibility::Hidden;
        }
    }
}

// ---------------------- refresh ----------------------

pub(crate) fn animate_thinking(time: Res<Time>, mut q: Query<(&mut Thinking, &mut Text)>) {
    for (mut thinking, mut text) in &mut q {
        if thinking.timer.tick(time.delta()).just_finished() {
            thinking.dots = thinking.dots % 3 + 1;
            text.0 = ".".repeat(thinking.dots);
        }
    }
}

/// mirrors the input buffer and grows the box with its line count.
pub(crate) fn refresh_input(
    input: Res<ChatInput>,
    mut q_text: Query<(&mut Text, &mut TextColor), With<InputText>>,
    mut q_box: Query<(&mut Node, &mut BorderRadius), With<InputBox>>,
) {
    if !input.is_changed() {
        return;
    }
    for (mut text, mut color) in &mut q_text {
        if input.text.is_empty() {
            text.0 = "Message...".to_string();
            color.0 = MUTED;
        } else {
            text.0 = format!("{}|", input.text);
            color.0 = TEXT;
        }
    }
    let lines = input.text.lines().count().max(1) + usize::from(input.text.ends_with('\n'));
    for (mut node, mut radius) in &mut q_box {
        node.height = Val::Px(input_height(lines));
        let r = if lines > 1 { 15.0 } else { 32.0 };
        *radius = BorderRadius::all(Val::Px(r));
    }
}

pub(crate) fn refresh_send_button(
    state: Res<ChatState>,
    mut q: Query<&mut BackgroundColor, With<SendButton>>,
) {
    if !state.is_changed() {
        return;
    }
    let bg = if state.is_busy() { MUTED } else { ACCENT };
    for mut c in &mut q {
        c.0 = bg;
    }
}

/// shows the buffered attachment as a thumbnail.
pub(crate) fn refresh_attachment_tray(
    state: Res<ChatState>,
    images: Option<ResMut<Assets<Image>>>,
    mut shown: Local<Option<Attachment>>,
    mut q_tray: Query<&mut Visibility, With<AttachmentTray>>,
    mut q_thumb: Query<&mut ImageNode, With<AttachmentThumb>>,
) {
    if !state.is_changed() {
        return;
    }
    let current = state.session.attachment().get();
    if current == shown.as_ref() {
        return;
    }
    *shown = current.cloned();

    let handle = match (current, images) {
        (Some(a), Some(mut images)) => preview_image(&mut images, a),
        _ => None,
    };
    for mut thumb in &mut q_thumb {
        thumb.image = handle.clone().unwrap_or_default();
    }
    for mut vis in &mut q_tray {
        *vis = if current.is_some() { Visibility::Inherited } else { Visibility::Hidden };
    }
}

pub(crate) fn sync_overlays(
    camera: Res<CameraCapture>,
    notice: Res<Notice>,
    mut q_cam: Query<&mut Visibility, (With<CameraPanel>, Without<NoticePanel>)>,
    mut q_notice: Query<&mut Visibility, (With<NoticePanel>, Without<CameraPanel>)>,
    mut q_notice_text: Query<&mut Text, With<NoticeText>>,
) {
    if camera.is_changed() {
        for mut vis in &mut q_cam {
            *vis = if camera.is_open() { Visibility::Inherited } else { Visibility::Hidden };
        }
    }
    if notice.is_changed() {
        for mut vis in &mut q_notice {
            *vis = if notice.0.is_some() { Visibility::Inherited } else { Visibility::Hidden };
        }
        for mut text in &mut q_notice_text {
            text.0 = notice.0.clone().unwrap_or_default();
        }
    }
}

/// pushes live frames into the camera panel while the camera is open.
pub(crate) fn stream_camera_preview(
    mut camera: ResMut<CameraCapture>,
    images: Option<ResMut<Assets<Image>>>,
    mut preview: Local<Option<Handle<Image>>>,
    mut q_view: Query<&mut ImageNode, With<CameraView>>,
) {
    let Some(mut images) = images else { return };
    // polling frames must not mark the camera changed
    let camera = camera.bypass_change_detection();
    if !camera.is_open() {
        *preview = None;
        return;
    }
    let frame = match camera.frame() {
        Ok(f) => f,
        Err(err) => {
            debug!(target: "bevy_gemini_chat", "camera preview frame skipped: {}", err);
            return;
        }
    };
    let image = frame_image(frame);
    match preview.as_ref().and_then(|h| images.get_mut(h)) {
        Some(existing) => *existing = image,
        None => {
            let handle = images.add(image);
            for mut view in &mut q_view {
                view.image = handle.clone();
            }
            *preview = Some(handle);
        }
    }
}
