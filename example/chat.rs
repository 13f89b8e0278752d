//! popup chat widget demo.
//! - reads GEMINI_API_KEY / GEMINI_MODEL / GEMINI_BASE_URL from the env.
//! - CHAT_TEST_CAMERA=1 swaps in a synthetic camera so the capture flow can
//!   be tried without hardware.
//! - attach an image with the "file" button or by dropping it onto the window.
//!
//! replies and errors are also logged so failures are visible in the console.

use bevy::prelude::*;
use bevy_gemini_chat::{
    AttachmentReadyEvt, CameraCapture, CameraNoticeEvt, ChatConfig, ChatErrorEvt, ChatReplyEvt,
    ChatState, GeminiChatPlugin, TestPatternCamera, ToggleChat,
};

fn main() {
    #[cfg(target_arch = "wasm32")]
    console_error_panic_hook::set_once();

    let config = ChatConfig::from_env();
    let mut app = App::new();
    app.insert_resource(ClearColor(Color::srgb_u8(18, 18, 20)))
        .insert_resource(config);

    if std::env::var("CHAT_TEST_CAMERA").is_ok_and(|v| v == "1") {
        app.insert_resource(CameraCapture::new(TestPatternCamera::new(320, 240)));
    }

    app.add_plugins(DefaultPlugins)
        .add_plugins(GeminiChatPlugin)
        .add_systems(Startup, setup)
        .add_systems(
            Update,
            (on_reply, on_error, on_attachment, on_notice).after(bevy_gemini_chat::ChatSet::Drain),
        )
        .run();
}

fn setup(mut commands: Commands, config: Res<ChatConfig>, mut ev_toggle: EventWriter<ToggleChat>) {
    info!(
        target: "chat_widget",
        "config: base_url='{}', model='{}', key_present={}",
        config.base_url, config.model, !config.api_key.is_empty()
    );
    commands.spawn(Camera2d);
    // start with the popup open
    ev_toggle.write(ToggleChat);
}

fn on_reply(mut ev: EventReader<ChatReplyEvt>, state: Res<ChatState>) {
    for ChatReplyEvt { text, .. } in ev.read() {
        info!(
            target: "chat_widget",
            "reply (history={}): {}",
            state.session.history().len(), text
        );
    }
}

fn on_error(mut ev: EventReader<ChatErrorEvt>) {
    for ChatErrorEvt { error, .. } in ev.read() {
        error!(target: "chat_widget", "chat error: {}", error);
    }
}

fn on_attachment(mut ev: EventReader<AttachmentReadyEvt>) {
    for AttachmentReadyEvt { source, mime_type } in ev.read() {
        info!(target: "chat_widget", "attached {} from {:?}", mime_type, source);
    }
}

fn on_notice(mut ev: EventReader<CameraNoticeEvt>) {
    for CameraNoticeEvt { notice } in ev.read() {
        warn!(target: "chat_widget", "notice: {}", notice);
    }
}
