//! the attach-file button's picker: one image file per selection.
//!
//! `RfdPicker` opens the platform dialog (`rfd`), which on wasm is the
//! browser's file input. the plugin runs the pick on the io task pool and
//! feeds the bytes through `load_bytes`.

use std::sync::Arc;

/// extensions offered by the dialog filter; the content is sniffed anyway.
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "bmp"];

/// a file the user picked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PickedFile {
    pub name: String,
    pub bytes: Vec<u8>,
}

/// asks the user for one image file. `None` when the dialog is dismissed.
#[cfg_attr(target_arch = "wasm32", async_trait::async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait::async_trait)]
pub trait FilePicker: Send + Sync {
    async fn pick_image(&self) -> Option<PickedFile>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RfdPicker;

#[cfg_attr(target_arch = "wasm32", async_trait::async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait::async_trait)]
impl FilePicker for RfdPicker {
    async fn pick_image(&self) -> Option<PickedFile> {
        let handle = rfd::AsyncFileDialog::new()
            .set_title("Attach an image")
            .add_filter("image", IMAGE_EXTENSIONS)
            .pick_file()
            .await?;
        let name = handle.file_name();
        let bytes = handle.read().await;
        Some(PickedFile { name, bytes })
    }
}

/// picker used by the attach-file button.
#[derive(bevy::prelude::Resource, Clone)]
pub struct ChatFilePicker(pub Arc<dyn FilePicker>);

impl Default for ChatFilePicker {
    fn default() -> Self {
        Self(Arc::new(RfdPicker))
    }
}
