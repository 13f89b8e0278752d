//! image attachments: a base64 payload plus its mime type.
//!
//! attachments come from a local file (`load_file`) or a camera frame
//! (see `camera`). the widget holds at most one pending attachment at a
//! time in an `AttachmentBuffer`.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// an inline image payload, serialized the way `generateContent` expects
/// `inlineData` (`{ "data": ..., "mimeType": ... }`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    /// base64 (standard alphabet, padded) encoded bytes.
    pub data: String,
    pub mime_type: String,
}

#[derive(Debug, thiserror::Error)]
pub enum AttachmentError {
    #[error("failed to read attachment: {0}")]
    Io(#[from] std::io::Error),
    #[error("file is not a supported image")]
    NotAnImage,
    #[error("malformed data url")]
    MalformedDataUrl,
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("invalid image: {0}")]
    Image(#[from] image::ImageError),
}

impl Attachment {
    pub fn from_bytes(bytes: &[u8], mime_type: impl Into<String>) -> Self {
        Self {
            data: STANDARD.encode(bytes),
            mime_type: mime_type.into(),
        }
    }

    /// parses `data:<mime>;base64,<payload>`. the payload is everything
    /// after the first comma.
    pub fn from_data_url(url: &str) -> Result<Self, AttachmentError> {
        let rest = url.strip_prefix("data:").ok_or(AttachmentError::MalformedDataUrl)?;
        let (header, payload) = rest.split_once(',').ok_or(AttachmentError::MalformedDataUrl)?;
        let mime_type = header
            .strip_suffix(";base64")
            .ok_or(AttachmentError::MalformedDataUrl)?;
        if mime_type.is_empty() || payload.is_empty() {
            return Err(AttachmentError::MalformedDataUrl);
        }
        Ok(Self {
            data: payload.to_string(),
            mime_type: mime_type.to_string(),
        })
    }

    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.data)
    }

    pub fn decode(&self) -> Result<Vec<u8>, AttachmentError> {
        Ok(STANDARD.decode(&self.data)?)
    }

    pub fn decode_image(&self) -> Result<image::DynamicImage, AttachmentError> {
        let bytes = self.decode()?;
        Ok(image::load_from_memory(&bytes)?)
    }
}

/// reads an image file and sniffs its format from the content (not the
/// extension). blocking; the plugin runs it on the io task pool.
pub fn load_file(path: &Path) -> Result<Attachment, AttachmentError> {
    let bytes = std::fs::read(path)?;
    load_bytes(&bytes)
}

/// wraps raw image bytes (e.g. from a file picker), sniffing the mime type.
pub fn load_bytes(bytes: &[u8]) -> Result<Attachment, AttachmentError> {
    let format = image::guess_format(bytes).map_err(|_| AttachmentError::NotAnImage)?;
    Ok(Attachment::from_bytes(bytes, format.to_mime_type()))
}

/// where the buffered attachment came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentSource {
    File,
    Camera,
}

/// holds at most one pending attachment. a new acquisition replaces the
/// previous one.
#[derive(Debug, Clone, Default)]
pub struct AttachmentBuffer {
    slot: Option<(Attachment, AttachmentSource)>,
}

impl AttachmentBuffer {
    /// stores `attachment`, returning the one it displaced (if any).
    pub fn set(&mut self, attachment: Attachment, source: AttachmentSource) -> Option<Attachment> {
        self.slot.replace((attachment, source)).map(|(a, _)| a)
    }

    pub fn take(&mut self) -> Option<Attachment> {
        self.slot.take().map(|(a, _)| a)
    }

    pub fn clear(&mut self) {
        self.slot = None;
    }

    pub fn get(&self) -> Option<&Attachment> {
        self.slot.as_ref().map(|(a, _)| a)
    }

    pub fn source(&self) -> Option<AttachmentSource> {
        self.slot.as_ref().map(|(_, s)| *s)
    }

    pub fn is_empty(&self) -> bool {
        self.slot.is_none()
    }
}
