use std::sync::Arc;

use chrono::Utc;
use shared::domain::MessageType;

use crate::blob::{BlobUrlRegistry, PreviewUrl};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttachmentKind {
    Image,
    File,
    Voice,
    Video,
}

impl AttachmentKind {
    pub fn message_type(self) -> MessageType {
        match self {
            Self::Image => MessageType::Image,
            Self::File => MessageType::File,
            Self::Voice => MessageType::Voice,
            Self::Video => MessageType::Video,
        }
    }
}

/// Locally staged media waiting to be uploaded with the next message.
#[derive(Debug)]
pub struct PendingAttachment {
    pub kind: AttachmentKind,
    pub data: Vec<u8>,
    pub file_name: String,
    /// Full negotiated type, codec parameters included.
    pub mime_type: String,
    pub duration_secs: Option<u64>,
    pub(crate) preview: PreviewUrl,
    pub(crate) picked: bool,
}

impl PendingAttachment {
    /// A file chosen by the user. Images are sent as image messages.
    pub fn picked(
        registry: &Arc<dyn BlobUrlRegistry>,
        data: Vec<u8>,
        file_name: impl Into<String>,
        mime_type: impl Into<String>,
    ) -> Self {
        let mime_type = mime_type.into();
        let kind = if mime_type.starts_with("image/") {
            AttachmentKind::Image
        } else {
            AttachmentKind::File
        };
        let preview = PreviewUrl::create(registry, &data, &mime_type);
        Self {
            kind,
            data,
            file_name: file_name.into(),
            mime_type,
            duration_secs: None,
            preview,
            picked: true,
        }
    }

    pub(crate) fn captured(
        registry: &Arc<dyn BlobUrlRegistry>,
        kind: AttachmentKind,
        data: Vec<u8>,
        mime_type: String,
        duration_secs: Option<u64>,
    ) -> Self {
        let file_name = capture_file_name(kind, &mime_type, Utc::now().timestamp_millis());
        let preview = PreviewUrl::create(registry, &data, &mime_type);
        Self {
            kind,
            data,
            file_name,
            mime_type,
            duration_secs,
            preview,
            picked: false,
        }
    }

    pub fn preview_url(&self) -> &str {
        self.preview.as_str()
    }

    /// Whether it came from the file picker rather than the camera or microphone.
    pub fn is_picked(&self) -> bool {
        self.picked
    }

    /// Mime type without codec parameters, as sent to storage.
    pub fn content_type(&self) -> &str {
        essence(&self.mime_type)
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Drops the payload and revokes the preview URL.
    pub fn discard(self) {
        self.preview.revoke();
    }
}

pub fn essence(mime_type: &str) -> &str {
    mime_type.split(';').next().unwrap_or(mime_type).trim()
}

pub fn extension_for_mime(mime_type: &str) -> &'static str {
    match essence(mime_type) {
        "audio/webm" | "video/webm" => "webm",
        "audio/ogg" => "ogg",
        "audio/mp4" => "m4a",
        "audio/mpeg" => "mp3",
        "audio/wav" => "wav",
        "video/mp4" => "mp4",
        "video/quicktime" => "mov",
        "image/jpeg" => "jpg",
        "image/png" => "png",
        "image/webp" => "webp",
        _ => "bin",
    }
}

fn capture_file_name(kind: AttachmentKind, mime_type: &str, unix_ms: i64) -> String {
    let stem = match kind {
        AttachmentKind::Voice => "voice",
        AttachmentKind::Video => "video",
        AttachmentKind::Image => "photo",
        AttachmentKind::File => "file",
    };
    format!("{stem}-{unix_ms}.{}", extension_for_mime(mime_type))
}

#[cfg(test)]
#[path = "tests/attachment_tests.rs"]
mod tests;
