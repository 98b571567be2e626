use thiserror::Error;

use crate::capture::{CaptureKind, CaptureState};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaptureError {
    /// Recoverable: the user may grant access and try again.
    #[error("{device} access denied: {reason}")]
    PermissionDenied { device: CaptureKind, reason: String },
    #[error("{device} is unavailable: {reason}")]
    DeviceUnavailable { device: CaptureKind, reason: String },
    #[error("capture already active ({state:?})")]
    Busy { state: CaptureState },
    #[error("cannot {operation} while {state:?}")]
    InvalidTransition {
        operation: &'static str,
        state: CaptureState,
    },
    #[error("capture was cancelled before it started")]
    Cancelled,
    #[error("recorder failed: {0}")]
    Recorder(String),
    #[error("failed to encode still image: {0}")]
    Encode(String),
}

impl CaptureError {
    pub fn is_permission_error(&self) -> bool {
        matches!(self, Self::PermissionDenied { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UploadError {
    #[error("{file_name} is empty")]
    Empty { file_name: String },
    #[error("{file_name} is {size} bytes, limit is {limit}")]
    TooLarge {
        file_name: String,
        size: u64,
        limit: u64,
    },
    #[error("{file_name} was rejected: {reason}")]
    Rejected { file_name: String, reason: String },
    #[error("failed to upload {file_name}: {reason}")]
    Transport { file_name: String, reason: String },
}

impl UploadError {
    pub fn file_name(&self) -> &str {
        match self {
            Self::Empty { file_name }
            | Self::TooLarge { file_name, .. }
            | Self::Rejected { file_name, .. }
            | Self::Transport { file_name, .. } => file_name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("message has neither text nor attachment")]
    EmptyMessage,
    #[error("composer is busy with an upload or recording")]
    ComposerBusy,
    #[error("an attachment is already staged")]
    AttachmentAlreadyStaged,
    #[error("no conversation selected")]
    NoConversationSelected,
}

#[derive(Debug, Error)]
pub enum MessagingError {
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Upload(#[from] UploadError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("network request failed: {0}")]
    Network(String),
}

impl MessagingError {
    pub fn network(err: &anyhow::Error) -> Self {
        Self::Network(format!("{err:#}"))
    }
}
