use std::sync::Arc;

use anyhow::Result;
use shared::{
    domain::{ConversationId, MessageId, MessageStatus},
    protocol::Message,
};
use tokio::sync::broadcast;

pub mod api;
pub mod attachment;
pub mod blob;
pub mod capture;
pub mod composer;
pub mod config;
pub mod conversation_store;
pub mod error;
pub mod message_store;
pub mod personalize;
pub mod playback;
pub mod upload;

pub use api::{HttpMessagingApi, MessagingApi};
pub use attachment::{AttachmentKind, PendingAttachment};
pub use blob::{BlobUrlRegistry, InMemoryBlobUrls, PreviewUrl};
pub use capture::{
    CaptureKind, CaptureOptions, CaptureState, MediaCaptureController, MediaDevices,
    MissingMediaDevices,
};
pub use composer::{MessageComposer, StagedAttachment};
pub use config::{load_settings, ClientSettings};
pub use conversation_store::{ConversationStore, ListState};
pub use error::{CaptureError, MessagingError, UploadError, ValidationError};
pub use message_store::{LoadOutcome, LoadState, MessageStore};
pub use personalize::{personalize, Recipient};
pub use playback::{PlaybackController, PlaybackHandle};
pub use upload::{AttachmentReference, AttachmentUploader, BatchOutcome, UploadItem};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Notifications for a rendering layer.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    ConversationsUpdated,
    ConversationListFailed(String),
    MessagesReplaced {
        conversation_id: ConversationId,
        count: usize,
    },
    MessageAppended {
        conversation_id: ConversationId,
        message: Message,
    },
    MessageStatusChanged {
        message_id: MessageId,
        status: MessageStatus,
    },
    CaptureStateChanged(CaptureState),
    RecordingTick {
        elapsed_secs: u64,
    },
    UploadStarted {
        file_name: String,
    },
    UploadSucceeded {
        reference: AttachmentReference,
    },
    UploadFailed {
        error: UploadError,
    },
    PlaybackChanged {
        playing: Option<MessageId>,
    },
    Error(String),
}

/// All messaging components wired to one API and one event channel.
pub struct MessagingClient {
    pub conversations: Arc<ConversationStore>,
    pub messages: Arc<MessageStore>,
    pub composer: Arc<MessageComposer>,
    pub capture: Arc<MediaCaptureController>,
    pub uploader: Arc<AttachmentUploader>,
    events: broadcast::Sender<ClientEvent>,
}

impl MessagingClient {
    pub fn new(
        settings: &ClientSettings,
        api: Arc<dyn MessagingApi>,
        devices: Arc<dyn MediaDevices>,
        blob_urls: Arc<dyn BlobUrlRegistry>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let messages = Arc::new(MessageStore::new(Arc::clone(&api), events.clone()));
        let conversations = Arc::new(ConversationStore::new(
            Arc::clone(&api),
            Arc::clone(&messages),
            events.clone(),
        ));
        let uploader = Arc::new(AttachmentUploader::new(
            Arc::clone(&api),
            settings.max_upload_bytes,
            events.clone(),
        ));
        let capture = Arc::new(MediaCaptureController::new(
            devices,
            Arc::clone(&blob_urls),
            CaptureOptions {
                mirror_preview: settings.mirror_camera_preview,
                jpeg_quality: settings.photo_jpeg_quality,
            },
            events.clone(),
        ));
        let composer = Arc::new(MessageComposer::new(
            api,
            Arc::clone(&uploader),
            Arc::clone(&capture),
            Arc::clone(&messages),
            Arc::clone(&conversations),
            blob_urls,
            events.clone(),
        ));
        Self {
            conversations,
            messages,
            composer,
            capture,
            uploader,
            events,
        }
    }

    /// Client backed by the HTTP API described by `settings`.
    pub fn connect(
        settings: &ClientSettings,
        devices: Arc<dyn MediaDevices>,
        blob_urls: Arc<dyn BlobUrlRegistry>,
    ) -> Result<Self> {
        let api: Arc<dyn MessagingApi> = Arc::new(HttpMessagingApi::new(settings)?);
        Ok(Self::new(settings, api, devices, blob_urls))
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// A playback controller for one rendered message list, reporting on the
    /// client's event channel.
    pub fn playback(&self) -> PlaybackController {
        PlaybackController::with_events(self.events.clone())
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
