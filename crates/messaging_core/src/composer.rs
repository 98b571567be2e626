use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use shared::{
    domain::{ConversationId, MessageType},
    protocol::{Message, SendMessageRequest},
};
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

use crate::{
    api::MessagingApi,
    attachment::{AttachmentKind, PendingAttachment},
    blob::BlobUrlRegistry,
    capture::MediaCaptureController,
    conversation_store::ConversationStore,
    error::{MessagingError, ValidationError},
    message_store::MessageStore,
    personalize::{personalize, Recipient},
    upload::AttachmentUploader,
    ClientEvent,
};

/// What the composer currently shows for its staged attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedAttachment {
    pub kind: AttachmentKind,
    pub file_name: String,
    pub mime_type: String,
    pub preview_url: String,
    pub size: u64,
    pub duration_secs: Option<u64>,
}

impl From<&PendingAttachment> for StagedAttachment {
    fn from(pending: &PendingAttachment) -> Self {
        Self {
            kind: pending.kind,
            file_name: pending.file_name.clone(),
            mime_type: pending.mime_type.clone(),
            preview_url: pending.preview_url().to_string(),
            size: pending.size(),
            duration_secs: pending.duration_secs,
        }
    }
}

struct OutgoingAttachment {
    kind: AttachmentKind,
    data: Vec<u8>,
    file_name: String,
    content_type: String,
    duration_secs: Option<u64>,
}

#[derive(Default)]
struct ComposerState {
    text: String,
    pending: Option<PendingAttachment>,
}

/// Clears the in-flight flag when `send` returns or its future is dropped.
struct SendInFlight<'a>(&'a AtomicBool);

impl<'a> SendInFlight<'a> {
    /// Only called with the composer state locked.
    fn claim(flag: &'a AtomicBool) -> Option<Self> {
        (!flag.swap(true, Ordering::SeqCst)).then_some(Self(flag))
    }
}

impl Drop for SendInFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct MessageComposer {
    api: Arc<dyn MessagingApi>,
    uploader: Arc<AttachmentUploader>,
    capture: Arc<MediaCaptureController>,
    messages: Arc<MessageStore>,
    conversations: Arc<ConversationStore>,
    blob_urls: Arc<dyn BlobUrlRegistry>,
    inner: Mutex<ComposerState>,
    sending: AtomicBool,
    events: broadcast::Sender<ClientEvent>,
}

impl MessageComposer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        api: Arc<dyn MessagingApi>,
        uploader: Arc<AttachmentUploader>,
        capture: Arc<MediaCaptureController>,
        messages: Arc<MessageStore>,
        conversations: Arc<ConversationStore>,
        blob_urls: Arc<dyn BlobUrlRegistry>,
        events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        Self {
            api,
            uploader,
            capture,
            messages,
            conversations,
            blob_urls,
            inner: Mutex::new(ComposerState::default()),
            sending: AtomicBool::new(false),
            events,
        }
    }

    pub async fn set_text(&self, text: impl Into<String>) {
        self.inner.lock().await.text = text.into();
    }

    pub async fn text(&self) -> String {
        self.inner.lock().await.text.clone()
    }

    /// Fills the text box with a template personalized for `recipient`.
    pub async fn apply_template(&self, template: &str, recipient: &Recipient) {
        self.inner.lock().await.text = personalize(template, recipient);
    }

    pub async fn staged(&self) -> Option<StagedAttachment> {
        self.inner
            .lock()
            .await
            .pending
            .as_ref()
            .map(StagedAttachment::from)
    }

    pub async fn is_sending(&self) -> bool {
        self.sending.load(Ordering::SeqCst)
    }

    /// Stages a picked file. A previously picked file is replaced and its
    /// preview revoked; captured media is never replaced this way.
    pub async fn attach_file(
        &self,
        data: Vec<u8>,
        file_name: impl Into<String>,
        mime_type: impl Into<String>,
    ) -> Result<StagedAttachment, MessagingError> {
        if !self.capture.state().await.is_idle() {
            return Err(ValidationError::ComposerBusy.into());
        }
        let mut guard = self.inner.lock().await;
        if self.sending.load(Ordering::SeqCst) {
            return Err(ValidationError::ComposerBusy.into());
        }
        if guard.pending.as_ref().is_some_and(|pending| !pending.is_picked()) {
            return Err(ValidationError::AttachmentAlreadyStaged.into());
        }
        let staged = PendingAttachment::picked(&self.blob_urls, data, file_name, mime_type);
        let summary = StagedAttachment::from(&staged);
        if let Some(previous) = guard.pending.replace(staged) {
            info!(file_name = %previous.file_name, "composer: staged file superseded");
            previous.discard();
        }
        Ok(summary)
    }

    pub async fn discard_attachment(&self) {
        let pending = self.inner.lock().await.pending.take();
        if let Some(pending) = pending {
            info!(file_name = %pending.file_name, "composer: attachment discarded");
            pending.discard();
        }
    }

    pub async fn start_voice_recording(&self) -> Result<(), MessagingError> {
        self.ensure_free_for_capture().await?;
        self.capture.start_voice().await?;
        Ok(())
    }

    pub async fn open_camera(&self) -> Result<(), MessagingError> {
        self.ensure_free_for_capture().await?;
        self.capture.open_camera_preview().await?;
        Ok(())
    }

    pub async fn start_video_recording(&self) -> Result<(), MessagingError> {
        self.capture.start_video_recording().await?;
        Ok(())
    }

    /// Stops the running recording and stages its output.
    pub async fn stop_recording(&self) -> Result<StagedAttachment, MessagingError> {
        let recorded = self.capture.stop().await?;
        self.stage_capture(recorded).await
    }

    pub async fn capture_photo(&self) -> Result<StagedAttachment, MessagingError> {
        let photo = self.capture.capture_photo().await?;
        self.stage_capture(photo).await
    }

    pub async fn cancel_capture(&self) {
        self.capture.cancel().await;
    }

    /// Uploads the staged attachment if any, posts the message and updates the
    /// stores. On failure text and attachment are left in place for a retry.
    pub async fn send(&self, conversation_id: &ConversationId) -> Result<Message, MessagingError> {
        let busy =
            self.capture.state().await.is_busy() || self.uploader.is_uploading().await;
        let (content, outgoing, _in_flight) = {
            let guard = self.inner.lock().await;
            if busy || self.sending.load(Ordering::SeqCst) {
                return Err(ValidationError::ComposerBusy.into());
            }
            let trimmed = guard.text.trim();
            if trimmed.is_empty() && guard.pending.is_none() {
                return Err(ValidationError::EmptyMessage.into());
            }
            let content = (!trimmed.is_empty()).then(|| trimmed.to_string());
            let outgoing = guard.pending.as_ref().map(|pending| OutgoingAttachment {
                kind: pending.kind,
                data: pending.data.clone(),
                file_name: pending.file_name.clone(),
                content_type: pending.content_type().to_string(),
                duration_secs: pending.duration_secs,
            });
            let in_flight =
                SendInFlight::claim(&self.sending).ok_or(ValidationError::ComposerBusy)?;
            (content, outgoing, in_flight)
        };

        let result = self.deliver(conversation_id, content, outgoing).await;

        let message = match result {
            Ok(message) => message,
            Err(err) => {
                warn!(conversation_id = %conversation_id, "composer: send failed: {err}");
                let _ = self.events.send(ClientEvent::Error(err.to_string()));
                return Err(err);
            }
        };

        self.messages.append(conversation_id, message.clone()).await;
        self.conversations
            .upsert_from_sent_message(conversation_id, &message)
            .await;

        let sent_attachment = {
            let mut guard = self.inner.lock().await;
            guard.text.clear();
            guard.pending.take()
        };
        if let Some(pending) = sent_attachment {
            pending.discard();
        }
        info!(
            conversation_id = %conversation_id,
            message_id = %message.id,
            message_type = ?message.message_type,
            "composer: message sent"
        );
        Ok(message)
    }

    /// Releases any capture session and staged attachment.
    pub async fn teardown(&self) {
        self.capture.shutdown().await;
        self.discard_attachment().await;
    }

    async fn deliver(
        &self,
        conversation_id: &ConversationId,
        content: Option<String>,
        outgoing: Option<OutgoingAttachment>,
    ) -> Result<Message, MessagingError> {
        let request = match outgoing {
            Some(attachment) => {
                let reference = self
                    .uploader
                    .upload(
                        &attachment.data,
                        &attachment.file_name,
                        &attachment.content_type,
                    )
                    .await?;
                SendMessageRequest {
                    content,
                    message_type: attachment.kind.message_type(),
                    file_name: Some(reference.file_name),
                    file_url: Some(reference.url),
                    file_type: Some(reference.file_type),
                    duration: attachment.duration_secs,
                }
            }
            None => SendMessageRequest {
                content,
                message_type: MessageType::Text,
                file_name: None,
                file_url: None,
                file_type: None,
                duration: None,
            },
        };

        self.api
            .send_message(conversation_id, request)
            .await
            .map_err(|err| MessagingError::network(&err))
    }

    async fn ensure_free_for_capture(&self) -> Result<(), MessagingError> {
        let guard = self.inner.lock().await;
        if self.sending.load(Ordering::SeqCst) {
            return Err(ValidationError::ComposerBusy.into());
        }
        if guard.pending.is_some() {
            return Err(ValidationError::AttachmentAlreadyStaged.into());
        }
        Ok(())
    }

    async fn stage_capture(
        &self,
        captured: PendingAttachment,
    ) -> Result<StagedAttachment, MessagingError> {
        let mut guard = self.inner.lock().await;
        if guard.pending.is_some() {
            drop(guard);
            captured.discard();
            return Err(ValidationError::AttachmentAlreadyStaged.into());
        }
        let summary = StagedAttachment::from(&captured);
        info!(
            kind = ?captured.kind,
            file_name = %captured.file_name,
            "composer: capture staged"
        );
        guard.pending = Some(captured);
        Ok(summary)
    }
}

#[cfg(test)]
#[path = "tests/composer_tests.rs"]
mod tests;
