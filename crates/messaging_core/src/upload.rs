use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use shared::{error::ApiException, protocol::AttachmentUploadRequest};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::{api::MessagingApi, error::UploadError, ClientEvent};

/// Durable reference returned by storage, usable in a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentReference {
    pub url: String,
    pub file_name: String,
    pub file_type: String,
    pub file_size: u64,
}

#[derive(Debug, Clone)]
pub struct UploadItem {
    pub data: Vec<u8>,
    pub file_name: String,
    pub mime_type: String,
}

#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub attached: Vec<AttachmentReference>,
    pub failures: Vec<UploadError>,
}

impl BatchOutcome {
    pub fn all_succeeded(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Listed in `in_progress` from creation until dropped, so an upload whose
/// future is abandoned mid-request does not stay listed.
struct InProgressEntry<'a> {
    uploading: &'a Mutex<Vec<String>>,
    file_name: String,
}

impl<'a> InProgressEntry<'a> {
    fn start(uploading: &'a Mutex<Vec<String>>, file_name: &str) -> Self {
        lock_list(uploading).push(file_name.to_string());
        Self {
            uploading,
            file_name: file_name.to_string(),
        }
    }
}

impl Drop for InProgressEntry<'_> {
    fn drop(&mut self) {
        let mut uploading = lock_list(self.uploading);
        if let Some(position) = uploading.iter().position(|name| name == &self.file_name) {
            uploading.remove(position);
        }
    }
}

fn lock_list(list: &Mutex<Vec<String>>) -> MutexGuard<'_, Vec<String>> {
    list.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct AttachmentUploader {
    api: Arc<dyn MessagingApi>,
    max_bytes: u64,
    in_progress: Mutex<Vec<String>>,
    events: broadcast::Sender<ClientEvent>,
}

impl AttachmentUploader {
    pub fn new(
        api: Arc<dyn MessagingApi>,
        max_bytes: u64,
        events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        Self {
            api,
            max_bytes,
            in_progress: Mutex::new(Vec::new()),
            events,
        }
    }

    /// File names currently uploading, in start order.
    pub async fn in_progress(&self) -> Vec<String> {
        lock_list(&self.in_progress).clone()
    }

    pub async fn is_uploading(&self) -> bool {
        !lock_list(&self.in_progress).is_empty()
    }

    pub async fn upload(
        &self,
        data: &[u8],
        file_name: &str,
        mime_type: &str,
    ) -> Result<AttachmentReference, UploadError> {
        let result = self.upload_inner(data, file_name, mime_type).await;
        match &result {
            Ok(reference) => {
                let _ = self.events.send(ClientEvent::UploadSucceeded {
                    reference: reference.clone(),
                });
            }
            Err(err) => {
                warn!(file_name, "upload: {err}");
                let _ = self
                    .events
                    .send(ClientEvent::UploadFailed { error: err.clone() });
            }
        }
        result
    }

    /// Uploads one after another; a failed item never stops the rest.
    pub async fn upload_batch(&self, items: Vec<UploadItem>) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for item in items {
            match self
                .upload(&item.data, &item.file_name, &item.mime_type)
                .await
            {
                Ok(reference) => outcome.attached.push(reference),
                Err(err) => outcome.failures.push(err),
            }
        }
        info!(
            attached = outcome.attached.len(),
            failed = outcome.failures.len(),
            "upload: batch finished"
        );
        outcome
    }

    async fn upload_inner(
        &self,
        data: &[u8],
        file_name: &str,
        mime_type: &str,
    ) -> Result<AttachmentReference, UploadError> {
        if data.is_empty() {
            return Err(UploadError::Empty {
                file_name: file_name.to_string(),
            });
        }
        let size = data.len() as u64;
        if size > self.max_bytes {
            return Err(UploadError::TooLarge {
                file_name: file_name.to_string(),
                size,
                limit: self.max_bytes,
            });
        }

        let entry = InProgressEntry::start(&self.in_progress, file_name);
        let _ = self.events.send(ClientEvent::UploadStarted {
            file_name: file_name.to_string(),
        });

        let request = AttachmentUploadRequest {
            file: STANDARD.encode(data),
            file_name: file_name.to_string(),
            file_type: mime_type.to_string(),
        };
        let result = self.api.upload_attachment(request).await;
        drop(entry);

        match result {
            Ok(stored) => {
                info!(
                    file_name,
                    file_size = stored.file_size,
                    "upload: stored attachment"
                );
                Ok(AttachmentReference {
                    url: stored.url,
                    file_name: stored.file_name,
                    file_type: stored.file_type,
                    file_size: stored.file_size,
                })
            }
            Err(err) => match err.downcast_ref::<ApiException>() {
                Some(rejection) => Err(UploadError::Rejected {
                    file_name: file_name.to_string(),
                    reason: rejection.message.clone(),
                }),
                None => Err(UploadError::Transport {
                    file_name: file_name.to_string(),
                    reason: format!("{err:#}"),
                }),
            },
        }
    }
}

#[cfg(test)]
#[path = "tests/upload_tests.rs"]
mod tests;
