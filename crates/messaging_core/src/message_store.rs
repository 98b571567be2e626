use std::sync::Arc;

use shared::{
    domain::{ConversationId, MessageId, MessageStatus, ProfileId},
    protocol::Message,
};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::{api::MessagingApi, error::MessagingError, ClientEvent};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadState {
    Idle,
    Loading,
    Ready,
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Applied { count: usize },
    /// A newer load started while this one was in flight; its result was dropped.
    Superseded,
}

struct MessageStoreState {
    conversation_id: Option<ConversationId>,
    messages: Vec<Message>,
    current_user_id: Option<ProfileId>,
    latest_request: u64,
    load_state: LoadState,
}

/// Messages of the conversation on screen, oldest first.
pub struct MessageStore {
    api: Arc<dyn MessagingApi>,
    inner: Mutex<MessageStoreState>,
    events: broadcast::Sender<ClientEvent>,
}

impl MessageStore {
    pub fn new(api: Arc<dyn MessagingApi>, events: broadcast::Sender<ClientEvent>) -> Self {
        Self {
            api,
            inner: Mutex::new(MessageStoreState {
                conversation_id: None,
                messages: Vec::new(),
                current_user_id: None,
                latest_request: 0,
                load_state: LoadState::Idle,
            }),
            events,
        }
    }

    pub async fn load(&self, conversation_id: &ConversationId) -> Result<LoadOutcome, MessagingError> {
        let token = {
            let mut guard = self.inner.lock().await;
            guard.latest_request += 1;
            if guard.conversation_id.as_ref() != Some(conversation_id) {
                guard.messages.clear();
                guard.conversation_id = Some(conversation_id.clone());
            }
            guard.load_state = LoadState::Loading;
            guard.latest_request
        };

        let result = self.api.fetch_messages(conversation_id).await;

        let mut guard = self.inner.lock().await;
        if guard.latest_request != token {
            debug!(
                conversation_id = %conversation_id,
                token,
                latest = guard.latest_request,
                "messages: discarding superseded load"
            );
            return Ok(LoadOutcome::Superseded);
        }

        match result {
            Ok(snapshot) => {
                let mut messages = snapshot.messages;
                messages.sort_by_key(|message| message.created_at);
                let count = messages.len();
                guard.messages = messages;
                guard.current_user_id = Some(snapshot.current_user_id);
                guard.load_state = LoadState::Ready;
                drop(guard);
                info!(conversation_id = %conversation_id, count, "messages: loaded");
                let _ = self.events.send(ClientEvent::MessagesReplaced {
                    conversation_id: conversation_id.clone(),
                    count,
                });
                Ok(LoadOutcome::Applied { count })
            }
            Err(err) => {
                let error = MessagingError::network(&err);
                guard.load_state = LoadState::Failed(error.to_string());
                drop(guard);
                warn!(conversation_id = %conversation_id, "messages: load failed: {err:#}");
                let _ = self.events.send(ClientEvent::Error(error.to_string()));
                Err(error)
            }
        }
    }

    /// Adds a message to the end of the visible conversation.
    ///
    /// Returns false when the conversation is no longer displayed or the id is
    /// already present.
    pub async fn append(&self, conversation_id: &ConversationId, message: Message) -> bool {
        let mut guard = self.inner.lock().await;
        if guard.conversation_id.as_ref() != Some(conversation_id) {
            debug!(
                conversation_id = %conversation_id,
                message_id = %message.id,
                "messages: append for hidden conversation ignored"
            );
            return false;
        }
        if guard.messages.iter().any(|existing| existing.id == message.id) {
            return false;
        }
        if let Some(last) = guard.messages.last() {
            if message.created_at < last.created_at {
                warn!(
                    message_id = %message.id,
                    "messages: appended message is older than the current tail"
                );
            }
        }
        guard.messages.push(message.clone());
        drop(guard);
        let _ = self.events.send(ClientEvent::MessageAppended {
            conversation_id: conversation_id.clone(),
            message,
        });
        true
    }

    /// Moves a message forward along sent → delivered → read.
    pub async fn update_status(&self, message_id: &MessageId, status: MessageStatus) -> bool {
        let mut guard = self.inner.lock().await;
        let Some(message) = guard
            .messages
            .iter_mut()
            .find(|message| &message.id == message_id)
        else {
            return false;
        };
        if status <= message.status {
            return false;
        }
        message.status = status;
        drop(guard);
        let _ = self.events.send(ClientEvent::MessageStatusChanged {
            message_id: message_id.clone(),
            status,
        });
        true
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.inner.lock().await.messages.clone()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.messages.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.messages.is_empty()
    }

    pub async fn conversation_id(&self) -> Option<ConversationId> {
        self.inner.lock().await.conversation_id.clone()
    }

    pub async fn current_user_id(&self) -> Option<ProfileId> {
        self.inner.lock().await.current_user_id.clone()
    }

    pub async fn load_state(&self) -> LoadState {
        self.inner.lock().await.load_state.clone()
    }

    /// Own messages align right and show read receipts.
    pub async fn is_own(&self, message: &Message) -> bool {
        self.inner.lock().await.current_user_id.as_ref() == Some(&message.sender_id)
    }
}

#[cfg(test)]
#[path = "tests/message_store_tests.rs"]
mod tests;
