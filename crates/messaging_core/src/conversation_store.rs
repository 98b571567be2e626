use std::sync::Arc;

use shared::{
    domain::{ConversationId, ProfileId},
    protocol::{Conversation, LastMessageSummary, Message, StartConversationRequest, TeamMember},
};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::{
    api::MessagingApi,
    error::MessagingError,
    message_store::{LoadOutcome, MessageStore},
    ClientEvent,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListState {
    Idle,
    Loading,
    Ready,
    /// Distinct from an empty `Ready` list; previously loaded entries are kept.
    Failed(String),
}

/// A sent message applied locally, tagged with the refresh that was current
/// when it happened.
struct LocalSend {
    refresh: u64,
    conversation_id: ConversationId,
    message: Message,
}

struct ConversationStoreState {
    conversations: Vec<Conversation>,
    list_state: ListState,
    selected: Option<ConversationId>,
    latest_refresh: u64,
    local_sends: Vec<LocalSend>,
}

impl ConversationStoreState {
    fn apply_sent(&mut self, conversation_id: &ConversationId, message: &Message) {
        let summary = LastMessageSummary::from(message);
        match self.find_mut(conversation_id) {
            Some(conversation) => {
                conversation.last_message = Some(summary);
                conversation.last_message_at = Some(message.created_at);
            }
            None => {
                info!(
                    conversation_id = %conversation_id,
                    "conversations: inserting entry for sent message"
                );
                self.conversations.push(Conversation {
                    id: conversation_id.clone(),
                    participant_ids: vec![message.sender_id.clone()],
                    participant: None,
                    last_message: Some(summary),
                    last_message_at: Some(message.created_at),
                    unread_count: 0,
                });
            }
        }
    }

    /// Re-applies sends the server list fetched by `refresh` may predate.
    /// Older sends are dropped: that list already includes them.
    fn replay_local_sends(&mut self, refresh: u64) {
        let sends = std::mem::take(&mut self.local_sends);
        for send in sends.into_iter().filter(|send| send.refresh >= refresh) {
            let newer_on_server = self
                .find_mut(&send.conversation_id)
                .and_then(|conversation| conversation.last_message_at)
                .is_some_and(|at| at > send.message.created_at);
            if !newer_on_server {
                self.apply_sent(&send.conversation_id, &send.message);
            }
            self.local_sends.push(send);
        }
    }

    fn sort(&mut self) {
        self.conversations
            .sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
    }

    fn find_mut(&mut self, id: &ConversationId) -> Option<&mut Conversation> {
        self.conversations
            .iter_mut()
            .find(|conversation| &conversation.id == id)
    }
}

pub struct ConversationStore {
    api: Arc<dyn MessagingApi>,
    messages: Arc<MessageStore>,
    inner: Mutex<ConversationStoreState>,
    events: broadcast::Sender<ClientEvent>,
}

impl ConversationStore {
    pub fn new(
        api: Arc<dyn MessagingApi>,
        messages: Arc<MessageStore>,
        events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        Self {
            api,
            messages,
            inner: Mutex::new(ConversationStoreState {
                conversations: Vec::new(),
                list_state: ListState::Idle,
                selected: None,
                latest_refresh: 0,
                local_sends: Vec::new(),
            }),
            events,
        }
    }

    /// Replaces the list with the server's view, newest activity first.
    ///
    /// A response that arrives after a newer refresh was issued is dropped.
    pub async fn refresh(&self) -> Result<usize, MessagingError> {
        let token = {
            let mut guard = self.inner.lock().await;
            guard.latest_refresh += 1;
            guard.list_state = ListState::Loading;
            guard.latest_refresh
        };

        let result = self.api.list_conversations().await;

        let mut guard = self.inner.lock().await;
        if guard.latest_refresh != token {
            debug!(
                token,
                latest = guard.latest_refresh,
                "conversations: discarding superseded refresh"
            );
            return match result {
                Ok(_) => Ok(guard.conversations.len()),
                Err(err) => Err(MessagingError::network(&err)),
            };
        }

        match result {
            Ok(conversations) => {
                guard.conversations = conversations;
                guard.replay_local_sends(token);
                if let Some(selected) = guard.selected.clone() {
                    if let Some(open) = guard.find_mut(&selected) {
                        open.unread_count = 0;
                    }
                }
                guard.sort();
                guard.list_state = ListState::Ready;
                let count = guard.conversations.len();
                drop(guard);
                info!(count, "conversations: refreshed");
                let _ = self.events.send(ClientEvent::ConversationsUpdated);
                Ok(count)
            }
            Err(err) => {
                let error = MessagingError::network(&err);
                guard.list_state = ListState::Failed(error.to_string());
                drop(guard);
                warn!("conversations: refresh failed: {err:#}");
                let _ = self
                    .events
                    .send(ClientEvent::ConversationListFailed(error.to_string()));
                Err(error)
            }
        }
    }

    pub async fn retry(&self) -> Result<usize, MessagingError> {
        self.refresh().await
    }

    pub async fn list(&self) -> Vec<Conversation> {
        self.inner.lock().await.conversations.clone()
    }

    pub async fn list_state(&self) -> ListState {
        self.inner.lock().await.list_state.clone()
    }

    pub async fn get(&self, id: &ConversationId) -> Option<Conversation> {
        self.inner
            .lock()
            .await
            .conversations
            .iter()
            .find(|conversation| &conversation.id == id)
            .cloned()
    }

    pub async fn unread_count(&self, id: &ConversationId) -> Option<u32> {
        self.get(id).await.map(|conversation| conversation.unread_count)
    }

    pub async fn total_unread(&self) -> u32 {
        self.inner
            .lock()
            .await
            .conversations
            .iter()
            .map(|conversation| conversation.unread_count)
            .sum()
    }

    pub async fn selected(&self) -> Option<ConversationId> {
        self.inner.lock().await.selected.clone()
    }

    /// Opens a conversation: clears its unread count and loads its messages.
    pub async fn select(&self, id: &ConversationId) -> Result<LoadOutcome, MessagingError> {
        {
            let mut guard = self.inner.lock().await;
            guard.selected = Some(id.clone());
            if let Some(conversation) = guard.find_mut(id) {
                conversation.unread_count = 0;
            }
        }
        info!(conversation_id = %id, "conversations: selected");
        let _ = self.events.send(ClientEvent::ConversationsUpdated);
        self.messages.load(id).await
    }

    pub async fn upsert_from_sent_message(&self, conversation_id: &ConversationId, message: &Message) {
        {
            let mut guard = self.inner.lock().await;
            guard.apply_sent(conversation_id, message);
            let refresh = guard.latest_refresh;
            guard.local_sends.push(LocalSend {
                refresh,
                conversation_id: conversation_id.clone(),
                message: message.clone(),
            });
            guard.sort();
        }
        let _ = self.events.send(ClientEvent::ConversationsUpdated);
    }

    /// Finds the 1:1 conversation with `participant_id`, creating it remotely if needed.
    pub async fn start_with(&self, participant_id: &ProfileId) -> Result<ConversationId, MessagingError> {
        if let Some(existing) = self.find_with(participant_id).await {
            return Ok(existing);
        }

        let response = self
            .api
            .start_conversation(StartConversationRequest {
                participant_id: participant_id.clone(),
            })
            .await
            .map_err(|err| MessagingError::network(&err))?;
        info!(
            conversation_id = %response.id,
            participant_id = %participant_id,
            is_new = response.is_new,
            "conversations: started"
        );

        let current_user = self.messages.current_user_id().await;
        {
            let mut guard = self.inner.lock().await;
            if guard.find_mut(&response.id).is_none() {
                let participant_ids = current_user
                    .into_iter()
                    .chain(std::iter::once(participant_id.clone()))
                    .collect();
                guard.conversations.push(Conversation {
                    id: response.id.clone(),
                    participant_ids,
                    participant: None,
                    last_message: None,
                    last_message_at: None,
                    unread_count: 0,
                });
                guard.sort();
            }
        }
        let _ = self.events.send(ClientEvent::ConversationsUpdated);
        Ok(response.id)
    }

    pub async fn team_members(&self) -> Result<Vec<TeamMember>, MessagingError> {
        self.api
            .list_team_members()
            .await
            .map_err(|err| MessagingError::network(&err))
    }

    /// Team members one could start a new conversation with.
    pub async fn candidates(&self) -> Result<Vec<TeamMember>, MessagingError> {
        let members = self.team_members().await?;
        let current_user = self.messages.current_user_id().await;
        let guard = self.inner.lock().await;
        Ok(members
            .into_iter()
            .filter(|member| current_user.as_ref() != Some(&member.id))
            .filter(|member| {
                !guard
                    .conversations
                    .iter()
                    .any(|conversation| conversation.involves(&member.id))
            })
            .collect())
    }

    async fn find_with(&self, participant_id: &ProfileId) -> Option<ConversationId> {
        let current_user = self.messages.current_user_id().await;
        if current_user.as_ref() == Some(participant_id) {
            return None;
        }
        self.inner
            .lock()
            .await
            .conversations
            .iter()
            .find(|conversation| conversation.involves(participant_id))
            .map(|conversation| conversation.id.clone())
    }
}

#[cfg(test)]
#[path = "tests/conversation_store_tests.rs"]
mod tests;
