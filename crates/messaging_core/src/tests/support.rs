//! Deterministic doubles for the messaging API, capture devices and preview URLs.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Duration, TimeZone, Utc};
use shared::{
    domain::{ConversationId, MessageId, MessageStatus, MessageType, ProfileId},
    error::{ApiException, ErrorCode},
    protocol::{
        AttachmentUploadRequest, AttachmentUploadResponse, Conversation, LastMessageSummary,
        Message, MessagesResponse, SendMessageRequest, StartConversationRequest,
        StartConversationResponse, TeamMember,
    },
};
use tokio::sync::Notify;

use crate::{
    api::MessagingApi,
    blob::InMemoryBlobUrls,
    capture::{
        CaptureKind, DeviceAccessError, DeviceStream, MediaDevices, StreamConstraints,
        StreamRecorder, VideoFrame,
    },
    config::ClientSettings,
    MessagingClient,
};

pub const ME: &str = "me";

pub fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0)
        .single()
        .expect("valid timestamp")
        + Duration::seconds(secs)
}

pub fn text_message(id: &str, sender: &str, secs: i64, text: &str) -> Message {
    Message {
        id: MessageId::from(id),
        sender_id: ProfileId::from(sender),
        message_type: MessageType::Text,
        content: Some(text.to_string()),
        file_url: None,
        file_name: None,
        file_type: None,
        duration: None,
        status: MessageStatus::Sent,
        created_at: ts(secs),
    }
}

pub fn conversation(id: &str, other: &str, last_at: Option<i64>, unread: u32) -> Conversation {
    Conversation {
        id: ConversationId::from(id),
        participant_ids: vec![ProfileId::from(ME), ProfileId::from(other)],
        participant: None,
        last_message: last_at.map(|secs| LastMessageSummary {
            sender_id: ProfileId::from(other),
            message_type: MessageType::Text,
            content: Some(format!("hello from {other}")),
            file_name: None,
            created_at: ts(secs),
        }),
        last_message_at: last_at.map(ts),
        unread_count: unread,
    }
}

pub fn member(id: &str, name: &str) -> TeamMember {
    TeamMember {
        id: ProfileId::from(id),
        name: name.to_string(),
        email: Some(format!("{id}@agency.test")),
        role: Some("member".to_string()),
        avatar_url: None,
    }
}

pub struct FakeApiState {
    pub conversations: Vec<Conversation>,
    pub fail_conversations: bool,
    pub messages: HashMap<ConversationId, Vec<Message>>,
    pub fail_messages: bool,
    pub fetch_calls: Vec<ConversationId>,
    pub sent: Vec<(ConversationId, SendMessageRequest)>,
    pub fail_send: bool,
    pub uploads: Vec<AttachmentUploadRequest>,
    pub rejected_uploads: HashSet<String>,
    pub broken_uploads: HashSet<String>,
    pub started: HashMap<ProfileId, ConversationId>,
    pub start_calls: u32,
    pub team: Vec<TeamMember>,
    next_id: u64,
}

impl Default for FakeApiState {
    fn default() -> Self {
        Self {
            conversations: Vec::new(),
            fail_conversations: false,
            messages: HashMap::new(),
            fail_messages: false,
            fetch_calls: Vec::new(),
            sent: Vec::new(),
            fail_send: false,
            uploads: Vec::new(),
            rejected_uploads: HashSet::new(),
            broken_uploads: HashSet::new(),
            started: HashMap::new(),
            start_calls: 0,
            team: Vec::new(),
            next_id: 1,
        }
    }
}

#[derive(Default)]
pub struct FakeMessagingApi {
    pub state: Mutex<FakeApiState>,
    message_gates: Mutex<HashMap<ConversationId, Arc<Notify>>>,
    upload_gate: Mutex<Option<Arc<Notify>>>,
    conversations_gate: Mutex<Option<Arc<Notify>>>,
}

impl FakeMessagingApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_state(&self, update: impl FnOnce(&mut FakeApiState)) {
        update(&mut self.state.lock().expect("api state"));
    }

    pub fn read<T>(&self, read: impl FnOnce(&FakeApiState) -> T) -> T {
        read(&self.state.lock().expect("api state"))
    }

    /// Holds message fetches for `conversation_id` until the returned notify fires.
    pub fn gate_messages(&self, conversation_id: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.message_gates
            .lock()
            .expect("gates")
            .insert(ConversationId::from(conversation_id), Arc::clone(&gate));
        gate
    }

    /// Holds the response of the next conversation listing, computed from
    /// the state at call time, until the returned notify fires.
    pub fn gate_next_conversation_list(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.conversations_gate.lock().expect("gate") = Some(Arc::clone(&gate));
        gate
    }

    pub fn gate_uploads(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.upload_gate.lock().expect("gate") = Some(Arc::clone(&gate));
        gate
    }

    /// Server-assigned ids live in their own namespace so they never
    /// collide with seeded fixtures like `m-1` or `c-1`.
    fn next_id(&self, prefix: &str) -> String {
        let mut state = self.state.lock().expect("api state");
        let id = state.next_id;
        state.next_id += 1;
        format!("srv-{prefix}-{id}")
    }
}

#[async_trait]
impl MessagingApi for FakeMessagingApi {
    async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        let response = self.read(|state| {
            if state.fail_conversations {
                Err(anyhow!("connection refused"))
            } else {
                Ok(state.conversations.clone())
            }
        });
        let gate = self.conversations_gate.lock().expect("gate").take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        response
    }

    async fn fetch_messages(&self, conversation_id: &ConversationId) -> Result<MessagesResponse> {
        self.with_state(|state| state.fetch_calls.push(conversation_id.clone()));
        let gate = self
            .message_gates
            .lock()
            .expect("gates")
            .get(conversation_id)
            .cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let state = self.state.lock().expect("api state");
        if state.fail_messages {
            return Err(anyhow!("timed out"));
        }
        Ok(MessagesResponse {
            messages: state
                .messages
                .get(conversation_id)
                .cloned()
                .unwrap_or_default(),
            current_user_id: ProfileId::from(ME),
        })
    }

    async fn send_message(
        &self,
        conversation_id: &ConversationId,
        request: SendMessageRequest,
    ) -> Result<Message> {
        if self.read(|state| state.fail_send) {
            return Err(anyhow!("503 service unavailable"));
        }
        let id = self.next_id("m");
        let mut state = self.state.lock().expect("api state");
        state.sent.push((conversation_id.clone(), request.clone()));
        let sequence = state.sent.len() as i64;
        Ok(Message {
            id: MessageId::new(id),
            sender_id: ProfileId::from(ME),
            message_type: request.message_type,
            content: request.content,
            file_url: request.file_url,
            file_name: request.file_name,
            file_type: request.file_type,
            duration: request.duration,
            status: MessageStatus::Sent,
            created_at: ts(10_000 + sequence),
        })
    }

    async fn start_conversation(
        &self,
        request: StartConversationRequest,
    ) -> Result<StartConversationResponse> {
        let existing = self.record_start_call(&request.participant_id);
        if let Some(id) = existing {
            return Ok(StartConversationResponse { id, is_new: false });
        }
        let id = ConversationId::new(self.next_id("c"));
        self.with_state(|state| {
            state
                .started
                .insert(request.participant_id.clone(), id.clone());
        });
        Ok(StartConversationResponse { id, is_new: true })
    }

    async fn upload_attachment(
        &self,
        request: AttachmentUploadRequest,
    ) -> Result<AttachmentUploadResponse> {
        let gate = self.upload_gate.lock().expect("gate").clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let decoded = STANDARD
            .decode(&request.file)
            .map_err(|err| anyhow!("bad base64: {err}"))?;
        let mut state = self.state.lock().expect("api state");
        state.uploads.push(request.clone());
        if state.rejected_uploads.contains(&request.file_name) {
            return Err(anyhow!(ApiException::new(
                ErrorCode::Validation,
                "file type not allowed"
            )));
        }
        if state.broken_uploads.contains(&request.file_name) {
            return Err(anyhow!("connection reset by peer"));
        }
        Ok(AttachmentUploadResponse {
            url: format!("https://cdn.test/{}", request.file_name),
            file_name: request.file_name,
            file_type: request.file_type,
            file_size: decoded.len() as u64,
        })
    }

    async fn list_team_members(&self) -> Result<Vec<TeamMember>> {
        Ok(self.read(|state| state.team.clone()))
    }
}

impl FakeMessagingApi {
    fn record_start_call(&self, participant_id: &ProfileId) -> Option<ConversationId> {
        let mut state = self.state.lock().expect("api state");
        state.start_calls += 1;
        state.started.get(participant_id).cloned()
    }
}

#[derive(Default)]
pub struct DeviceLog {
    pub requests: Vec<StreamConstraints>,
    pub opened: Vec<String>,
    pub stopped: HashMap<String, u32>,
    pub recorder_mime_types: Vec<String>,
    pub discarded_recorders: u32,
}

pub struct DeviceConfig {
    pub deny: bool,
    pub supported: Vec<String>,
    pub chunks: Vec<Vec<u8>>,
    pub frame: Option<VideoFrame>,
}

pub struct FakeMediaDevices {
    pub log: Arc<Mutex<DeviceLog>>,
    pub config: Mutex<DeviceConfig>,
    request_gate: Mutex<Option<Arc<Notify>>>,
    next_stream: AtomicU64,
}

impl FakeMediaDevices {
    pub fn granting() -> Arc<Self> {
        Arc::new(Self {
            log: Arc::new(Mutex::new(DeviceLog::default())),
            config: Mutex::new(DeviceConfig {
                deny: false,
                supported: vec!["audio/webm;codecs=opus".into(), "video/webm".into()],
                chunks: vec![b"chunk-1".to_vec(), b"chunk-2".to_vec()],
                frame: Some(solid_frame(4, 2, [200, 10, 10, 255])),
            }),
            request_gate: Mutex::new(None),
            next_stream: AtomicU64::new(1),
        })
    }

    pub fn configure(&self, update: impl FnOnce(&mut DeviceConfig)) {
        update(&mut self.config.lock().expect("config"));
    }

    pub fn gate_requests(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.request_gate.lock().expect("gate") = Some(Arc::clone(&gate));
        gate
    }

    pub fn opened(&self) -> usize {
        self.log.lock().expect("log").opened.len()
    }

    /// Every stream ever opened has had its tracks stopped exactly once.
    pub fn all_released_exactly_once(&self) -> bool {
        let log = self.log.lock().expect("log");
        log.opened
            .iter()
            .all(|id| log.stopped.get(id).copied() == Some(1))
            && log.stopped.values().all(|count| *count == 1)
    }

    pub fn live_streams(&self) -> usize {
        let log = self.log.lock().expect("log");
        log.opened
            .iter()
            .filter(|id| !log.stopped.contains_key(*id))
            .count()
    }
}

pub fn solid_frame(width: u32, height: u32, rgba: [u8; 4]) -> VideoFrame {
    VideoFrame {
        width,
        height,
        rgba: rgba
            .iter()
            .copied()
            .cycle()
            .take((width * height * 4) as usize)
            .collect(),
    }
}

#[async_trait]
impl MediaDevices for FakeMediaDevices {
    async fn request_stream(
        &self,
        constraints: StreamConstraints,
    ) -> Result<Box<dyn DeviceStream>, DeviceAccessError> {
        self.log.lock().expect("log").requests.push(constraints);
        let gate = self.request_gate.lock().expect("gate").clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let (deny, chunks, frame) = {
            let config = self.config.lock().expect("config");
            (config.deny, config.chunks.clone(), config.frame.clone())
        };
        if deny {
            return Err(DeviceAccessError::Denied("user dismissed prompt".to_string()));
        }
        let id = format!("stream-{}", self.next_stream.fetch_add(1, Ordering::SeqCst));
        self.log.lock().expect("log").opened.push(id.clone());
        Ok(Box::new(FakeStream {
            id,
            log: Arc::clone(&self.log),
            chunks,
            frame,
        }))
    }

    fn is_type_supported(&self, mime_type: &str) -> bool {
        self.config
            .lock()
            .expect("config")
            .supported
            .iter()
            .any(|supported| supported == mime_type)
    }

    fn default_mime_type(&self, kind: CaptureKind) -> String {
        match kind {
            CaptureKind::Voice => "audio/platform-default".to_string(),
            CaptureKind::Video => "video/platform-default".to_string(),
        }
    }
}

struct FakeStream {
    id: String,
    log: Arc<Mutex<DeviceLog>>,
    chunks: Vec<Vec<u8>>,
    frame: Option<VideoFrame>,
}

impl DeviceStream for FakeStream {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn start_recorder(&self, mime_type: &str) -> Result<Box<dyn StreamRecorder>> {
        self.log
            .lock()
            .expect("log")
            .recorder_mime_types
            .push(mime_type.to_string());
        Ok(Box::new(FakeRecorder {
            chunks: self.chunks.clone(),
            log: Arc::clone(&self.log),
        }))
    }

    fn grab_frame(&self) -> Result<VideoFrame> {
        self.frame
            .clone()
            .ok_or_else(|| anyhow!("no video track"))
    }

    fn stop_tracks(&self) {
        *self
            .log
            .lock()
            .expect("log")
            .stopped
            .entry(self.id.clone())
            .or_default() += 1;
    }
}

struct FakeRecorder {
    chunks: Vec<Vec<u8>>,
    log: Arc<Mutex<DeviceLog>>,
}

#[async_trait]
impl StreamRecorder for FakeRecorder {
    async fn finish(self: Box<Self>) -> Result<Vec<Vec<u8>>> {
        Ok(self.chunks)
    }

    fn discard(self: Box<Self>) {
        self.log.lock().expect("log").discarded_recorders += 1;
    }
}

pub struct Harness {
    pub api: Arc<FakeMessagingApi>,
    pub devices: Arc<FakeMediaDevices>,
    pub urls: Arc<InMemoryBlobUrls>,
    pub client: MessagingClient,
}

pub fn harness() -> Harness {
    harness_with(ClientSettings::default())
}

pub fn harness_with(settings: ClientSettings) -> Harness {
    let api = FakeMessagingApi::new();
    let devices = FakeMediaDevices::granting();
    let urls = InMemoryBlobUrls::new();
    let client = MessagingClient::new(&settings, api.clone(), devices.clone(), urls.clone());
    Harness {
        api,
        devices,
        urls,
        client,
    }
}
