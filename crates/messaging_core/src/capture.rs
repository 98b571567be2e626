//! Microphone and camera capture.
//!
//! `Idle → Requesting → {Recording | PreviewReady} → Idle`. Device access,
//! recording and frame grabbing sit behind [`MediaDevices`] so that platform
//! backends and test doubles are interchangeable.
//!
//! A device stream is owned by the active session and its tracks are stopped
//! exactly once, on stop, cancel, photo capture or when the controller is
//! dropped.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use image::{codecs::jpeg::JpegEncoder, imageops, DynamicImage, RgbaImage};
use thiserror::Error;
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
    time::{interval_at, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    attachment::{AttachmentKind, PendingAttachment},
    blob::BlobUrlRegistry,
    error::CaptureError,
    ClientEvent,
};

pub const AUDIO_MIME_PREFERENCES: &[&str] = &[
    "audio/webm;codecs=opus",
    "audio/webm",
    "audio/ogg;codecs=opus",
    "audio/mp4",
];

pub const VIDEO_MIME_PREFERENCES: &[&str] = &[
    "video/webm;codecs=vp9,opus",
    "video/webm;codecs=vp8,opus",
    "video/webm",
    "video/mp4",
];

const PHOTO_MIME_TYPE: &str = "image/jpeg";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaptureKind {
    Voice,
    Video,
}

impl CaptureKind {
    pub fn constraints(self) -> StreamConstraints {
        match self {
            Self::Voice => StreamConstraints {
                audio: true,
                video: false,
            },
            Self::Video => StreamConstraints {
                audio: true,
                video: true,
            },
        }
    }

    fn mime_preferences(self) -> &'static [&'static str] {
        match self {
            Self::Voice => AUDIO_MIME_PREFERENCES,
            Self::Video => VIDEO_MIME_PREFERENCES,
        }
    }

    fn attachment_kind(self) -> AttachmentKind {
        match self {
            Self::Voice => AttachmentKind::Voice,
            Self::Video => AttachmentKind::Video,
        }
    }
}

impl fmt::Display for CaptureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Voice => f.write_str("microphone"),
            Self::Video => f.write_str("camera"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Requesting(CaptureKind),
    PreviewReady,
    Recording(CaptureKind),
}

impl CaptureState {
    pub fn is_idle(self) -> bool {
        matches!(self, Self::Idle)
    }

    /// A permission prompt or a recording is in flight.
    pub fn is_busy(self) -> bool {
        matches!(self, Self::Requesting(_) | Self::Recording(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConstraints {
    pub audio: bool,
    pub video: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceAccessError {
    #[error("permission denied: {0}")]
    Denied(String),
    #[error("device unavailable: {0}")]
    Unavailable(String),
}

/// One still frame of a camera stream, tightly packed RGBA8.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn request_stream(
        &self,
        constraints: StreamConstraints,
    ) -> Result<Box<dyn DeviceStream>, DeviceAccessError>;
    fn is_type_supported(&self, mime_type: &str) -> bool;
    fn default_mime_type(&self, kind: CaptureKind) -> String;
}

pub trait DeviceStream: Send + Sync {
    fn id(&self) -> String;
    fn start_recorder(&self, mime_type: &str) -> anyhow::Result<Box<dyn StreamRecorder>>;
    fn grab_frame(&self) -> anyhow::Result<VideoFrame>;
    fn stop_tracks(&self);
}

#[async_trait]
pub trait StreamRecorder: Send {
    /// Stops recording and returns every buffered chunk in order.
    async fn finish(self: Box<Self>) -> anyhow::Result<Vec<Vec<u8>>>;
    fn discard(self: Box<Self>);
}

/// Backend for hosts without capture hardware.
pub struct MissingMediaDevices;

#[async_trait]
impl MediaDevices for MissingMediaDevices {
    async fn request_stream(
        &self,
        _constraints: StreamConstraints,
    ) -> Result<Box<dyn DeviceStream>, DeviceAccessError> {
        Err(DeviceAccessError::Unavailable(
            "no capture backend configured".to_string(),
        ))
    }

    fn is_type_supported(&self, _mime_type: &str) -> bool {
        false
    }

    fn default_mime_type(&self, kind: CaptureKind) -> String {
        match kind {
            CaptureKind::Voice => "audio/webm".to_string(),
            CaptureKind::Video => "video/webm".to_string(),
        }
    }
}

/// First supported entry of the preference list, else the platform default.
pub fn negotiate_mime_type(devices: &dyn MediaDevices, kind: CaptureKind) -> String {
    kind.mime_preferences()
        .iter()
        .find(|candidate| devices.is_type_supported(candidate))
        .map(|candidate| candidate.to_string())
        .unwrap_or_else(|| devices.default_mime_type(kind))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureOptions {
    /// The live camera preview is shown mirrored; photos match what was shown.
    pub mirror_preview: bool,
    pub jpeg_quality: u8,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            mirror_preview: true,
            jpeg_quality: 90,
        }
    }
}

struct HeldStream {
    stream: Option<Box<dyn DeviceStream>>,
}

impl HeldStream {
    fn new(stream: Box<dyn DeviceStream>) -> Self {
        Self {
            stream: Some(stream),
        }
    }

    fn get(&self) -> Option<&dyn DeviceStream> {
        self.stream.as_deref()
    }

    fn release(&mut self) {
        if let Some(stream) = self.stream.take() {
            debug!(stream_id = %stream.id(), "capture: stopping device tracks");
            stream.stop_tracks();
        }
    }
}

impl Drop for HeldStream {
    fn drop(&mut self) {
        self.release();
    }
}

struct ActiveSession {
    kind: CaptureKind,
    stream: HeldStream,
    recorder: Option<Box<dyn StreamRecorder>>,
    mime_type: Option<String>,
    timer: Option<JoinHandle<()>>,
    /// Owned by this session so a tick racing an abort never leaks into the next one.
    elapsed_secs: Arc<AtomicU64>,
}

impl ActiveSession {
    fn new(kind: CaptureKind, stream: HeldStream) -> Self {
        Self {
            kind,
            stream,
            recorder: None,
            mime_type: None,
            timer: None,
            elapsed_secs: Arc::new(AtomicU64::new(0)),
        }
    }

    fn stop_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        self.stop_timer();
        if let Some(recorder) = self.recorder.take() {
            recorder.discard();
        }
        self.stream.release();
    }
}

struct CaptureInner {
    state: CaptureState,
    generation: u64,
    session: Option<ActiveSession>,
}

pub struct MediaCaptureController {
    devices: Arc<dyn MediaDevices>,
    blob_urls: Arc<dyn BlobUrlRegistry>,
    options: CaptureOptions,
    inner: Mutex<CaptureInner>,
    events: broadcast::Sender<ClientEvent>,
}

impl MediaCaptureController {
    pub fn new(
        devices: Arc<dyn MediaDevices>,
        blob_urls: Arc<dyn BlobUrlRegistry>,
        options: CaptureOptions,
        events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        Self {
            devices,
            blob_urls,
            options,
            inner: Mutex::new(CaptureInner {
                state: CaptureState::Idle,
                generation: 0,
                session: None,
            }),
            events,
        }
    }

    pub async fn state(&self) -> CaptureState {
        self.inner.lock().await.state
    }

    /// Whole seconds recorded so far; zero unless a recording is running.
    pub async fn elapsed_secs(&self) -> u64 {
        let guard = self.inner.lock().await;
        match (guard.state, guard.session.as_ref()) {
            (CaptureState::Recording(_), Some(session)) => {
                session.elapsed_secs.load(Ordering::SeqCst)
            }
            _ => 0,
        }
    }

    /// Id of the stream backing the live preview or recording, if any.
    pub async fn active_stream_id(&self) -> Option<String> {
        let guard = self.inner.lock().await;
        guard
            .session
            .as_ref()
            .and_then(|session| session.stream.get())
            .map(|stream| stream.id())
    }

    /// Requests the microphone and starts recording as soon as access is granted.
    pub async fn start_voice(&self) -> Result<(), CaptureError> {
        let (generation, stream) = self.acquire(CaptureKind::Voice).await?;
        let mut guard = self.inner.lock().await;
        if !Self::still_requesting(&guard, generation, CaptureKind::Voice) {
            drop(guard);
            drop(stream);
            info!("capture: microphone granted after cancel; released");
            return Err(CaptureError::Cancelled);
        }

        let mut session = ActiveSession::new(CaptureKind::Voice, stream);
        if let Err(err) = self.begin_recording(&mut session) {
            guard.state = CaptureState::Idle;
            drop(guard);
            drop(session);
            self.emit_state(CaptureState::Idle);
            return Err(err);
        }
        guard.session = Some(session);
        guard.state = CaptureState::Recording(CaptureKind::Voice);
        drop(guard);
        info!("capture: voice recording started");
        self.emit_state(CaptureState::Recording(CaptureKind::Voice));
        Ok(())
    }

    /// Requests camera and microphone and shows a live preview without recording.
    pub async fn open_camera_preview(&self) -> Result<(), CaptureError> {
        let (generation, stream) = self.acquire(CaptureKind::Video).await?;
        let mut guard = self.inner.lock().await;
        if !Self::still_requesting(&guard, generation, CaptureKind::Video) {
            drop(guard);
            drop(stream);
            info!("capture: camera granted after cancel; released");
            return Err(CaptureError::Cancelled);
        }
        guard.session = Some(ActiveSession::new(CaptureKind::Video, stream));
        guard.state = CaptureState::PreviewReady;
        drop(guard);
        info!("capture: camera preview ready");
        self.emit_state(CaptureState::PreviewReady);
        Ok(())
    }

    pub async fn start_video_recording(&self) -> Result<(), CaptureError> {
        let mut guard = self.inner.lock().await;
        if guard.state != CaptureState::PreviewReady {
            return Err(CaptureError::InvalidTransition {
                operation: "start video recording",
                state: guard.state,
            });
        }
        let Some(mut session) = guard.session.take() else {
            guard.state = CaptureState::Idle;
            return Err(CaptureError::InvalidTransition {
                operation: "start video recording",
                state: CaptureState::Idle,
            });
        };
        match self.begin_recording(&mut session) {
            Ok(()) => {
                guard.session = Some(session);
                guard.state = CaptureState::Recording(CaptureKind::Video);
                drop(guard);
                info!("capture: video recording started");
                self.emit_state(CaptureState::Recording(CaptureKind::Video));
                Ok(())
            }
            Err(err) => {
                // Preview stays usable; the user can retry or take a photo.
                guard.session = Some(session);
                Err(err)
            }
        }
    }

    /// Snapshots the preview into a JPEG, releases the camera and returns to idle.
    pub async fn capture_photo(&self) -> Result<PendingAttachment, CaptureError> {
        let mut session = {
            let mut guard = self.inner.lock().await;
            if guard.state != CaptureState::PreviewReady {
                return Err(CaptureError::InvalidTransition {
                    operation: "capture photo",
                    state: guard.state,
                });
            }
            guard.state = CaptureState::Idle;
            guard.generation += 1;
            guard.session.take()
        };
        self.emit_state(CaptureState::Idle);

        let frame = session
            .as_ref()
            .and_then(|session| session.stream.get())
            .map(|stream| stream.grab_frame());
        if let Some(session) = session.as_mut() {
            session.stream.release();
        }
        drop(session);

        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(err)) => return Err(CaptureError::Recorder(format!("{err:#}"))),
            None => return Err(CaptureError::Recorder("camera stream missing".to_string())),
        };
        let (width, height) = (frame.width, frame.height);
        let jpeg = encode_photo(frame, self.options.mirror_preview, self.options.jpeg_quality)?;
        info!(width, height, bytes = jpeg.len(), "capture: photo captured");
        Ok(PendingAttachment::captured(
            &self.blob_urls,
            AttachmentKind::Image,
            jpeg,
            PHOTO_MIME_TYPE.to_string(),
            None,
        ))
    }

    /// Flushes the recording into one blob tagged with mime type and duration.
    pub async fn stop(&self) -> Result<PendingAttachment, CaptureError> {
        let mut session = {
            let mut guard = self.inner.lock().await;
            let CaptureState::Recording(_) = guard.state else {
                return Err(CaptureError::InvalidTransition {
                    operation: "stop",
                    state: guard.state,
                });
            };
            guard.state = CaptureState::Idle;
            guard.generation += 1;
            guard
                .session
                .take()
                .ok_or_else(|| CaptureError::Recorder("recording session missing".to_string()))?
        };
        session.stop_timer();
        let duration_secs = session.elapsed_secs.load(Ordering::SeqCst);
        self.emit_state(CaptureState::Idle);

        let kind = session.kind;
        let mime_type = session
            .mime_type
            .take()
            .unwrap_or_else(|| self.devices.default_mime_type(kind));
        let finished = match session.recorder.take() {
            Some(recorder) => recorder.finish().await,
            None => Ok(Vec::new()),
        };
        session.stream.release();
        drop(session);

        let chunks = finished.map_err(|err| CaptureError::Recorder(format!("{err:#}")))?;
        let data: Vec<u8> = chunks.concat();
        if data.is_empty() {
            warn!(?kind, "capture: recording produced no data");
            return Err(CaptureError::Recorder("recording produced no data".to_string()));
        }
        info!(
            ?kind,
            duration_secs,
            bytes = data.len(),
            mime_type = %mime_type,
            "capture: recording stopped"
        );
        Ok(PendingAttachment::captured(
            &self.blob_urls,
            kind.attachment_kind(),
            data,
            mime_type,
            Some(duration_secs),
        ))
    }

    /// Abandons any request, preview or recording. Safe to call repeatedly.
    pub async fn cancel(&self) {
        let session = {
            let mut guard = self.inner.lock().await;
            if guard.state == CaptureState::Idle {
                debug!("capture: cancel while idle ignored");
                return;
            }
            guard.state = CaptureState::Idle;
            guard.generation += 1;
            guard.session.take()
        };
        drop(session);
        info!("capture: cancelled");
        self.emit_state(CaptureState::Idle);
    }

    /// Releases everything held; used when the owning view goes away.
    pub async fn shutdown(&self) {
        self.cancel().await;
    }

    async fn acquire(&self, kind: CaptureKind) -> Result<(u64, HeldStream), CaptureError> {
        let generation = {
            let mut guard = self.inner.lock().await;
            if guard.state != CaptureState::Idle {
                return Err(CaptureError::Busy { state: guard.state });
            }
            guard.state = CaptureState::Requesting(kind);
            guard.generation += 1;
            guard.generation
        };
        self.emit_state(CaptureState::Requesting(kind));

        match self.devices.request_stream(kind.constraints()).await {
            Ok(stream) => Ok((generation, HeldStream::new(stream))),
            Err(err) => {
                let reset = {
                    let mut guard = self.inner.lock().await;
                    if Self::still_requesting(&guard, generation, kind) {
                        guard.state = CaptureState::Idle;
                        true
                    } else {
                        false
                    }
                };
                if reset {
                    self.emit_state(CaptureState::Idle);
                }
                warn!(device = %kind, "capture: device request failed: {err}");
                Err(match err {
                    DeviceAccessError::Denied(reason) => CaptureError::PermissionDenied {
                        device: kind,
                        reason,
                    },
                    DeviceAccessError::Unavailable(reason) => CaptureError::DeviceUnavailable {
                        device: kind,
                        reason,
                    },
                })
            }
        }
    }

    fn still_requesting(inner: &CaptureInner, generation: u64, kind: CaptureKind) -> bool {
        inner.generation == generation && inner.state == CaptureState::Requesting(kind)
    }

    fn begin_recording(&self, session: &mut ActiveSession) -> Result<(), CaptureError> {
        let mime_type = negotiate_mime_type(self.devices.as_ref(), session.kind);
        let stream = session
            .stream
            .get()
            .ok_or_else(|| CaptureError::Recorder("device stream already released".to_string()))?;
        let recorder = stream
            .start_recorder(&mime_type)
            .map_err(|err| CaptureError::Recorder(format!("{err:#}")))?;
        debug!(mime_type = %mime_type, "capture: recorder started");
        session.recorder = Some(recorder);
        session.mime_type = Some(mime_type);
        session.timer = Some(self.spawn_timer(Arc::clone(&session.elapsed_secs)));
        Ok(())
    }

    fn spawn_timer(&self, elapsed: Arc<AtomicU64>) -> JoinHandle<()> {
        let events = self.events.clone();
        tokio::spawn(async move {
            let period = Duration::from_secs(1);
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let elapsed_secs = elapsed.fetch_add(1, Ordering::SeqCst) + 1;
                let _ = events.send(ClientEvent::RecordingTick { elapsed_secs });
            }
        })
    }

    fn emit_state(&self, state: CaptureState) {
        let _ = self.events.send(ClientEvent::CaptureStateChanged(state));
    }
}

/// Encodes a frame as JPEG, flipping it horizontally when the preview was mirrored.
pub fn encode_photo(
    frame: VideoFrame,
    mirrored: bool,
    quality: u8,
) -> Result<Vec<u8>, CaptureError> {
    let VideoFrame {
        width,
        height,
        rgba,
    } = frame;
    let mut image = RgbaImage::from_raw(width, height, rgba).ok_or_else(|| {
        CaptureError::Encode(format!("frame buffer does not match {width}x{height}"))
    })?;
    if mirrored {
        imageops::flip_horizontal_in_place(&mut image);
    }
    let rgb = DynamicImage::ImageRgba8(image).to_rgb8();
    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, quality.clamp(1, 100))
        .encode_image(&rgb)
        .map_err(|err| CaptureError::Encode(err.to_string()))?;
    Ok(jpeg)
}

#[cfg(test)]
#[path = "tests/capture_tests.rs"]
mod tests;
