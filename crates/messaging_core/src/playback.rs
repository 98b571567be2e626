use std::collections::HashMap;

use anyhow::{anyhow, Result};
use shared::domain::MessageId;
use tokio::sync::broadcast;
use tracing::debug;

use crate::ClientEvent;

/// A rendered audio/video player belonging to one message.
pub trait PlaybackHandle: Send {
    fn play(&mut self) -> Result<()>;
    fn pause(&mut self);
}

/// Keeps at most one message playing at a time.
#[derive(Default)]
pub struct PlaybackController {
    players: HashMap<MessageId, Box<dyn PlaybackHandle>>,
    playing: Option<MessageId>,
    events: Option<broadcast::Sender<ClientEvent>>,
}

impl PlaybackController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Controller that reports every change of the playing message.
    pub fn with_events(events: broadcast::Sender<ClientEvent>) -> Self {
        Self {
            events: Some(events),
            ..Self::default()
        }
    }

    pub fn register(&mut self, message_id: MessageId, handle: Box<dyn PlaybackHandle>) {
        if self.playing.as_ref() == Some(&message_id) {
            self.pause(&message_id);
        }
        self.players.insert(message_id, handle);
    }

    pub fn unregister(&mut self, message_id: &MessageId) {
        if self.playing.as_ref() == Some(message_id) {
            self.pause(message_id);
        }
        self.players.remove(message_id);
    }

    /// Pauses whatever is playing, then starts `message_id`.
    pub fn play(&mut self, message_id: &MessageId) -> Result<()> {
        if self.playing.as_ref() == Some(message_id) {
            return Ok(());
        }
        if !self.players.contains_key(message_id) {
            return Err(anyhow!("no player registered for message {message_id}"));
        }
        if let Some(current) = self.playing.take() {
            if let Some(handle) = self.players.get_mut(&current) {
                handle.pause();
            }
            debug!(message_id = %current, "playback: paused for another message");
        }
        if let Some(handle) = self.players.get_mut(message_id) {
            if let Err(err) = handle.play() {
                self.emit();
                return Err(err);
            }
        }
        self.playing = Some(message_id.clone());
        self.emit();
        Ok(())
    }

    pub fn pause(&mut self, message_id: &MessageId) {
        if self.playing.as_ref() != Some(message_id) {
            return;
        }
        if let Some(handle) = self.players.get_mut(message_id) {
            handle.pause();
        }
        self.playing = None;
        self.emit();
    }

    /// Natural end of track.
    pub fn ended(&mut self, message_id: &MessageId) {
        if self.playing.as_ref() == Some(message_id) {
            self.playing = None;
            self.emit();
        }
    }

    pub fn currently_playing(&self) -> Option<&MessageId> {
        self.playing.as_ref()
    }

    pub fn is_playing(&self, message_id: &MessageId) -> bool {
        self.playing.as_ref() == Some(message_id)
    }

    pub fn pause_all(&mut self) {
        if let Some(current) = self.playing.clone() {
            self.pause(&current);
        }
    }

    fn emit(&self) {
        if let Some(events) = &self.events {
            let _ = events.send(ClientEvent::PlaybackChanged {
                playing: self.playing.clone(),
            });
        }
    }
}

#[cfg(test)]
#[path = "tests/playback_tests.rs"]
mod tests;
