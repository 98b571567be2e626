use std::{fs, path::Path, time::Duration};

use anyhow::{anyhow, Context};
use serde::Deserialize;
use url::Url;

pub const DEFAULT_SETTINGS_FILE: &str = "messaging.toml";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClientSettings {
    pub api_base_url: String,
    pub api_token: Option<String>,
    pub max_upload_bytes: u64,
    pub request_timeout_secs: u64,
    pub mirror_camera_preview: bool,
    pub photo_jpeg_quality: u8,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:3000/api".into(),
            api_token: None,
            max_upload_bytes: 25 * 1024 * 1024,
            request_timeout_secs: 30,
            mirror_camera_preview: true,
            photo_jpeg_quality: 90,
        }
    }
}

impl ClientSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    /// Base URL without a trailing slash, checked to be http(s).
    pub fn normalized_base_url(&self) -> anyhow::Result<String> {
        let trimmed = self.api_base_url.trim().trim_end_matches('/');
        let parsed = Url::parse(trimmed)
            .with_context(|| format!("invalid api_base_url '{}'", self.api_base_url))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(anyhow!(
                "api_base_url must start with http:// or https://, got '{}'",
                self.api_base_url
            ));
        }
        Ok(trimmed.to_string())
    }
}

/// Partial settings as they appear in `messaging.toml`.
#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    api_base_url: Option<String>,
    api_token: Option<String>,
    max_upload_bytes: Option<u64>,
    request_timeout_secs: Option<u64>,
    mirror_camera_preview: Option<bool>,
    photo_jpeg_quality: Option<u8>,
}

pub fn load_settings() -> ClientSettings {
    load_settings_from(Path::new(DEFAULT_SETTINGS_FILE))
}

pub fn load_settings_from(path: &Path) -> ClientSettings {
    let raw = fs::read_to_string(path).ok();
    settings_from_sources(raw.as_deref(), |key| std::env::var(key).ok())
}

/// Defaults, then the optional file contents, then environment overrides.
pub fn settings_from_sources(
    file_contents: Option<&str>,
    env: impl Fn(&str) -> Option<String>,
) -> ClientSettings {
    let mut settings = ClientSettings::default();

    if let Some(raw) = file_contents {
        match toml::from_str::<FileSettings>(raw) {
            Ok(file_cfg) => {
                if let Some(v) = file_cfg.api_base_url {
                    settings.api_base_url = v;
                }
                if file_cfg.api_token.is_some() {
                    settings.api_token = file_cfg.api_token;
                }
                if let Some(v) = file_cfg.max_upload_bytes {
                    settings.max_upload_bytes = v;
                }
                if let Some(v) = file_cfg.request_timeout_secs {
                    settings.request_timeout_secs = v;
                }
                if let Some(v) = file_cfg.mirror_camera_preview {
                    settings.mirror_camera_preview = v;
                }
                if let Some(v) = file_cfg.photo_jpeg_quality {
                    settings.photo_jpeg_quality = v;
                }
            }
            Err(err) => {
                tracing::warn!("settings: ignoring malformed settings file: {err}");
            }
        }
    }

    if let Some(v) = env("MESSAGING_API_URL") {
        settings.api_base_url = v;
    }
    if let Some(v) = env("APP__API_BASE_URL") {
        settings.api_base_url = v;
    }

    if let Some(v) = env("MESSAGING_API_TOKEN") {
        settings.api_token = Some(v);
    }
    if let Some(v) = env("APP__API_TOKEN") {
        settings.api_token = Some(v);
    }

    if let Some(v) = env("APP__MAX_UPLOAD_BYTES") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.max_upload_bytes = parsed;
        }
    }

    if let Some(v) = env("APP__REQUEST_TIMEOUT_SECS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.request_timeout_secs = parsed;
        }
    }

    if let Some(v) = env("APP__MIRROR_CAMERA_PREVIEW") {
        if let Ok(parsed) = v.parse::<bool>() {
            settings.mirror_camera_preview = parsed;
        }
    }

    if let Some(v) = env("APP__PHOTO_JPEG_QUALITY") {
        if let Ok(parsed) = v.parse::<u8>() {
            settings.photo_jpeg_quality = parsed.clamp(1, 100);
        }
    }

    settings
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
