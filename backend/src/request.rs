use std::fmt;

use serde::Serialize;
use url::Url;

use crate::error::ServiceError;

const MIN_URL_LENGTH: usize = 10;
pub const INVALID_URL_MESSAGE: &str = "Invalid or missing URL";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
}

impl MediaKind {
    /// Parses the `type` query value. Absent means video; anything that is not
    /// a known spelling is rejected so a caller never receives an artifact type
    /// it did not ask for.
    pub fn parse(raw: Option<&str>) -> Result<Self, ServiceError> {
        let Some(value) = raw.map(str::trim).filter(|value| !value.is_empty()) else {
            return Ok(Self::Video);
        };

        match value.to_ascii_lowercase().as_str() {
            "mp4" | "video" => Ok(Self::Video),
            "mp3" | "audio" => Ok(Self::Audio),
            _ => Err(ServiceError::InvalidRequest(format!(
                "Unsupported type {value:?}, use mp4 or mp3"
            ))),
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Video => "mp4",
            Self::Audio => "mp3",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            Self::Video => "video/mp4",
            Self::Audio => "audio/mpeg",
        }
    }

    pub fn suggested_filename(self) -> String {
        match self {
            Self::Video => "video.mp4".to_string(),
            Self::Audio => "audio.mp3".to_string(),
        }
    }
}

/// Ceiling on the vertical resolution of the selected video stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quality {
    MaxHeight(u32),
    Best,
}

impl Quality {
    /// Numeric heights are kept, everything else (including `0`) means best.
    pub fn parse(raw: Option<&str>) -> Self {
        raw.map(str::trim)
            .and_then(|value| value.parse::<u32>().ok())
            .filter(|height| *height > 0)
            .map_or(Self::Best, Self::MaxHeight)
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MaxHeight(height) => write!(f, "{height}p"),
            Self::Best => f.write_str("best"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub url: Url,
    pub kind: MediaKind,
    pub quality: Quality,
    pub client_key: String,
}

pub struct RequestValidator {
    allowed_domains: Vec<String>,
}

impl RequestValidator {
    /// An empty allow-list accepts any http(s) host and leaves unsupported
    /// platforms to fail inside the engine.
    pub fn new(allowed_domains: Vec<String>) -> Self {
        Self { allowed_domains }
    }

    pub fn validate(
        &self,
        raw_url: Option<&str>,
        kind: Option<&str>,
        quality: Option<&str>,
        client_key: &str,
    ) -> Result<DownloadRequest, ServiceError> {
        let url = self.validate_url(raw_url)?;

        Ok(DownloadRequest {
            url,
            kind: MediaKind::parse(kind)?,
            quality: Quality::parse(quality),
            client_key: client_key.to_string(),
        })
    }

    pub fn validate_url(&self, raw_url: Option<&str>) -> Result<Url, ServiceError> {
        let invalid = || ServiceError::InvalidRequest(INVALID_URL_MESSAGE.to_string());

        let raw = raw_url.map(str::trim).unwrap_or_default();
        if raw.len() < MIN_URL_LENGTH {
            return Err(invalid());
        }

        let parsed = Url::parse(raw).map_err(|_| invalid())?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(invalid());
        }

        let host = parsed
            .host_str()
            .map(str::to_ascii_lowercase)
            .ok_or_else(invalid)?;

        if !self.is_allowed_host(&host) {
            return Err(ServiceError::InvalidRequest(format!(
                "Unsupported platform: {host}"
            )));
        }

        Ok(parsed)
    }

    fn is_allowed_host(&self, host: &str) -> bool {
        self.allowed_domains.is_empty()
            || self
                .allowed_domains
                .iter()
                .any(|domain| host == domain || host.ends_with(&format!(".{domain}")))
    }
}
