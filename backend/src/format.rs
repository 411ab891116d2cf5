//! Maps a validated request onto the engine's format-selection language.

use crate::request::{DownloadRequest, MediaKind, Quality};

pub const AUDIO_CODEC: &str = "mp3";
pub const AUDIO_BITRATE_KBPS: u32 = 192;
const MERGE_CONTAINER: &str = "mp4";

/// Post-extraction transcode the engine performs once the download finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioTranscode {
    pub codec: &'static str,
    pub bitrate_kbps: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatSpec {
    pub kind: MediaKind,
    /// Ordered `/`-separated alternatives; the last one always matches.
    pub selector: String,
    /// Progressive single-file selector used when the output is piped.
    pub stream_selector: String,
    pub merge_container: Option<&'static str>,
    pub transcode: Option<AudioTranscode>,
}

impl FormatSpec {
    pub fn target_extension(&self) -> &'static str {
        self.kind.extension()
    }

    /// Audio extraction runs on the finished file, so it cannot be piped.
    pub fn supports_streaming(&self) -> bool {
        self.transcode.is_none()
    }

    pub fn to_args(&self, streaming: bool) -> Vec<String> {
        let selector = if streaming {
            &self.stream_selector
        } else {
            &self.selector
        };
        let mut args = vec!["-f".to_string(), selector.clone()];

        if let Some(container) = self.merge_container
            && !streaming
        {
            args.push("--merge-output-format".to_string());
            args.push(container.to_string());
        }

        if let Some(transcode) = &self.transcode {
            args.push("-x".to_string());
            args.push("--audio-format".to_string());
            args.push(transcode.codec.to_string());
            args.push("--audio-quality".to_string());
            args.push(format!("{}K", transcode.bitrate_kbps));
        }

        args
    }
}

pub fn select(request: &DownloadRequest) -> FormatSpec {
    match request.kind {
        MediaKind::Audio => FormatSpec {
            kind: MediaKind::Audio,
            selector: "bestaudio/best".to_string(),
            stream_selector: "bestaudio[ext=m4a]/bestaudio/best".to_string(),
            merge_container: None,
            transcode: Some(AudioTranscode {
                codec: AUDIO_CODEC,
                bitrate_kbps: AUDIO_BITRATE_KBPS,
            }),
        },
        MediaKind::Video => {
            let ceiling = height_filter(request.quality);
            let selector = [
                format!("bestvideo[ext=mp4]{ceiling}+bestaudio[ext=m4a]"),
                format!("best[ext=mp4]{ceiling}"),
                format!("bestvideo{ceiling}+bestaudio"),
                format!("best{ceiling}"),
                "best".to_string(),
            ]
            .join("/");
            let stream_selector = [
                format!("best[ext=mp4]{ceiling}"),
                format!("best{ceiling}"),
                "best".to_string(),
            ]
            .join("/");

            FormatSpec {
                kind: MediaKind::Video,
                selector: dedupe_alternatives(&selector),
                stream_selector: dedupe_alternatives(&stream_selector),
                merge_container: Some(MERGE_CONTAINER),
                transcode: None,
            }
        }
    }
}

fn height_filter(quality: Quality) -> String {
    match quality {
        Quality::MaxHeight(height) => format!("[height<={height}]"),
        Quality::Best => String::new(),
    }
}

// With no ceiling `best{ceiling}` and `best` collapse into the same term.
fn dedupe_alternatives(selector: &str) -> String {
    let mut seen = Vec::new();
    for alternative in selector.split('/') {
        if !seen.contains(&alternative) {
            seen.push(alternative);
        }
    }
    seen.join("/")
}
