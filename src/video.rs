#![forbid(unsafe_code)]

//! Video identity and format selection.
//!
//! Everything in here is pure: turning user input into a `VideoId`, mapping a
//! requested format/quality onto the selector string handed to yt-dlp, and
//! deriving response headers for the finished stream.

use std::fmt;

use url::Url;

use crate::error::FetchError;

const VIDEO_ID_LEN: usize = 11;

/// An 11-character YouTube video identifier that passed validation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VideoId(String);

impl VideoId {
    /// Canonical URL handed to the extractor, regardless of the form the
    /// client used.
    pub fn watch_url(&self) -> String {
        format!("https://www.youtube.com/watch?v={}", self.0)
    }
}

impl fmt::Display for VideoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn is_video_id(value: &str) -> bool {
    value.len() == VIDEO_ID_LEN
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn is_youtube_host(host: &str) -> bool {
    matches!(
        host,
        "youtube.com" | "www.youtube.com" | "m.youtube.com" | "music.youtube.com"
    )
}

/// Accepts either a bare ID or any of the common YouTube URL shapes.
pub fn validate(input: &str) -> Result<VideoId, FetchError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(FetchError::InvalidInput("missing video url or id".into()));
    }
    if is_video_id(trimmed) {
        return Ok(VideoId(trimmed.to_string()));
    }

    let parsed = Url::parse(trimmed)
        .or_else(|_| Url::parse(&format!("https://{trimmed}")))
        .map_err(|_| FetchError::InvalidInput(format!("not a YouTube url: {trimmed}")))?;
    let host = parsed
        .host_str()
        .map(|host| host.to_ascii_lowercase())
        .unwrap_or_default();

    let candidate = if host == "youtu.be" {
        parsed
            .path_segments()
            .and_then(|mut segments| segments.next())
            .map(str::to_string)
    } else if is_youtube_host(&host) {
        let mut segments = parsed.path_segments().into_iter().flatten();
        match segments.next() {
            Some("watch") => parsed
                .query_pairs()
                .find(|(key, _)| key == "v")
                .map(|(_, value)| value.into_owned()),
            Some("shorts" | "embed" | "live" | "v") => segments.next().map(str::to_string),
            _ => None,
        }
    } else {
        None
    };

    match candidate {
        Some(id) if is_video_id(&id) => Ok(VideoId(id)),
        _ => Err(FetchError::InvalidInput(format!(
            "not a YouTube url: {trimmed}"
        ))),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaFormat {
    Video,
    Audio,
}

/// Height ceiling requested by the client. `Best` means no ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quality {
    Best,
    P1080,
    P720,
    P480,
}

impl Quality {
    pub const ALL: [Quality; 4] = [Quality::Best, Quality::P1080, Quality::P720, Quality::P480];

    pub fn height(self) -> Option<u32> {
        match self {
            Self::Best => None,
            Self::P1080 => Some(1080),
            Self::P720 => Some(720),
            Self::P480 => Some(480),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Best => "best",
            Self::P1080 => "1080p",
            Self::P720 => "720p",
            Self::P480 => "480p",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatSpec {
    pub format: MediaFormat,
    pub quality: Quality,
}

impl Default for FormatSpec {
    fn default() -> Self {
        Self {
            format: MediaFormat::Video,
            quality: Quality::Best,
        }
    }
}

impl FormatSpec {
    /// Parses the `format` and `quality` query parameters. Missing values
    /// fall back to `video` and `best`.
    pub fn parse(format: Option<&str>, quality: Option<&str>) -> Result<Self, FetchError> {
        let format = match format.map(|value| value.trim().to_ascii_lowercase()) {
            None => MediaFormat::Video,
            Some(value) => match value.as_str() {
                "" | "video" | "mp4" => MediaFormat::Video,
                "audio" | "mp3" => MediaFormat::Audio,
                other => {
                    return Err(FetchError::InvalidInput(format!(
                        "unsupported format: {other}"
                    )));
                }
            },
        };
        let quality = match quality.map(|value| value.trim().to_ascii_lowercase()) {
            None => Quality::Best,
            Some(value) => match value.trim_end_matches('p') {
                "" | "best" => Quality::Best,
                "1080" => Quality::P1080,
                "720" => Quality::P720,
                "480" => Quality::P480,
                other => {
                    return Err(FetchError::InvalidInput(format!(
                        "unsupported quality: {other}"
                    )));
                }
            },
        };
        Ok(Self { format, quality })
    }

    /// yt-dlp `--format` selector, most preferred alternative first.
    pub fn selector(&self) -> String {
        match (self.format, self.quality.height()) {
            (MediaFormat::Audio, _) => "bestaudio/best".to_string(),
            (MediaFormat::Video, None) => "best[ext=mp4]/bestvideo*+bestaudio/best".to_string(),
            (MediaFormat::Video, Some(height)) => format!(
                "best[ext=mp4][height<={height}]/best[height<={height}]/bestvideo*[height<={height}]+bestaudio/best"
            ),
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self.format {
            MediaFormat::Audio => "audio/mpeg",
            MediaFormat::Video => "video/mp4",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self.format {
            MediaFormat::Audio => "mp3",
            MediaFormat::Video => "mp4",
        }
    }

    /// Attachment filename, preferring a known title over the bare id.
    pub fn filename(&self, video_id: &VideoId, title: Option<&str>) -> String {
        let stem = title
            .map(sanitize_filename)
            .filter(|stem| !stem.is_empty())
            .unwrap_or_else(|| video_id.to_string());
        format!("{stem}.{}", self.extension())
    }
}

/// Keeps filenames safe inside a quoted `Content-Disposition` value.
fn sanitize_filename(title: &str) -> String {
    let cleaned: String = title
        .chars()
        .map(|c| match c {
            '"' | '\\' | '/' | ':' | '*' | '?' | '<' | '>' | '|' => '_',
            c if c.is_ascii_graphic() || c == ' ' => c,
            _ => '_',
        })
        .collect();
    cleaned.trim().chars().take(120).collect()
}
