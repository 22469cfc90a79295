#![forbid(unsafe_code)]

//! Flat playlist listings and playlist-entry download presets.

use serde::{Deserialize, Serialize};
use tracing::warn;
use url::Url;

use crate::{
    extractor::StreamOptions,
    lenient,
    metadata::{MERGE_CONTAINER, RawThumbnail},
    policy::{BlockReason, ContentPolicy, Verdict},
};

const DEFAULT_PLAYLIST_ID: &str = "playlist";
const DEFAULT_PLAYLIST_TITLE: &str = "Playlist";
const UNKNOWN_CHANNEL: &str = "Unknown";
const AUDIO_CODEC: &str = "mp3";
const SUBTITLE_LANGUAGE: &str = "en";

/// One NDJSON line of `--flat-playlist` output. yt-dlp emits either the
/// playlist itself (`_type: playlist`) or one line per entry.
#[derive(Debug, Default, Deserialize)]
struct RawPlaylistLine {
    #[serde(rename = "_type", default, deserialize_with = "lenient::text")]
    kind: Option<String>,
    #[serde(default, deserialize_with = "lenient::text")]
    id: Option<String>,
    #[serde(default, deserialize_with = "lenient::text")]
    url: Option<String>,
    #[serde(default, deserialize_with = "lenient::text")]
    title: Option<String>,
    #[serde(default, deserialize_with = "lenient::number")]
    duration: Option<f64>,
    #[serde(default, deserialize_with = "lenient::list")]
    thumbnails: Vec<RawThumbnail>,
    #[serde(default, deserialize_with = "lenient::text")]
    thumbnail: Option<String>,
    #[serde(default, deserialize_with = "lenient::text")]
    uploader: Option<String>,
    #[serde(default, deserialize_with = "lenient::text")]
    channel: Option<String>,
    #[serde(default, deserialize_with = "lenient::text")]
    playlist_id: Option<String>,
    #[serde(default, deserialize_with = "lenient::text")]
    playlist_title: Option<String>,
    #[serde(default, deserialize_with = "lenient::text")]
    playlist_uploader: Option<String>,
}

impl RawPlaylistLine {
    fn is_playlist(&self) -> bool {
        self.kind.as_deref() == Some("playlist")
    }

    fn channel(&self) -> Option<&str> {
        non_empty(self.uploader.as_deref()).or(non_empty(self.channel.as_deref()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistInfo {
    pub id: String,
    pub title: String,
    pub channel: String,
    pub thumbnail: Option<String>,
    pub video_count: usize,
    pub videos: Vec<PlaylistEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlaylistEntry {
    pub id: String,
    pub title: String,
    pub duration: u64,
    pub thumbnail: Option<String>,
    pub channel: String,
}

/// Parses NDJSON listing output. Lines that are not JSON objects are
/// skipped, so partial output from a failed run still yields what it can.
pub fn parse_playlist(stdout: &str) -> PlaylistInfo {
    let mut id = None;
    let mut title = None;
    let mut channel = None;
    let mut entries = Vec::new();

    for line in stdout.lines().map(str::trim).filter(|line| !line.is_empty()) {
        let raw: RawPlaylistLine = match serde_json::from_str(line) {
            Ok(raw) => raw,
            Err(err) => {
                let preview: String = line.chars().take(100).collect();
                warn!("skipping unparseable playlist line ({err}): {preview}");
                continue;
            }
        };

        if raw.is_playlist() {
            id = id.or(non_empty(raw.id.as_deref()).map(str::to_string));
            title = title.or(non_empty(raw.title.as_deref()).map(str::to_string));
            channel = channel.or(raw.channel().map(str::to_string));
            continue;
        }

        id = id.or(non_empty(raw.playlist_id.as_deref()).map(str::to_string));
        title = title.or(non_empty(raw.playlist_title.as_deref()).map(str::to_string));
        channel = channel.or(non_empty(raw.playlist_uploader.as_deref()).map(str::to_string));
        entries.push(raw);
    }

    let channel = channel.unwrap_or_else(|| UNKNOWN_CHANNEL.to_string());
    let videos: Vec<PlaylistEntry> = entries
        .iter()
        .enumerate()
        .map(|(index, raw)| build_entry(raw, index + 1, &channel))
        .collect();

    PlaylistInfo {
        id: id.unwrap_or_else(|| DEFAULT_PLAYLIST_ID.to_string()),
        title: title.unwrap_or_else(|| DEFAULT_PLAYLIST_TITLE.to_string()),
        thumbnail: videos.first().and_then(|video| video.thumbnail.clone()),
        video_count: videos.len(),
        channel,
        videos,
    }
}

fn build_entry(raw: &RawPlaylistLine, position: usize, playlist_channel: &str) -> PlaylistEntry {
    let id = non_empty(raw.id.as_deref())
        .map(str::to_string)
        .or_else(|| raw.url.as_deref().and_then(watch_id))
        .unwrap_or_else(|| format!("video_{position}"));

    PlaylistEntry {
        id,
        title: non_empty(raw.title.as_deref())
            .map(str::to_string)
            .unwrap_or_else(|| format!("Video {position}")),
        duration: raw
            .duration
            .filter(|duration| duration.is_finite() && *duration > 0.0)
            .map(|duration| duration.round() as u64)
            .unwrap_or(0),
        thumbnail: raw
            .thumbnails
            .iter()
            .find_map(|thumb| non_empty(thumb.url.as_deref()))
            .or(non_empty(raw.thumbnail.as_deref()))
            .map(str::to_string),
        channel: raw.channel().unwrap_or(playlist_channel).to_string(),
    }
}

/// The `v` query parameter of a watch URL.
fn watch_id(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    parsed
        .query_pairs()
        .find(|(key, value)| key == "v" && !value.is_empty())
        .map(|(_, value)| value.into_owned())
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

impl PlaylistInfo {
    /// Rejects the playlist when its own title or channel is blocked and
    /// drops entries whose title or channel is.
    pub fn screen(mut self, policy: &ContentPolicy) -> Result<Self, BlockReason> {
        policy
            .classify_text(&[self.title.as_str(), self.channel.as_str()])
            .into_result()?;

        let before = self.videos.len();
        self.videos.retain(|video| {
            policy.classify_text(&[video.title.as_str(), video.channel.as_str()]) == Verdict::Allowed
        });
        let dropped = before - self.videos.len();
        if dropped > 0 {
            warn!(playlist = %self.id, dropped, "filtered blocked playlist entries");
        }
        self.video_count = self.videos.len();
        self.thumbnail = self.videos.first().and_then(|video| video.thumbnail.clone());
        Ok(self)
    }
}

/// Download preset chosen by the `quality` field of a playlist download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaylistQuality {
    Audio,
    Best,
    MaxHeight(u32),
    /// Unrecognised input: 720p video with an unconstrained fallback.
    Default,
}

impl PlaylistQuality {
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            Some("audio") => Self::Audio,
            Some("best") => Self::Best,
            Some("1080") => Self::MaxHeight(1080),
            Some("720") => Self::MaxHeight(720),
            Some("480") => Self::MaxHeight(480),
            Some("360") => Self::MaxHeight(360),
            _ => Self::Default,
        }
    }

    pub fn selector(self) -> String {
        match self {
            Self::Audio => "bestaudio/best".to_string(),
            Self::Best => "bestvideo+bestaudio/best".to_string(),
            Self::MaxHeight(height) => {
                format!("bestvideo[height<={height}]+bestaudio/best[height<={height}]")
            }
            Self::Default => "bestvideo[height<=720]+bestaudio/best".to_string(),
        }
    }

    /// File extension of the produced download.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Audio => AUDIO_CODEC,
            _ => MERGE_CONTAINER,
        }
    }

    pub fn stream_options(self, extras: &DownloadExtras) -> StreamOptions {
        let mut options = match self {
            Self::Audio => StreamOptions::audio(self.selector(), AUDIO_CODEC),
            _ => StreamOptions::video(self.selector()),
        };
        if extras.subtitles {
            options.subtitles = Some(SUBTITLE_LANGUAGE.to_string());
        }
        options.embed_thumbnail = extras.thumbnail;
        options.add_metadata = extras.metadata;
        options
    }
}

/// Optional post-processing toggles sent with a playlist download.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DownloadExtras {
    pub subtitles: bool,
    pub thumbnail: bool,
    pub metadata: bool,
}
