//! yt-dlp metadata as it arrives (`Raw*`) and the canonical shape the API
//! returns (`Normalized*`).
//!
//! Raw documents come straight from an external process and may be partial
//! or oddly typed, so every field is optional and read leniently. The
//! normalizer never fails; missing values fall back to the defaults
//! documented on each field.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::lenient;

/// Sentinel yt-dlp uses for a missing track in `vcodec`/`acodec`.
const NO_CODEC: &str = "none";
/// Container used whenever video and audio are fetched separately.
pub const MERGE_CONTAINER: &str = "mp4";
/// Selector passed to yt-dlp unmodified.
pub const BEST_FORMAT: &str = "best";
const DESCRIPTION_LIMIT: usize = 200;
const UNKNOWN: &str = "Unknown";

/// Output of `yt-dlp --dump-single-json` for a single video.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawMetadataDocument {
    #[serde(default, deserialize_with = "lenient::text")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "lenient::text")]
    pub title: Option<String>,
    #[serde(default, deserialize_with = "lenient::text")]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "lenient::text")]
    pub uploader: Option<String>,
    #[serde(default, deserialize_with = "lenient::text")]
    pub channel: Option<String>,
    #[serde(default, deserialize_with = "lenient::number")]
    pub duration: Option<f64>,
    #[serde(default, deserialize_with = "lenient::count")]
    pub view_count: Option<u64>,
    #[serde(default, deserialize_with = "lenient::text")]
    pub upload_date: Option<String>,
    #[serde(default, deserialize_with = "lenient::number")]
    pub age_limit: Option<f64>,
    #[serde(default, deserialize_with = "lenient::text_list")]
    pub categories: Vec<String>,
    #[serde(default, deserialize_with = "lenient::text_list")]
    pub tags: Vec<String>,
    #[serde(default, deserialize_with = "lenient::text")]
    pub thumbnail: Option<String>,
    #[serde(default, deserialize_with = "lenient::list")]
    pub thumbnails: Vec<RawThumbnail>,
    #[serde(default, deserialize_with = "lenient::list")]
    pub formats: Vec<RawFormat>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawThumbnail {
    #[serde(default, deserialize_with = "lenient::text")]
    pub url: Option<String>,
    #[serde(default, deserialize_with = "lenient::count")]
    pub width: Option<u64>,
    #[serde(default, deserialize_with = "lenient::count")]
    pub height: Option<u64>,
}

/// One candidate stream from the `formats` array.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawFormat {
    #[serde(default, deserialize_with = "lenient::text")]
    pub format_id: Option<String>,
    #[serde(default, deserialize_with = "lenient::text")]
    pub vcodec: Option<String>,
    #[serde(default, deserialize_with = "lenient::text")]
    pub acodec: Option<String>,
    #[serde(default, deserialize_with = "lenient::count")]
    pub height: Option<u64>,
    #[serde(default, deserialize_with = "lenient::number")]
    pub fps: Option<f64>,
    #[serde(default, deserialize_with = "lenient::number")]
    pub abr: Option<f64>,
    #[serde(default, deserialize_with = "lenient::text")]
    pub ext: Option<String>,
    #[serde(default, deserialize_with = "lenient::count")]
    pub filesize: Option<u64>,
    #[serde(default, deserialize_with = "lenient::count")]
    pub filesize_approx: Option<u64>,
    #[serde(default, deserialize_with = "lenient::text")]
    pub format_note: Option<String>,
}

impl RawFormat {
    /// A missing `vcodec` counts as video-bearing.
    pub fn has_video(&self) -> bool {
        self.vcodec.as_deref() != Some(NO_CODEC)
    }

    /// A missing `acodec` counts as silent.
    pub fn has_audio(&self) -> bool {
        self.acodec.as_deref().is_some_and(|codec| codec != NO_CODEC)
    }

    pub fn is_audio_only(&self) -> bool {
        !self.has_video() && self.has_audio()
    }

    pub fn is_video_only(&self) -> bool {
        self.has_video() && !self.has_audio()
    }

    /// Exact size when known, else yt-dlp's estimate, else 0.
    pub fn size(&self) -> u64 {
        self.filesize.or(self.filesize_approx).unwrap_or(0)
    }

    fn height(&self) -> u64 {
        self.height.unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedVideoInfo {
    pub id: String,
    pub title: String,
    pub duration: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    pub channel: String,
    pub views: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_date: Option<String>,
    /// At most 200 characters, ellipsis included.
    pub description: String,
    pub formats: Vec<NormalizedFormat>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedFormat {
    pub format_id: String,
    pub quality: String,
    pub height: u64,
    pub ext: String,
    pub filesize: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fps: Option<f64>,
    pub needs_merge: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_size: Option<u64>,
}

/// Sites whose thumbnails can be built from the video id alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    YouTube,
}

impl Platform {
    pub fn detect(url: &str) -> Option<Self> {
        let parsed = Url::parse(url.trim()).ok()?;
        let host = parsed.host_str()?.to_ascii_lowercase();
        let host = host.trim_end_matches('.');
        if host == "youtu.be" || host == "youtube.com" || host.ends_with(".youtube.com") {
            return Some(Self::YouTube);
        }
        None
    }

    /// Highest resolution the platform serves for `video_id`.
    pub fn max_thumbnail(self, video_id: &str) -> String {
        match self {
            Self::YouTube => format!("https://i.ytimg.com/vi/{video_id}/maxresdefault.jpg"),
        }
    }

    /// Every known thumbnail size, best first.
    pub fn thumbnail_ladder(self, video_id: &str) -> Vec<String> {
        match self {
            Self::YouTube => ["maxresdefault", "sddefault", "hqdefault", "mqdefault"]
                .iter()
                .map(|name| format!("https://i.ytimg.com/vi/{video_id}/{name}.jpg"))
                .collect(),
        }
    }
}

/// Builds the API view of a raw document. `original_url` is the URL the
/// client asked for and only drives platform detection.
pub fn normalize(doc: &RawMetadataDocument, original_url: &str) -> NormalizedVideoInfo {
    let id = doc.id.clone().unwrap_or_default();
    let thumbnail = select_thumbnail(doc, original_url);

    NormalizedVideoInfo {
        title: doc.title.clone().unwrap_or_else(|| UNKNOWN.to_string()),
        duration: doc
            .duration
            .filter(|duration| duration.is_finite() && *duration > 0.0)
            .map(|duration| duration.round() as u64)
            .unwrap_or(0),
        thumbnail,
        channel: doc
            .uploader
            .clone()
            .or_else(|| doc.channel.clone())
            .unwrap_or_else(|| UNKNOWN.to_string()),
        views: doc.view_count.unwrap_or(0),
        upload_date: doc.upload_date.clone(),
        description: truncate_description(doc.description.as_deref().unwrap_or("")),
        formats: build_format_ladder(&doc.formats),
        id,
    }
}

fn select_thumbnail(doc: &RawMetadataDocument, original_url: &str) -> Option<String> {
    if let Some(id) = doc.id.as_deref().filter(|id| !id.is_empty())
        && let Some(platform) = Platform::detect(original_url)
    {
        return Some(platform.max_thumbnail(id));
    }

    let mut candidates: Vec<&RawThumbnail> = doc
        .thumbnails
        .iter()
        .filter(|thumb| thumb.url.as_deref().is_some_and(|url| !url.is_empty()))
        .collect();
    candidates.sort_by_key(|thumb| {
        std::cmp::Reverse(thumb.width.unwrap_or(0).saturating_mul(thumb.height.unwrap_or(0)))
    });
    candidates
        .first()
        .and_then(|thumb| thumb.url.clone())
        .or_else(|| doc.thumbnail.clone())
}

fn truncate_description(description: &str) -> String {
    if description.chars().count() <= DESCRIPTION_LIMIT {
        return description.to_string();
    }
    let mut truncated: String = description.chars().take(DESCRIPTION_LIMIT - 3).collect();
    truncated.push_str("...");
    truncated
}

/// Highest-bitrate audio-only stream, used both for merge sizing and as the
/// audio half of every `needsMerge` entry.
pub fn best_audio(formats: &[RawFormat]) -> Option<&RawFormat> {
    let mut audio: Vec<&RawFormat> = formats.iter().filter(|f| f.is_audio_only()).collect();
    audio.sort_by(|a, b| b.abr.unwrap_or(0.0).total_cmp(&a.abr.unwrap_or(0.0)));
    audio.first().copied()
}

fn by_height_desc<'a>(formats: impl Iterator<Item = &'a RawFormat>) -> Vec<&'a RawFormat> {
    let mut sorted: Vec<&RawFormat> = formats.collect();
    sorted.sort_by_key(|format| std::cmp::Reverse(format.height()));
    sorted
}

fn quality_label(format: &RawFormat) -> String {
    format
        .format_note
        .clone()
        .filter(|note| !note.trim().is_empty())
        .unwrap_or_else(|| format!("{}p", format.height()))
}

fn build_format_ladder(formats: &[RawFormat]) -> Vec<NormalizedFormat> {
    let audio_size = best_audio(formats).map(RawFormat::size).unwrap_or(0);
    let mut seen_heights = Vec::new();
    let mut ladder = Vec::new();

    // Separate streams usually beat pre-muxed ones at the same height.
    for format in by_height_desc(formats.iter().filter(|f| f.is_video_only())) {
        let height = format.height();
        if height == 0 || seen_heights.contains(&height) {
            continue;
        }
        seen_heights.push(height);
        let video_size = format.size();
        ladder.push(NormalizedFormat {
            format_id: format.format_id.clone().unwrap_or_default(),
            quality: quality_label(format),
            height,
            ext: MERGE_CONTAINER.to_string(),
            filesize: video_size.saturating_add(audio_size),
            fps: format.fps,
            needs_merge: true,
            video_size: Some(video_size),
            audio_size: Some(audio_size),
        });
    }

    for format in by_height_desc(formats.iter().filter(|f| f.has_video() && f.has_audio())) {
        let height = format.height();
        if height == 0 || seen_heights.contains(&height) {
            continue;
        }
        seen_heights.push(height);
        ladder.push(NormalizedFormat {
            format_id: format.format_id.clone().unwrap_or_default(),
            quality: quality_label(format),
            height,
            ext: format
                .ext
                .clone()
                .unwrap_or_else(|| MERGE_CONTAINER.to_string()),
            filesize: format.size(),
            fps: format.fps,
            needs_merge: false,
            video_size: None,
            audio_size: None,
        });
    }

    ladder.sort_by_key(|format| std::cmp::Reverse(format.height));

    if ladder.is_empty()
        && let Some(best) = by_height_desc(formats.iter().filter(|f| f.has_video()))
            .first()
            .copied()
    {
        let height = best.height();
        ladder.push(NormalizedFormat {
            format_id: BEST_FORMAT.to_string(),
            quality: if height > 0 {
                format!("{height}p (best)")
            } else {
                BEST_FORMAT.to_string()
            },
            height,
            ext: MERGE_CONTAINER.to_string(),
            filesize: best.size().saturating_add(audio_size),
            fps: best.fps,
            needs_merge: false,
            video_size: None,
            audio_size: None,
        });
    }

    ladder
}

/// Size estimate for a download of `format_id`, adding the best audio track
/// when the format carries no audio of its own. `None` when nothing useful
/// is known.
pub fn expected_download_size(doc: &RawMetadataDocument, format_id: Option<&str>) -> Option<u64> {
    let format_id = format_id.map(str::trim).filter(|id| !id.is_empty());
    let size = match format_id {
        None | Some(BEST_FORMAT) => build_format_ladder(&doc.formats)
            .first()
            .map(|entry| entry.filesize)
            .unwrap_or(0),
        Some(id) => doc
            .formats
            .iter()
            .find(|format| format.format_id.as_deref() == Some(id))
            .map(|format| {
                let audio = if format.has_audio() {
                    0
                } else {
                    best_audio(&doc.formats).map(RawFormat::size).unwrap_or(0)
                };
                format.size().saturating_add(audio)
            })
            .unwrap_or(0),
    };
    (size > 0).then_some(size)
}
