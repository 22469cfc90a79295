#![forbid(unsafe_code)]

//! Hardening helpers shared by the backend: privilege check, and scrubbing of
//! client- or extractor-supplied strings before they reach headers or URLs.

use anyhow::{Result, bail};
use nix::unistd::Uid;

const FALLBACK_FILENAME: &str = "video";
const MAX_FILENAME_CHARS: usize = 150;

/// Fails fast when the backend is started as root. It runs yt-dlp on URLs
/// chosen by remote clients, so it should never hold root privileges.
pub fn ensure_not_root(process: &str) -> Result<()> {
    ensure_not_root_for(Uid::current(), process)
}

fn ensure_not_root_for(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!(
            "{process} must not be run as root; use a regular user or a dedicated service account"
        );
    }
    Ok(())
}

/// Which characters survive in a download filename.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilenameStyle {
    /// ASCII word characters, spaces and `-`.
    Title,
    /// Same as `Title` plus `.`, for names the client already chose.
    ClientSupplied,
}

/// Drops every character outside the style's allow-list, collapses runs of
/// whitespace and trims. Falls back to `video` when nothing is left. The
/// result is always a valid header value.
pub fn sanitize_filename(raw: &str, style: FilenameStyle) -> String {
    let kept: String = raw
        .chars()
        .filter(|c| {
            c.is_ascii_alphanumeric()
                || matches!(c, '_' | '-' | ' ' | '\t')
                || (style == FilenameStyle::ClientSupplied && *c == '.')
        })
        .take(MAX_FILENAME_CHARS)
        .collect();
    let collapsed = kept.split_whitespace().collect::<Vec<_>>().join(" ");
    let trimmed = collapsed.trim_matches('.').trim();
    if trimmed.is_empty() {
        FALLBACK_FILENAME.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Replaces every non-alphanumeric character with `_`, as used for saved
/// thumbnails.
pub fn underscore_filename(raw: &str, fallback: &str) -> String {
    let replaced: String = raw
        .chars()
        .take(MAX_FILENAME_CHARS)
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if replaced.is_empty() {
        fallback.to_string()
    } else {
        replaced
    }
}

/// `Content-Disposition` value for an already sanitized filename.
pub fn attachment_disposition(filename: &str) -> String {
    format!("attachment; filename=\"{filename}\"")
}

/// Video ids are spliced into thumbnail URLs, so only the characters real ids
/// use are accepted.
pub fn is_safe_video_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
