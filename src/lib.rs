#![forbid(unsafe_code)]

//! Core of the AquaSeal backend: content policy, metadata normalization and
//! the yt-dlp streaming relay. The HTTP surface lives in `src/bin/backend.rs`.

pub mod config;
pub mod extractor;
mod lenient;
pub mod metadata;
pub mod playlist;
pub mod policy;
pub mod relay;
pub mod security;
pub mod thumbnail;
