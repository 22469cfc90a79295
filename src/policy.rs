#![forbid(unsafe_code)]

//! Content policy: substring block-lists applied to request URLs and to the
//! metadata yt-dlp reports back.
//!
//! Matching is plain lower-cased substring search. It over-blocks on purpose
//! (plurals, punctuation and compound words all still match) and a false
//! positive only costs the user a clear 403.

use std::{fs, path::Path};

use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::metadata::RawMetadataDocument;

const DEFAULT_DOMAINS: &[&str] = &[
    // Adult content sites
    "pornhub", "xvideos", "xnxx", "xhamster", "redtube", "youporn", "tube8",
    "spankbang", "eporner", "ixxx", "tnaflix", "porntrex", "beeg", "porn",
    "xxx", "adult", "nsfw", "onlyfans", "fansly", "chaturbate", "stripchat",
    "cam4", "bongacams", "livejasmin", "camsoda", "myfreecams", "flirt4free",
    "imlive", "streamate", "jerkmate", "pornmd", "thumbzilla", "pornone",
    "hqporner", "daftsex", "sxyprn", "playvids", "heavy-r", "efukt",
    "motherless", "bestgore", "kaotic", "crazyshit", "theync", "documenting",
    "livegore", "shockchan", "rotten", "ogrish", "hentai", "nhentai", "hanime",
    "rule34", "e621", "furaffinity", "gelbooru", "danbooru", "sankaku",
    "literotica", "asstr", "sexstories", "luscious", "fakku", "tsumino",
    "fapdu", "nudevista", "fuq", "youjizz", "drtuber", "txxx", "hdzog",
    "hclips", "upornia", "vjav", "javhd", "jav", "dmm", "r18", "caribbean",
    "tokyo-hot", "1pondo", "pacopacomama", "heydouga", "mywife", "h0930",
    "av", "javlibrary", "javbus", "javdb", "missav", "supjav",
    // Gore and violence
    "liveleak", "documentingreality", "goregrish", "seegore",
    // Gambling
    "bet365", "betway", "bovada", "pokerstars", "draftkings", "fanduel",
    // Drugs
    "erowid", "drugs-forum",
];

const DEFAULT_KEYWORDS: &[&str] = &[
    "porn", "xxx", "sex", "adult", "nsfw", "nude", "naked", "hentai", "erotic",
    "fetish", "bdsm", "gore", "死", "gruesom", "torture",
];

const AGE_LIMIT: f64 = 18.0;

/// Why a request was refused. Messages are fixed and never name the rule
/// that matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    UnsupportedSite,
    UnsupportedContent,
    AgeRestricted,
}

impl BlockReason {
    pub fn message(self) -> &'static str {
        match self {
            Self::UnsupportedSite => {
                "This website is not supported due to content policy restrictions."
            }
            Self::UnsupportedContent => {
                "This content is not supported due to content policy restrictions."
            }
            Self::AgeRestricted => "Age-restricted content is not supported.",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    Blocked(BlockReason),
}

impl Verdict {
    pub fn is_blocked(self) -> bool {
        matches!(self, Self::Blocked(_))
    }

    /// `Err(reason)` when blocked, for use with `?`.
    pub fn into_result(self) -> Result<(), BlockReason> {
        match self {
            Self::Allowed => Ok(()),
            Self::Blocked(reason) => Err(reason),
        }
    }
}

#[derive(Debug, Error)]
pub enum BlockListError {
    #[error("reading block-list {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing block-list {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// Extra entries loaded from a TOML file:
///
/// ```toml
/// domains = ["example-casino"]
/// keywords = ["gambling"]
/// ```
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct BlockListFile {
    #[serde(default)]
    domains: Vec<String>,
    #[serde(default)]
    keywords: Vec<String>,
}

/// Lower-cased domain and keyword substrings. Built once at startup and only
/// read afterwards.
#[derive(Debug, Clone)]
pub struct BlockList {
    domains: Vec<String>,
    keywords: Vec<String>,
}

impl Default for BlockList {
    fn default() -> Self {
        Self::new(
            DEFAULT_DOMAINS.iter().copied(),
            DEFAULT_KEYWORDS.iter().copied(),
        )
    }
}

impl BlockList {
    pub fn new<D, K>(domains: D, keywords: K) -> Self
    where
        D: IntoIterator,
        D::Item: AsRef<str>,
        K: IntoIterator,
        K::Item: AsRef<str>,
    {
        let mut list = Self {
            domains: Vec::new(),
            keywords: Vec::new(),
        };
        list.extend(domains, keywords);
        list
    }

    /// Default lists plus the entries of the TOML file at `path`.
    pub fn with_file(path: &Path) -> Result<Self, BlockListError> {
        let raw = fs::read_to_string(path).map_err(|source| BlockListError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let extra: BlockListFile = toml::from_str(&raw).map_err(|source| BlockListError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        let mut list = Self::default();
        list.extend(extra.domains, extra.keywords);
        Ok(list)
    }

    fn extend<D, K>(&mut self, domains: D, keywords: K)
    where
        D: IntoIterator,
        D::Item: AsRef<str>,
        K: IntoIterator,
        K::Item: AsRef<str>,
    {
        push_entries(&mut self.domains, domains);
        push_entries(&mut self.keywords, keywords);
    }

    pub fn domains(&self) -> &[String] {
        &self.domains
    }

    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }

    fn matches_domain(&self, lowered: &str) -> bool {
        self.domains.iter().any(|domain| lowered.contains(domain.as_str()))
    }

    fn matches_keyword(&self, lowered: &str) -> bool {
        self.keywords
            .iter()
            .any(|keyword| lowered.contains(keyword.as_str()))
    }
}

fn push_entries<I>(target: &mut Vec<String>, entries: I)
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    for entry in entries {
        let entry = entry.as_ref().trim().to_lowercase();
        // An empty needle would match every string.
        if !entry.is_empty() && !target.contains(&entry) {
            target.push(entry);
        }
    }
}

/// Stateless classifier over an injected [`BlockList`].
#[derive(Debug, Clone, Default)]
pub struct ContentPolicy {
    blocklist: BlockList,
}

impl ContentPolicy {
    pub fn new(blocklist: BlockList) -> Self {
        Self { blocklist }
    }

    pub fn blocklist(&self) -> &BlockList {
        &self.blocklist
    }

    /// Domain entries are matched against the whole lower-cased input;
    /// keywords only against the path and query of a parseable URL. Input
    /// that is not a URL only gets the domain check.
    pub fn classify_url(&self, url: &str) -> Verdict {
        if self.blocklist.matches_domain(&url.to_lowercase()) {
            return Verdict::Blocked(BlockReason::UnsupportedSite);
        }

        if let Ok(parsed) = Url::parse(url.trim()) {
            let mut path_and_query = parsed.path().to_string();
            if let Some(query) = parsed.query() {
                path_and_query.push('?');
                path_and_query.push_str(query);
            }
            if self.blocklist.matches_keyword(&path_and_query.to_lowercase()) {
                return Verdict::Blocked(BlockReason::UnsupportedContent);
            }
        }

        Verdict::Allowed
    }

    /// Age rating first, then keywords across title, description, channel,
    /// categories and tags. Absent fields never block.
    pub fn classify_metadata(&self, doc: &RawMetadataDocument) -> Verdict {
        if doc.age_limit.is_some_and(|limit| limit >= AGE_LIMIT) {
            return Verdict::Blocked(BlockReason::AgeRestricted);
        }

        let categories = doc.categories.join(" ");
        let tags = doc.tags.join(" ");
        let text = [
            doc.title.as_deref().unwrap_or(""),
            doc.description.as_deref().unwrap_or(""),
            doc.uploader.as_deref().unwrap_or(""),
            doc.channel.as_deref().unwrap_or(""),
            categories.as_str(),
            tags.as_str(),
        ]
        .join(" ")
        .to_lowercase();

        if self.blocklist.matches_keyword(&text) {
            return Verdict::Blocked(BlockReason::UnsupportedContent);
        }

        Verdict::Allowed
    }

    /// Keyword check over loose fields, for listings that carry no age rating.
    pub fn classify_text(&self, fields: &[&str]) -> Verdict {
        if self.blocklist.matches_keyword(&fields.join(" ").to_lowercase()) {
            Verdict::Blocked(BlockReason::UnsupportedContent)
        } else {
            Verdict::Allowed
        }
    }
}
