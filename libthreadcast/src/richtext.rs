//! Rich-text facet detection for AT Protocol posts
//!
//! Bluesky does not parse links, mentions or hashtags out of post text.
//! Clients annotate the text with facets: half-open byte ranges into the
//! UTF-8 encoding of the final text, each carrying one feature.
//!
//! Links may be rewritten to a shorter display form. Offsets are always taken
//! from the text being built, so every replacement shifts the facets that
//! follow it correctly.
//!
//! # Examples
//!
//! ```
//! use libthreadcast::richtext::{shorten_links, FacetFeature};
//!
//! let rich = shorten_links("Check https://example.com/very/long/path out", Some(15));
//! assert_eq!(rich.text, "Check example.com/ver… out");
//!
//! let facet = &rich.facets[0];
//! assert_eq!(&rich.text.as_bytes()[facet.byte_start..facet.byte_end], "example.com/ver…".as_bytes());
//! assert_eq!(
//!     facet.feature,
//!     FacetFeature::Link { uri: "https://example.com/very/long/path".to_string() }
//! );
//! ```

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::error::Result;

static URL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"https?://\S+").unwrap());

static MENTION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:^|[\s(])(@[a-zA-Z0-9](?:[a-zA-Z0-9.-]*[a-zA-Z0-9])?)").unwrap()
});

static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?:^|\s)(#[^\s#]+)").unwrap());

const MAX_TAG_CHARS: usize = 64;
const ELLIPSIS: char = '…';

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FacetFeature {
    Link { uri: String },
    Mention { did: String },
    Tag { tag: String },
}

/// A byte-range annotation on post text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Facet {
    pub byte_start: usize,
    pub byte_end: usize,
    pub feature: FacetFeature,
}

impl Facet {
    fn overlaps(&self, start: usize, end: usize) -> bool {
        start < self.byte_end && self.byte_start < end
    }

    /// The `app.bsky.richtext.facet` record representation
    pub fn to_record(&self) -> serde_json::Value {
        let feature = match &self.feature {
            FacetFeature::Link { uri } => json!({
                "$type": "app.bsky.richtext.facet#link",
                "uri": uri,
            }),
            FacetFeature::Mention { did } => json!({
                "$type": "app.bsky.richtext.facet#mention",
                "did": did,
            }),
            FacetFeature::Tag { tag } => json!({
                "$type": "app.bsky.richtext.facet#tag",
                "tag": tag,
            }),
        };
        json!({
            "index": {
                "byteStart": self.byte_start,
                "byteEnd": self.byte_end,
            },
            "features": [feature],
        })
    }
}

/// Final post text plus its facets
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RichText {
    pub text: String,
    pub facets: Vec<Facet>,
}

impl RichText {
    /// Length as counted by the platform's character limit
    pub fn char_count(&self) -> usize {
        self.text.chars().count()
    }

    /// Text covered by `facet`
    pub fn slice(&self, facet: &Facet) -> Option<&str> {
        self.text.get(facet.byte_start..facet.byte_end)
    }
}

/// Resolves `@handle` mentions to account identifiers (DIDs)
#[async_trait]
pub trait HandleResolver: Send + Sync {
    async fn resolve_handle(&self, handle: &str) -> Result<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RichTextOptions {
    /// Visible characters kept when shortening links; `None` keeps links verbatim
    pub link_display_length: Option<usize>,
}

impl Default for RichTextOptions {
    fn default() -> Self {
        Self {
            link_display_length: Some(27),
        }
    }
}

/// Drop trailing sentence punctuation and an unbalanced closing paren
fn trim_url(candidate: &str) -> &str {
    let mut url = candidate;
    loop {
        let mut trimmed =
            url.trim_end_matches(|c| matches!(c, '.' | ',' | ';' | ':' | '!' | '?' | '"' | '\''));
        if trimmed.ends_with(')') && !trimmed.contains('(') {
            trimmed = &trimmed[..trimmed.len() - 1];
        }
        if trimmed.len() == url.len() {
            return url;
        }
        url = trimmed;
    }
}

fn strip_scheme(url: &str) -> &str {
    url.strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url)
}

/// Display form of a link: scheme stripped, truncated to `max_chars` plus an ellipsis
pub fn display_link(url: &str, max_chars: usize) -> String {
    let without_scheme = strip_scheme(url);
    if without_scheme.chars().count() <= max_chars {
        return without_scheme.to_string();
    }
    let mut display: String = without_scheme.chars().take(max_chars).collect();
    display.push(ELLIPSIS);
    display
}

/// Replace bare URLs with their display form and annotate them
///
/// With `link_display_length` of `None` URLs stay verbatim but still get link
/// facets. Text without URLs comes back unchanged with no facets.
pub fn shorten_links(text: &str, link_display_length: Option<usize>) -> RichText {
    let mut out = String::with_capacity(text.len());
    let mut facets = Vec::new();
    let mut cursor = 0;

    for candidate in URL_RE.find_iter(text) {
        let url = trim_url(candidate.as_str());
        if strip_scheme(url).is_empty() {
            continue;
        }

        let start = candidate.start();
        out.push_str(&text[cursor..start]);

        let display = match link_display_length {
            Some(max) => display_link(url, max),
            None => url.to_string(),
        };

        let byte_start = out.len();
        out.push_str(&display);
        facets.push(Facet {
            byte_start,
            byte_end: out.len(),
            feature: FacetFeature::Link {
                uri: url.to_string(),
            },
        });

        cursor = start + url.len();
    }
    out.push_str(&text[cursor..]);

    RichText { text: out, facets }
}

/// `(byte_start, byte_end, handle)` of every well-formed mention
fn detect_mentions(text: &str) -> Vec<(usize, usize, String)> {
    MENTION_RE
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .filter_map(|m| {
            let handle = &m.as_str()[1..];
            let valid = handle.contains('.') && !handle.split('.').any(str::is_empty);
            valid.then(|| (m.start(), m.end(), handle.to_string()))
        })
        .collect()
}

/// `(byte_start, byte_end, tag)` of every hashtag; the range includes the `#`
fn detect_tags(text: &str) -> Vec<(usize, usize, String)> {
    TAG_RE
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .filter_map(|m| {
            let tag = m.as_str()[1..].trim_end_matches(|c: char| c.is_ascii_punctuation() || c == ELLIPSIS);
            if tag.is_empty()
                || tag.chars().all(|c| c.is_ascii_digit())
                || tag.chars().count() > MAX_TAG_CHARS
            {
                return None;
            }
            let start = m.start();
            Some((start, start + 1 + tag.len(), tag.to_string()))
        })
        .collect()
}

/// Build the final text and facets for a post
///
/// Links are shortened and annotated first. Mentions and hashtags are then
/// detected on the rewritten text. A mention whose handle cannot be resolved
/// is left as plain text.
pub async fn build_rich_text(
    text: &str,
    options: &RichTextOptions,
    resolver: &dyn HandleResolver,
) -> RichText {
    let mut rich = shorten_links(text, options.link_display_length);
    let mut spans: Vec<Facet> = Vec::new();
    let mut resolved: HashMap<String, Option<String>> = HashMap::new();

    let is_free = |facets: &[Facet], spans: &[Facet], start: usize, end: usize| {
        !facets.iter().chain(spans.iter()).any(|f| f.overlaps(start, end))
    };

    for (start, end, handle) in detect_mentions(&rich.text) {
        if !is_free(&rich.facets, &spans, start, end) {
            continue;
        }

        let did = match resolved.get(&handle) {
            Some(cached) => cached.clone(),
            None => {
                let did = match resolver.resolve_handle(&handle).await {
                    Ok(did) => Some(did),
                    Err(e) => {
                        warn!(handle = %handle, error = %e, "could not resolve mention, leaving it as text");
                        None
                    }
                };
                resolved.insert(handle.clone(), did.clone());
                did
            }
        };

        if let Some(did) = did {
            spans.push(Facet {
                byte_start: start,
                byte_end: end,
                feature: FacetFeature::Mention { did },
            });
        }
    }

    for (start, end, tag) in detect_tags(&rich.text) {
        if is_free(&rich.facets, &spans, start, end) {
            spans.push(Facet {
                byte_start: start,
                byte_end: end,
                feature: FacetFeature::Tag { tag },
            });
        }
    }

    spans.sort_by_key(|f| f.byte_start);
    debug!(
        links = rich.facets.len(),
        spans = spans.len(),
        bytes = rich.text.len(),
        "computed facets"
    );
    rich.facets.extend(spans);
    rich
}
