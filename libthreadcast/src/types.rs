//! Core types for Threadcast

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{ApiError, CompositeError};

/// A broadcast destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    Bluesky,
    Mastodon,
    Twitter,
    #[serde(rename = "linkedin")]
    LinkedIn,
    Feed,
}

impl Target {
    pub const ALL: [Target; 5] = [
        Target::Bluesky,
        Target::Mastodon,
        Target::Twitter,
        Target::LinkedIn,
        Target::Feed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Target::Bluesky => "bluesky",
            Target::Mastodon => "mastodon",
            Target::Twitter => "twitter",
            Target::LinkedIn => "linkedin",
            Target::Feed => "feed",
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Target {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "bluesky" => Ok(Target::Bluesky),
            "mastodon" => Ok(Target::Mastodon),
            "twitter" | "x" => Ok(Target::Twitter),
            "linkedin" => Ok(Target::LinkedIn),
            "feed" => Ok(Target::Feed),
            other => Err(format!(
                "Unknown target: '{}'. Valid targets: bluesky, mastodon, twitter, linkedin, feed",
                other
            )),
        }
    }
}

/// A reference to an image handed to the image source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    /// Opaque reference understood by the image source (a file path for
    /// the filesystem source)
    pub source: String,
    /// Alt text; overrides whatever the image source reports
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt_text: Option<String>,
}

impl ImageRef {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            alt_text: None,
        }
    }

    pub fn with_alt_text(mut self, alt_text: impl Into<String>) -> Self {
        self.alt_text = Some(alt_text.into());
        self
    }
}

/// One message of a thread
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageRef>,
}

impl Message {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            link: None,
            images: Vec::new(),
        }
    }

    pub fn with_link(mut self, link: impl Into<String>) -> Self {
        self.link = Some(link.into());
        self
    }

    pub fn with_image(mut self, image: ImageRef) -> Self {
        self.images.push(image);
        self
    }

    /// Content with the link appended, for platforms that carry links inline
    ///
    /// The link is not appended again when the content already contains it.
    pub fn text_with_link(&self) -> String {
        match &self.link {
            Some(link) if !self.content.contains(link.as_str()) => {
                if self.content.trim().is_empty() {
                    link.clone()
                } else {
                    format!("{}\n\n{}", self.content.trim_end(), link)
                }
            }
            _ => self.content.clone(),
        }
    }
}

/// A broadcast request as decoded from the wire
///
/// Target names stay raw strings until validation so that unknown names are
/// rejected instead of silently dropped.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PostRequest {
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    pub messages: Vec<Message>,
}

impl PostRequest {
    pub fn new(targets: &[Target], messages: Vec<Message>) -> Self {
        Self {
            targets: targets.iter().map(|t| t.to_string()).collect(),
            language: None,
            messages,
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    /// Whether `target` was requested, by raw name
    pub fn requests(&self, target: Target) -> bool {
        self.targets
            .iter()
            .any(|name| name.parse::<Target>().ok() == Some(target))
    }
}

/// Result of publishing one message to one platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishedRef {
    pub post_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    /// Content hash (Bluesky strong refs)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cid: Option<String>,
    /// User-facing link to the post
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Root of the thread; `None` when this post is the root
    #[serde(skip)]
    pub root: Option<Box<PublishedRef>>,
}

impl PublishedRef {
    pub fn new(post_id: impl Into<String>) -> Self {
        Self {
            post_id: post_id.into(),
            uri: None,
            cid: None,
            url: None,
            root: None,
        }
    }

    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    pub fn with_cid(mut self, cid: impl Into<String>) -> Self {
        self.cid = Some(cid.into());
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Mark this post as a reply somewhere below `parent`'s thread root
    pub fn in_thread_of(mut self, parent: Option<&PublishedRef>) -> Self {
        self.root = parent.map(|p| Box::new(p.thread_root().detached()));
        self
    }

    /// The root of the thread this post belongs to
    pub fn thread_root(&self) -> &PublishedRef {
        self.root.as_deref().unwrap_or(self)
    }

    /// Copy without the root link
    fn detached(&self) -> PublishedRef {
        PublishedRef {
            root: None,
            ..self.clone()
        }
    }
}

/// Request-level options passed through to every adapter call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOptions {
    pub language: Option<String>,
    /// Id of the broadcast this call belongs to
    pub request_id: Option<String>,
}

/// Outcome of publishing a whole thread to one target
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", content = "result", rename_all = "snake_case")]
pub enum TargetResult {
    Success(Vec<PublishedRef>),
    Failure(ApiError),
}

impl TargetResult {
    pub fn is_success(&self) -> bool {
        matches!(self, TargetResult::Success(_))
    }

    pub fn posts(&self) -> Option<&[PublishedRef]> {
        match self {
            TargetResult::Success(posts) => Some(posts),
            TargetResult::Failure(_) => None,
        }
    }

    pub fn error(&self) -> Option<&ApiError> {
        match self {
            TargetResult::Success(_) => None,
            TargetResult::Failure(e) => Some(e),
        }
    }
}

/// Merged per-target outcome of one broadcast
#[derive(Debug, Clone, Default, Serialize)]
pub struct CompositeResult {
    pub outcomes: BTreeMap<Target, TargetResult>,
}

impl CompositeResult {
    pub fn is_success(&self) -> bool {
        self.outcomes.values().all(TargetResult::is_success)
    }

    /// 200 when every target succeeded, otherwise the highest failing status
    pub fn status(&self) -> u16 {
        self.outcomes
            .values()
            .filter_map(|r| r.error().map(|e| e.status))
            .max()
            .unwrap_or(200)
    }

    pub fn get(&self, target: Target) -> Option<&TargetResult> {
        self.outcomes.get(&target)
    }

    pub fn failures(&self) -> impl Iterator<Item = (&Target, &ApiError)> {
        self.outcomes
            .iter()
            .filter_map(|(target, result)| result.error().map(|e| (target, e)))
    }

    /// Split into the all-success mapping or the composite failure
    pub fn into_result(
        self,
    ) -> std::result::Result<BTreeMap<Target, Vec<PublishedRef>>, CompositeError> {
        if self.is_success() {
            return Ok(self
                .outcomes
                .into_iter()
                .filter_map(|(target, result)| match result {
                    TargetResult::Success(posts) => Some((target, posts)),
                    TargetResult::Failure(_) => None,
                })
                .collect());
        }

        let status = self.status();
        let failed = self.failures().count();
        Err(CompositeError {
            status,
            failed,
            total: self.outcomes.len(),
            outcomes: self.outcomes,
        })
    }
}

/// Supported image MIME types for uploads
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ImageMimeType {
    Jpeg,
    Png,
    Gif,
    WebP,
}

impl ImageMimeType {
    /// Parse MIME type from a MIME string (e.g., "image/jpeg")
    pub fn from_mime_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "image/jpeg" | "image/jpg" => Some(Self::Jpeg),
            "image/png" => Some(Self::Png),
            "image/gif" => Some(Self::Gif),
            "image/webp" => Some(Self::WebP),
            _ => None,
        }
    }

    /// Detect MIME type from file extension
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "jpg" | "jpeg" => Some(Self::Jpeg),
            "png" => Some(Self::Png),
            "gif" => Some(Self::Gif),
            "webp" => Some(Self::WebP),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Gif => "image/gif",
            Self::WebP => "image/webp",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Png => "png",
            Self::Gif => "gif",
            Self::WebP => "webp",
        }
    }
}

impl fmt::Display for ImageMimeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
