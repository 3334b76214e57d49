//! Pre-flight validation
//!
//! Every structural problem that would make any requested target fail is
//! caught here, before a single network call. External platforms cannot
//! roll back, so a request that would leave a half-published thread on
//! some platforms is rejected as a whole.
//!
//! Rules run in order and the first violation wins:
//!
//! 1. the thread has at least one message
//! 2. every message is sane: not empty (unless it carries an image or a
//!    link), within the byte bound and the image cap, with a valid link
//! 3. LinkedIn threads have at most two messages (post plus one comment)
//! 4. a LinkedIn follow-up comment fits the comment ceiling and carries at
//!    most one image
//! 5. every target name is known and at least one is given
//! 6. every message fits each target's character ceiling

use std::collections::BTreeSet;

use crate::config::{Config, Limits};
use crate::error::ApiError;
use crate::platforms::{bluesky, linkedin, mastodon, twitter};
use crate::richtext::{shorten_links, RichText};
use crate::types::{Message, PostRequest, Target};

/// Length every URL counts as on Twitter and Mastodon
pub const WEIGHTED_URL_CHARS: usize = 23;

const LINKEDIN_MAX_MESSAGES: usize = 2;

/// Character count with every URL weighted as [`WEIGHTED_URL_CHARS`]
pub fn weighted_length(text: &str) -> usize {
    let RichText { text, facets } = shorten_links(text, None);
    let url_chars: usize = facets
        .iter()
        .filter_map(|f| text.get(f.byte_start..f.byte_end))
        .map(|url| url.chars().count())
        .sum();
    text.chars().count() - url_chars + facets.len() * WEIGHTED_URL_CHARS
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validator {
    limits: Limits,
    link_display_length: Option<usize>,
}

impl Default for Validator {
    fn default() -> Self {
        Self::new(Limits::default())
    }
}

impl Validator {
    pub fn new(limits: Limits) -> Self {
        Self {
            limits,
            link_display_length: Some(27),
        }
    }

    /// Validator using the configured limits and Bluesky link shortening
    pub fn from_config(config: &Config) -> Self {
        let validator = Self::new(config.limits.clone());
        match &config.bluesky {
            Some(bluesky) => validator.with_link_display_length(bluesky.link_display_length),
            None => validator,
        }
    }

    pub fn with_link_display_length(mut self, link_display_length: Option<usize>) -> Self {
        self.link_display_length = link_display_length;
        self
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Validate `request`, returning the parsed target set
    ///
    /// Pure: no I/O and no side effects.
    ///
    /// # Errors
    ///
    /// Returns a 400 [`ApiError`] describing the first violated rule.
    pub fn validate(&self, request: &PostRequest) -> Result<BTreeSet<Target>, ApiError> {
        if request.messages.is_empty() {
            return Err(ApiError::validation("messages must not be empty"));
        }

        for (index, message) in request.messages.iter().enumerate() {
            self.check_message(index, message)?;
        }

        if request.requests(Target::LinkedIn) {
            self.check_linkedin_thread(&request.messages)?;
        }

        let targets = parse_targets(&request.targets)?;

        for target in &targets {
            for (index, message) in request.messages.iter().enumerate() {
                self.check_length(*target, index, message)?;
            }
        }

        Ok(targets)
    }

    fn check_message(&self, index: usize, message: &Message) -> Result<(), ApiError> {
        let n = index + 1;

        if message.content.trim().is_empty() && message.images.is_empty() && message.link.is_none() {
            return Err(ApiError::validation(format!(
                "message {} is empty: it needs content, an image or a link",
                n
            )));
        }

        if message.content.len() > self.limits.max_content_bytes {
            return Err(ApiError::validation(format!(
                "message {} is {} bytes, larger than the {} byte limit",
                n,
                message.content.len(),
                self.limits.max_content_bytes
            )));
        }

        if message.images.len() > self.limits.max_images_per_message {
            return Err(ApiError::validation(format!(
                "message {} has {} images, at most {} are allowed",
                n,
                message.images.len(),
                self.limits.max_images_per_message
            )));
        }

        if let Some(link) = &message.link {
            let valid = url::Url::parse(link)
                .map(|url| matches!(url.scheme(), "http" | "https"))
                .unwrap_or(false);
            if !valid {
                return Err(ApiError::validation(format!(
                    "message {} has an invalid link: {}",
                    n, link
                )));
            }
        }

        Ok(())
    }

    fn check_linkedin_thread(&self, messages: &[Message]) -> Result<(), ApiError> {
        if messages.len() > LINKEDIN_MAX_MESSAGES {
            return Err(ApiError::validation(format!(
                "linkedin supports one post and at most one follow-up comment, got {} messages",
                messages.len()
            ))
            .for_target(Target::LinkedIn));
        }

        if let Some(follow_up) = messages.get(1) {
            let length = linkedin::comment_text(follow_up).chars().count();
            if length > self.limits.linkedin_comment_chars {
                return Err(ApiError::validation(format!(
                    "linkedin follow-up comment is {} characters, over the {} character limit",
                    length, self.limits.linkedin_comment_chars
                ))
                .for_target(Target::LinkedIn));
            }
            if follow_up.images.len() > 1 {
                return Err(ApiError::validation(format!(
                    "linkedin follow-up comment can carry one image, got {}",
                    follow_up.images.len()
                ))
                .for_target(Target::LinkedIn));
            }
        }

        Ok(())
    }

    /// Character count and ceiling of `message` on `target`
    ///
    /// `None` when the target has no ceiling for this message (the feed, and
    /// LinkedIn follow-ups, which rule 4 already covered).
    fn measure(&self, target: Target, index: usize, message: &Message) -> Option<(usize, usize)> {
        match target {
            Target::Bluesky => {
                let text = bluesky::post_text(message);
                let length = shorten_links(&text, self.link_display_length).char_count();
                Some((length, self.limits.bluesky_chars))
            }
            Target::Mastodon => Some((
                weighted_length(&mastodon::post_text(message)),
                self.limits.mastodon_chars,
            )),
            Target::Twitter => Some((
                weighted_length(&twitter::post_text(message)),
                self.limits.twitter_chars,
            )),
            Target::LinkedIn if index == 0 => Some((
                linkedin::post_text(message).chars().count(),
                self.limits.linkedin_chars,
            )),
            Target::LinkedIn | Target::Feed => None,
        }
    }

    fn check_length(&self, target: Target, index: usize, message: &Message) -> Result<(), ApiError> {
        match self.measure(target, index, message) {
            Some((length, limit)) if length > limit => Err(ApiError::validation(format!(
                "message {} is {} characters, over the {} character limit for {}",
                index + 1,
                length,
                limit,
                target
            ))
            .for_target(target)),
            _ => Ok(()),
        }
    }
}

fn parse_targets(names: &[String]) -> Result<BTreeSet<Target>, ApiError> {
    let targets = names
        .iter()
        .map(|name| name.parse::<Target>().map_err(ApiError::validation))
        .collect::<Result<BTreeSet<_>, _>>()?;

    if targets.is_empty() {
        return Err(ApiError::validation("at least one target is required"));
    }
    Ok(targets)
}
