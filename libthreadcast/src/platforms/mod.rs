//! Platform adapters
//!
//! Every destination implements [`PlatformAdapter`]: publish one message,
//! optionally as a reply to an earlier post of the same thread, and return
//! a [`PublishedRef`] for it. Adapters own their authentication state and
//! media uploads; the orchestrator only sees the trait.
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//! use libthreadcast::platforms::{mock::MockAdapter, AdapterSet, PlatformAdapter};
//! use libthreadcast::{Message, PublishOptions, Target};
//!
//! # async fn example() -> libthreadcast::Result<()> {
//! let adapters = AdapterSet::new().with(Arc::new(MockAdapter::new(Target::Mastodon)));
//!
//! let mastodon = adapters.get(Target::Mastodon).expect("configured");
//! let root = mastodon
//!     .publish(&Message::new("Hello"), None, &PublishOptions::default())
//!     .await?;
//! assert_eq!(root.post_id, "mastodon-1");
//! assert!(adapters.get(Target::LinkedIn).is_none());
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::{read_secret_file, Config};
use crate::error::Result;
use crate::http::HttpClient;
use crate::images::ImageSource;
use crate::store::DocumentStore;
use crate::types::{Message, PublishOptions, PublishedRef, Target};

pub mod bluesky;
pub mod feed;
pub mod linkedin;
pub mod mastodon;
pub mod session;
pub mod twitter;

// Mock adapter is available for all builds (not just tests) to support integration tests
pub mod mock;

/// One publish destination
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    /// The target this adapter publishes to
    fn target(&self) -> Target;

    /// Publish one message
    ///
    /// `reply_to` is the result of the previous message of the same thread,
    /// or `None` for the first message. Implementations chain the new post
    /// to it in whatever way the platform supports (reply, comment, entry
    /// reference) and return a reference whose `root` points at the
    /// thread's first post.
    ///
    /// # Errors
    ///
    /// Returns a `PlatformError` for anything that went wrong talking to the
    /// platform; nothing is retried here.
    async fn publish(
        &self,
        message: &Message,
        reply_to: Option<&PublishedRef>,
        options: &PublishOptions,
    ) -> Result<PublishedRef>;
}

/// Configured adapters, keyed by target
///
/// A target without an entry is "not configured"; the orchestrator reports
/// it as such instead of starting a task for it.
#[derive(Clone, Default)]
pub struct AdapterSet {
    adapters: BTreeMap<Target, Arc<dyn PlatformAdapter>>,
}

impl AdapterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an adapter, replacing any existing one for the same target
    pub fn insert(&mut self, adapter: Arc<dyn PlatformAdapter>) {
        self.adapters.insert(adapter.target(), adapter);
    }

    pub fn with(mut self, adapter: Arc<dyn PlatformAdapter>) -> Self {
        self.insert(adapter);
        self
    }

    pub fn get(&self, target: Target) -> Option<Arc<dyn PlatformAdapter>> {
        self.adapters.get(&target).cloned()
    }

    pub fn targets(&self) -> Vec<Target> {
        self.adapters.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

/// Collaborators shared by every adapter
#[derive(Clone)]
pub struct Capabilities {
    pub http: Arc<dyn HttpClient>,
    pub store: Arc<dyn DocumentStore>,
    pub images: Arc<dyn ImageSource>,
}

/// Create adapters for every configured section
///
/// A section whose secret file cannot be read is logged and left out, so
/// requests for that target fail as "not configured" instead of taking the
/// whole service down.
pub fn create_adapters(config: &Config, caps: &Capabilities) -> AdapterSet {
    let mut adapters = AdapterSet::new();

    if let Some(bluesky_config) = &config.bluesky {
        match read_secret_file(&bluesky_config.app_password_file) {
            Ok(app_password) => adapters.insert(Arc::new(bluesky::BlueskyAdapter::new(
                bluesky_config,
                app_password,
                Arc::clone(&caps.http),
                Arc::clone(&caps.images),
            ))),
            Err(e) => skip(Target::Bluesky, &e),
        }
    }

    if let Some(mastodon_config) = &config.mastodon {
        match read_secret_file(&mastodon_config.token_file) {
            Ok(token) => adapters.insert(Arc::new(mastodon::MastodonAdapter::new(
                mastodon_config,
                token,
                Arc::clone(&caps.http),
                Arc::clone(&caps.images),
            ))),
            Err(e) => skip(Target::Mastodon, &e),
        }
    }

    if let Some(twitter_config) = &config.twitter {
        let secrets = read_secret_file(&twitter_config.refresh_token_file).and_then(|refresh| {
            let client_secret = twitter_config
                .client_secret_file
                .as_deref()
                .map(read_secret_file)
                .transpose()?;
            Ok((refresh, client_secret))
        });
        match secrets {
            Ok((refresh_token, client_secret)) => {
                adapters.insert(Arc::new(twitter::TwitterAdapter::new(
                    twitter_config,
                    refresh_token,
                    client_secret,
                    Arc::clone(&caps.http),
                    Arc::clone(&caps.images),
                    Arc::clone(&caps.store),
                )))
            }
            Err(e) => skip(Target::Twitter, &e),
        }
    }

    if let Some(linkedin_config) = &config.linkedin {
        match read_secret_file(&linkedin_config.token_file) {
            Ok(token) => adapters.insert(Arc::new(linkedin::LinkedInAdapter::new(
                linkedin_config,
                token,
                Arc::clone(&caps.http),
                Arc::clone(&caps.images),
            ))),
            Err(e) => skip(Target::LinkedIn, &e),
        }
    }

    if let Some(feed_config) = &config.feed {
        adapters.insert(Arc::new(feed::FeedAdapter::new(
            feed_config,
            Arc::clone(&caps.store),
        )));
    }

    debug!(targets = ?adapters.targets(), "adapters created");
    adapters
}

fn skip(target: Target, error: &crate::error::ThreadcastError) {
    warn!(target_name = %target, error = %error, "credentials unavailable, target left unconfigured");
}
