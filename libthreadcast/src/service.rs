//! Service facade for Threadcast
//!
//! `ThreadcastService` wires the configured collaborators (document store,
//! HTTP client, image source) into the adapter set and the orchestrator,
//! and is the single entry point the CLI (or an HTTP layer) talks to.
//!
//! # Example
//!
//! ```no_run
//! use libthreadcast::{Config, Message, PostRequest, Target, ThreadcastService};
//!
//! # async fn example() -> libthreadcast::Result<()> {
//! let service = ThreadcastService::from_config(Config::load()?).await?;
//! let mut events = service.subscribe();
//!
//! let request = PostRequest::new(
//!     &[Target::Mastodon, Target::Bluesky],
//!     vec![Message::new("Hello"), Message::new("World")],
//! );
//!
//! match service.broadcast(&request).await {
//!     Ok(result) => println!("HTTP {}", result.status()),
//!     Err(rejected) => eprintln!("rejected: {}", rejected),
//! }
//! # while let Ok(event) = events.try_recv() { println!("{:?}", event); }
//! # Ok(())
//! # }
//! ```

use serde_json::Value;
use std::borrow::Cow;
use std::sync::Arc;
use tracing::info;

use crate::broadcast::Broadcaster;
use crate::config::Config;
use crate::error::{ApiError, PlatformError, Result};
use crate::events::{EventBus, EventReceiver};
use crate::http::ReqwestClient;
use crate::images::FsImageSource;
use crate::platforms::{create_adapters, feed, AdapterSet, Capabilities};
use crate::store::{DocumentStore, SqliteStore};
use crate::thread::RetryPolicy;
use crate::types::{CompositeResult, PostRequest};
use crate::validation::Validator;

pub struct ThreadcastService {
    config: Arc<Config>,
    store: Arc<dyn DocumentStore>,
    broadcaster: Broadcaster,
    event_bus: EventBus,
}

impl ThreadcastService {
    /// Load the default configuration and build the service from it
    pub async fn new() -> Result<Self> {
        Self::from_config(Config::load()?).await
    }

    /// Build the service from `config`
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrated, the
    /// HTTP client cannot be built, or a duration setting is invalid.
    /// Platform sections with unreadable credentials are skipped, not fatal.
    pub async fn from_config(config: Config) -> Result<Self> {
        let store: Arc<dyn DocumentStore> = Arc::new(SqliteStore::new(&config.database.path).await?);
        let caps = Capabilities {
            http: Arc::new(ReqwestClient::new(&config.http)?),
            store: Arc::clone(&store),
            images: Arc::new(FsImageSource::new().with_max_bytes(config.limits.max_image_bytes)),
        };

        let adapters = create_adapters(&config, &caps);
        info!(targets = ?adapters.targets(), "threadcast service ready");

        Self::with_adapters(config, store, adapters)
    }

    /// Build the service around an explicit adapter set
    pub fn with_adapters(
        config: Config,
        store: Arc<dyn DocumentStore>,
        adapters: AdapterSet,
    ) -> Result<Self> {
        let event_bus = EventBus::default();
        let broadcaster = Broadcaster::new(adapters, Validator::from_config(&config))
            .with_retry(RetryPolicy::from_config(&config.retry)?)
            .with_events(event_bus.clone());

        Ok(Self {
            config: Arc::new(config),
            store,
            broadcaster,
            event_bus,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn validator(&self) -> &Validator {
        self.broadcaster.validator()
    }

    /// Publish `request`, falling back to the configured default targets
    /// when it names none
    pub async fn broadcast(&self, request: &PostRequest) -> std::result::Result<CompositeResult, ApiError> {
        let request = self.with_default_targets(request);
        self.broadcaster.broadcast(&request).await
    }

    /// Run validation only
    pub fn validate(&self, request: &PostRequest) -> std::result::Result<(), ApiError> {
        self.validator()
            .validate(&self.with_default_targets(request))
            .map(|_| ())
    }

    fn with_default_targets<'a>(&self, request: &'a PostRequest) -> Cow<'a, PostRequest> {
        if request.targets.is_empty() && !self.config.defaults.targets.is_empty() {
            let mut request = request.clone();
            request.targets = self.config.defaults.targets.clone();
            Cow::Owned(request)
        } else {
            Cow::Borrowed(request)
        }
    }

    /// Receive progress events of every broadcast from now on
    pub fn subscribe(&self) -> EventReceiver {
        self.event_bus.subscribe()
    }

    /// The feed as a JSON Feed 1.1 document
    pub async fn feed_json(&self) -> Result<Value> {
        let feed_config = self
            .config
            .feed
            .as_ref()
            .ok_or_else(|| PlatformError::NotConfigured("feed".to_string()))?;
        feed::render_json_feed(self.store.as_ref(), feed_config).await
    }
}
