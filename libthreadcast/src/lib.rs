//! Threadcast - one thread, every platform
//!
//! This library validates a multi-message thread, publishes it concurrently
//! to Bluesky, Mastodon, X/Twitter, LinkedIn and a local syndication feed,
//! and reports every target's outcome in a single composite result.

pub mod broadcast;
pub mod config;
pub mod error;
pub mod events;
pub mod http;
pub mod images;
pub mod logging;
pub mod platforms;
pub mod richtext;
pub mod service;
pub mod store;
pub mod thread;
pub mod types;
pub mod validation;

// Re-export commonly used types
pub use broadcast::Broadcaster;
pub use config::Config;
pub use error::{ApiError, CompositeError, PlatformError, Result, ThreadcastError};
pub use service::ThreadcastService;
pub use thread::RetryPolicy;
pub use types::{
    CompositeResult, ImageRef, Message, PostRequest, PublishOptions, PublishedRef, Target,
    TargetResult,
};
pub use validation::Validator;
