//! Thread chaining
//!
//! Publishes the messages of a thread to one adapter strictly in order.
//! Each message after the first replies to the reference returned for the
//! message before it. The first failure ends the thread; later messages are
//! never attempted.

use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::error::{ApiError, Result, ThreadcastError};
use crate::platforms::PlatformAdapter;
use crate::types::{Message, PublishOptions, PublishedRef, TargetResult};

/// Retry policy for errors the platform provably did not act on
///
/// Only refused connections and rate limits are retried. Timeouts and other
/// network errors are not: the post may already exist. Attempt `n` waits
/// `base_delay * 2^(n-1)` before the next one; `max_attempts = 1` disables
/// retry entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Result<Self> {
        Ok(Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.base_delay()?,
        })
    }

    /// Delay after failed attempt `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

fn is_transient(error: &ThreadcastError) -> bool {
    error.as_platform().is_some_and(|e| e.is_transient())
}

/// Publish one message, retrying refused connections and rate limits per `retry`
pub async fn publish_with_retry(
    adapter: &dyn PlatformAdapter,
    message: &Message,
    reply_to: Option<&PublishedRef>,
    options: &PublishOptions,
    retry: &RetryPolicy,
) -> Result<PublishedRef> {
    let target = adapter.target();
    let mut attempt = 1;

    loop {
        match adapter.publish(message, reply_to, options).await {
            Ok(published) => return Ok(published),
            Err(e) if is_transient(&e) && attempt < retry.max_attempts => {
                let delay = retry.delay_for(attempt);
                warn!(
                    target_name = %target,
                    attempt,
                    max_attempts = retry.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient error, retrying"
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Publish `messages` as one thread on `adapter`
///
/// `on_published` is called with the index and reference of every message
/// that made it out, in order. Returns every reference on success, or the
/// error of the first message that failed.
pub async fn publish_thread<F>(
    messages: &[Message],
    adapter: &dyn PlatformAdapter,
    options: &PublishOptions,
    retry: &RetryPolicy,
    mut on_published: F,
) -> TargetResult
where
    F: FnMut(usize, &PublishedRef) + Send,
{
    let target = adapter.target();
    let mut published: Vec<PublishedRef> = Vec::with_capacity(messages.len());

    for (index, message) in messages.iter().enumerate() {
        let outcome = publish_with_retry(adapter, message, published.last(), options, retry).await;
        match outcome {
            Ok(post) => {
                debug!(target_name = %target, index, post_id = %post.post_id, "message published");
                on_published(index, &post);
                published.push(post);
            }
            Err(e) => {
                warn!(
                    target_name = %target,
                    index,
                    published = published.len(),
                    error = %e,
                    "thread stopped at failed message"
                );
                return TargetResult::Failure(ApiError::from_error(target, &e));
            }
        }
    }

    TargetResult::Success(published)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platforms::mock::{MockAdapter, MockBehavior};
    use crate::types::Target;

    fn thread(n: usize) -> Vec<Message> {
        (1..=n).map(|i| Message::new(format!("message {}", i))).collect()
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_each_message_replies_to_the_previous_one() {
        let mock = MockAdapter::new(Target::Mastodon);
        let result = publish_thread(
            &thread(3),
            &mock,
            &PublishOptions::default(),
            &RetryPolicy::none(),
            |_, _| {},
        )
        .await;

        let posts = result.posts().unwrap().to_vec();
        let ids: Vec<&str> = posts.iter().map(|p| p.post_id.as_str()).collect();
        assert_eq!(ids, vec!["mastodon-1", "mastodon-2", "mastodon-3"]);

        let calls = mock.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].reply_to, None);
        assert_eq!(calls[1].reply_to.as_ref(), Some(&posts[0]));
        // The immediately preceding post, not the root
        assert_eq!(calls[2].reply_to.as_ref(), Some(&posts[1]));
        assert_eq!(posts[2].thread_root().post_id, "mastodon-1");
    }

    #[tokio::test]
    async fn test_failure_stops_the_thread() {
        let mock = MockAdapter::failing_from(Target::Twitter, 2);
        let result = publish_thread(
            &thread(3),
            &mock,
            &PublishOptions::default(),
            &fast_retry(),
            |_, _| {},
        )
        .await;

        let error = result.error().unwrap();
        assert_eq!(error.target, Some(Target::Twitter));
        assert_eq!(error.status, 500);
        // Message 3 is never attempted and permanent errors are not retried
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let mock = MockAdapter::with_transient_failures(Target::Bluesky, 2);
        let result = publish_thread(
            &thread(2),
            &mock,
            &PublishOptions::default(),
            &fast_retry(),
            |_, _| {},
        )
        .await;

        assert!(result.is_success());
        assert_eq!(mock.call_count(), 4);
        let posts = result.posts().unwrap();
        assert_eq!(posts[1].thread_root().post_id, "bluesky-1");
    }

    #[tokio::test]
    async fn test_retries_give_up_after_max_attempts() {
        let mock = MockAdapter::with_behavior(
            Target::Bluesky,
            MockBehavior {
                transient_failures: 10,
                ..Default::default()
            },
        );
        let result = publish_thread(
            &thread(1),
            &mock,
            &PublishOptions::default(),
            &fast_retry(),
            |_, _| {},
        )
        .await;

        let error = result.error().unwrap();
        assert_eq!(error.status, 500);
        assert!(error.message.contains("error communicating with platform"));
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test]
    async fn test_timeout_is_not_retried() {
        let mock = MockAdapter::with_behavior(
            Target::Mastodon,
            MockBehavior {
                timeout_at: Some(1),
                ..Default::default()
            },
        );
        let result = publish_thread(
            &thread(2),
            &mock,
            &PublishOptions::default(),
            &fast_retry(),
            |_, _| {},
        )
        .await;

        let error = result.error().unwrap();
        assert_eq!(error.status, 500);
        assert!(error.message.contains("error communicating with platform"));
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn test_no_retry_policy_makes_one_attempt() {
        let mock = MockAdapter::with_transient_failures(Target::Feed, 1);
        let result = publish_thread(
            &thread(1),
            &mock,
            &PublishOptions::default(),
            &RetryPolicy::none(),
            |_, _| {},
        )
        .await;

        assert!(!result.is_success());
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn test_on_published_sees_every_message_in_order() {
        let mock = MockAdapter::new(Target::Feed);
        let mut seen = Vec::new();
        publish_thread(
            &thread(3),
            &mock,
            &PublishOptions::default(),
            &RetryPolicy::none(),
            |index, post| seen.push((index, post.post_id.clone())),
        )
        .await;

        assert_eq!(
            seen,
            vec![
                (0, "feed-1".to_string()),
                (1, "feed-2".to_string()),
                (2, "feed-3".to_string())
            ]
        );
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_secs(1),
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
    }

    #[test]
    fn test_from_config_never_allows_zero_attempts() {
        let config = RetryConfig {
            max_attempts: 0,
            base_delay: "250ms".to_string(),
        };
        let policy = RetryPolicy::from_config(&config).unwrap();
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.base_delay, Duration::from_millis(250));
    }
}
