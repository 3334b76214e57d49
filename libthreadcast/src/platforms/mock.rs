//! Mock adapter for testing
//!
//! Echoes `<target>-<n>` post ids and records every call so tests can check
//! what the orchestrator and thread chainer sent. Failures, transient
//! errors, panics and latency can be scripted per instance.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

use crate::error::{PlatformError, Result};
use crate::platforms::PlatformAdapter;
use crate::types::{Message, PublishOptions, PublishedRef, Target};

/// Scripted behavior; call numbers are 1-based and count every attempt
#[derive(Debug, Clone, Default)]
pub struct MockBehavior {
    /// Fail with a permanent request error from this call on
    pub fail_from: Option<usize>,
    /// Status of the permanent failure (defaults to 500)
    pub fail_status: Option<u16>,
    /// Refuse the connection this many times before behaving normally
    pub transient_failures: usize,
    /// Time out on this call after the post was already created
    pub timeout_at: Option<usize>,
    /// Panic on this call
    pub panic_at: Option<usize>,
    /// Latency added to every call
    pub delay: Duration,
}

/// One recorded `publish` call
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub content: String,
    pub reply_to: Option<PublishedRef>,
    pub language: Option<String>,
    pub request_id: Option<String>,
}

pub struct MockAdapter {
    target: Target,
    behavior: MockBehavior,
    attempts: AtomicUsize,
    published: AtomicUsize,
    transient_left: AtomicUsize,
    calls: Arc<Mutex<Vec<RecordedCall>>>,
}

impl MockAdapter {
    pub fn with_behavior(target: Target, behavior: MockBehavior) -> Self {
        Self {
            target,
            transient_left: AtomicUsize::new(behavior.transient_failures),
            behavior,
            attempts: AtomicUsize::new(0),
            published: AtomicUsize::new(0),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Always succeeds
    pub fn new(target: Target) -> Self {
        Self::with_behavior(target, MockBehavior::default())
    }

    /// Succeeds until call `n`, then fails every call
    pub fn failing_from(target: Target, n: usize) -> Self {
        Self::with_behavior(
            target,
            MockBehavior {
                fail_from: Some(n),
                ..Default::default()
            },
        )
    }

    /// Fails every call
    pub fn always_failing(target: Target) -> Self {
        Self::failing_from(target, 1)
    }

    /// Connection failures for the first `n` calls
    pub fn with_transient_failures(target: Target, n: usize) -> Self {
        Self::with_behavior(
            target,
            MockBehavior {
                transient_failures: n,
                ..Default::default()
            },
        )
    }

    /// Panics on the first call
    pub fn panicking(target: Target) -> Self {
        Self::with_behavior(
            target,
            MockBehavior {
                panic_at: Some(1),
                ..Default::default()
            },
        )
    }

    pub fn with_delay(target: Target, delay: Duration) -> Self {
        Self::with_behavior(
            target,
            MockBehavior {
                delay,
                ..Default::default()
            },
        )
    }

    /// Every call made so far, in order
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PlatformAdapter for MockAdapter {
    fn target(&self) -> Target {
        self.target
    }

    async fn publish(
        &self,
        message: &Message,
        reply_to: Option<&PublishedRef>,
        options: &PublishOptions,
    ) -> Result<PublishedRef> {
        if !self.behavior.delay.is_zero() {
            sleep(self.behavior.delay).await;
        }

        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(RecordedCall {
                content: message.content.clone(),
                reply_to: reply_to.cloned(),
                language: options.language.clone(),
                request_id: options.request_id.clone(),
            });
        }

        if self.behavior.panic_at == Some(attempt) {
            panic!("{} mock panicked on call {}", self.target, attempt);
        }

        let transient = self
            .transient_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if transient {
            return Err(PlatformError::Connect(format!(
                "{} mock connection refused on call {}",
                self.target, attempt
            ))
            .into());
        }

        if self.behavior.timeout_at == Some(attempt) {
            self.published.fetch_add(1, Ordering::SeqCst);
            return Err(PlatformError::Network(format!(
                "{} mock timed out on call {}",
                self.target, attempt
            ))
            .into());
        }

        if self.behavior.fail_from.is_some_and(|n| attempt >= n) {
            let status = self.behavior.fail_status.unwrap_or(500);
            return Err(PlatformError::Request {
                status,
                message: format!("{} mock rejected call {}", self.target, attempt),
                body: Some(format!("{{\"error\":\"mock failure {}\"}}", attempt)),
            }
            .into());
        }

        let n = self.published.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(PublishedRef::new(format!("{}-{}", self.target, n))
            .with_uri(format!("mock://{}/{}", self.target, n))
            .in_thread_of(reply_to))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echoes_numbered_ids_and_records_calls() {
        let mock = MockAdapter::new(Target::Bluesky);
        let options = PublishOptions {
            language: Some("en".to_string()),
            ..Default::default()
        };

        let first = mock.publish(&Message::new("one"), None, &options).await.unwrap();
        let second = mock
            .publish(&Message::new("two"), Some(&first), &options)
            .await
            .unwrap();

        assert_eq!(first.post_id, "bluesky-1");
        assert_eq!(second.post_id, "bluesky-2");
        assert_eq!(second.thread_root().post_id, "bluesky-1");

        let calls = mock.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].reply_to, None);
        assert_eq!(calls[1].reply_to.as_ref(), Some(&first));
        assert_eq!(calls[1].language.as_deref(), Some("en"));
    }

    #[tokio::test]
    async fn test_failing_from() {
        let mock = MockAdapter::failing_from(Target::Twitter, 2);
        let options = PublishOptions::default();

        assert!(mock.publish(&Message::new("a"), None, &options).await.is_ok());
        let err = mock.publish(&Message::new("b"), None, &options).await.unwrap_err();
        assert_eq!(err.as_platform().map(|e| e.status_hint()), Some(500));
        assert!(mock.publish(&Message::new("c"), None, &options).await.is_err());
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test]
    async fn test_transient_failures_then_success() {
        let mock = MockAdapter::with_transient_failures(Target::Mastodon, 2);
        let options = PublishOptions::default();

        for _ in 0..2 {
            let err = mock.publish(&Message::new("x"), None, &options).await.unwrap_err();
            assert!(err.as_platform().unwrap().is_transient());
        }
        let ok = mock.publish(&Message::new("x"), None, &options).await.unwrap();
        assert_eq!(ok.post_id, "mastodon-1");
    }
}
