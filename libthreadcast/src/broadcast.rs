//! Broadcast orchestration
//!
//! Validates a request, then runs one thread per requested target
//! concurrently and merges the outcomes into a [`CompositeResult`].
//!
//! Every target runs in its own `tokio` task. Errors, panics and
//! cancellation are all caught at the task boundary and become that
//! target's failure; a target can never take its siblings down with it.

use futures::future::join_all;
use std::sync::Arc;
use tokio::task::JoinError;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::ApiError;
use crate::events::{Event, EventBus};
use crate::platforms::AdapterSet;
use crate::thread::{publish_thread, RetryPolicy};
use crate::types::{CompositeResult, Message, PostRequest, PublishOptions, Target, TargetResult};
use crate::validation::Validator;

pub struct Broadcaster {
    adapters: AdapterSet,
    validator: Validator,
    retry: RetryPolicy,
    events: EventBus,
}

impl Broadcaster {
    pub fn new(adapters: AdapterSet, validator: Validator) -> Self {
        Self {
            adapters,
            validator,
            retry: RetryPolicy::default(),
            events: EventBus::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Emit progress on `events` instead of a private bus
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn validator(&self) -> &Validator {
        &self.validator
    }

    pub fn adapters(&self) -> &AdapterSet {
        &self.adapters
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Publish `request` to every requested target
    ///
    /// # Errors
    ///
    /// Returns the validation error when the request is rejected up front;
    /// no adapter has been called in that case. Per-target failures are
    /// reported inside the [`CompositeResult`] instead.
    pub async fn broadcast(&self, request: &PostRequest) -> Result<CompositeResult, ApiError> {
        let targets = self.validator.validate(request)?;

        let request_id = Uuid::new_v4().to_string();
        info!(
            request_id = %request_id,
            targets = ?targets,
            messages = request.messages.len(),
            "broadcast started"
        );
        self.events.emit(Event::BroadcastStarted {
            request_id: request_id.clone(),
            targets: targets.iter().copied().collect(),
        });

        let messages: Arc<Vec<Message>> = Arc::new(request.messages.clone());
        let options = PublishOptions {
            language: request.language.clone(),
            request_id: Some(request_id.clone()),
        };

        let mut result = CompositeResult::default();
        let mut running = Vec::new();

        for target in targets {
            match self.adapters.get(target) {
                Some(adapter) => {
                    let messages = Arc::clone(&messages);
                    let options = options.clone();
                    let retry = self.retry;
                    let events = self.events.clone();
                    let request_id = request_id.clone();

                    let handle = tokio::spawn(async move {
                        info!(request_id = %request_id, target_name = %target, "publishing thread");
                        publish_thread(
                            &messages,
                            adapter.as_ref(),
                            &options,
                            &retry,
                            |index, post| {
                                events.emit(Event::MessagePublished {
                                    request_id: request_id.clone(),
                                    target,
                                    index,
                                    post_id: post.post_id.clone(),
                                })
                            },
                        )
                        .await
                    });
                    running.push((target, handle));
                }
                None => {
                    warn!(request_id = %request_id, target_name = %target, "target not configured");
                    result
                        .outcomes
                        .insert(target, TargetResult::Failure(ApiError::not_configured(target)));
                }
            }
        }

        let (started, handles): (Vec<Target>, Vec<_>) = running.into_iter().unzip();
        let joined = join_all(handles).await;

        for (target, outcome) in started.into_iter().zip(joined) {
            let outcome = outcome.unwrap_or_else(|e| aborted(&request_id, target, e));
            result.outcomes.insert(target, outcome);
        }

        for (target, outcome) in &result.outcomes {
            self.events.emit(match outcome {
                TargetResult::Success(posts) => Event::TargetCompleted {
                    request_id: request_id.clone(),
                    target: *target,
                    post_ids: posts.iter().map(|p| p.post_id.clone()).collect(),
                },
                TargetResult::Failure(error) => Event::TargetFailed {
                    request_id: request_id.clone(),
                    target: *target,
                    error: error.clone(),
                },
            });
        }

        let status = result.status();
        info!(
            request_id = %request_id,
            status,
            failed = result.failures().count(),
            "broadcast finished"
        );
        self.events.emit(Event::BroadcastFinished { request_id, status });

        Ok(result)
    }
}

fn aborted(request_id: &str, target: Target, join_error: JoinError) -> TargetResult {
    let reason = if join_error.is_panic() {
        "panicked"
    } else {
        "cancelled"
    };
    error!(
        request_id = %request_id,
        target_name = %target,
        error = %join_error,
        "publishing task {}",
        reason
    );
    TargetResult::Failure(ApiError::task_aborted(target, reason))
}
