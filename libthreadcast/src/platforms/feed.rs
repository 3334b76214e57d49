//! Local syndication feed
//!
//! Publishing appends an entry to the document store instead of calling a
//! remote API. Within one broadcast each entry is keyed by a hash of the
//! request id, its parent and its content, so a repeated call for the same
//! message returns the entry that already exists. A later broadcast of the
//! same text is a new post and gets a new entry. Replies point at their
//! parent through `in_reply_to`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::config::FeedConfig;
use crate::error::{DbError, Result};
use crate::platforms::PlatformAdapter;
use crate::store::DocumentStore;
use crate::types::{ImageRef, Message, PublishOptions, PublishedRef, Target};

pub const ENTRY_COLLECTION: &str = "feed_entries";

const JSON_FEED_VERSION: &str = "https://jsonfeed.org/version/1.1";

/// One stored feed entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedEntry {
    pub id: String,
    pub url: String,
    pub content_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    pub date_published: DateTime<Utc>,
}

impl FeedEntry {
    fn published_ref(&self, reply_to: Option<&PublishedRef>) -> PublishedRef {
        PublishedRef::new(self.id.clone())
            .with_uri(self.url.clone())
            .with_url(self.url.clone())
            .in_thread_of(reply_to)
    }

    fn to_json_feed_item(&self) -> Value {
        let mut item = json!({
            "id": self.id,
            "url": self.url,
            "content_text": self.content_text,
            "date_published": self.date_published.to_rfc3339(),
        });
        if let Some(external_url) = &self.external_url {
            item["external_url"] = json!(external_url);
        }
        if let Some(language) = &self.language {
            item["language"] = json!(language);
        }
        if !self.images.is_empty() {
            item["attachments"] = self
                .images
                .iter()
                .map(|image| {
                    let mut attachment = json!({ "url": image.source });
                    if let Some(alt) = &image.alt_text {
                        attachment["title"] = json!(alt);
                    }
                    attachment
                })
                .collect();
        }
        if let Some(parent) = &self.in_reply_to {
            item["_threadcast"] = json!({ "in_reply_to": parent });
        }
        item
    }
}

/// Idempotency key of a message published below `parent_uri` by request `request_id`
pub fn idempotency_key(request_id: &str, parent_uri: Option<&str>, message: &Message) -> String {
    let mut hasher = Sha256::new();
    hasher.update(request_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(parent_uri.unwrap_or_default().as_bytes());
    hasher.update([0u8]);
    hasher.update(message.content.as_bytes());
    hasher.update([0u8]);
    hasher.update(message.link.as_deref().unwrap_or_default().as_bytes());
    for image in &message.images {
        hasher.update([0u8]);
        hasher.update(image.source.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

fn decode_entry(body: &Value) -> Result<FeedEntry> {
    serde_json::from_value(body.clone()).map_err(|e| DbError::Document(e).into())
}

/// Render every stored entry as a JSON Feed 1.1 document, newest first
pub async fn render_json_feed(store: &dyn DocumentStore, config: &FeedConfig) -> Result<Value> {
    let base_url = config.base_url.trim_end_matches('/');
    let mut entries = store
        .get_all(ENTRY_COLLECTION)
        .await?
        .iter()
        .map(|doc| decode_entry(&doc.body))
        .collect::<Result<Vec<_>>>()?;
    entries.sort_by(|a, b| b.date_published.cmp(&a.date_published));

    Ok(json!({
        "version": JSON_FEED_VERSION,
        "title": config.title,
        "home_page_url": base_url,
        "feed_url": format!("{}/feed.json", base_url),
        "items": entries.iter().map(FeedEntry::to_json_feed_item).collect::<Vec<_>>(),
    }))
}

pub struct FeedAdapter {
    store: Arc<dyn DocumentStore>,
    config: FeedConfig,
}

impl FeedAdapter {
    pub fn new(config: &FeedConfig, store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            config: config.clone(),
        }
    }

    pub async fn render_json_feed(&self) -> Result<Value> {
        render_json_feed(self.store.as_ref(), &self.config).await
    }
}

#[async_trait]
impl PlatformAdapter for FeedAdapter {
    fn target(&self) -> Target {
        Target::Feed
    }

    async fn publish(
        &self,
        message: &Message,
        reply_to: Option<&PublishedRef>,
        options: &PublishOptions,
    ) -> Result<PublishedRef> {
        let parent_uri = reply_to.and_then(|parent| parent.uri.as_deref());
        let id = Uuid::new_v4().to_string();

        // Without a request there is nothing to dedup against
        let key = match options.request_id.as_deref() {
            Some(request_id) => {
                let key = idempotency_key(request_id, parent_uri, message);
                if let Some(existing) = self
                    .store
                    .search_by_key(ENTRY_COLLECTION, &key)
                    .await?
                    .first()
                {
                    let entry = decode_entry(&existing.body)?;
                    debug!(entry_id = %entry.id, "feed entry already exists, reusing it");
                    return Ok(entry.published_ref(reply_to));
                }
                key
            }
            None => idempotency_key(&id, parent_uri, message),
        };

        let entry = FeedEntry {
            url: format!("{}/entries/{}", self.config.base_url.trim_end_matches('/'), id),
            id,
            content_text: message.content.clone(),
            external_url: message.link.clone(),
            images: message.images.clone(),
            in_reply_to: parent_uri.map(str::to_string),
            language: options.language.clone(),
            date_published: Utc::now(),
        };

        let body = serde_json::to_value(&entry).map_err(DbError::Document)?;
        self.store.create(ENTRY_COLLECTION, &key, body).await?;

        debug!(entry_id = %entry.id, in_reply_to = ?entry.in_reply_to, "feed entry appended");
        Ok(entry.published_ref(reply_to))
    }
}
