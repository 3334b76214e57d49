//! X/Twitter adapter (API v2, OAuth 2.0 user context)
//!
//! Access tokens are short-lived and minted from a refresh token. X rotates
//! the refresh token on every use, so the new one is appended to the
//! document store (`oauth_tokens` / `twitter`) before the access token is
//! handed out; the newest stored token wins over the configured file on the
//! next start.

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::TwitterConfig;
use crate::error::{PlatformError, Result};
use crate::http::{FilePart, HttpClient, HttpRequest, HttpResponse, MultipartForm};
use crate::images::ImageSource;
use crate::platforms::session::SessionCache;
use crate::platforms::PlatformAdapter;
use crate::store::DocumentStore;
use crate::types::{Message, PublishOptions, PublishedRef, Target};

pub const TOKEN_COLLECTION: &str = "oauth_tokens";
pub const TOKEN_KEY: &str = "twitter";

/// Tokens this close to expiry are refreshed before use
const EXPIRY_MARGIN_SECS: i64 = 60;

#[derive(Debug)]
struct AccessToken {
    access_token: String,
    refresh_token: String,
    expires_at: Option<DateTime<Utc>>,
}

impl AccessToken {
    fn is_fresh(&self) -> bool {
        self.expires_at
            .map_or(true, |at| at - ChronoDuration::seconds(EXPIRY_MARGIN_SECS) > Utc::now())
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct DataEnvelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct Id {
    id: String,
}

/// Tweet text: content with the link appended when it is not already there
pub fn post_text(message: &Message) -> String {
    message.text_with_link()
}

pub struct TwitterAdapter {
    http: Arc<dyn HttpClient>,
    images: Arc<dyn ImageSource>,
    store: Arc<dyn DocumentStore>,
    api_base: String,
    client_id: String,
    client_secret: Option<SecretString>,
    configured_refresh_token: SecretString,
    session: SessionCache<AccessToken>,
}

impl TwitterAdapter {
    pub fn new(
        config: &TwitterConfig,
        refresh_token: SecretString,
        client_secret: Option<SecretString>,
        http: Arc<dyn HttpClient>,
        images: Arc<dyn ImageSource>,
        store: Arc<dyn DocumentStore>,
    ) -> Self {
        Self {
            http,
            images,
            store,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            client_id: config.client_id.clone(),
            client_secret,
            configured_refresh_token: refresh_token,
            session: SessionCache::new(),
        }
    }

    /// Latest refresh token: previous session, then store, then config file
    async fn current_refresh_token(&self, previous: Option<&AccessToken>) -> Result<String> {
        if let Some(previous) = previous {
            return Ok(previous.refresh_token.clone());
        }
        let stored = self.store.search_by_key(TOKEN_COLLECTION, TOKEN_KEY).await?;
        let newest = stored
            .iter()
            .rev()
            .find_map(|doc| doc.body.get("refresh_token").and_then(|t| t.as_str()));
        Ok(newest
            .map(str::to_string)
            .unwrap_or_else(|| self.configured_refresh_token.expose_secret().to_string()))
    }

    async fn refresh(&self, previous: Option<Arc<AccessToken>>) -> Result<AccessToken> {
        let refresh_token = self.current_refresh_token(previous.as_deref()).await?;

        let mut request = HttpRequest::post(format!("{}/2/oauth2/token", self.api_base)).form(vec![
            ("grant_type".to_string(), "refresh_token".to_string()),
            ("refresh_token".to_string(), refresh_token.clone()),
            ("client_id".to_string(), self.client_id.clone()),
        ]);
        if let Some(secret) = &self.client_secret {
            let credentials = base64::engine::general_purpose::STANDARD
                .encode(format!("{}:{}", self.client_id, secret.expose_secret()));
            request = request.header("Authorization", format!("Basic {}", credentials));
        }

        let response = self
            .http
            .send(request)
            .await?
            .error_for_status("X token refresh")?;
        let token: TokenResponse = response.json("X token refresh")?;

        let rotated = token.refresh_token.unwrap_or(refresh_token);
        self.store
            .create(
                TOKEN_COLLECTION,
                TOKEN_KEY,
                json!({
                    "refresh_token": rotated,
                    "refreshed_at": Utc::now().to_rfc3339(),
                }),
            )
            .await?;
        info!(expires_in = ?token.expires_in, "X access token refreshed");

        Ok(AccessToken {
            access_token: token.access_token,
            refresh_token: rotated,
            expires_at: token.expires_in.map(|secs| Utc::now() + ChronoDuration::seconds(secs)),
        })
    }

    async fn access_token(&self) -> Result<Arc<AccessToken>> {
        self.session
            .get_or_refresh(AccessToken::is_fresh, |previous| self.refresh(previous))
            .await
    }

    /// Send with the current bearer; on 401 drop the token and retry once
    async fn send_authorized(
        &self,
        context: &str,
        build: impl Fn(&str) -> HttpRequest + Send + Sync,
    ) -> Result<HttpResponse> {
        let token = self.access_token().await?;
        let response = self.http.send(build(&token.access_token)).await?;
        if response.status != 401 {
            return response.error_for_status(context);
        }

        warn!("X rejected the access token, refreshing and retrying once");
        self.session.invalidate(&token).await;
        let token = self.access_token().await?;
        self.http
            .send(build(&token.access_token))
            .await?
            .error_for_status(context)
    }

    async fn upload_media(&self, message: &Message) -> Result<Vec<String>> {
        let mut media_ids = Vec::with_capacity(message.images.len());
        for (index, image_ref) in message.images.iter().enumerate() {
            let image = self.images.read_image(image_ref).await?;

            let response = self
                .send_authorized("X media upload", |token| {
                    HttpRequest::post(format!("{}/2/media/upload", self.api_base))
                        .bearer(token)
                        .multipart(
                            MultipartForm::default()
                                .text("media_category", "tweet_image")
                                .file(FilePart {
                                    field: "media".to_string(),
                                    file_name: image.file_name(index),
                                    mime: image.mime.as_str().to_string(),
                                    data: image.bytes.clone(),
                                }),
                        )
                })
                .await?;
            let media: DataEnvelope<Id> = response.json("X media upload")?;

            if let Some(alt) = image.alt_text.as_deref().filter(|a| !a.is_empty()) {
                self.send_authorized("X media metadata", |token| {
                    HttpRequest::post(format!("{}/2/media/metadata", self.api_base))
                        .bearer(token)
                        .json(json!({
                            "id": media.data.id,
                            "metadata": { "alt_text": { "text": alt } },
                        }))
                })
                .await?;
            }

            debug!(media_id = %media.data.id, "X media uploaded");
            media_ids.push(media.data.id);
        }
        Ok(media_ids)
    }
}

#[async_trait]
impl PlatformAdapter for TwitterAdapter {
    fn target(&self) -> Target {
        Target::Twitter
    }

    async fn publish(
        &self,
        message: &Message,
        reply_to: Option<&PublishedRef>,
        _options: &PublishOptions,
    ) -> Result<PublishedRef> {
        let media_ids = self.upload_media(message).await?;

        let mut body = json!({ "text": post_text(message) });
        if !media_ids.is_empty() {
            body["media"] = json!({ "media_ids": media_ids });
        }
        if let Some(parent) = reply_to {
            body["reply"] = json!({ "in_reply_to_tweet_id": parent.post_id });
        }

        let response = self
            .send_authorized("X", |token| {
                HttpRequest::post(format!("{}/2/tweets", self.api_base))
                    .bearer(token)
                    .json(body.clone())
            })
            .await?;
        let tweet: DataEnvelope<Id> = response.json("X")?;
        let id = tweet.data.id;
        if id.is_empty() {
            return Err(PlatformError::MalformedResponse("X returned an empty tweet id".into()).into());
        }

        debug!(tweet_id = %id, "tweet created");
        Ok(PublishedRef::new(id.clone())
            .with_url(format!("https://x.com/i/web/status/{}", id))
            .in_thread_of(reply_to))
    }
}
