//! Mastodon adapter (REST API with a user access token)

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

use crate::config::MastodonConfig;
use crate::error::Result;
use crate::http::{FilePart, HttpClient, HttpRequest, MultipartForm};
use crate::images::ImageSource;
use crate::platforms::PlatformAdapter;
use crate::types::{Message, PublishOptions, PublishedRef, Target};

#[derive(Debug, Deserialize)]
struct MediaAttachment {
    id: String,
}

#[derive(Debug, Deserialize)]
struct Status {
    id: String,
    uri: String,
    #[serde(default)]
    url: Option<String>,
}

/// Status text: content with the link appended when it is not already there
pub fn post_text(message: &Message) -> String {
    message.text_with_link()
}

pub struct MastodonAdapter {
    http: Arc<dyn HttpClient>,
    images: Arc<dyn ImageSource>,
    instance_url: String,
    token: SecretString,
    visibility: String,
}

impl MastodonAdapter {
    pub fn new(
        config: &MastodonConfig,
        token: SecretString,
        http: Arc<dyn HttpClient>,
        images: Arc<dyn ImageSource>,
    ) -> Self {
        Self {
            http,
            images,
            instance_url: config.instance_url(),
            token,
            visibility: config.visibility.clone(),
        }
    }

    async fn upload_media(&self, message: &Message) -> Result<Vec<String>> {
        let mut media_ids = Vec::with_capacity(message.images.len());
        for (index, image_ref) in message.images.iter().enumerate() {
            let image = self.images.read_image(image_ref).await?;

            let mut form = MultipartForm::default().file(FilePart {
                field: "file".to_string(),
                file_name: image.file_name(index),
                mime: image.mime.as_str().to_string(),
                data: image.bytes.clone(),
            });
            if let Some(alt) = &image.alt_text {
                form = form.text("description", alt.clone());
            }

            // 202 means the upload is accepted and still processing; the id
            // is already usable in a status
            let response = self
                .http
                .send(
                    HttpRequest::post(format!("{}/api/v2/media", self.instance_url))
                        .bearer(self.token.expose_secret())
                        .multipart(form),
                )
                .await?
                .error_for_status("Mastodon media upload")?;
            let media: MediaAttachment = response.json("Mastodon media upload")?;
            debug!(media_id = %media.id, "Mastodon media uploaded");
            media_ids.push(media.id);
        }
        Ok(media_ids)
    }
}

#[async_trait]
impl PlatformAdapter for MastodonAdapter {
    fn target(&self) -> Target {
        Target::Mastodon
    }

    async fn publish(
        &self,
        message: &Message,
        reply_to: Option<&PublishedRef>,
        options: &PublishOptions,
    ) -> Result<PublishedRef> {
        let media_ids = self.upload_media(message).await?;

        let mut body = json!({
            "status": post_text(message),
            "visibility": self.visibility,
        });
        if !media_ids.is_empty() {
            body["media_ids"] = json!(media_ids);
        }
        if let Some(parent) = reply_to {
            body["in_reply_to_id"] = json!(parent.post_id);
        }
        if let Some(language) = &options.language {
            body["language"] = json!(language);
        }

        let response = self
            .http
            .send(
                HttpRequest::post(format!("{}/api/v1/statuses", self.instance_url))
                    .bearer(self.token.expose_secret())
                    .json(body),
            )
            .await?
            .error_for_status("Mastodon")?;
        let status: Status = response.json("Mastodon")?;
        debug!(status_id = %status.id, "Mastodon status created");

        let mut published = PublishedRef::new(status.id)
            .with_uri(status.uri)
            .in_thread_of(reply_to);
        if let Some(url) = status.url {
            published = published.with_url(url);
        }
        Ok(published)
    }
}
