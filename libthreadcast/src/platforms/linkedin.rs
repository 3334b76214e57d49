//! LinkedIn adapter (Posts and Social Actions REST APIs)
//!
//! LinkedIn has no reply posts. The first message of a thread becomes a
//! post; a follow-up becomes a comment on that post, always addressed to
//! the thread root.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

use crate::config::LinkedInConfig;
use crate::error::{PlatformError, Result};
use crate::http::{HttpClient, HttpRequest, HttpResponse};
use crate::images::{ImageSource, LoadedImage};
use crate::platforms::PlatformAdapter;
use crate::types::{Message, PublishOptions, PublishedRef, Target};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadTicket {
    upload_url: String,
    image: String,
}

#[derive(Debug, Deserialize)]
struct InitializeUploadResponse {
    value: UploadTicket,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatedComment {
    #[serde(default)]
    comment_urn: Option<String>,
    #[serde(default)]
    id: Option<String>,
}

/// Commentary text of a root post
///
/// Without images the link becomes the article attachment; with images it
/// is appended to the text.
pub fn post_text(message: &Message) -> String {
    if message.images.is_empty() {
        message.content.clone()
    } else {
        message.text_with_link()
    }
}

/// Text of a follow-up comment; comments carry no article, so the link is
/// always appended
pub fn comment_text(message: &Message) -> String {
    message.text_with_link()
}

/// Escape characters reserved by LinkedIn's "little text" commentary format
fn escape_little_text(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(
            c,
            '\\' | '|' | '{' | '}' | '@' | '[' | ']' | '(' | ')' | '<' | '>' | '#' | '*' | '_' | '~'
        ) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn encode_urn(urn: &str) -> String {
    url::form_urlencoded::byte_serialize(urn.as_bytes()).collect()
}

pub struct LinkedInAdapter {
    http: Arc<dyn HttpClient>,
    images: Arc<dyn ImageSource>,
    api_base: String,
    author_urn: String,
    token: SecretString,
    api_version: String,
}

impl LinkedInAdapter {
    pub fn new(
        config: &LinkedInConfig,
        token: SecretString,
        http: Arc<dyn HttpClient>,
        images: Arc<dyn ImageSource>,
    ) -> Self {
        Self {
            http,
            images,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            author_urn: config.author_urn.clone(),
            token,
            api_version: config.api_version.clone(),
        }
    }

    fn request(&self, request: HttpRequest) -> HttpRequest {
        request
            .bearer(self.token.expose_secret())
            .header("LinkedIn-Version", self.api_version.as_str())
            .header("X-Restli-Protocol-Version", "2.0.0")
    }

    async fn send(&self, context: &str, request: HttpRequest) -> Result<HttpResponse> {
        self.http
            .send(self.request(request))
            .await?
            .error_for_status(context)
    }

    /// Upload one image, returning its `urn:li:image:` URN
    async fn upload_image(&self, image: &LoadedImage) -> Result<String> {
        let response = self
            .send(
                "LinkedIn image upload",
                HttpRequest::post(format!("{}/rest/images?action=initializeUpload", self.api_base))
                    .json(json!({ "initializeUploadRequest": { "owner": self.author_urn } })),
            )
            .await?;
        let ticket: InitializeUploadResponse = response.json("LinkedIn image upload")?;

        self.http
            .send(
                HttpRequest::put(ticket.value.upload_url)
                    .bearer(self.token.expose_secret())
                    .bytes(image.mime.as_str(), image.bytes.clone()),
            )
            .await?
            .error_for_status("LinkedIn image upload")?;

        debug!(image = %ticket.value.image, "LinkedIn image uploaded");
        Ok(ticket.value.image)
    }

    async fn create_post(&self, message: &Message) -> Result<PublishedRef> {
        let mut uploaded = Vec::with_capacity(message.images.len());
        for image_ref in &message.images {
            let image = self.images.read_image(image_ref).await?;
            let urn = self.upload_image(&image).await?;
            uploaded.push(json!({ "id": urn, "altText": image.alt() }));
        }

        let mut body = json!({
            "author": self.author_urn,
            "commentary": escape_little_text(&post_text(message)),
            "visibility": "PUBLIC",
            "distribution": {
                "feedDistribution": "MAIN_FEED",
                "targetEntities": [],
                "thirdPartyDistributionChannels": [],
            },
            "lifecycleState": "PUBLISHED",
            "isReshareDisabledByAuthor": false,
        });

        let content = match (uploaded.len(), &message.link) {
            (0, Some(link)) => Some(json!({ "article": { "source": link, "title": link } })),
            (0, None) => None,
            (1, _) => Some(json!({ "media": uploaded[0] })),
            _ => Some(json!({ "multiImage": { "images": uploaded } })),
        };
        if let Some(content) = content {
            body["content"] = content;
        }

        let response = self
            .send(
                "LinkedIn",
                HttpRequest::post(format!("{}/rest/posts", self.api_base)).json(body),
            )
            .await?;
        let urn = response
            .header("x-restli-id")
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                PlatformError::MalformedResponse("LinkedIn post response has no x-restli-id".into())
            })?
            .to_string();

        debug!(urn = %urn, "LinkedIn post created");
        Ok(PublishedRef::new(urn.clone())
            .with_uri(urn.clone())
            .with_url(format!("https://www.linkedin.com/feed/update/{}", urn)))
    }

    async fn create_comment(&self, message: &Message, root: &PublishedRef) -> Result<PublishedRef> {
        let root_urn = root.post_id.as_str();

        let mut body = json!({
            "actor": self.author_urn,
            "object": root_urn,
            "message": { "text": comment_text(message) },
        });

        if let Some(image_ref) = message.images.first() {
            let image = self.images.read_image(image_ref).await?;
            if image.alt_text.is_some() {
                debug!("LinkedIn comment images carry no alt text, dropping it");
            }
            let urn = self.upload_image(&image).await?;
            body["content"] = json!([{ "entity": { "image": urn } }]);
        }

        let response = self
            .send(
                "LinkedIn comment",
                HttpRequest::post(format!(
                    "{}/rest/socialActions/{}/comments",
                    self.api_base,
                    encode_urn(root_urn)
                ))
                .json(body),
            )
            .await?;

        let created: CreatedComment = if response.body.trim().is_empty() {
            CreatedComment::default()
        } else {
            response.json("LinkedIn comment")?
        };
        let comment_urn = created
            .comment_urn
            .or_else(|| response.header("x-restli-id").map(str::to_string))
            .or(created.id)
            .ok_or_else(|| {
                PlatformError::MalformedResponse("LinkedIn comment response has no id".into())
            })?;

        debug!(comment = %comment_urn, root = %root_urn, "LinkedIn comment created");
        Ok(PublishedRef::new(comment_urn.clone()).with_uri(comment_urn))
    }
}

#[async_trait]
impl PlatformAdapter for LinkedInAdapter {
    fn target(&self) -> Target {
        Target::LinkedIn
    }

    async fn publish(
        &self,
        message: &Message,
        reply_to: Option<&PublishedRef>,
        _options: &PublishOptions,
    ) -> Result<PublishedRef> {
        match reply_to {
            None => self.create_post(message).await,
            Some(parent) => {
                let root = parent.thread_root();
                Ok(self.create_comment(message, root).await?.in_thread_of(Some(parent)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::ReqwestClient;
    use crate::images::FsImageSource;
    use crate::types::ImageRef;
    use wiremock::matchers::{body_json, body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adapter(server: &MockServer) -> LinkedInAdapter {
        let config = LinkedInConfig {
            api_base: server.uri(),
            author_urn: "urn:li:person:abc".to_string(),
            token_file: "unused".to_string(),
            api_version: "202405".to_string(),
        };
        LinkedInAdapter::new(
            &config,
            SecretString::from("li-token".to_string()),
            Arc::new(ReqwestClient::new(&Default::default()).unwrap()),
            Arc::new(FsImageSource::new()),
        )
    }

    #[test]
    fn test_escape_little_text() {
        assert_eq!(escape_little_text("plain text"), "plain text");
        assert_eq!(escape_little_text("#rust (v1)"), "\\#rust \\(v1\\)");
    }

    #[test]
    fn test_encode_urn() {
        assert_eq!(encode_urn("urn:li:share:123"), "urn%3Ali%3Ashare%3A123");
    }

    #[tokio::test]
    async fn test_root_post_with_article_reads_restli_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/posts"))
            .and(header("authorization", "Bearer li-token"))
            .and(header("linkedin-version", "202405"))
            .and(body_partial_json(json!({
                "author": "urn:li:person:abc",
                "commentary": "Launch day",
                "content": {"article": {"source": "https://example.com/launch"}},
            })))
            .respond_with(ResponseTemplate::new(201).insert_header("x-restli-id", "urn:li:share:42"))
            .expect(1)
            .mount(&server)
            .await;

        let message = Message::new("Launch day").with_link("https://example.com/launch");
        let published = adapter(&server)
            .publish(&message, None, &PublishOptions::default())
            .await
            .unwrap();

        assert_eq!(published.post_id, "urn:li:share:42");
        assert_eq!(
            published.url.as_deref(),
            Some("https://www.linkedin.com/feed/update/urn:li:share:42")
        );
    }

    #[tokio::test]
    async fn test_follow_up_is_a_comment_on_the_root() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/socialActions/urn%3Ali%3Ashare%3A42/comments"))
            .and(body_json(json!({
                "actor": "urn:li:person:abc",
                "object": "urn:li:share:42",
                "message": {"text": "More details\n\nhttps://example.com/details"},
            })))
            .respond_with(
                ResponseTemplate::new(201)
                    .set_body_json(json!({"commentUrn": "urn:li:comment:(urn:li:share:42,7)"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let root = PublishedRef::new("urn:li:share:42");
        let message = Message::new("More details").with_link("https://example.com/details");
        let comment = adapter(&server)
            .publish(&message, Some(&root), &PublishOptions::default())
            .await
            .unwrap();

        assert_eq!(comment.post_id, "urn:li:comment:(urn:li:share:42,7)");
        assert_eq!(comment.thread_root().post_id, "urn:li:share:42");
    }

    #[tokio::test]
    async fn test_root_post_with_image_uploads_first() {
        let server = MockServer::start().await;
        let temp_dir = tempfile::TempDir::new().unwrap();
        let image_path = temp_dir.path().join("slide.png");
        std::fs::write(&image_path, b"png").unwrap();

        Mock::given(method("POST"))
            .and(path("/rest/images"))
            .and(query_param("action", "initializeUpload"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": {
                    "uploadUrl": format!("{}/upload/slide", server.uri()),
                    "image": "urn:li:image:slide",
                },
            })))
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("PUT"))
            .and(path("/upload/slide"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/rest/posts"))
            .and(body_partial_json(json!({
                "content": {"media": {"id": "urn:li:image:slide", "altText": "Title slide"}},
            })))
            .respond_with(ResponseTemplate::new(201).insert_header("x-restli-id", "urn:li:share:9"))
            .expect(1)
            .mount(&server)
            .await;

        let message = Message::new("Slides")
            .with_image(ImageRef::new(image_path.to_str().unwrap()).with_alt_text("Title slide"));
        let published = adapter(&server)
            .publish(&message, None, &PublishOptions::default())
            .await
            .unwrap();
        assert_eq!(published.post_id, "urn:li:share:9");

        let requests = server.received_requests().await.unwrap();
        let paths: Vec<&str> = requests.iter().map(|r| r.url.path()).collect();
        assert_eq!(paths, vec!["/rest/images", "/upload/slide", "/rest/posts"]);
    }

    #[tokio::test]
    async fn test_missing_restli_id_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/posts"))
            .respond_with(ResponseTemplate::new(201))
            .mount(&server)
            .await;

        let err = adapter(&server)
            .publish(&Message::new("x"), None, &PublishOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err.as_platform(), Some(PlatformError::MalformedResponse(_))));
    }
}
