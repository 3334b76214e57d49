//! Bluesky adapter (AT Protocol XRPC)
//!
//! Sessions come from `com.atproto.server.createSession` and are cached per
//! adapter. When the PDS rejects the access token as expired the session is
//! refreshed once with its refresh token and the call is replayed.

use async_trait::async_trait;
use chrono::SecondsFormat;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::BlueskyConfig;
use crate::error::{PlatformError, Result};
use crate::http::{HttpClient, HttpRequest, HttpResponse};
use crate::images::ImageSource;
use crate::platforms::session::SessionCache;
use crate::platforms::PlatformAdapter;
use crate::richtext::{build_rich_text, display_link, HandleResolver, RichTextOptions};
use crate::types::{Message, PublishOptions, PublishedRef, Target};

const POST_COLLECTION: &str = "app.bsky.feed.post";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Session {
    access_jwt: String,
    refresh_jwt: String,
    did: String,
}

#[derive(Debug, Deserialize)]
struct XrpcError {
    error: String,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreatedRecord {
    uri: String,
    cid: String,
}

#[derive(Debug, Deserialize)]
struct UploadedBlob {
    blob: Value,
}

#[derive(Debug, Deserialize)]
struct ResolvedHandle {
    did: String,
}

fn xrpc_error(response: &HttpResponse) -> Option<XrpcError> {
    serde_json::from_str(&response.body).ok()
}

fn is_expired_token(response: &HttpResponse) -> bool {
    !response.is_success() && xrpc_error(response).is_some_and(|e| e.error == "ExpiredToken")
}

/// Map a failed XRPC response to a platform error
///
/// AT Protocol errors carry a machine-readable code in the `error` field;
/// the codes that mean "your credentials are no good" are classified as
/// authentication failures regardless of the HTTP status the PDS picked.
fn map_bluesky_error(context: &str, response: &HttpResponse) -> PlatformError {
    let Some(xrpc) = xrpc_error(response) else {
        return PlatformError::from_status(context, response.status, &response.body);
    };
    let detail = xrpc.message.unwrap_or_else(|| xrpc.error.clone());

    match xrpc.error.as_str() {
        "AuthenticationRequired" | "InvalidToken" | "ExpiredToken" | "AccountTakedown" => {
            PlatformError::Authentication(format!(
                "Bluesky {} failed ({}): {}. Check your handle and app password.",
                context, xrpc.error, detail
            ))
        }
        "RateLimitExceeded" => PlatformError::RateLimit(format!(
            "Bluesky rate limit exceeded during {}: {}",
            context, detail
        )),
        _ => PlatformError::from_status(&format!("Bluesky {}", context), response.status, &response.body),
    }
}

fn check(context: &str, response: HttpResponse) -> Result<HttpResponse> {
    if response.is_success() {
        Ok(response)
    } else {
        Err(map_bluesky_error(context, &response).into())
    }
}

/// Text of the post record for `message`
///
/// Without images the link travels as an external embed and stays out of
/// the text; with images the embed slot is taken, so the link is appended.
pub fn post_text(message: &Message) -> String {
    if message.images.is_empty() {
        message.content.clone()
    } else {
        message.text_with_link()
    }
}

/// `bsky.app` URL for an `at://` post URI
fn web_url(did: &str, at_uri: &str) -> Option<String> {
    let rkey = at_uri.rsplit('/').next().filter(|k| !k.is_empty())?;
    Some(format!("https://bsky.app/profile/{}/post/{}", did, rkey))
}

fn strong_ref(post: &PublishedRef) -> Result<Value> {
    match (&post.uri, &post.cid) {
        (Some(uri), Some(cid)) => Ok(json!({ "uri": uri, "cid": cid })),
        _ => Err(PlatformError::Validation(format!(
            "cannot reply to {}: missing uri or cid",
            post.post_id
        ))
        .into()),
    }
}

pub struct BlueskyAdapter {
    http: Arc<dyn HttpClient>,
    images: Arc<dyn ImageSource>,
    service: String,
    handle: String,
    app_password: SecretString,
    rich_text: RichTextOptions,
    session: SessionCache<Session>,
}

impl BlueskyAdapter {
    pub fn new(
        config: &BlueskyConfig,
        app_password: SecretString,
        http: Arc<dyn HttpClient>,
        images: Arc<dyn ImageSource>,
    ) -> Self {
        Self {
            http,
            images,
            service: config.service.trim_end_matches('/').to_string(),
            handle: config.handle.clone(),
            app_password,
            rich_text: RichTextOptions {
                link_display_length: config.link_display_length,
            },
            session: SessionCache::new(),
        }
    }

    fn xrpc_url(&self, nsid: &str) -> String {
        format!("{}/xrpc/{}", self.service, nsid)
    }

    async fn session(&self) -> Result<Arc<Session>> {
        self.session
            .get_or_refresh(|_| true, |previous| self.open_session(previous))
            .await
    }

    /// Refresh the previous session if there is one, log in otherwise
    async fn open_session(&self, previous: Option<Arc<Session>>) -> Result<Session> {
        if let Some(previous) = previous {
            let response = self
                .http
                .send(
                    HttpRequest::post(self.xrpc_url("com.atproto.server.refreshSession"))
                        .bearer(&previous.refresh_jwt),
                )
                .await?;
            if response.is_success() {
                debug!(handle = %self.handle, "Bluesky session refreshed");
                return response.json("Bluesky refreshSession");
            }
            debug!(
                handle = %self.handle,
                status = response.status,
                "Bluesky session refresh rejected, logging in again"
            );
        }

        let response = self
            .http
            .send(
                HttpRequest::post(self.xrpc_url("com.atproto.server.createSession")).json(json!({
                    "identifier": self.handle,
                    "password": self.app_password.expose_secret(),
                })),
            )
            .await?;
        let session: Session = check("authentication", response)?.json("Bluesky createSession")?;
        info!(handle = %self.handle, did = %session.did, "Bluesky session created");
        Ok(session)
    }

    /// Send an authenticated request, refreshing once on an expired token
    async fn send_authorized(
        &self,
        context: &str,
        build: impl Fn(&Session) -> HttpRequest + Send + Sync,
    ) -> Result<(Arc<Session>, HttpResponse)> {
        let session = self.session().await?;
        let response = self.http.send(build(&session)).await?;
        if !is_expired_token(&response) {
            return Ok((Arc::clone(&session), check(context, response)?));
        }

        debug!(handle = %self.handle, "Bluesky access token expired");
        self.session.invalidate(&session).await;
        let session = self.session().await?;
        let response = self.http.send(build(&session)).await?;
        Ok((Arc::clone(&session), check(context, response)?))
    }

    async fn upload_images(&self, message: &Message) -> Result<Vec<Value>> {
        let mut uploaded = Vec::with_capacity(message.images.len());
        for image_ref in &message.images {
            let image = self.images.read_image(image_ref).await?;
            let (_, response) = self
                .send_authorized("uploadBlob", |session| {
                    HttpRequest::post(self.xrpc_url("com.atproto.repo.uploadBlob"))
                        .bearer(&session.access_jwt)
                        .bytes(image.mime.as_str(), image.bytes.clone())
                })
                .await?;
            let blob: UploadedBlob = response.json("Bluesky uploadBlob")?;

            let mut entry = json!({ "image": blob.blob, "alt": image.alt() });
            if let (Some(width), Some(height)) = (image.width, image.height) {
                entry["aspectRatio"] = json!({ "width": width, "height": height });
            }
            uploaded.push(entry);
        }
        Ok(uploaded)
    }

    fn embed(&self, message: &Message, images: Vec<Value>) -> Option<Value> {
        if !images.is_empty() {
            return Some(json!({ "$type": "app.bsky.embed.images", "images": images }));
        }
        message.link.as_ref().map(|link| {
            json!({
                "$type": "app.bsky.embed.external",
                "external": {
                    "uri": link,
                    "title": display_link(link, 64),
                    "description": "",
                },
            })
        })
    }
}

#[async_trait]
impl HandleResolver for BlueskyAdapter {
    async fn resolve_handle(&self, handle: &str) -> Result<String> {
        let url = url::Url::parse_with_params(
            &self.xrpc_url("com.atproto.identity.resolveHandle"),
            &[("handle", handle)],
        )
        .map_err(|e| PlatformError::Validation(format!("Invalid Bluesky service URL: {}", e)))?;

        let response = self.http.send(HttpRequest::get(url.as_str())).await?;
        let resolved: ResolvedHandle = check("resolveHandle", response)?.json("Bluesky resolveHandle")?;
        Ok(resolved.did)
    }
}

#[async_trait]
impl PlatformAdapter for BlueskyAdapter {
    fn target(&self) -> Target {
        Target::Bluesky
    }

    async fn publish(
        &self,
        message: &Message,
        reply_to: Option<&PublishedRef>,
        options: &PublishOptions,
    ) -> Result<PublishedRef> {
        let rich = build_rich_text(&post_text(message), &self.rich_text, self).await;
        let images = self.upload_images(message).await?;

        let mut record = json!({
            "$type": POST_COLLECTION,
            "text": rich.text,
            "createdAt": chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        });
        if !rich.facets.is_empty() {
            record["facets"] = rich.facets.iter().map(|f| f.to_record()).collect();
        }
        if let Some(language) = &options.language {
            record["langs"] = json!([language]);
        }
        if let Some(parent) = reply_to {
            record["reply"] = json!({
                "root": strong_ref(parent.thread_root())?,
                "parent": strong_ref(parent)?,
            });
        }
        if let Some(embed) = self.embed(message, images) {
            record["embed"] = embed;
        }

        let (session, response) = self
            .send_authorized("createRecord", |session| {
                HttpRequest::post(self.xrpc_url("com.atproto.repo.createRecord"))
                    .bearer(&session.access_jwt)
                    .json(json!({
                        "repo": session.did,
                        "collection": POST_COLLECTION,
                        "record": record,
                    }))
            })
            .await?;
        let created: CreatedRecord = response.json("Bluesky createRecord")?;

        let mut published = PublishedRef::new(created.uri.clone())
            .with_uri(created.uri.clone())
            .with_cid(created.cid)
            .in_thread_of(reply_to);
        if let Some(url) = web_url(&session.did, &created.uri) {
            published = published.with_url(url);
        }
        debug!(uri = %created.uri, "Bluesky post created");
        Ok(published)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::ReqwestClient;
    use crate::images::FsImageSource;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adapter(server: &MockServer) -> BlueskyAdapter {
        let config = BlueskyConfig {
            service: server.uri(),
            handle: "alice.bsky.social".to_string(),
            app_password_file: "unused".to_string(),
            link_display_length: Some(27),
        };
        BlueskyAdapter::new(
            &config,
            SecretString::from("app-password".to_string()),
            Arc::new(ReqwestClient::new(&Default::default()).unwrap()),
            Arc::new(FsImageSource::new()),
        )
    }

    async fn mount_session(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.server.createSession"))
            .and(body_partial_json(json!({"identifier": "alice.bsky.social"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "accessJwt": "access-1",
                "refreshJwt": "refresh-1",
                "did": "did:plc:alice",
                "handle": "alice.bsky.social",
            })))
            .expect(1)
            .mount(server)
            .await;
    }

    #[test]
    fn test_map_bluesky_error_codes() {
        let response = HttpResponse {
            status: 400,
            headers: vec![],
            body: r#"{"error":"InvalidToken","message":"Bad token"}"#.to_string(),
        };
        assert!(matches!(
            map_bluesky_error("createRecord", &response),
            PlatformError::Authentication(_)
        ));

        let response = HttpResponse {
            status: 400,
            headers: vec![],
            body: r#"{"error":"InvalidRequest","message":"Record too long"}"#.to_string(),
        };
        match map_bluesky_error("createRecord", &response) {
            PlatformError::Request { status, body, .. } => {
                assert_eq!(status, 400);
                assert!(body.unwrap().contains("Record too long"));
            }
            other => panic!("Expected Request, got {:?}", other),
        }
    }

    #[test]
    fn test_post_text_keeps_link_out_unless_images() {
        let message = Message::new("Read this").with_link("https://example.com/a");
        assert_eq!(post_text(&message), "Read this");

        let message = message.with_image(crate::types::ImageRef::new("cat.jpg"));
        assert_eq!(post_text(&message), "Read this\n\nhttps://example.com/a");
    }

    #[test]
    fn test_web_url() {
        assert_eq!(
            web_url("did:plc:alice", "at://did:plc:alice/app.bsky.feed.post/3kabc").as_deref(),
            Some("https://bsky.app/profile/did:plc:alice/post/3kabc")
        );
    }

    #[tokio::test]
    async fn test_publish_root_with_facets_and_link_embed() {
        let server = MockServer::start().await;
        mount_session(&server).await;

        Mock::given(method("GET"))
            .and(path("/xrpc/com.atproto.identity.resolveHandle"))
            .and(query_param("handle", "bob.example.com"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"did": "did:plc:bob"})))
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.repo.createRecord"))
            .and(header("authorization", "Bearer access-1"))
            .and(body_partial_json(json!({
                "repo": "did:plc:alice",
                "collection": "app.bsky.feed.post",
                "record": {
                    "text": "Hi @bob.example.com #rust",
                    "langs": ["en"],
                    "embed": {
                        "$type": "app.bsky.embed.external",
                        "external": {"uri": "https://example.com/post"},
                    },
                    "facets": [
                        {
                            "index": {"byteStart": 3, "byteEnd": 19},
                            "features": [{"$type": "app.bsky.richtext.facet#mention", "did": "did:plc:bob"}],
                        },
                        {
                            "index": {"byteStart": 20, "byteEnd": 25},
                            "features": [{"$type": "app.bsky.richtext.facet#tag", "tag": "rust"}],
                        },
                    ],
                },
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "uri": "at://did:plc:alice/app.bsky.feed.post/3kroot",
                "cid": "bafyroot",
            })))
            .expect(1)
            .mount(&server)
            .await;

        let message = Message::new("Hi @bob.example.com #rust").with_link("https://example.com/post");
        let options = PublishOptions {
            language: Some("en".to_string()),
            ..Default::default()
        };
        let published = adapter(&server).publish(&message, None, &options).await.unwrap();

        assert_eq!(published.uri.as_deref(), Some("at://did:plc:alice/app.bsky.feed.post/3kroot"));
        assert_eq!(published.cid.as_deref(), Some("bafyroot"));
        assert_eq!(
            published.url.as_deref(),
            Some("https://bsky.app/profile/did:plc:alice/post/3kroot")
        );
        assert!(published.root.is_none());
    }

    #[tokio::test]
    async fn test_reply_references_root_and_parent() {
        let server = MockServer::start().await;
        mount_session(&server).await;

        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.repo.createRecord"))
            .and(body_partial_json(json!({
                "record": {
                    "reply": {
                        "root": {"uri": "at://root", "cid": "cid-root"},
                        "parent": {"uri": "at://second", "cid": "cid-second"},
                    },
                },
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "uri": "at://did:plc:alice/app.bsky.feed.post/3kthird",
                "cid": "cid-third",
            })))
            .expect(1)
            .mount(&server)
            .await;

        let root = PublishedRef::new("at://root").with_uri("at://root").with_cid("cid-root");
        let second = PublishedRef::new("at://second")
            .with_uri("at://second")
            .with_cid("cid-second")
            .in_thread_of(Some(&root));

        let third = adapter(&server)
            .publish(&Message::new("third"), Some(&second), &PublishOptions::default())
            .await
            .unwrap();
        assert_eq!(third.thread_root().uri.as_deref(), Some("at://root"));
    }

    #[tokio::test]
    async fn test_expired_token_refreshes_and_replays() {
        let server = MockServer::start().await;
        mount_session(&server).await;

        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.repo.createRecord"))
            .and(header("authorization", "Bearer access-1"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": "ExpiredToken",
                "message": "Token has expired",
            })))
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.server.refreshSession"))
            .and(header("authorization", "Bearer refresh-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "accessJwt": "access-2",
                "refreshJwt": "refresh-2",
                "did": "did:plc:alice",
                "handle": "alice.bsky.social",
            })))
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.repo.createRecord"))
            .and(header("authorization", "Bearer access-2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "uri": "at://did:plc:alice/app.bsky.feed.post/3knew",
                "cid": "cid-new",
            })))
            .expect(1)
            .mount(&server)
            .await;

        let published = adapter(&server)
            .publish(&Message::new("hello"), None, &PublishOptions::default())
            .await
            .unwrap();
        assert_eq!(published.cid.as_deref(), Some("cid-new"));
    }

    #[tokio::test]
    async fn test_bad_credentials_are_authentication_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.server.createSession"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "error": "AuthenticationRequired",
                "message": "Invalid identifier or password",
            })))
            .mount(&server)
            .await;

        let err = adapter(&server)
            .publish(&Message::new("hello"), None, &PublishOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err.as_platform(), Some(PlatformError::Authentication(_))));
    }

    #[tokio::test]
    async fn test_uploads_images_before_post() {
        let server = MockServer::start().await;
        mount_session(&server).await;

        let temp_dir = tempfile::TempDir::new().unwrap();
        let image_path = temp_dir.path().join("cat.png");
        let mut png = b"\x89PNG\r\n\x1a\n\x00\x00\x00\x0dIHDR".to_vec();
        png.extend_from_slice(&640u32.to_be_bytes());
        png.extend_from_slice(&480u32.to_be_bytes());
        std::fs::write(&image_path, &png).unwrap();

        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.repo.uploadBlob"))
            .and(header("content-type", "image/png"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "blob": {"$type": "blob", "ref": {"$link": "bafyblob"}, "mimeType": "image/png", "size": 9},
            })))
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.repo.createRecord"))
            .and(body_partial_json(json!({
                "record": {
                    "text": "A cat\n\nexample.com/cats",
                    "embed": {
                        "$type": "app.bsky.embed.images",
                        "images": [{
                            "alt": "Sleeping cat",
                            "image": {"ref": {"$link": "bafyblob"}},
                            "aspectRatio": {"width": 640, "height": 480},
                        }],
                    },
                },
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "uri": "at://did:plc:alice/app.bsky.feed.post/3kcat",
                "cid": "cid-cat",
            })))
            .expect(1)
            .mount(&server)
            .await;

        let message = Message::new("A cat")
            .with_link("https://example.com/cats")
            .with_image(
                crate::types::ImageRef::new(image_path.to_str().unwrap()).with_alt_text("Sleeping cat"),
            );
        adapter(&server)
            .publish(&message, None, &PublishOptions::default())
            .await
            .unwrap();
    }
}
