//! Authorized HTTP capability consumed by the platform adapters
//!
//! Adapters build [`HttpRequest`] values and hand them to an [`HttpClient`].
//! The production client is backed by reqwest; tests point it at a local
//! mock server.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::fmt;

use crate::config::HttpConfig;
use crate::error::{PlatformError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Get => write!(f, "GET"),
            Method::Post => write!(f, "POST"),
            Method::Put => write!(f, "PUT"),
        }
    }
}

/// A file part of a multipart upload
#[derive(Clone)]
pub struct FilePart {
    pub field: String,
    pub file_name: String,
    pub mime: String,
    pub data: Vec<u8>,
}

#[derive(Clone, Default)]
pub struct MultipartForm {
    pub fields: Vec<(String, String)>,
    pub file: Option<FilePart>,
}

impl MultipartForm {
    pub fn text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }

    pub fn file(mut self, part: FilePart) -> Self {
        self.file = Some(part);
        self
    }
}

#[derive(Clone)]
pub enum Body {
    Empty,
    Json(serde_json::Value),
    Form(Vec<(String, String)>),
    Bytes { content_type: String, data: Vec<u8> },
    Multipart(MultipartForm),
}

#[derive(Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Body,
}

// Headers carry bearer tokens, keep them out of logs.
impl fmt::Debug for HttpRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpRequest")
            .field("method", &self.method)
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: Body::Empty,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::Post, url)
    }

    pub fn put(url: impl Into<String>) -> Self {
        Self::new(Method::Put, url)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn bearer(self, token: &str) -> Self {
        self.header("Authorization", format!("Bearer {}", token))
    }

    pub fn json(mut self, value: serde_json::Value) -> Self {
        self.body = Body::Json(value);
        self
    }

    pub fn form(mut self, pairs: Vec<(String, String)>) -> Self {
        self.body = Body::Form(pairs);
        self
    }

    pub fn bytes(mut self, content_type: impl Into<String>, data: Vec<u8>) -> Self {
        self.body = Body::Bytes {
            content_type: content_type.into(),
            data,
        };
        self
    }

    pub fn multipart(mut self, form: MultipartForm) -> Self {
        self.body = Body::Multipart(form);
        self
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    /// Header names are lowercase
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Turn a non-2xx response into a platform error
    pub fn error_for_status(self, context: &str) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(PlatformError::from_status(context, self.status, &self.body).into())
        }
    }

    /// Decode the body as JSON
    pub fn json<T: DeserializeOwned>(&self, context: &str) -> Result<T> {
        serde_json::from_str(&self.body).map_err(|e| {
            PlatformError::MalformedResponse(format!("{} returned unexpected JSON: {}", context, e))
                .into()
        })
    }
}

/// Capability to issue an authorized HTTP request
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Send the request and return whatever status the server answered with
    ///
    /// Only transport failures (connect, timeout, body read) are errors;
    /// non-2xx statuses come back as responses.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// reqwest-backed [`HttpClient`]
#[derive(Clone)]
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    pub fn new(config: &HttpConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout()?)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| PlatformError::Network(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

fn to_reqwest_form(form: MultipartForm) -> Result<reqwest::multipart::Form> {
    let mut multipart = reqwest::multipart::Form::new();
    for (name, value) in form.fields {
        multipart = multipart.text(name, value);
    }
    if let Some(file) = form.file {
        let part = reqwest::multipart::Part::bytes(file.data)
            .file_name(file.file_name)
            .mime_str(&file.mime)
            .map_err(|e| PlatformError::Validation(format!("Invalid MIME type: {}", e)))?;
        multipart = multipart.part(file.field, part);
    }
    Ok(multipart)
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let HttpRequest {
            method,
            url,
            headers,
            body,
        } = request;

        let reqwest_method = match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
        };

        let mut builder = self.client.request(reqwest_method, url.as_str());
        for (name, value) in &headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        builder = match body {
            Body::Empty => builder,
            Body::Json(value) => builder.json(&value),
            Body::Form(pairs) => builder.form(&pairs),
            Body::Bytes { content_type, data } => builder
                .header(reqwest::header::CONTENT_TYPE, content_type)
                .body(data),
            Body::Multipart(form) => builder.multipart(to_reqwest_form(form)?),
        };

        tracing::debug!(method = %method, url = %url, "sending request");

        let response = builder.send().await.map_err(|e| {
            let detail = format!("{} {} failed: {}", method, url, e);
            if e.is_connect() {
                PlatformError::Connect(detail)
            } else {
                PlatformError::Network(detail)
            }
        })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response.text().await.map_err(|e| {
            PlatformError::Network(format!("Failed to read response from {}: {}", url, e))
        })?;

        tracing::debug!(method = %method, url = %url, status, "received response");

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}
