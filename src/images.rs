//! Image inlining.
//!
//! The upstream only accepts images as base64 data URLs. Remote `http(s)`
//! URLs in a request are downloaded concurrently and replaced before the
//! request is translated.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::translate::canonical::{CanonicalRequest, ContentPart};

pub const SUPPORTED_IMAGE_FORMATS: [&str; 5] =
    ["image/png", "image/jpeg", "image/jpg", "image/webp", "image/gif"];

const SUPPORTED_EXTENSIONS: [(&str, &str); 5] = [
    (".png", "image/png"),
    (".jpg", "image/jpeg"),
    (".jpeg", "image/jpeg"),
    (".webp", "image/webp"),
    (".gif", "image/gif"),
];

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Split `data:<mime>;base64,<data>` into `(mime, data)`.
pub fn parse_data_url(url: &str) -> Option<(&str, &str)> {
    let rest = url.strip_prefix("data:")?;
    let (meta, data) = rest.split_once(',')?;
    let mime = meta.strip_suffix(";base64")?;
    if mime.is_empty() {
        return None;
    }
    Some((mime, data))
}

pub fn to_data_url(mime: &str, bytes: &[u8]) -> String {
    format!("data:{mime};base64,{}", STANDARD.encode(bytes))
}

pub fn is_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Mime type from the response header, falling back to the URL extension.
pub fn image_mime(content_type: Option<&str>, url: &str) -> Option<&'static str> {
    if let Some(ct) = content_type {
        let ct = ct.split(';').next().unwrap_or_default().trim().to_ascii_lowercase();
        if let Some(&known) = SUPPORTED_IMAGE_FORMATS.iter().find(|f| **f == ct) {
            return Some(if known == "image/jpg" { "image/jpeg" } else { known });
        }
    }
    let path = url.split(['?', '#']).next().unwrap_or(url).to_ascii_lowercase();
    SUPPORTED_EXTENSIONS
        .iter()
        .find(|(ext, _)| path.ends_with(ext))
        .map(|(_, mime)| *mime)
}

/// Check the magic bytes agree with the claimed mime type.
pub fn validate_image_content(bytes: &[u8], mime: &str) -> bool {
    if bytes.len() < 8 {
        return false;
    }
    match mime {
        "image/png" => bytes.starts_with(b"\x89PNG\r\n\x1a\n"),
        "image/jpeg" | "image/jpg" => bytes.starts_with(b"\xff\xd8\xff"),
        "image/webp" => bytes.len() >= 12 && bytes.starts_with(b"RIFF") && &bytes[8..12] == b"WEBP",
        "image/gif" => bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a"),
        _ => true,
    }
}

/// Turns image references into inline base64 data.
#[async_trait]
pub trait ImagePipeline: Send + Sync {
    /// Fetch one image as a data URL.
    async fn fetch(&self, url: &str) -> Result<String, String>;

    /// Inline every remote image in `req`. Failures leave the part as-is and
    /// come back as warnings.
    async fn inline_request(&self, req: &mut CanonicalRequest) -> Vec<String> {
        let urls: HashSet<String> = req
            .messages
            .iter()
            .flat_map(|m| m.content.iter())
            .filter_map(|part| match part {
                ContentPart::Image { url, .. } if is_http_url(url) => Some(url.clone()),
                _ => None,
            })
            .collect();

        if urls.is_empty() {
            return Vec::new();
        }

        tracing::info!(count = urls.len(), "Downloading images");
        let results = futures::future::join_all(urls.iter().map(|url| async move {
            (url.clone(), self.fetch(url).await)
        }))
        .await;

        let mut warnings = Vec::new();
        let mut inlined = HashMap::new();
        for (url, result) in results {
            match result {
                Ok(data_url) => {
                    inlined.insert(url, data_url);
                }
                Err(e) => {
                    tracing::warn!(url = %url, error = %e, "Image download failed");
                    warnings.push(format!("image {url} not inlined: {e}"));
                }
            }
        }

        for part in req.messages.iter_mut().flat_map(|m| m.content.iter_mut()) {
            if let ContentPart::Image { url, mime } = part {
                if let Some(data_url) = inlined.get(url.as_str()) {
                    *mime = parse_data_url(data_url).map(|(m, _)| m.to_string());
                    url.clone_from(data_url);
                }
            }
        }

        warnings
    }
}

/// Downloads images over HTTP with the shared client.
pub struct HttpImagePipeline {
    client: reqwest::Client,
    max_bytes: usize,
}

impl HttpImagePipeline {
    pub fn new(client: reqwest::Client, max_bytes: usize) -> Self {
        Self { client, max_bytes }
    }
}

#[async_trait]
impl ImagePipeline for HttpImagePipeline {
    async fn fetch(&self, url: &str) -> Result<String, String> {
        let resp = self
            .client
            .get(url)
            .timeout(DOWNLOAD_TIMEOUT)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if !resp.status().is_success() {
            return Err(format!("HTTP {}", resp.status()));
        }
        if resp.content_length().is_some_and(|len| len as usize > self.max_bytes) {
            return Err(format!("larger than {} bytes", self.max_bytes));
        }

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let mime = image_mime(content_type.as_deref(), url)
            .ok_or_else(|| format!("unsupported image format ({})", content_type.unwrap_or_default()))?;

        let bytes = resp.bytes().await.map_err(|e| e.to_string())?;
        if bytes.len() > self.max_bytes {
            return Err(format!("larger than {} bytes", self.max_bytes));
        }
        if !validate_image_content(&bytes, mime) {
            return Err(format!("content does not look like {mime}"));
        }

        Ok(to_data_url(mime, &bytes))
    }
}

/// Leaves every image untouched.
pub struct NoopImagePipeline;

#[async_trait]
impl ImagePipeline for NoopImagePipeline {
    async fn fetch(&self, url: &str) -> Result<String, String> {
        Err(format!("remote image inlining disabled for {url}"))
    }

    async fn inline_request(&self, _req: &mut CanonicalRequest) -> Vec<String> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::canonical::{ChatMessage, Role};

    const PNG: &[u8] = b"\x89PNG\r\n\x1a\n0000";

    #[test]
    fn test_parse_data_url() {
        assert_eq!(parse_data_url("data:image/png;base64,AAAA"), Some(("image/png", "AAAA")));
        assert_eq!(parse_data_url("data:;base64,AAAA"), None);
        assert_eq!(parse_data_url("data:image/png,AAAA"), None);
        assert_eq!(parse_data_url("https://x/y.png"), None);
    }

    #[test]
    fn test_image_mime() {
        assert_eq!(image_mime(Some("image/PNG; charset=binary"), "x"), Some("image/png"));
        assert_eq!(image_mime(Some("image/jpg"), "x"), Some("image/jpeg"));
        assert_eq!(image_mime(Some("application/octet-stream"), "https://h/cat.webp?v=2"), Some("image/webp"));
        assert_eq!(image_mime(None, "https://h/doc.pdf"), None);
    }

    #[test]
    fn test_validate_magic_bytes() {
        assert!(validate_image_content(PNG, "image/png"));
        assert!(!validate_image_content(PNG, "image/jpeg"));
        assert!(!validate_image_content(b"GIF", "image/gif"));
        assert!(validate_image_content(b"RIFF0000WEBP", "image/webp"));
    }

    struct FakePipeline;

    #[async_trait]
    impl ImagePipeline for FakePipeline {
        async fn fetch(&self, url: &str) -> Result<String, String> {
            if url.ends_with("good.png") {
                Ok(to_data_url("image/png", PNG))
            } else {
                Err("HTTP 404 Not Found".to_string())
            }
        }
    }

    fn image_message(urls: &[&str]) -> ChatMessage {
        ChatMessage::new(
            Role::User,
            urls.iter()
                .map(|u| ContentPart::Image {
                    url: u.to_string(),
                    mime: None,
                })
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_inline_request_replaces_and_warns() {
        let mut req = CanonicalRequest::new(
            "gpt4o",
            vec![image_message(&["https://h/good.png", "https://h/missing.png", "data:image/gif;base64,R0lG"])],
        );
        let warnings = FakePipeline.inline_request(&mut req).await;

        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("missing.png"));
        match &req.messages[0].content[0] {
            ContentPart::Image { url, mime } => {
                assert!(url.starts_with("data:image/png;base64,"));
                assert_eq!(mime.as_deref(), Some("image/png"));
            }
            other => panic!("unexpected part {other:?}"),
        }
        match &req.messages[0].content[1] {
            ContentPart::Image { url, .. } => assert_eq!(url, "https://h/missing.png"),
            other => panic!("unexpected part {other:?}"),
        }
    }

    #[test]
    fn test_noop_pipeline() {
        let mut req = CanonicalRequest::new("gpt4o", vec![image_message(&["https://h/good.png"])]);
        assert!(tokio_test::block_on(NoopImagePipeline.inline_request(&mut req)).is_empty());
        assert!(tokio_test::block_on(NoopImagePipeline.fetch("https://h/good.png")).is_err());
    }
}
