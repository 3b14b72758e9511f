//! Attachment pipeline - turns a local image into a durably stored, publicly resolvable object
//!
//! 1. Fail fast when the local file is not an image
//! 2. Downscale to the configured bound and re-encode as JPEG
//! 3. Reject results over the size cap
//! 4. Upload under `{conversation_id}/{millis}-{uuid}.jpg`, each attempt under a timeout,
//!    retried once
//! 5. Resolve the public URL (terminal on failure)
//! 6. Probe the URL; an unreachable object is only logged, storage visibility may lag

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use foundit_store::ObjectStorage;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use url::Url;
use uuid::Uuid;

use crate::config::ChatConfig;
use crate::error::{ChatError, ChatResult};
use crate::models::ImageAttachment;

/// Content type of every re-encoded attachment
pub const ENCODED_CONTENT_TYPE: &str = "image/jpeg";

/// Best-effort check that a resolved URL is actually being served
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn check(&self, url: &Url) -> anyhow::Result<()>;
}

/// HEAD request for http(s) URLs, a metadata lookup for `file://` URLs
pub struct HeadProbe {
    client: reqwest::Client,
}

impl HeadProbe {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }
}

impl Default for HeadProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl ReachabilityProbe for HeadProbe {
    async fn check(&self, url: &Url) -> anyhow::Result<()> {
        match url.scheme() {
            "file" => {
                let path = url
                    .to_file_path()
                    .map_err(|_| anyhow!("Not a local path: {}", url))?;
                tokio::fs::metadata(&path)
                    .await
                    .with_context(|| format!("Object missing at {}", path.display()))?;
            }
            "http" | "https" => {
                self.client
                    .head(url.clone())
                    .send()
                    .await?
                    .error_for_status()?;
            }
            other => bail!("Unsupported URL scheme: {}", other),
        }
        Ok(())
    }
}

/// A downscaled, re-encoded image ready for upload
#[derive(Debug, Clone)]
pub struct CompressedImage {
    pub bytes: Bytes,
    pub width: u32,
    pub height: u32,
}

/// Decode `path`, fit it within `max_dimension` and re-encode as JPEG
pub fn compress(path: &Path, max_dimension: u32, quality: u8) -> ChatResult<CompressedImage> {
    let img = image::open(path)?;
    let img = if img.width() > max_dimension || img.height() > max_dimension {
        img.resize(max_dimension, max_dimension, FilterType::Triangle)
    } else {
        img
    };

    let rgb = img.to_rgb8();
    let mut buf = Vec::new();
    {
        let mut encoder = JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100));
        encoder.encode_image(&rgb)?;
    }

    Ok(CompressedImage {
        bytes: Bytes::from(buf),
        width: rgb.width(),
        height: rgb.height(),
    })
}

/// Whether the file name maps to an image media type
pub fn is_image_path(path: &Path) -> bool {
    mime_guess::from_path(path)
        .first()
        .map(|m| m.type_() == mime_guess::mime::IMAGE)
        .unwrap_or(false)
}

pub struct AttachmentPipeline {
    objects: Arc<dyn ObjectStorage>,
    probe: Arc<dyn ReachabilityProbe>,
    config: ChatConfig,
}

impl AttachmentPipeline {
    pub fn new(
        objects: Arc<dyn ObjectStorage>,
        probe: Arc<dyn ReachabilityProbe>,
        config: ChatConfig,
    ) -> Self {
        Self {
            objects,
            probe,
            config,
        }
    }

    /// Run the whole pipeline for one image
    #[instrument(skip(self))]
    pub async fn upload(&self, conversation_id: &str, local: &Path) -> ChatResult<ImageAttachment> {
        if !is_image_path(local) {
            return Err(ChatError::UnsupportedMediaType(local.display().to_string()));
        }

        let compressed = {
            let path: PathBuf = local.to_path_buf();
            let max = self.config.max_image_dimension;
            let quality = self.config.jpeg_quality;
            tokio::task::spawn_blocking(move || compress(&path, max, quality))
                .await
                .map_err(|e| ChatError::Task(e.to_string()))??
        };

        let size = compressed.bytes.len();
        if size > self.config.max_upload_bytes {
            return Err(ChatError::TooLarge {
                size,
                limit: self.config.max_upload_bytes,
            });
        }
        debug!(
            "Compressed {} to {}x{} ({} bytes)",
            local.display(),
            compressed.width,
            compressed.height,
            size
        );

        let path = format!(
            "{}/{}-{}.jpg",
            conversation_id,
            Utc::now().timestamp_millis(),
            Uuid::new_v4().simple()
        );
        self.upload_with_retry(&path, compressed.bytes).await?;

        let url = self.objects.public_url(&path).map_err(|e| {
            error!("Uploaded {} but could not resolve its URL: {}", path, e);
            ChatError::UnresolvableUrl(path.clone())
        })?;

        if let Err(e) = self.probe.check(&url).await {
            warn!("Attachment {} is not reachable yet: {}", url, e);
        }

        info!("Attachment ready at {}", url);
        Ok(ImageAttachment {
            url: url.to_string(),
            path,
            content_type: ENCODED_CONTENT_TYPE.to_string(),
            size,
            width: compressed.width,
            height: compressed.height,
        })
    }

    async fn upload_with_retry(&self, path: &str, bytes: Bytes) -> ChatResult<()> {
        let timeout = self.config.upload_timeout;
        let attempts = self.config.upload_retries + 1;
        let mut last_error = ChatError::Upload("no upload attempted".to_string());

        for attempt in 1..=attempts {
            let upload = self
                .objects
                .upload(path, bytes.clone(), ENCODED_CONTENT_TYPE);
            match tokio::time::timeout(timeout, upload).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => {
                    warn!("Upload attempt {}/{} of {} failed: {}", attempt, attempts, path, e);
                    last_error = ChatError::Upload(e.to_string());
                }
                Err(_) => {
                    warn!(
                        "Upload attempt {}/{} of {} timed out after {:?}",
                        attempt, attempts, path, timeout
                    );
                    last_error = ChatError::UploadTimeout(timeout);
                }
            }
        }
        Err(last_error)
    }
}
