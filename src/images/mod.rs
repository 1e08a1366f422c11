//! Record images and screenshots
//!
//! Record images are downloaded with the driver's identity (user agent and
//! cookies), hashed with SHA-256 so site-placeholder images can be
//! rejected, and uploaded to the blob store. Screenshots are captured when
//! a run looks suspicious and stored per run.

use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Local;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::settings::Env;
use crate::settings::task::ScrapeTask;

pub const SCREENSHOT_FOLDER: &str = "BI/scraper_screenshots";
pub const RECORD_IMAGE_FOLDER: &str = "BI/record_images";

/// A downloaded record image with its content hash.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordImage {
    pub link: String,
    pub extension: String,
    pub bytes: Vec<u8>,
    pub hash: Option<String>,
}

impl RecordImage {
    pub fn new(link: String, extension: String, bytes: Vec<u8>) -> Self {
        let hash = hash_bytes(&bytes);
        Self {
            link,
            extension,
            bytes,
            hash,
        }
    }
}

/// SHA-256 hex digest; empty content hashes to `None` so a missing image
/// can never collide with a real one.
pub fn hash_bytes(bytes: &[u8]) -> Option<String> {
    if bytes.is_empty() {
        return None;
    }
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    Some(hex::encode(hasher.finalize()))
}

/// Per-task image context: the HTTP identity to download with and the
/// knowledge needed to skip redundant or placeholder images.
pub struct ImageContext {
    pub client: reqwest::Client,
    pub default_hashes: HashSet<String>,
    pub records_with_images: HashSet<String>,
    pub enabled: bool,
}

impl ImageContext {
    /// Build a client that presents the driver's identity. Listing sites
    /// routinely serve images only to the session that rendered the page,
    /// and many run broken TLS, so invalid certificates are accepted.
    pub fn new(
        user_agent: Option<String>,
        default_hashes: HashSet<String>,
        records_with_images: HashSet<String>,
        enabled: bool,
    ) -> Self {
        let mut builder = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .cookie_store(true);
        if let Some(agent) = user_agent {
            builder = builder.user_agent(agent);
        }
        let client = builder.build().unwrap_or_default();
        Self {
            client,
            default_hashes,
            records_with_images,
            enabled,
        }
    }

    /// Context that never fetches; used when hashing is disabled or no
    /// driver is available.
    pub fn disabled() -> Self {
        Self::new(None, HashSet::new(), HashSet::new(), false)
    }

    /// Download the first usable image from the candidate links. Default
    /// (placeholder) images are discarded by hash.
    pub async fn fetch_first(&self, links: &[String]) -> Option<RecordImage> {
        if !self.enabled {
            return None;
        }

        for link in links {
            if !link.starts_with("http") {
                continue;
            }
            let image = match self.fetch(link).await {
                Ok(image) => image,
                Err(e) => {
                    warn!("failed to download image {link}: {e}");
                    continue;
                }
            };
            let Some(image) = image else { continue };

            if let Some(hash) = &image.hash
                && self.default_hashes.contains(hash)
            {
                return None;
            }
            return Some(image);
        }

        None
    }

    async fn fetch(&self, link: &str) -> Result<Option<RecordImage>> {
        let response = self
            .client
            .get(link)
            .send()
            .await
            .with_context(|| format!("requesting {link}"))?;

        if !response.status().is_success() {
            return Ok(None);
        }

        let extension = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split('/').nth(1))
            .map(|v| v.split(';').next().unwrap_or(v).to_string())
            .unwrap_or_else(|| link.rsplit('.').next().unwrap_or("jpg").to_string());

        let bytes = response.bytes().await.context("reading image body")?;
        Ok(Some(RecordImage::new(link.to_string(), extension, bytes.to_vec())))
    }
}

/// Blob store for screenshots and record images. Uploads are gated to
/// STAGE/PROD; DEV keeps artifacts local only.
pub struct BlobStore {
    root: PathBuf,
    env: Env,
}

impl BlobStore {
    pub fn new(root: PathBuf, env: Env) -> Self {
        Self { root, env }
    }

    /// Store a screenshot under the per-run folder. Returns the stored
    /// path, or `None` when uploads are disabled for this environment.
    pub async fn save_screenshot(&self, task: &ScrapeTask, png: &[u8]) -> Result<Option<String>> {
        if !self.uploads_enabled() {
            info!("screenshot upload not enabled for {} mode", self.env);
            return Ok(None);
        }

        let file_name = format!(
            "{}_{}_{}.png",
            task.domain,
            task.locale.replace(':', "_"),
            Local::now().format("%Y-%m-%d_%H-%M-%S")
        );
        let folder = format!("{SCREENSHOT_FOLDER}/run_{}", task.run_id);
        self.save(&folder, &file_name, png).await.map(Some)
    }

    /// Store a record image keyed by alias. Returns the stored path.
    pub async fn save_record_image(&self, alias: &str, image: &RecordImage) -> Result<Option<String>> {
        if !self.uploads_enabled() {
            info!("image upload not enabled for {} mode", self.env);
            return Ok(None);
        }
        if alias.is_empty() || image.bytes.is_empty() || image.extension.is_empty() {
            warn!("not uploading invalid record image for alias {alias:?}");
            return Ok(None);
        }

        let file_name = format!("{alias}.{}", image.extension);
        self.save(RECORD_IMAGE_FOLDER, &file_name, &image.bytes)
            .await
            .map(Some)
    }

    fn uploads_enabled(&self) -> bool {
        matches!(self.env, Env::Stage | Env::Prod)
    }

    async fn save(&self, folder: &str, file_name: &str, bytes: &[u8]) -> Result<String> {
        let dir = self.root.join(folder);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating blob folder {}", dir.display()))?;
        let path = dir.join(file_name);
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing blob {}", path.display()))?;
        Ok(path.display().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_of_known_bytes() {
        assert_eq!(
            hash_bytes(b"123").as_deref(),
            Some("a665a45920422f9d417e4867efdc4fb8a04a1f3fff1fa07e998e86f7f7a27ae3")
        );
    }

    #[test]
    fn identical_bytes_hash_identically_regardless_of_source() {
        let a = RecordImage::new("https://a.example/img.jpg".into(), "jpg".into(), b"same".to_vec());
        let b = RecordImage::new("https://b.example/other.png".into(), "png".into(), b"same".to_vec());
        assert_eq!(a.hash, b.hash);
    }

    #[test]
    fn empty_image_has_no_hash() {
        assert_eq!(hash_bytes(b""), None);
        let image = RecordImage::new("https://a.example/x".into(), "jpg".into(), Vec::new());
        assert_eq!(image.hash, None);
    }

    #[tokio::test]
    async fn blob_store_writes_record_images_under_their_folder() {
        let dir = tempfile::tempdir().expect("temp dir");
        let blob = BlobStore::new(dir.path().to_path_buf(), Env::Stage);
        let image = RecordImage::new("https://a.example/x.jpg".into(), "jpg".into(), b"bytes".to_vec());

        let stored = blob
            .save_record_image("autos_12345", &image)
            .await
            .expect("save succeeds")
            .expect("path returned");
        assert!(stored.contains("record_images"));
        assert!(stored.ends_with("autos_12345.jpg"));
        assert!(std::path::Path::new(&stored).exists());
    }

    #[tokio::test]
    async fn dev_environment_skips_uploads() {
        let dir = tempfile::tempdir().expect("temp dir");
        let blob = BlobStore::new(dir.path().to_path_buf(), Env::Dev);
        let image = RecordImage::new("https://a.example/x.jpg".into(), "jpg".into(), b"bytes".to_vec());
        let stored = blob.save_record_image("autos_1", &image).await.expect("no error");
        assert_eq!(stored, None);
    }
}
