//! Docker Registry v1 client (SPEC_FULL.md §4.8, §12).
//!
//! Uses `reqwest`'s blocking client: the registry calls are a small, bounded
//! sequence of sequential requests per invocation, not a throughput-sensitive
//! streaming pipeline, matching the sibling `tinyort` reference repo's choice
//! of `reqwest` (blocking) for the same kind of one-shot registry fetch.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::{debug, info};

use crate::dockerfile::{ImageMetadataResolver, ImageSpec};
use crate::store::metadata::{from_docker_metadata, DockerMetadata};

pub const DEFAULT_INDEX: &str = "https://index.docker.io";

pub struct ImageRepository {
    index_url: String,
    storage_dir: PathBuf,
    client: reqwest::blocking::Client,
    token: std::cell::RefCell<Option<String>>,
    repositories: std::cell::RefCell<Vec<String>>,
}

impl ImageRepository {
    pub fn new(index_url: impl Into<String>, storage_dir: impl Into<PathBuf>) -> Self {
        ImageRepository {
            index_url: index_url.into(),
            storage_dir: storage_dir.into(),
            client: reqwest::blocking::Client::new(),
            token: std::cell::RefCell::new(None),
            repositories: std::cell::RefCell::new(Vec::new()),
        }
    }

    /// `GET /v1/repositories/{img}/images` — obtains an auth token and the
    /// list of repository endpoints to try.
    pub fn request_access(&self, image: &str) -> Result<()> {
        info!(image, index_url = %self.index_url, "requesting registry access");
        let url = format!("{}/v1/repositories/{}/images", self.index_url, image);
        let response = self
            .client
            .get(&url)
            .header("X-Docker-Token", "true")
            .send()
            .context("registry access request failed")?;
        let response = response.error_for_status().context("registry access denied")?;

        let token = response
            .headers()
            .get("X-Docker-Token")
            .and_then(|v| v.to_str().ok())
            .map(String::from);

        let protocol = self.index_url.split(':').next().unwrap_or("https");
        let repositories: Vec<String> = response
            .headers()
            .get("X-Docker-Endpoints")
            .and_then(|v| v.to_str().ok())
            .map(|endpoints| {
                endpoints
                    .split(',')
                    .map(|e| format!("{protocol}://{}", e.trim()))
                    .collect()
            })
            .unwrap_or_default();

        *self.token.borrow_mut() = token;
        *self.repositories.borrow_mut() = if repositories.is_empty() {
            vec![self.index_url.clone()]
        } else {
            repositories
        };
        Ok(())
    }

    /// Try every known repository endpoint for `path`: a 404 raises
    /// immediately, a 200 returns immediately, anything else falls through to
    /// the next endpoint, and the last response's error is raised if none
    /// succeed.
    fn repository_request(&self, path: &str) -> Result<reqwest::blocking::Response> {
        let repositories = self.repositories.borrow().clone();
        if repositories.is_empty() {
            bail!("no repositories to choose from, call request_access() first");
        }

        let mut builder_headers = reqwest::header::HeaderMap::new();
        if let Some(token) = self.token.borrow().as_ref() {
            builder_headers.insert(
                "Authorization",
                format!("Token {token}").parse().context("invalid token header")?,
            );
        }

        let mut last_err = None;
        for repo in &repositories {
            let url = format!("{repo}{path}");
            debug!(url, "registry request");
            let response = self
                .client
                .get(&url)
                .headers(builder_headers.clone())
                .send();
            match response {
                Ok(resp) if resp.status() == reqwest::StatusCode::NOT_FOUND => {
                    bail!("registry returned 404 for {url}");
                }
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) => last_err = Some(format!("{url}: HTTP {}", resp.status())),
                Err(e) => last_err = Some(format!("{url}: {e}")),
            }
        }
        bail!(
            "all registry endpoints failed: {}",
            last_err.unwrap_or_else(|| "no endpoints tried".to_string())
        )
    }

    pub fn list_tags(&self, image: &str) -> Result<BTreeMap<String, String>> {
        let resp = self.repository_request(&format!("/v1/repositories/{image}/tags"))?;
        Ok(resp.json()?)
    }

    pub fn ancestors(&self, image_id: &str) -> Result<Vec<String>> {
        let resp = self.repository_request(&format!("/v1/images/{image_id}/ancestry"))?;
        Ok(resp.json()?)
    }

    pub fn image_metadata(&self, image_id: &str) -> Result<DockerMetadata> {
        let resp = self.repository_request(&format!("/v1/images/{image_id}/json"))?;
        Ok(resp.json()?)
    }

    fn image_layer(&self, image_id: &str) -> Result<reqwest::blocking::Response> {
        self.repository_request(&format!("/v1/images/{image_id}/layer"))
    }

    fn layer_path(&self, image_id: &str) -> PathBuf {
        self.storage_dir.join(image_id)
    }

    fn metadata_path(&self, image_id: &str) -> PathBuf {
        self.storage_dir.join(format!("{image_id}.json"))
    }

    pub fn download_metadata(&self, image_id: &str, force: bool) -> Result<DockerMetadata> {
        let path = self.metadata_path(image_id);
        if !force && path.exists() {
            let text = std::fs::read_to_string(&path)?;
            return Ok(serde_json::from_str(&text)?);
        }
        std::fs::create_dir_all(&self.storage_dir)?;
        let metadata = self.image_metadata(image_id)?;
        std::fs::write(&path, serde_json::to_string(&metadata)?)?;
        Ok(metadata)
    }

    pub fn download_image(&self, image_id: &str, force: bool) -> Result<PathBuf> {
        let path = self.layer_path(image_id);
        if !force && path.exists() {
            return Ok(path);
        }
        std::fs::create_dir_all(&self.storage_dir)?;
        info!(image_id, "downloading layer");
        let mut response = self.image_layer(image_id)?;
        let mut file = std::fs::File::create(&path)?;
        let mut downloaded = 0u64;
        let mut buf = [0u8; 1 << 16];
        loop {
            let n = std::io::Read::read(&mut response, &mut buf)?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n])?;
            downloaded += n as u64;
            debug!(downloaded_kb = downloaded >> 10, "layer download progress");
        }
        Ok(path)
    }

    fn resolve_tag(&self, image: &str, tag: &str) -> Result<String> {
        self.request_access(image)?;
        let tags = self.list_tags(image)?;
        tags.get(tag)
            .cloned()
            .with_context(|| format!("no such tag: {image}:{tag}"))
    }

    /// Download the full ancestry of `image:tag`, top first as returned by
    /// the registry. Returns each ancestor's metadata, root-first.
    pub fn pull(&self, image: &str, tag: &str, force: bool) -> Result<Vec<DockerMetadata>> {
        let target_id = self.resolve_tag(image, tag)?;
        let mut ancestry = self.ancestors(&target_id)?;
        ancestry.reverse();
        let mut metadata = Vec::with_capacity(ancestry.len());
        for image_id in ancestry {
            self.download_image(&image_id, force)?;
            metadata.push(self.download_metadata(&image_id, force)?);
        }
        Ok(metadata)
    }

    /// Unpack `image:tag` into `target_dir`: extract each ancestor's layer in
    /// reverse order (root first), observing whiteouts, so the final content
    /// for any path is the topmost non-whiteout entry (Testable Scenario S7).
    pub fn unpack(&self, target_dir: &Path, image: &str, tag: &str, force: bool) -> Result<()> {
        let target_id = self.resolve_tag(image, tag)?;
        std::fs::create_dir_all(target_dir)?;

        let mut ancestry = self.ancestors(&target_id)?;
        ancestry.reverse();
        for image_id in &ancestry {
            let layer_path = self.download_image(image_id, force)?;
            extract_layer(&layer_path, target_dir)?;
        }
        info!(image, tag, target = %target_dir.display(), "unpacked image");
        Ok(())
    }

    pub fn ancestry(&self, image: &str, tag: &str) -> Result<Vec<String>> {
        let target_id = self.resolve_tag(image, tag)?;
        let mut ancestry = self.ancestors(&target_id)?;
        ancestry.reverse();
        Ok(ancestry)
    }

    pub fn metadata(&self, image: &str, tag: &str, use_cache: bool) -> Result<DockerMetadata> {
        let target_id = self.resolve_tag(image, tag)?;
        if use_cache {
            let path = self.metadata_path(&target_id);
            if path.exists() {
                let text = std::fs::read_to_string(&path)?;
                return Ok(serde_json::from_str(&text)?);
            }
        }
        self.image_metadata(&target_id)
    }
}

/// Extract a single tar layer into `target_dir` using the `tar` crate's
/// streaming reader, deleting the named file for any `.wh.X` whiteout entry
/// instead of writing it (§4.7's whiteout handling).
fn extract_layer(layer_path: &Path, target_dir: &Path) -> Result<()> {
    let file = std::fs::File::open(layer_path)
        .with_context(|| format!("failed to open layer {}", layer_path.display()))?;
    let mut archive = tar::Archive::new(file);
    archive.set_preserve_permissions(true);
    archive.set_unpack_xattrs(true);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let file_name = path
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or_default();

        if let Some(victim) = file_name.strip_prefix(".wh.") {
            let victim_path = target_dir.join(path.with_file_name(victim));
            if victim_path.is_dir() {
                std::fs::remove_dir_all(&victim_path).ok();
            } else {
                std::fs::remove_file(&victim_path).ok();
            }
            continue;
        }

        entry.unpack_in(target_dir)?;
    }
    Ok(())
}

impl ImageMetadataResolver for ImageRepository {
    fn resolve(&self, name: &str, tag: &str) -> Result<(String, ImageSpec)> {
        let target_id = self.resolve_tag(name, tag)?;
        let metadata = self.download_metadata(&target_id, false)?;
        Ok((target_id, from_docker_metadata(&metadata)))
    }
}
