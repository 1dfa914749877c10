use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use report_schema::{ImageSizeRecord, MeasuredImage, bytes_to_gb};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::config::RegistrySettings;
use crate::container_runtime;
use crate::http::{FetchError, HttpRequest, Transport};
use crate::store::Store;

pub const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";

/// How (and whether) to measure the uncompressed image size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UncompressedStrategy {
    None,
    /// Sum of `Content-Length` over the config's `rootfs.diff_ids` blobs.
    /// Best effort: most registries only serve blobs by compressed digest.
    BlobContentLength,
    /// Pull with docker or podman and read the inspected size.
    ContainerRuntime,
}

impl FromStr for UncompressedStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(UncompressedStrategy::None),
            "blob-content-length" => Ok(UncompressedStrategy::BlobContentLength),
            "container-runtime" => Ok(UncompressedStrategy::ContainerRuntime),
            other => bail!(
                "unknown uncompressed size strategy {other:?} \
                 (expected none, blob-content-length or container-runtime)"
            ),
        }
    }
}

// ── Wire types ───────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

/// Either a manifest list / OCI index or a single image manifest; which one
/// is decided by the presence of `manifests`.
#[derive(Debug, Deserialize)]
struct ManifestDocument {
    #[serde(rename = "mediaType", default)]
    media_type: Option<String>,
    #[serde(default)]
    manifests: Option<Vec<PlatformManifest>>,
    #[serde(default)]
    config: Option<Descriptor>,
    #[serde(default)]
    layers: Option<Vec<Descriptor>>,
}

#[derive(Debug, Deserialize)]
struct PlatformManifest {
    digest: String,
    #[serde(default)]
    platform: Option<Platform>,
}

#[derive(Debug, Deserialize)]
struct Platform {
    architecture: String,
}

#[derive(Debug, Deserialize)]
struct Descriptor {
    digest: String,
    #[serde(default)]
    size: u64,
}

#[derive(Debug, Deserialize)]
struct ImageConfigBlob {
    rootfs: RootFs,
}

#[derive(Debug, Deserialize)]
struct RootFs {
    #[serde(default)]
    diff_ids: Vec<String>,
}

// ── Resolved values ──────────────────────────────────────

/// The parts of a platform manifest the report needs. This is what gets
/// cached per tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedManifest {
    pub digest: Option<String>,
    pub config_digest: Option<String>,
    pub layer_sizes: Vec<u64>,
}

impl ResolvedManifest {
    pub fn compressed_size(&self) -> u64 {
        self.layer_sizes.iter().sum()
    }

    pub fn layer_count(&self) -> usize {
        self.layer_sizes.len()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegistryImage {
    pub tag: String,
    pub compressed_size: u64,
    pub uncompressed_size: Option<u64>,
    pub layer_count: usize,
    pub digest: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

/// Result of sizing one tag. An error carries no sizes, so it cannot be
/// mistaken for an empty image.
#[derive(Debug, Clone, PartialEq)]
pub enum ImageSizeOutcome {
    Measured(RegistryImage),
    Error {
        tag: String,
        error: String,
        fetched_at: DateTime<Utc>,
    },
}

impl From<ImageSizeOutcome> for ImageSizeRecord {
    fn from(outcome: ImageSizeOutcome) -> Self {
        match outcome {
            ImageSizeOutcome::Measured(image) => ImageSizeRecord::Measured(MeasuredImage {
                compressed_size_gb: bytes_to_gb(image.compressed_size),
                uncompressed_size_gb: image.uncompressed_size.map(bytes_to_gb),
                tag: image.tag,
                compressed_size_bytes: image.compressed_size,
                uncompressed_size_bytes: image.uncompressed_size,
                num_layers: image.layer_count,
                digest: image.digest,
                fetched_at: image.fetched_at,
            }),
            ImageSizeOutcome::Error {
                tag,
                error,
                fetched_at,
            } => ImageSizeRecord::Failed {
                tag,
                error,
                fetched_at,
            },
        }
    }
}

// ── Client ───────────────────────────────────────────────

/// OCI distribution client scoped to one repository, holding a pull token.
pub struct RegistryClient<T> {
    transport: T,
    base_url: String,
    host: String,
    org: String,
    image: String,
    arch: String,
    uncompressed: UncompressedStrategy,
    token: String,
}

impl<T: Transport> RegistryClient<T> {
    /// Exchange the configured credential (or nothing, for anonymous pulls)
    /// for a pull token. Failing here is fatal: nothing else can be fetched.
    pub async fn authenticate(transport: T, settings: &RegistrySettings) -> Result<Self> {
        let base_url = settings.url.trim_end_matches('/').to_string();
        let mut request = HttpRequest::get(format!("{base_url}/token"))
            .query("service", &settings.service)
            .query(
                "scope",
                format!("repository:{}/{}:pull", settings.org, settings.image),
            )
            .header("Accept", "application/json");
        if let Some(credential) = &settings.credential {
            request = request.header("Authorization", format!("Bearer {credential}"));
        } else {
            tracing::info!("requesting anonymous registry token");
        }

        let response: TokenResponse = transport
            .get_json(&request)
            .await
            .context("requesting registry token")?;
        let Some(token) = response.token.or(response.access_token) else {
            bail!("registry token response has no token");
        };

        Ok(RegistryClient {
            transport,
            base_url,
            host: settings.service.clone(),
            org: settings.org.clone(),
            image: settings.image.clone(),
            arch: settings.arch.clone(),
            uncompressed: settings.uncompressed,
            token,
        })
    }

    #[cfg(test)]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn repo_url(&self) -> String {
        format!("{}/v2/{}/{}", self.base_url, self.org, self.image)
    }

    fn request(&self, url: String) -> HttpRequest {
        HttpRequest::get(url).header("Authorization", format!("Bearer {}", self.token))
    }

    /// Resolve `tag` to the manifest for the configured architecture.
    pub async fn resolve_manifest(&self, tag: &str) -> Result<ResolvedManifest, FetchError> {
        let url = format!("{}/manifests/{tag}", self.repo_url());
        let request = self.request(url.clone()).header(
            "Accept",
            [DOCKER_MANIFEST_LIST, OCI_INDEX, DOCKER_MANIFEST, OCI_MANIFEST].join(", "),
        );
        let response = self
            .transport
            .send(&request)
            .await?
            .error_for_status(&url)?;
        let header_digest = response.header("docker-content-digest").map(str::to_string);
        let document: ManifestDocument = response.json(&url)?;

        let Some(entries) = document.manifests else {
            return resolved(document, header_digest, &url);
        };

        tracing::debug!(
            "{} is a {} with {} entries",
            tag,
            document.media_type.as_deref().unwrap_or("manifest list"),
            entries.len()
        );
        let chosen = entries
            .iter()
            .find(|m| {
                m.platform
                    .as_ref()
                    .is_some_and(|p| p.architecture == self.arch)
            })
            .or_else(|| entries.first())
            .ok_or_else(|| FetchError::Decode {
                url: url.clone(),
                message: "manifest list is empty".to_string(),
            })?;

        let url = format!("{}/manifests/{}", self.repo_url(), chosen.digest);
        let request = self
            .request(url.clone())
            .header("Accept", [DOCKER_MANIFEST, OCI_MANIFEST].join(", "));
        let response = self
            .transport
            .send(&request)
            .await?
            .error_for_status(&url)?;
        let header_digest = response
            .header("docker-content-digest")
            .map(str::to_string)
            .or_else(|| Some(chosen.digest.clone()));
        let document: ManifestDocument = response.json(&url)?;
        resolved(document, header_digest, &url)
    }

    /// [`resolve_manifest`](Self::resolve_manifest) memoized under `docker_<tag>`.
    pub async fn resolve_manifest_cached(
        &self,
        store: &Store,
        tag: &str,
    ) -> Result<ResolvedManifest> {
        store
            .get_or_compute(&format!("docker_{tag}"), move || async move {
                Ok(self.resolve_manifest(tag).await?)
            })
            .await
    }

    /// Size one tag. Never fails: problems become [`ImageSizeOutcome::Error`].
    ///
    /// Pass a store only for immutable tags; a moving tag such as
    /// `universe-devel` must be re-resolved every time.
    pub async fn resolve_image(&self, tag: &str, store: Option<&Store>) -> ImageSizeOutcome {
        let manifest = match store {
            Some(store) => self.resolve_manifest_cached(store, tag).await,
            None => self.resolve_manifest(tag).await.map_err(anyhow::Error::from),
        };
        let fetched_at = Utc::now();
        let manifest = match manifest {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("failed to resolve manifest for {}: {:#}", tag, e);
                return ImageSizeOutcome::Error {
                    tag: tag.to_string(),
                    error: format!("{e:#}"),
                    fetched_at,
                };
            }
        };

        tracing::info!(
            "compressed size for {}: {} bytes ({} layers)",
            tag,
            manifest.compressed_size(),
            manifest.layer_count()
        );
        let uncompressed_size = self.uncompressed_size(tag, &manifest).await;

        ImageSizeOutcome::Measured(RegistryImage {
            tag: tag.to_string(),
            compressed_size: manifest.compressed_size(),
            uncompressed_size,
            layer_count: manifest.layer_count(),
            digest: manifest.digest,
            fetched_at,
        })
    }

    /// `None` when not requested; `Some(0)` when requested but unmeasurable.
    async fn uncompressed_size(&self, tag: &str, manifest: &ResolvedManifest) -> Option<u64> {
        let measured = match self.uncompressed {
            UncompressedStrategy::None => return None,
            UncompressedStrategy::BlobContentLength => self
                .diff_ids_content_length(manifest)
                .await
                .map_err(anyhow::Error::from),
            UncompressedStrategy::ContainerRuntime => {
                let image_ref = format!("{}/{}/{}:{tag}", self.host, self.org, self.image);
                container_runtime::measure_uncompressed(&image_ref, &self.arch).await
            }
        };
        match measured {
            Ok(size) => Some(size),
            Err(e) => {
                tracing::warn!("unable to determine uncompressed size for {}: {:#}", tag, e);
                Some(0)
            }
        }
    }

    async fn diff_ids_content_length(&self, manifest: &ResolvedManifest) -> Result<u64, FetchError> {
        let config_digest = manifest.config_digest.as_deref().ok_or_else(|| FetchError::Decode {
            url: self.repo_url(),
            message: "manifest has no config blob".to_string(),
        })?;
        let config: ImageConfigBlob = self
            .transport
            .get_json(&self.request(format!("{}/blobs/{config_digest}", self.repo_url())))
            .await?;

        let mut total = 0;
        for diff_id in &config.rootfs.diff_ids {
            let url = format!("{}/blobs/{diff_id}", self.repo_url());
            let request = HttpRequest::head(url.clone())
                .header("Authorization", format!("Bearer {}", self.token));
            let response = self.transport.send(&request).await?.error_for_status(&url)?;
            let length = response
                .header("content-length")
                .and_then(|v| v.parse::<u64>().ok())
                .ok_or_else(|| FetchError::Decode {
                    url: url.clone(),
                    message: "missing Content-Length".to_string(),
                })?;
            total += length;
        }
        Ok(total)
    }
}

/// A document without `layers` is not an image manifest (an error body, an
/// unknown media type) and must not be read as a zero-size image.
fn resolved(
    document: ManifestDocument,
    digest: Option<String>,
    url: &str,
) -> Result<ResolvedManifest, FetchError> {
    let layers = document.layers.ok_or_else(|| FetchError::Decode {
        url: url.to_string(),
        message: "not an image manifest".to_string(),
    })?;
    Ok(ResolvedManifest {
        digest,
        config_digest: document.config.map(|c| c.digest),
        layer_sizes: layers.iter().map(|l| l.size).collect(),
    })
}
