// Manifest parser: fetches HLS playlists and scans them line by line for
// quality variants (master manifest) or segment references (media manifest).

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use tracing::{debug, trace, warn};
use url::Url;

use crate::error::DownloadError;
use crate::variant::QualityVariant;

const STREAM_INF_TAG: &str = "#EXT-X-STREAM-INF:";

/// Extensions that mark a plain line as a segment reference, matched before
/// any trailing query string.
const SEGMENT_EXTENSIONS: &[&str] = &[".ts", ".m4s", ".jpeg", ".jpg"];

static BANDWIDTH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"BANDWIDTH=(\d+)").expect("valid regex"));
static RESOLUTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"RESOLUTION=(\d+)x(\d+)").expect("valid regex"));

/// Source of manifest text. The HTTP implementation is the production
/// one; tests substitute their own.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ManifestSource: Send + Sync {
    async fn fetch_manifest(&self, url: &Url) -> Result<String, DownloadError>;
}

pub struct HttpManifestSource {
    client: Client,
}

impl HttpManifestSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ManifestSource for HttpManifestSource {
    async fn fetch_manifest(&self, url: &Url) -> Result<String, DownloadError> {
        trace!(url = %url, "fetching manifest");
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| DownloadError::manifest_fetch(url.as_str(), e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::http_status(
                status,
                url.as_str(),
                "manifest fetch",
            ));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| DownloadError::manifest_fetch(url.as_str(), e))?;

        String::from_utf8(bytes.to_vec()).map_err(|_| DownloadError::ManifestDecode {
            url: url.to_string(),
        })
    }
}

pub struct ManifestParser {
    source: Arc<dyn ManifestSource>,
}

impl ManifestParser {
    pub fn new(source: Arc<dyn ManifestSource>) -> Self {
        Self { source }
    }

    /// Production parser fetching manifests over HTTP.
    pub fn over_http(client: Client) -> Self {
        Self::new(Arc::new(HttpManifestSource::new(client)))
    }

    /// Discovers the quality variants a manifest offers, sorted descending
    /// by vertical resolution (unknown resolution sorts last). A manifest
    /// with no stream declarations yields exactly one "Original"
    /// pseudo-variant pointing at the manifest URL itself.
    pub async fn discover_variants(
        &self,
        manifest_url: &Url,
    ) -> Result<Vec<QualityVariant>, DownloadError> {
        let text = self.source.fetch_manifest(manifest_url).await?;
        let variants = scan_master(&text, manifest_url);
        debug!(url = %manifest_url, count = variants.len(), "discovered quality variants");
        Ok(variants)
    }

    /// Lists the ordered segment URLs of a media manifest. Line order is
    /// preserved exactly; it becomes segment index order.
    pub async fn list_segments(&self, variant_url: &Url) -> Result<Vec<Url>, DownloadError> {
        let text = self.source.fetch_manifest(variant_url).await?;
        let segments = scan_segments(&text, variant_url);
        if segments.is_empty() {
            return Err(DownloadError::EmptyManifest {
                url: variant_url.to_string(),
            });
        }
        debug!(url = %variant_url, count = segments.len(), "listed media segments");
        Ok(segments)
    }
}

/// Scans a master manifest for `#EXT-X-STREAM-INF` declarations. The next
/// non-blank, non-comment line after a declaration is its variant URL;
/// attribute state resets after every declaration+URL pair so nothing leaks
/// across consecutive declarations.
fn scan_master(text: &str, base: &Url) -> Vec<QualityVariant> {
    let mut variants = Vec::new();
    // (bandwidth, resolution) of the declaration awaiting its URL line
    let mut pending: Option<(u64, Option<(u32, u32)>)> = None;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(attributes) = line.strip_prefix(STREAM_INF_TAG) {
            let bandwidth = BANDWIDTH_RE
                .captures(attributes)
                .and_then(|c| c[1].parse::<u64>().ok());
            let resolution = RESOLUTION_RE.captures(attributes).and_then(|c| {
                Some((c[1].parse::<u32>().ok()?, c[2].parse::<u32>().ok()?))
            });
            // BANDWIDTH is required to register a variant
            if bandwidth.is_none() {
                warn!(line, "stream declaration without BANDWIDTH, skipping");
            }
            pending = bandwidth.map(|b| (b, resolution));
            continue;
        }

        if line.starts_with('#') {
            continue;
        }

        if let Some((bandwidth, resolution)) = pending.take() {
            match resolve_reference(base, line) {
                Ok(url) => variants.push(QualityVariant::new(bandwidth, resolution, url)),
                Err(e) => warn!(line, error = %e, "unresolvable variant URL, skipping"),
            }
        }
    }

    if variants.is_empty() {
        // flat / single-quality manifest
        return vec![QualityVariant::original(base.clone())];
    }

    // Descending by height, unknown last; stable, so declaration order is
    // kept for equal heights.
    variants.sort_by_key(|v| std::cmp::Reverse(v.height.unwrap_or(0)));
    variants
}

/// Scans a media manifest for segment references, preserving line order.
fn scan_segments(text: &str, base: &Url) -> Vec<Url> {
    let mut segments = Vec::new();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if !is_segment_line(line) {
            continue;
        }
        match resolve_reference(base, line) {
            Ok(url) => segments.push(url),
            Err(e) => warn!(line, error = %e, "unresolvable segment URL, skipping"),
        }
    }

    segments
}

/// A plain line is a segment reference if it ends in a known segment
/// extension (query string ignored), or, as a fallback, if it is schemeless
/// and does not point at a nested manifest.
fn is_segment_line(line: &str) -> bool {
    let path = line.split('?').next().unwrap_or(line);
    let lower = path.to_ascii_lowercase();
    if SEGMENT_EXTENSIONS.iter().any(|ext| lower.ends_with(ext)) {
        return true;
    }
    !line.contains("://") && !lower.ends_with(".m3u8")
}

/// Resolves a manifest reference against the manifest's own URL per
/// RFC 3986: absolute references pass through, relative ones resolve
/// against the base URL's directory, with `../` consuming path levels.
pub(crate) fn resolve_reference(base: &Url, reference: &str) -> Result<Url, DownloadError> {
    base.join(reference)
        .map_err(|e| DownloadError::invalid_url(reference, e.to_string()))
}
