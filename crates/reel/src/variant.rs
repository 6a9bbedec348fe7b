use serde::Serialize;
use url::Url;
use uuid::Uuid;

/// One selectable quality rendition of a stream. Immutable once built by
/// the manifest parser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QualityVariant {
    /// Stable identifier, unique per parse.
    pub id: Uuid,
    /// Human-readable resolution label, e.g. `1080p` or `Original`.
    pub label: String,
    /// Declared bandwidth in bits per second. Zero when unknown.
    pub bandwidth: u64,
    /// Absolute URL of the variant's media manifest.
    pub url: Url,
    /// Pixel width, when the manifest declares a RESOLUTION.
    pub width: Option<u32>,
    /// Pixel height, when the manifest declares a RESOLUTION.
    pub height: Option<u32>,
}

impl QualityVariant {
    pub fn new(bandwidth: u64, resolution: Option<(u32, u32)>, url: Url) -> Self {
        let (width, height) = match resolution {
            Some((w, h)) => (Some(w), Some(h)),
            None => (None, None),
        };
        let label = match height {
            Some(h) => format!("{h}p"),
            None => "Original".to_owned(),
        };
        Self {
            id: Uuid::new_v4(),
            label,
            bandwidth,
            url,
            width,
            height,
        }
    }

    /// Pseudo-variant synthesized for a manifest with no stream
    /// declarations: the manifest URL itself is the media manifest.
    pub fn original(manifest_url: Url) -> Self {
        Self::new(0, None, manifest_url)
    }
}
