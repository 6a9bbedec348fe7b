use std::path::PathBuf;
use std::time::Duration;

use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, HeaderMap, HeaderValue};

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36";

/// Default number of segment requests in flight at once.
pub const DEFAULT_CONCURRENCY: usize = 5;

/// Configurable options for one downloader instance.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Maximum segment requests in flight simultaneously.
    pub concurrency: usize,

    /// Overall timeout for a single HTTP request. Zero disables it.
    pub timeout: Duration,

    /// Connection timeout (time to establish the initial connection).
    pub connect_timeout: Duration,

    /// User agent string sent on every manifest and segment request.
    pub user_agent: String,

    /// Extra HTTP headers for requests.
    pub headers: HeaderMap,

    /// Parent directory for session workspaces. Defaults to the system
    /// temporary directory when unset.
    pub staging_root: Option<PathBuf>,

    /// Options for the reassembly stage.
    pub reassembly: ReassemblyConfig,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            timeout: Duration::from_secs(0),
            connect_timeout: Duration::from_secs(30),
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: DownloadConfig::get_default_headers(),
            staging_root: None,
            reassembly: ReassemblyConfig::default(),
        }
    }
}

impl DownloadConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Browser-like header set sent with every request.
    pub fn get_default_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/vnd.apple.mpegurl, video/*, image/*, */*"),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
        headers
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_staging_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.staging_root = Some(root.into());
        self
    }

    pub fn with_reassembly(mut self, reassembly: ReassemblyConfig) -> Self {
        self.reassembly = reassembly;
        self
    }
}

/// Options for the reassembly stage.
#[derive(Debug, Clone)]
pub struct ReassemblyConfig {
    /// Presentation duration of each frame on the frame-sequence path.
    /// Frame-sequence sources are slide-show style, one still per segment.
    pub frame_duration: Duration,

    /// JPEG quality (1-100) used when re-encoding frames into the
    /// synthetic video track.
    pub jpeg_quality: u8,
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        Self {
            frame_duration: Duration::from_secs(4),
            jpeg_quality: 85,
        }
    }
}

impl ReassemblyConfig {
    pub fn with_frame_duration(mut self, frame_duration: Duration) -> Self {
        self.frame_duration = frame_duration;
        self
    }

    pub fn with_jpeg_quality(mut self, quality: u8) -> Self {
        self.jpeg_quality = quality.clamp(1, 100);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = DownloadConfig::default();
        assert_eq!(config.concurrency, 5);
        assert_eq!(config.reassembly.frame_duration, Duration::from_secs(4));
        assert!(config.staging_root.is_none());
    }

    #[test]
    fn concurrency_of_zero_is_clamped_to_one() {
        let config = DownloadConfig::default().with_concurrency(0);
        assert_eq!(config.concurrency, 1);
    }

    #[test]
    fn jpeg_quality_is_clamped_to_valid_range() {
        let config = ReassemblyConfig::default().with_jpeg_quality(0);
        assert_eq!(config.jpeg_quality, 1);
        let config = ReassemblyConfig::default().with_jpeg_quality(200);
        assert_eq!(config.jpeg_quality, 100);
    }
}
