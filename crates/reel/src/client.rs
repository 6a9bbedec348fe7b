use reqwest::Client;

use crate::config::DownloadConfig;
use crate::error::DownloadError;

/// Builds the shared HTTP client used for every manifest and segment
/// request of one downloader instance.
pub fn build_client(config: &DownloadConfig) -> Result<Client, DownloadError> {
    let mut builder = Client::builder()
        .user_agent(config.user_agent.clone())
        .default_headers(config.headers.clone())
        .connect_timeout(config.connect_timeout)
        .gzip(true)
        .deflate(true);

    if !config.timeout.is_zero() {
        builder = builder.timeout(config.timeout);
    }

    builder
        .build()
        .map_err(|e| DownloadError::configuration(format!("failed to build HTTP client: {e}")))
}
