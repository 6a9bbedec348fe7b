// Segment fetcher: bounded-concurrency retrieval of an ordered segment
// list into the session workspace. Completion order is unordered; the
// returned file list is re-sorted into segment index order.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use url::Url;

use crate::error::DownloadError;
use crate::progress::ProgressTracker;
use crate::sniff::SegmentKind;
use crate::workspace::{PARTIAL_SUFFIX, SessionWorkspace};

/// Source of raw segment bytes. The HTTP implementation is the production
/// one; tests substitute their own.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SegmentSource: Send + Sync {
    async fn fetch_segment(&self, url: &Url) -> Result<Bytes, DownloadError>;
}

pub struct HttpSegmentSource {
    client: Client,
}

impl HttpSegmentSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SegmentSource for HttpSegmentSource {
    async fn fetch_segment(&self, url: &Url) -> Result<Bytes, DownloadError> {
        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::http_status(
                status,
                url.as_str(),
                "segment fetch",
            ));
        }
        Ok(response.bytes().await?)
    }
}

pub struct SegmentFetcher {
    source: Arc<dyn SegmentSource>,
    concurrency: usize,
}

impl SegmentFetcher {
    pub fn new(source: Arc<dyn SegmentSource>, concurrency: usize) -> Self {
        Self {
            source,
            concurrency: concurrency.max(1),
        }
    }

    /// Downloads every segment into the workspace, at most `concurrency`
    /// in flight, refilling the pool as workers finish. Cancellation is
    /// checked at every dispatch boundary; no new segment is started once
    /// it is observed.
    pub async fn fetch(
        &self,
        segments: &[Url],
        workspace: &SessionWorkspace,
        tracker: &ProgressTracker,
        token: &CancellationToken,
    ) -> Result<Vec<PathBuf>, DownloadError> {
        let total = segments.len();
        let mut queue = segments.iter().cloned().enumerate();
        let mut in_flight = FuturesUnordered::new();
        let mut completed: Vec<(usize, PathBuf)> = Vec::with_capacity(total);

        debug!(total, concurrency = self.concurrency, "starting segment fetch");

        loop {
            // refill to the configured width; this is the dispatch
            // boundary where cancellation takes effect
            while in_flight.len() < self.concurrency && !token.is_cancelled() {
                let Some((index, url)) = queue.next() else { break };
                in_flight.push(self.download_one(index, url, workspace));
            }

            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                biased;

                _ = token.cancelled() => {
                    debug!(
                        abandoned = in_flight.len(),
                        "cancellation observed mid-fetch"
                    );
                    return Err(DownloadError::Cancelled);
                }

                result = in_flight.next() => {
                    if let Some(result) = result {
                        let (index, path, byte_count) = result?;
                        trace!(index, bytes = byte_count, "segment completed");
                        tracker.record_segment(byte_count);
                        completed.push((index, path));
                    }
                }
            }
        }

        if token.is_cancelled() && completed.len() < total {
            return Err(DownloadError::Cancelled);
        }

        // completion order is arbitrary; reassembly depends on this re-sort
        completed.sort_by_key(|(index, _)| *index);
        Ok(completed.into_iter().map(|(_, path)| path).collect())
    }

    async fn download_one(
        &self,
        index: usize,
        url: Url,
        workspace: &SessionWorkspace,
    ) -> Result<(usize, PathBuf, u64), DownloadError> {
        trace!(index, url = %url, "fetching segment");
        let bytes = self
            .source
            .fetch_segment(&url)
            .await
            .map_err(|source| DownloadError::segment_fetch(index, source))?;

        let kind = SegmentKind::sniff(&bytes);
        let path = workspace.segment_path(index, kind.extension());
        // write-then-rename, so the workspace only ever holds complete
        // segment files
        let staging = path.with_extension(PARTIAL_SUFFIX);
        let write_result = async {
            tokio::fs::write(&staging, &bytes).await?;
            tokio::fs::rename(&staging, &path).await
        }
        .await;
        write_result.map_err(|e| DownloadError::segment_fetch(index, e.into()))?;

        Ok((index, path, bytes.len() as u64))
    }
}
