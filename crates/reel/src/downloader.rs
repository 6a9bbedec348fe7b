// Download orchestrator: quality discovery plus the linear pipeline
// (list segments → fetch → reassemble → finalize → catalog) behind a
// handle with live progress and cooperative cancellation. The workspace
// is removed on every exit path; on failure or cancellation no partial
// artifact is left at the destination.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

use crate::catalog::{CatalogEntry, DownloadCatalog, NullCatalog};
use crate::client::build_client;
use crate::config::DownloadConfig;
use crate::error::{DownloadError, FailureClass};
use crate::fetch::{HttpSegmentSource, SegmentFetcher, SegmentSource};
use crate::manifest::{HttpManifestSource, ManifestParser, ManifestSource};
use crate::progress::{DownloadProgress, DownloadState, ProgressCallback, ProgressTracker};
use crate::reassemble::mp4::Mp4SinkFactory;
use crate::reassemble::{FrameSinkFactory, Reassembler};
use crate::variant::QualityVariant;
use crate::workspace::SessionWorkspace;

pub struct HlsDownloader {
    config: DownloadConfig,
    manifest_source: Arc<dyn ManifestSource>,
    source: Arc<dyn SegmentSource>,
    sink_factory: Arc<dyn FrameSinkFactory>,
    catalog: Arc<dyn DownloadCatalog>,
}

impl HlsDownloader {
    pub fn new(config: DownloadConfig) -> Result<Self, DownloadError> {
        let client = build_client(&config)?;
        Ok(Self {
            manifest_source: Arc::new(HttpManifestSource::new(client.clone())),
            source: Arc::new(HttpSegmentSource::new(client)),
            sink_factory: Arc::new(Mp4SinkFactory::new(config.reassembly.jpeg_quality)),
            catalog: Arc::new(NullCatalog),
            config,
        })
    }

    pub fn with_manifest_source(mut self, manifest_source: Arc<dyn ManifestSource>) -> Self {
        self.manifest_source = manifest_source;
        self
    }

    pub fn with_segment_source(mut self, source: Arc<dyn SegmentSource>) -> Self {
        self.source = source;
        self
    }

    pub fn with_sink_factory(mut self, sink_factory: Arc<dyn FrameSinkFactory>) -> Self {
        self.sink_factory = sink_factory;
        self
    }

    pub fn with_catalog(mut self, catalog: Arc<dyn DownloadCatalog>) -> Self {
        self.catalog = catalog;
        self
    }

    /// Side-effect-free quality discovery for the given manifest URL.
    pub async fn discover_qualities(
        &self,
        manifest_url: &str,
    ) -> Result<Vec<QualityVariant>, DownloadError> {
        let url = Url::parse(manifest_url)
            .map_err(|e| DownloadError::invalid_url(manifest_url, e.to_string()))?;
        ManifestParser::new(Arc::clone(&self.manifest_source))
            .discover_variants(&url)
            .await
    }

    /// Starts the full pipeline asynchronously and returns immediately
    /// with a handle exposing live progress and a cancel operation.
    pub fn start_download(
        &self,
        variant: QualityVariant,
        destination_name: &str,
        destination_folder: &Path,
        on_progress: Option<ProgressCallback>,
    ) -> DownloadHandle {
        let session_id = Uuid::new_v4();
        let (tracker, progress) = ProgressTracker::new(session_id, on_progress);
        let token = CancellationToken::new();

        let file_name = output_file_name(destination_name);
        let pipeline = Pipeline {
            session_id,
            variant,
            destination_folder: destination_folder.to_path_buf(),
            file_name,
            config: self.config.clone(),
            parser: ManifestParser::new(Arc::clone(&self.manifest_source)),
            fetcher: SegmentFetcher::new(Arc::clone(&self.source), self.config.concurrency),
            reassembler: Reassembler::new(
                Arc::clone(&self.sink_factory),
                self.config.reassembly.clone(),
            ),
            catalog: Arc::clone(&self.catalog),
            tracker,
            token: token.clone(),
        };

        let join = tokio::spawn(pipeline.run());
        DownloadHandle {
            id: session_id,
            token,
            progress,
            join,
        }
    }
}

/// Live handle to one running download.
pub struct DownloadHandle {
    id: Uuid,
    token: CancellationToken,
    progress: watch::Receiver<DownloadProgress>,
    join: JoinHandle<Result<PathBuf, DownloadError>>,
}

impl DownloadHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Requests cooperative cancellation. Idempotent; a no-op once the
    /// session is terminal.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Subscription to progress snapshots.
    pub fn progress(&self) -> watch::Receiver<DownloadProgress> {
        self.progress.clone()
    }

    pub fn latest(&self) -> DownloadProgress {
        self.progress.borrow().clone()
    }

    /// Waits for the pipeline to settle, returning the final file path.
    pub async fn wait(self) -> Result<PathBuf, DownloadError> {
        match self.join.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(DownloadError::Cancelled),
            Err(e) => Err(DownloadError::configuration(format!(
                "download pipeline panicked: {e}"
            ))),
        }
    }
}

struct Pipeline {
    session_id: Uuid,
    variant: QualityVariant,
    destination_folder: PathBuf,
    file_name: String,
    config: DownloadConfig,
    parser: ManifestParser,
    fetcher: SegmentFetcher,
    reassembler: Reassembler,
    catalog: Arc<dyn DownloadCatalog>,
    tracker: ProgressTracker,
    token: CancellationToken,
}

impl Pipeline {
    async fn run(self) -> Result<PathBuf, DownloadError> {
        let result = self.execute().await;
        match &result {
            Ok(path) => {
                info!(
                    session = %self.session_id,
                    path = %path.display(),
                    "download completed"
                );
                self.tracker.complete();
            }
            Err(e) if e.is_cancelled() => {
                info!(session = %self.session_id, "download cancelled");
                self.tracker.cancel();
            }
            Err(e) => {
                let class = e.classify().unwrap_or(FailureClass::Internal);
                warn!(session = %self.session_id, error = %e, "download failed");
                self.tracker.fail(class);
            }
        }
        result
    }

    async fn execute(&self) -> Result<PathBuf, DownloadError> {
        self.tracker.set_state(DownloadState::DiscoveringQualities);
        let segments = self.parser.list_segments(&self.variant.url).await?;
        if self.token.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        let workspace =
            SessionWorkspace::create(self.config.staging_root.as_deref(), self.session_id)?;
        let result = self.stages(&workspace, &segments).await;

        // guaranteed removal on every exit path
        if let Err(e) = workspace.remove().await {
            warn!(session = %self.session_id, error = %e, "workspace removal failed");
        }
        result
    }

    async fn stages(
        &self,
        workspace: &SessionWorkspace,
        segments: &[Url],
    ) -> Result<PathBuf, DownloadError> {
        self.tracker.begin_fetch(segments.len());
        let files = self
            .fetcher
            .fetch(segments, workspace, &self.tracker, &self.token)
            .await?;

        self.tracker.set_state(DownloadState::Reassembling);
        let base_name = output_base_name(&self.file_name);
        let assembled = self
            .reassembler
            .reassemble(&files, workspace, &base_name, &self.token)
            .await?;
        if self.token.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        self.tracker.set_state(DownloadState::Finalizing);
        let destination = self.finalize(&assembled).await?;

        // the output already exists at the destination; a metadata or
        // catalog hiccup must not fail the completed download
        let size_bytes = file_size_or_zero(&destination).await;
        let entry = CatalogEntry {
            file_name: self.file_name.clone(),
            path: destination.clone(),
            size_bytes,
            mime_type: "video/mp4".to_owned(),
            folder: self.destination_folder.clone(),
        };
        if let Err(e) = self.catalog.record(&entry).await {
            warn!(session = %self.session_id, error = %e, "catalog record failed");
        }

        Ok(destination)
    }

    /// Moves the assembled file into the destination folder, replacing any
    /// pre-existing file of the same name. A cross-device move copies to a
    /// hidden staging name first, so the destination never holds a partial
    /// file under its final name.
    async fn finalize(&self, assembled: &Path) -> Result<PathBuf, DownloadError> {
        tokio::fs::create_dir_all(&self.destination_folder).await?;
        let destination = self.destination_folder.join(&self.file_name);

        if tokio::fs::rename(assembled, &destination).await.is_err() {
            let staging = self
                .destination_folder
                .join(format!(".{}.part", self.file_name));
            if let Err(e) = tokio::fs::copy(assembled, &staging).await {
                let _ = tokio::fs::remove_file(&staging).await;
                return Err(e.into());
            }
            if let Err(e) = tokio::fs::rename(&staging, &destination).await {
                let _ = tokio::fs::remove_file(&staging).await;
                return Err(e.into());
            }
        }

        Ok(destination)
    }
}

async fn file_size_or_zero(path: &Path) -> u64 {
    match tokio::fs::metadata(path).await {
        Ok(metadata) => metadata.len(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "file metadata unavailable");
            0
        }
    }
}

/// Extensions accepted as-is on a destination name; anything else gets
/// `.mp4` attached.
const CONTAINER_EXTENSIONS: &[&str] = &["mp4", "mkv", "mov", "m4v", "ts", "webm", "avi"];

/// Sanitizes the caller-provided destination name and ensures a container
/// extension: a manifest extension is replaced with `.mp4`, a missing or
/// unrecognized one has `.mp4` appended.
fn output_file_name(destination_name: &str) -> String {
    let sanitized: String = destination_name
        .chars()
        .map(|c| if matches!(c, '/' | '\\') { '_' } else { c })
        .collect();
    let trimmed = sanitized.trim();
    let name = if trimmed.is_empty() { "download" } else { trimmed };

    match Path::new(name).extension().and_then(|e| e.to_str()) {
        Some(ext) if CONTAINER_EXTENSIONS.iter().any(|c| ext.eq_ignore_ascii_case(c)) => {
            name.to_owned()
        }
        Some(ext) if ext.eq_ignore_ascii_case("m3u8") => {
            format!("{}.mp4", output_base_name(name))
        }
        _ => format!("{name}.mp4"),
    }
}

fn output_base_name(file_name: &str) -> String {
    Path::new(file_name)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_owned())
}
