//! # reel-engine
//!
//! An adaptive-streaming (HLS) retrieval engine: point it at a manifest
//! URL, discover the available quality variants, and reassemble the
//! chosen variant's segments into a single playable file, with live
//! progress reporting and cooperative cancellation.
//!
//! The pipeline is linear: parse the manifest, fetch segments with
//! bounded concurrency into a session-scoped workspace, reassemble them
//! (transport-stream concatenation or frame synthesis, chosen by content
//! sniffing), then move the result into place. The workspace is removed
//! on every exit path.
//!
//! ```no_run
//! use reel_engine::{DownloadConfig, HlsDownloader};
//!
//! # async fn example() -> Result<(), reel_engine::DownloadError> {
//! let downloader = HlsDownloader::new(DownloadConfig::default())?;
//! let variants = downloader
//!     .discover_qualities("https://example.com/stream/master.m3u8")
//!     .await?;
//!
//! let handle = downloader.start_download(
//!     variants[0].clone(),
//!     "my-show",
//!     std::path::Path::new("/tmp/downloads"),
//!     None,
//! );
//! let final_path = handle.wait().await?;
//! # let _ = final_path;
//! # Ok(())
//! # }
//! ```

pub mod catalog;
pub mod client;
pub mod config;
pub mod downloader;
pub mod error;
pub mod fetch;
pub mod manifest;
pub mod progress;
pub mod reassemble;
pub mod sniff;
pub mod variant;
pub mod workspace;

pub use catalog::{CatalogEntry, DownloadCatalog, NullCatalog};
pub use config::{DownloadConfig, ReassemblyConfig};
pub use downloader::{DownloadHandle, HlsDownloader};
pub use error::{DownloadError, FailureClass, NetworkFailureKind};
pub use fetch::{SegmentFetcher, SegmentSource};
pub use manifest::{ManifestParser, ManifestSource};
pub use progress::{DownloadProgress, DownloadState, ProgressCallback, ProgressTracker};
pub use reassemble::{FrameSink, FrameSinkFactory, PixelFrame, Reassembler, SinkStatus};
pub use sniff::SegmentKind;
pub use variant::QualityVariant;
pub use workspace::SessionWorkspace;
