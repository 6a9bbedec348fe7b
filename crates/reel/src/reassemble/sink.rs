// Video-encoding sink boundary for the frame-sequence reassembly path.
// The engine only relies on the contract here (ready-check before each
// append, caller-assigned timestamps, terminal-status check); the concrete
// encoder is swappable.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::DownloadError;

/// One decoded still, as a packed device-RGB pixel buffer (3 bytes per
/// pixel, row-major).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelFrame {
    pub width: u32,
    pub height: u32,
    pub rgb: Vec<u8>,
}

/// Terminal status reported by a sink after `finish`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkStatus {
    Completed,
    Failed(String),
}

/// A sink accepting timestamped frames for one output file.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FrameSink: Send {
    /// Suspends until the sink can accept more data.
    async fn wait_ready(&mut self) -> Result<(), DownloadError>;

    /// Appends one frame at its presentation timestamp.
    async fn append(&mut self, frame: &PixelFrame, timestamp: Duration)
    -> Result<(), DownloadError>;

    /// Finalizes the output and reports the terminal status.
    async fn finish(&mut self) -> Result<SinkStatus, DownloadError>;
}

/// Opens a sink for a given output path and frame geometry.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FrameSinkFactory: Send + Sync {
    async fn open(
        &self,
        output: &Path,
        width: u32,
        height: u32,
    ) -> Result<Box<dyn FrameSink>, DownloadError>;
}
