// Session-scoped temporary workspace holding fetched segments before
// reassembly. Uniquely named per session so concurrent downloads of the
// same source never collide; removed on every exit path.

use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::debug;
use uuid::Uuid;

/// Suffix given to files while they are still being written; listings and
/// reassembly ignore them.
pub(crate) const PARTIAL_SUFFIX: &str = "part";

pub struct SessionWorkspace {
    // `None` only after explicit removal; `Drop` remains as a backstop.
    dir: Option<TempDir>,
    path: PathBuf,
}

impl SessionWorkspace {
    /// Creates a fresh workspace under `staging_root` (or the system temp
    /// directory), named after the owning session.
    pub fn create(staging_root: Option<&Path>, session_id: Uuid) -> io::Result<Self> {
        let prefix = format!("reel-{session_id}-");
        let dir = match staging_root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                TempDir::with_prefix_in(prefix.as_str(), root)?
            }
            None => TempDir::with_prefix(prefix.as_str())?,
        };
        let path = dir.path().to_path_buf();
        debug!(workspace = %path.display(), "created session workspace");
        Ok(Self {
            dir: Some(dir),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Deterministic segment file name: zero-padded index so a lexical
    /// directory listing reproduces segment order.
    pub fn segment_path(&self, index: usize, extension: &str) -> PathBuf {
        self.path.join(format!("segment_{index:04}.{extension}"))
    }

    pub fn output_path(&self, file_name: &str) -> PathBuf {
        self.path.join(file_name)
    }

    /// Lists the completed segment files currently present, lexically
    /// sorted (equals index order by construction).
    pub async fn segment_files(&self) -> io::Result<Vec<PathBuf>> {
        let mut entries = tokio::fs::read_dir(&self.path).await?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_partial = path
                .extension()
                .is_some_and(|ext| ext == PARTIAL_SUFFIX);
            let is_segment = entry
                .file_name()
                .to_string_lossy()
                .starts_with("segment_");
            if is_segment && !is_partial {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Removes the workspace and everything in it. Consumes the workspace;
    /// the removal is performed off the async runtime's I/O path.
    pub async fn remove(mut self) -> io::Result<()> {
        if let Some(dir) = self.dir.take() {
            let path = dir.keep();
            tokio::fs::remove_dir_all(&path).await?;
            debug!(workspace = %path.display(), "removed session workspace");
        }
        Ok(())
    }
}

// TempDir's own Drop removes the directory if `remove` was never reached
// (a panic between creation and cleanup).
