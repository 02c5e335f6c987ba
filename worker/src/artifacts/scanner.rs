//! Recursive discovery of build output files

use std::collections::VecDeque;
use std::path::PathBuf;

use futures::stream::{self, Stream};
use tokio::fs;
use tracing::debug;

use crate::errors::WorkerError;

/// Lazily walks a directory tree, yielding regular files relative to the root
///
/// Symbolic links are never followed (and not yielded), so link cycles
/// cannot cause an endless walk. Order is unspecified but every regular file
/// is yielded exactly once.
#[derive(Debug)]
pub struct ArtifactScanner {
    root: PathBuf,
    pending_dirs: Vec<PathBuf>,
    ready: VecDeque<PathBuf>,
}

impl ArtifactScanner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            // The root itself, relative to the root.
            pending_dirs: vec![PathBuf::new()],
            ready: VecDeque::new(),
        }
    }

    /// Next file path relative to the root, or `None` once exhausted
    pub async fn next_file(&mut self) -> Result<Option<PathBuf>, WorkerError> {
        loop {
            if let Some(file) = self.ready.pop_front() {
                return Ok(Some(file));
            }
            let Some(dir) = self.pending_dirs.pop() else {
                return Ok(None);
            };
            self.read_dir(dir).await?;
        }
    }

    /// Consume the scanner as a stream of relative paths
    pub fn into_stream(self) -> impl Stream<Item = Result<PathBuf, WorkerError>> {
        stream::try_unfold(self, |mut scanner| async move {
            let next = scanner.next_file().await?;
            Ok::<_, WorkerError>(next.map(|file| (file, scanner)))
        })
    }

    async fn read_dir(&mut self, relative: PathBuf) -> Result<(), WorkerError> {
        let absolute = self.root.join(&relative);
        let scan_error = |e: std::io::Error| WorkerError::ScanError {
            path: absolute.display().to_string(),
            message: e.to_string(),
        };

        let mut entries = fs::read_dir(&absolute).await.map_err(scan_error)?;
        while let Some(entry) = entries.next_entry().await.map_err(scan_error)? {
            // `DirEntry::file_type` does not follow symlinks.
            let file_type = entry.file_type().await.map_err(scan_error)?;
            let child = relative.join(entry.file_name());
            if file_type.is_dir() {
                self.pending_dirs.push(child);
            } else if file_type.is_file() {
                self.ready.push_back(child);
            } else {
                debug!(path = %child.display(), "Skipping non-regular file");
            }
        }
        Ok(())
    }
}
