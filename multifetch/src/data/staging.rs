//! Pre-sized staging file receiving out-of-order positional writes.

use std::ffi::OsString;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::{fs, io};

/// Suffix appended to the final file name while the download is in progress.
pub const PARTIAL_SUFFIX: &str = ".part";

/// The file being downloaded, stored under a partial name until committed.
///
/// The underlying handle is shared between workers: every write specifies its absolute offset, so that chunk workers
/// owning disjoint ranges never contend on a cursor.
#[derive(Debug, Clone)]
pub struct StagingFile {
    file: Arc<std::fs::File>,
    path: PathBuf,
    final_path: PathBuf,
}

impl StagingFile {
    /// Create (or truncate) the staging file for `final_path` and force its length to `length`.
    pub async fn create(final_path: impl Into<PathBuf>, length: u64) -> io::Result<(Self, Metadata)> {
        let final_path = final_path.into();
        let path = partial_path(&final_path);

        tracing::debug!("Creating staging file of {length} bytes: `{}`", path.display());

        let file = fs::File::create(&path).await?;
        file.set_len(length).await?;
        let metadata = file.metadata().await?;

        let staging = Self {
            file: Arc::new(file.into_std().await),
            path,
            final_path,
        };

        Ok((staging, metadata))
    }

    /// Staging file path.
    #[inline]
    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// Path the staging file is renamed to on commit.
    #[inline]
    pub fn final_path(&self) -> &Path {
        self.final_path.as_path()
    }

    /// Write `buf` at the absolute `offset`.
    pub async fn write_at(&self, offset: u64, buf: bytes::Bytes) -> io::Result<()> {
        let file = Arc::clone(&self.file);

        tokio::task::spawn_blocking(move || super::utils::write_all_at(&file, &buf, offset))
            .await
            .map_err(io::Error::other)?
    }

    /// Flush the staging file and atomically rename it to its final path.
    pub async fn commit(self) -> io::Result<PathBuf> {
        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || file.sync_all()).await.map_err(io::Error::other)??;

        drop(self.file);
        fs::rename(&self.path, &self.final_path).await?;

        tracing::debug!("Committed `{}` to `{}`", self.path.display(), self.final_path.display());

        Ok(self.final_path)
    }
}

#[cfg(test)]
impl StagingFile {
    /// Open an existing staging file without write access.
    pub(crate) fn open_read_only(path: impl Into<PathBuf>, final_path: impl Into<PathBuf>) -> Self {
        let path = path.into();

        Self {
            file: Arc::new(std::fs::File::open(&path).unwrap()),
            path,
            final_path: final_path.into(),
        }
    }
}

fn partial_path(final_path: &Path) -> PathBuf {
    let mut name = OsString::from(final_path.as_os_str());
    name.push(PARTIAL_SUFFIX);
    name.into()
}
