use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io;

pub use reqwest::{Client, StatusCode};
pub use url::Url;

use crate::schedule::Scheduler;
use crate::verify::{self, Algorithm};
use crate::{mirror, Chunk, FileIdentity, StagingFile};

pub use crate::schedule::ProgressSink;

/// Default size of the blocks written to the staging file.
pub const DEFAULT_BLOCK_SIZE: NonZeroUsize = match NonZeroUsize::new(64 * 1_024) {
    Some(size) => size,
    None => unreachable!(),
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("no mirrors provided")]
    NoMirrors,
    #[error("failed connection to mirror `{mirror}`")]
    Connection {
        mirror: Url,
        #[source]
        source: reqwest::Error,
    },
    #[error("mirror `{mirror}` responded with status {status}")]
    BadStatus { mirror: Url, status: StatusCode },
    #[error("mirror `{mirror}` did not declare a valid content length")]
    MissingLength { mirror: Url },
    #[error("mirrors must point to the same file: `{mirror}` {reason}")]
    InconsistentMirrors { mirror: Url, reason: String },
    #[error("the file couldn't be downloaded from any mirror after {failures} failures")]
    ExhaustedMirrors { failures: usize },
    #[error("failed to write chunk #{chunk} to the staging file")]
    LocalWrite {
        chunk: usize,
        #[source]
        source: io::Error,
    },
    #[error("computed {algorithm} digest does not match: expected={expected} computed={computed}")]
    DigestMismatch {
        algorithm: Algorithm,
        expected: String,
        computed: String,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// What is known about the file once all mirrors have been reconciled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadPlan {
    /// Identity all mirrors agree on.
    pub identity: FileIdentity,
    /// Default output file name.
    pub file_name: PathBuf,
    /// Chunk table, one chunk per worker.
    pub chunks: Vec<Chunk>,
}

/// A download plan bound to its staging file, ready to be downloaded.
#[derive(Debug)]
pub struct DownloadJob {
    plan: DownloadPlan,
    staging: StagingFile,
    metadata: std::fs::Metadata,
}

impl DownloadJob {
    #[inline]
    pub fn plan(&self) -> &DownloadPlan {
        &self.plan
    }

    /// Staging file metadata, as created.
    #[inline]
    pub fn metadata(&self) -> &std::fs::Metadata {
        &self.metadata
    }

    /// Path of the staging file.
    #[inline]
    pub fn staging_path(&self) -> &Path {
        self.staging.path()
    }

    /// Path the file will be committed to.
    #[inline]
    pub fn final_path(&self) -> &Path {
        self.staging.final_path()
    }
}

/// Downloads a single file mirrored at several URLs, splitting it into concurrently fetched chunks.
///
/// A download goes through three steps:
/// 1. [`gather_info()`](Self::gather_info) checks every mirror serves the same file and plans the chunks;
/// 2. [`setup_file()`](Self::setup_file) creates the pre-sized staging file;
/// 3. [`download()`](Self::download) fetches the chunks and commits the file.
///
/// [`fetch()`](Self::fetch) chains them all.
#[derive(Debug, Clone)]
pub struct MultiDownloader {
    client: Client,
    mirrors: Arc<[Url]>,
    workers: NonZeroUsize,
    timeout: Duration,
    block_size: NonZeroUsize,
}

impl MultiDownloader {
    /// Create a downloader for `mirrors`, using up to `workers` concurrent transfers bound by `timeout` each.
    pub fn new(mirrors: impl IntoIterator<Item = Url>, workers: NonZeroUsize, timeout: Duration) -> Self {
        Self {
            client: Client::default(),
            mirrors: mirrors.into_iter().collect(),
            workers,
            timeout,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }

    #[inline]
    pub fn with_client(self, client: Client) -> Self {
        Self { client, ..self }
    }

    /// Set the size of the blocks written to the staging file.
    #[inline]
    pub fn with_block_size(self, block_size: NonZeroUsize) -> Self {
        Self { block_size, ..self }
    }

    #[inline]
    pub fn mirrors(&self) -> &[Url] {
        &self.mirrors
    }

    #[inline]
    pub fn workers(&self) -> NonZeroUsize {
        self.workers
    }

    /// Reconcile all mirrors and build the chunk table.
    pub async fn gather_info(&self) -> Result<DownloadPlan, Error> {
        let reconciled = mirror::reconcile(&self.client, &self.mirrors, self.timeout).await?;
        let chunks = crate::plan_chunks(reconciled.identity.length, self.workers);

        tracing::debug!(
            "Planned {} chunks for `{}` ({} bytes)",
            chunks.len(),
            reconciled.file_name,
            reconciled.identity.length
        );

        Ok(DownloadPlan {
            identity: reconciled.identity,
            file_name: reconciled.file_name.into(),
            chunks,
        })
    }

    /// Create the staging file, at `path` if given or at the plan's default file name otherwise.
    pub async fn setup_file(&self, plan: DownloadPlan, path: Option<PathBuf>) -> Result<DownloadJob, Error> {
        let final_path = path.unwrap_or_else(|| plan.file_name.clone());
        let (staging, metadata) = StagingFile::create(final_path, plan.identity.length).await?;

        Ok(DownloadJob { plan, staging, metadata })
    }

    /// Download all chunks of `job` and commit the file, returning its final path.
    ///
    /// On failure, the staging file is left on disk and the final path is untouched.
    pub async fn download(&self, job: DownloadJob, progress: Option<ProgressSink>) -> Result<PathBuf, Error> {
        let scheduler = Scheduler {
            client: self.client.clone(),
            mirrors: Arc::clone(&self.mirrors),
            timeout: self.timeout,
            block_size: self.block_size,
        };

        scheduler.run(job.plan.chunks, job.plan.identity.length, job.staging, progress).await
    }

    /// Gather info, set up the staging file and download it in one go.
    pub async fn fetch(&self, path: Option<PathBuf>, progress: Option<ProgressSink>) -> Result<PathBuf, Error> {
        let plan = self.gather_info().await?;
        let job = self.setup_file(plan, path).await?;

        self.download(job, progress).await
    }

    /// Check the SHA-256 digest of a downloaded file.
    pub async fn check_sha256(&self, path: impl AsRef<Path>, expected: &str) -> Result<(), Error> {
        verify::verify_file(path, Algorithm::Sha256, expected).await.map(drop)
    }

    /// Check the MD5 digest of a downloaded file.
    pub async fn check_md5(&self, path: impl AsRef<Path>, expected: &str) -> Result<(), Error> {
        verify::verify_file(path, Algorithm::Md5, expected).await.map(drop)
    }
}
