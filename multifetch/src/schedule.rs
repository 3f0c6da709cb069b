//! This module drives the concurrent chunk downloads of a session.
//!
//! Every chunk is owned by one worker task. Workers need an admission token to start a transfer attempt, and try each
//! mirror in turn, starting from the one at their own index so that workers fan out across mirrors. A worker failing
//! against every mirror reports it and waits for another token, which is only given back when some chunk completes:
//! failing workers borrow the capacity freed by successful ones.
//!
//! Workers never touch the session counters: they report to a single coordinator owning them, which aborts the
//! session once the cumulative number of failures reaches the number of chunks.

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use reqwest::header::RANGE;
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tokio::io;
use tokio::sync::mpsc;
use url::Url;

use crate::task::{Tokens, WorkerSet};
use crate::{Chunk, Error, ProgressSnapshot, StagingFile};

/// A progress callback, called with the latest snapshot of every chunk each time one of them advances.
///
/// It is always called from the same task, but should return quickly not to delay the next snapshots.
pub type ProgressSink = Box<dyn FnMut(&[ProgressSnapshot]) + Send + 'static>;

/// Worker to coordinator signals.
#[derive(Debug)]
enum Event {
    Done(usize),
    Failed(usize),
    Fatal(usize, io::Error),
}

/// Why a transfer attempt against a single mirror failed.
#[derive(Debug, Error)]
enum TransferError {
    #[error(transparent)]
    Request(#[from] reqwest::Error),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("unexpected status {0}")]
    Status(StatusCode),
    #[error("body ended after {received} of {expected} bytes")]
    ShortBody { received: u64, expected: u64 },
    #[error("body exceeds {expected} bytes")]
    LongBody { expected: u64 },
    /// Local failure, not worth retrying against another mirror.
    #[error(transparent)]
    Write(io::Error),
}

#[derive(Debug, Clone)]
pub(crate) struct Scheduler {
    pub client: Client,
    pub mirrors: Arc<[Url]>,
    pub timeout: Duration,
    pub block_size: NonZeroUsize,
}

impl Scheduler {
    /// Download `chunks` of a `length` bytes file into `staging`, then commit it.
    pub async fn run(
        &self,
        chunks: Vec<Chunk>,
        length: u64,
        staging: StagingFile,
        sink: Option<ProgressSink>,
    ) -> Result<PathBuf, Error> {
        if self.mirrors.is_empty() {
            return Err(Error::NoMirrors);
        }

        let n = chunks.len();
        let tokens = Tokens::new(n);
        let (events_tx, mut events) = mpsc::unbounded_channel();

        let (progress_tx, aggregator) = match sink {
            Some(sink) => {
                let (sender, receiver) = mpsc::unbounded_channel();
                let table = chunks.iter().map(ProgressSnapshot::start).collect();

                (Some(sender), Some(tokio::spawn(aggregate(table, receiver, sink))))
            }
            None => (None, None),
        };

        tracing::debug!("Downloading {n} chunks from {} mirrors...", self.mirrors.len());

        let mut workers = WorkerSet::with_capacity(n);

        for chunk in chunks {
            let worker = ChunkWorker {
                whole_file: chunk.range == (0..length),
                chunk,
                client: self.client.clone(),
                mirrors: Arc::clone(&self.mirrors),
                timeout: self.timeout,
                block_size: self.block_size.get(),
                staging: staging.clone(),
                tokens: tokens.clone(),
                events: events_tx.clone(),
                progress: progress_tx.clone(),
            };

            workers.spawn(worker.run());
        }

        // only workers hold senders from now on
        drop(events_tx);
        drop(progress_tx);

        let mut remaining = n;
        let mut failures = 0;

        while remaining > 0 {
            match events.recv().await {
                Some(Event::Done(chunk)) => {
                    remaining -= 1;
                    tokens.release();

                    tracing::debug!("Chunk #{chunk} done, {remaining} remaining");
                }
                Some(Event::Failed(chunk)) => {
                    failures += 1;

                    tracing::warn!("Chunk #{chunk} failed on every mirror ({failures}/{n} failures)");

                    if failures >= n {
                        return Err(Error::ExhaustedMirrors { failures });
                    }
                }
                Some(Event::Fatal(chunk, source)) => {
                    return Err(Error::LocalWrite { chunk, source });
                }
                None => {
                    return Err(Error::Io(io::Error::other("chunk workers stopped unexpectedly")));
                }
            }
        }

        drop(workers);

        if let Some(aggregator) = aggregator {
            if let Err(err) = aggregator.await {
                tracing::warn!("Progress aggregator stopped abnormally: {err}");
            }
        }

        Ok(staging.commit().await?)
    }
}

/// Keep the latest snapshot of every chunk and hand the whole table to `sink` on each update.
///
/// Returns once every chunk is complete, or when no worker is left to report progress.
async fn aggregate(
    mut table: Vec<ProgressSnapshot>,
    mut progress: mpsc::UnboundedReceiver<ProgressSnapshot>,
    mut sink: ProgressSink,
) {
    while !table.iter().all(ProgressSnapshot::is_complete) {
        let Some(snapshot) = progress.recv().await else {
            break;
        };

        table[snapshot.chunk_id] = snapshot;
        sink(&table);
    }
}

/// Everything a worker needs to download its chunk.
struct ChunkWorker {
    chunk: Chunk,
    whole_file: bool,
    client: Client,
    mirrors: Arc<[Url]>,
    timeout: Duration,
    block_size: usize,
    staging: StagingFile,
    tokens: Tokens,
    events: mpsc::UnboundedSender<Event>,
    progress: Option<mpsc::UnboundedSender<ProgressSnapshot>>,
}

impl ChunkWorker {
    async fn run(self) {
        let index = self.chunk.index;
        let count = self.mirrors.len();

        loop {
            self.tokens.acquire().await;

            if self.chunk.is_empty() {
                let _ = self.events.send(Event::Done(index));
                return;
            }

            for attempt in 0..count {
                let mirror = &self.mirrors[(index + attempt) % count];

                tracing::trace!("Downloading chunk #{index} {:?} from `{mirror}`...", self.chunk.range);

                match self.transfer(mirror).await {
                    Ok(()) => {
                        let _ = self.events.send(Event::Done(index));
                        return;
                    }
                    Err(TransferError::Write(err)) => {
                        tracing::error!("Failed to write chunk #{index}: {err}");

                        let _ = self.events.send(Event::Fatal(index, err));
                        return;
                    }
                    Err(err) => tracing::warn!("Chunk #{index} failed on mirror `{mirror}`: {err}"),
                }
            }

            let _ = self.events.send(Event::Failed(index));
        }
    }

    /// Download the whole chunk from `mirror`, from its first byte.
    async fn transfer(&self, mirror: &Url) -> Result<(), TransferError> {
        let Chunk { ref range, .. } = self.chunk;

        let mut request = self.client.get(mirror.clone());
        if let Some(header) = self.chunk.range_header() {
            request = request.header(RANGE, header);
        }

        let mut resp = self.timed(request.send()).await??;

        match resp.status() {
            StatusCode::PARTIAL_CONTENT => {}
            // a mirror ignoring the range header only fits a chunk spanning the whole file
            StatusCode::OK if self.whole_file => {}
            status => return Err(TransferError::Status(status)),
        }

        let mut block = BytesMut::with_capacity(self.block_size);
        let mut cursor = range.start;

        while let Some(bytes) = self.timed(resp.chunk()).await?? {
            if cursor + (block.len() + bytes.len()) as u64 > range.end {
                return Err(TransferError::LongBody { expected: self.chunk.len() });
            }

            block.extend_from_slice(&bytes);

            while block.len() >= self.block_size {
                let full = block.split_to(self.block_size);
                cursor = self.write(cursor, full).await?;
            }
        }

        if !block.is_empty() {
            cursor = self.write(cursor, block).await?;
        }

        if cursor < range.end {
            return Err(TransferError::ShortBody {
                received: cursor - range.start,
                expected: self.chunk.len(),
            });
        }

        Ok(())
    }

    /// Write `block` at `offset`, report progress and return the offset following it.
    async fn write(&self, offset: u64, block: BytesMut) -> Result<u64, TransferError> {
        let next = offset + block.len() as u64;

        self.staging.write_at(offset, block.freeze()).await.map_err(TransferError::Write)?;

        if let Some(ref progress) = self.progress {
            let _ = progress.send(ProgressSnapshot {
                chunk_id: self.chunk.index,
                begin: self.chunk.range.start,
                end: self.chunk.range.end,
                current: next,
            });
        }

        Ok(next)
    }

    async fn timed<T>(&self, future: impl std::future::Future<Output = T>) -> Result<T, TransferError> {
        tokio::time::timeout(self.timeout, future)
            .await
            .map_err(|_| TransferError::Timeout(self.timeout))
    }
}
