//! A crate downloading a single large file from several mirrors at once.
//!
//! The file is split into as many contiguous chunks as there are workers, and every chunk is fetched concurrently with
//! HTTP range requests, straight into a pre-sized staging file:
//! - all mirrors are first probed concurrently and must agree on the file length and, when they declare one, on its
//!   `ETag`: a single unreachable or inconsistent mirror aborts the download before any chunk is fetched;
//! - each worker starts from its own mirror, falls back to the next ones on failure, and waits for capacity freed by
//!   completed chunks once it failed against all of them;
//! - the session is aborted once the cumulative number of such failures reaches the number of workers;
//! - the staging file is renamed to its final name only when every chunk has been written.
//!
//! It makes use of `tokio` tasks for workers, a `Semaphore` for admission tokens and `mpsc` channels so that workers
//! only ever report to a single coordinator owning the session counters, rather than sharing them.
//!
//! Workers own disjoint byte ranges by construction, which is what makes concurrent positional writes to the shared
//! staging file safe without any lock:
//!
//! ```text
//!     file.iso.part  [ chunk #0 | chunk #1 | chunk #2 | chunk #3 ]
//!                        ^          ^          ^          ^
//!                    mirror 0   mirror 1   mirror 2   mirror 0   (first attempt, 3 mirrors)
//!     file.iso       renamed from file.iso.part once all chunks are done
//! ```
//!
//! Downloaded files can then be checked against a SHA-256 or MD5 digest with the [`verify`] module.

mod data;
pub use data::*;

pub mod download;
pub use download::{DownloadJob, DownloadPlan, Error, MultiDownloader, ProgressSink};

pub mod mirror;
mod schedule;
pub mod task;
pub mod verify;

#[cfg(test)]
mod testing;
