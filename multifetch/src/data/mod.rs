use std::num::NonZeroUsize;
use std::ops::Range;

pub mod staging;
pub use staging::*;

pub(crate) mod utils;

/// File identity as agreed upon by all mirrors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileIdentity {
    /// File length in bytes, as declared by the `Content-Length` header.
    pub length: u64,

    /// Strong validator (`ETag`) without its surrounding quotes.
    ///
    /// `None` when no mirror declared one, in which case it matches anything.
    pub tag: Option<String>,
}

/// A contiguous byte range of the file owned by exactly one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Chunk index, which is also the index of the worker owning it.
    pub index: usize,

    /// Byte range this chunk is responsible for, `end` excluded.
    pub range: Range<u64>,
}

impl Chunk {
    /// Chunk length in bytes.
    #[inline]
    pub fn len(&self) -> u64 {
        self.range.end - self.range.start
    }

    /// Whether this chunk holds no byte at all.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    /// The `Range` header value requesting this chunk, or `None` for an empty chunk.
    ///
    /// HTTP byte ranges are inclusive on both ends.
    pub fn range_header(&self) -> Option<String> {
        (!self.is_empty()).then(|| format!("bytes={}-{}", self.range.start, self.range.end - 1))
    }
}

/// Progress of a single chunk download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSnapshot {
    /// Index of the chunk.
    pub chunk_id: usize,
    /// First byte of the chunk.
    pub begin: u64,
    /// End of the chunk, excluded.
    pub end: u64,
    /// Absolute offset written so far, within `begin..=end`.
    pub current: u64,
}

impl ProgressSnapshot {
    /// Snapshot of a chunk with nothing written yet.
    pub fn start(chunk: &Chunk) -> Self {
        Self {
            chunk_id: chunk.index,
            begin: chunk.range.start,
            end: chunk.range.end,
            current: chunk.range.start,
        }
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.current >= self.end
    }
}

/// Split `length` bytes into `workers` contiguous chunks.
///
/// Chunk sizes differ by one byte at most: the remainder of `length / workers` is spread over the first chunks,
/// one extra byte each. The result only depends on its inputs.
///
/// ```
/// # use multifetch::plan_chunks;
/// let chunks = plan_chunks(10, 3.try_into().unwrap());
///
/// let ranges: Vec<_> = chunks.into_iter().map(|chunk| chunk.range).collect();
/// assert_eq!(ranges, [0..4, 4..7, 7..10]);
/// ```
pub fn plan_chunks(length: u64, workers: NonZeroUsize) -> Vec<Chunk> {
    let n = workers.get() as u64;
    let size = length / n;
    let mut remainder = length % n;

    let mut begin = 0;

    (0..workers.get())
        .map(|index| {
            let mut end = begin + size;
            if remainder > 0 {
                remainder -= 1;
                end += 1;
            }

            let chunk = Chunk { index, range: begin..end };
            begin = end;
            chunk
        })
        .collect()
}
