//! Whole-file digest verification.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use sha2::Digest;
use tokio::io::{self, AsyncReadExt};

use crate::Error;

/// Size of the blocks a file is read by while hashing.
pub const READ_BLOCK_SIZE: usize = 64 * 1_024;

/// A supported digest algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    Sha256,
    Md5,
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Sha256 => "SHA-256",
            Self::Md5 => "MD5",
        })
    }
}

impl FromStr for Algorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha256" | "sha-256" => Ok(Self::Sha256),
            "md5" => Ok(Self::Md5),
            other => Err(format!("unsupported digest algorithm `{other}`")),
        }
    }
}

enum Hasher {
    Sha256(sha2::Sha256),
    Md5(md5::Context),
}

impl Hasher {
    fn new(algorithm: Algorithm) -> Self {
        match algorithm {
            Algorithm::Sha256 => Self::Sha256(sha2::Sha256::new()),
            Algorithm::Md5 => Self::Md5(md5::Context::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha256(hasher) => hasher.update(data),
            Self::Md5(context) => context.consume(data),
        }
    }

    fn finalize(self) -> String {
        match self {
            Self::Sha256(hasher) => hex::encode(hasher.finalize()),
            Self::Md5(context) => format!("{:x}", context.compute()),
        }
    }
}

/// Lowercase hex digest of the file at `path`.
///
/// ```
/// # tokio_test::block_on(async {
/// # use multifetch::verify::{digest_file, Algorithm};
/// let file = tempfile::NamedTempFile::new().unwrap();
/// std::fs::write(file.path(), b"abc").unwrap();
///
/// let digest = digest_file(file.path(), Algorithm::Md5).await.unwrap();
/// assert_eq!(digest, "900150983cd24fb0d6963f7d28e17f72");
/// # })
/// ```
pub async fn digest_file(path: impl AsRef<Path>, algorithm: Algorithm) -> io::Result<String> {
    let mut file = tokio::fs::File::open(path.as_ref()).await?;
    let mut hasher = Hasher::new(algorithm);
    let mut buf = vec![0; READ_BLOCK_SIZE];

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }

        hasher.update(&buf[..n]);
    }

    Ok(hasher.finalize())
}

/// Check the digest of the file at `path` against `expected`, case-insensitively.
///
/// Returns the computed digest when it matches.
pub async fn verify_file(path: impl AsRef<Path>, algorithm: Algorithm, expected: &str) -> Result<String, Error> {
    let path = path.as_ref();
    let computed = digest_file(path, algorithm).await?;

    tracing::debug!("Computed {algorithm} digest of `{}`: {computed}", path.display());

    if computed.eq_ignore_ascii_case(expected.trim()) {
        Ok(computed)
    } else {
        Err(Error::DigestMismatch {
            algorithm,
            expected: expected.to_owned(),
            computed,
        })
    }
}
