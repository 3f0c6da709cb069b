use std::{fs, io};

use url::Url;

/// File name used when a mirror URL has no usable last path segment.
pub const FALLBACK_FILE_NAME: &str = "downloaded-file";

/// Strip the surrounding double quotes of an `ETag` value, if any.
///
/// An empty value (or a bare `""`) is no tag at all.
pub fn strip_quotes(tag: &str) -> Option<&str> {
    let tag = tag.trim();
    let tag = tag.strip_prefix('"').and_then(|tag| tag.strip_suffix('"')).unwrap_or(tag);

    (!tag.is_empty()).then_some(tag)
}

/// Last non-empty path segment of `url`, or [`FALLBACK_FILE_NAME`].
pub fn file_name(url: &Url) -> &str {
    url.path_segments()
        .and_then(|segments| segments.filter(|segment| !segment.is_empty()).last())
        .unwrap_or(FALLBACK_FILE_NAME)
}

/// Write the whole `buf` at the absolute `offset`, leaving any file cursor untouched.
#[cfg(unix)]
pub fn write_all_at(file: &fs::File, buf: &[u8], offset: u64) -> io::Result<()> {
    std::os::unix::fs::FileExt::write_all_at(file, buf, offset)
}

/// Write the whole `buf` at the absolute `offset`.
#[cfg(windows)]
pub fn write_all_at(file: &fs::File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;

    while !buf.is_empty() {
        match file.seek_write(buf, offset) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => {
                buf = &buf[n..];
                offset += n as u64;
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }

    Ok(())
}
