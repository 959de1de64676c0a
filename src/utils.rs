//! Utility functions that may be helpful for implementing
//! and testing MapReduce.

use anyhow::Result;
use bytes::Bytes;
use std::path::{Path, PathBuf};

/// Read an entire [`Bytes`] slice into a [`String`].
///
/// Returns an error if the slice contains invalid UTF-8.
pub fn string_from_bytes(buf: Bytes) -> Result<String> {
    Ok(String::from_utf8(buf.as_ref().into())?)
}

/// Convert a [`String`] to [`Bytes`].
#[inline]
pub fn string_to_bytes(s: String) -> Bytes {
    Bytes::from(s)
}

/// Default coordinator socket, one per owning user so concurrent users on
/// a shared machine do not trample each other's endpoints.
pub fn coordinator_socket() -> PathBuf {
    let user = std::env::var("USER").unwrap_or_else(|_| "anon".to_string());
    PathBuf::from(format!("/var/tmp/minimr-{user}.sock"))
}

/// Staged basename of the intermediate shard written by `holder` for
/// reduce bucket `y`.
pub fn shard_basename(holder: u64, y: u32) -> String {
    format!("mr-{holder}-{y}")
}

/// Basename of the committed output file for reduce bucket `y`.
pub fn output_basename(y: u32) -> String {
    format!("mr-out-{y}")
}

/// Parse `mr-<holder>-<y>` back into its parts. Returns `None` for
/// anything else, in particular `mr-out-<y>` files, so shard discovery
/// never mistakes committed output for intermediate data.
pub fn parse_shard_basename(name: &str) -> Option<(u64, u32)> {
    let rest = name.strip_prefix("mr-")?;
    let (holder, y) = rest.split_once('-')?;
    Some((holder.parse().ok()?, y.parse().ok()?))
}

/// Move `src` to `dest`, falling back to copy-and-remove when the two live
/// on different filesystems.
pub fn rename_or_copy(src: &Path, dest: &Path) -> std::io::Result<()> {
    match std::fs::rename(src, dest) {
        Ok(()) => Ok(()),
        Err(_) => {
            std::fs::copy(src, dest)?;
            let _ = std::fs::remove_file(src);
            Ok(())
        }
    }
}
