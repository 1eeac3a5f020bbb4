use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the cache reader and the decacher.
///
/// Only a bad cache magic or an I/O failure opening the cache itself
/// propagates out of `main`; everything else is caught at the per-image
/// call site and logged.
#[derive(Debug, Error)]
pub enum DecacheError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("'{path}' is not a dyld shared cache (bad magic)")]
    BadCacheMagic { path: PathBuf },

    #[error(
        "cannot dump '{path}': only 32-bit little-endian single-file Mach-O objects are supported"
    )]
    UnsupportedMachOMagic { path: String },

    #[error(
        "malformed Objective-C list at 0x{vmaddr:x} in '{path}': entsize {actual} does not match expected {expected}"
    )]
    MalformedObjcList {
        path: String,
        vmaddr: u32,
        expected: usize,
        actual: usize,
    },

    #[error("cannot create symlink '{}' -> '{}': {source}", link.display(), target.display())]
    SymlinkCollision {
        link: PathBuf,
        target: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, DecacheError>;
