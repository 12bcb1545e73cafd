//! Error types shared across the reading core.

use core::fmt;

/// Convenience alias used throughout the workspace.
pub type Result<T> = core::result::Result<T, FolioError>;

/// Failure classes surfaced by the reading core.
///
/// Fatal kinds (`NotAnEpub`, `CacheBuildFailed`) abort an open;
/// recoverable kinds (`CacheStale`, `CorruptCache`) trigger a rebuild
/// of the offending cache file; the rest degrade gracefully at the
/// call site.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FolioError {
    /// The archive is missing `META-INF/container.xml` or a rootfile.
    NotAnEpub,
    /// An I/O or parse error interrupted cache construction.
    /// Partially written cache files have been deleted.
    CacheBuildFailed(String),
    /// A cache file's header does not match the requested parameters.
    /// The file has been deleted; rebuild and retry.
    CacheStale,
    /// Neither an NCX nor a Nav document could be parsed.
    TocMissing,
    /// The publication declares no usable cover image.
    CoverMissing,
    /// A page index at or beyond the page count was requested.
    PageOutOfRange {
        /// Requested page index.
        index: usize,
        /// Number of pages actually available.
        page_count: usize,
    },
    /// A cache file contains implausible data (bad tag, oversized
    /// counts, truncated trailer). Treated like `CacheStale`.
    CorruptCache(String),
    /// The cover resource is not in a format the core can use.
    UnsupportedImage(String),
    /// Malformed XML/CSS/archive structure outside cache builds.
    Parse(String),
    /// Underlying file or archive I/O failure.
    Io(String),
    /// A cooperative cancellation flag was raised mid-parse.
    Cancelled,
}

impl fmt::Display for FolioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotAnEpub => write!(f, "not an EPUB: missing container.xml or rootfile"),
            Self::CacheBuildFailed(msg) => write!(f, "cache build failed: {}", msg),
            Self::CacheStale => write!(f, "cache parameters do not match request"),
            Self::TocMissing => write!(f, "no parseable table of contents"),
            Self::CoverMissing => write!(f, "no cover image"),
            Self::PageOutOfRange { index, page_count } => {
                write!(f, "page {} out of range (page count {})", index, page_count)
            }
            Self::CorruptCache(msg) => write!(f, "corrupt cache: {}", msg),
            Self::UnsupportedImage(msg) => write!(f, "unsupported image: {}", msg),
            Self::Parse(msg) => write!(f, "parse error: {}", msg),
            Self::Io(msg) => write!(f, "io error: {}", msg),
            Self::Cancelled => write!(f, "operation cancelled"),
        }
    }
}

impl std::error::Error for FolioError {}

impl From<std::io::Error> for FolioError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
