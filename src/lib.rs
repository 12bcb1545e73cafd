//! Core services for a paginated e-ink reading pipeline: archive
//! access, publication indexing, stylesheet compilation, navigation
//! parsing, and hyphenation.
//!
//! The companion crates build on these: `folio-render` turns chapter
//! XHTML into cached pages, and `folio-reader` maps ordinal page
//! navigation onto those caches.

#![cfg_attr(
    not(test),
    deny(
        clippy::expect_used,
        clippy::unwrap_used,
        clippy::panic,
        clippy::todo,
        clippy::unimplemented
    )
)]

pub mod archive;
pub mod book;
pub mod css;
pub mod entities;
pub mod error;
pub mod hyphenation;
pub mod metrics;
pub mod navigation;
pub mod opf;
pub mod serialize;
pub mod settings;

pub use archive::{normalize_entry_path, ArchiveReader, ZipArchive, ARCHIVE_CHUNK};
pub use book::{
    BookIndex, BookMetadata, CacheLayout, Publication, SpineEntry, TocEntry, DEFAULT_CACHE_DIR,
};
pub use css::{
    CssLength, CssRuleSet, CssStyle, CssUnit, FontStyle, FontWeight, TextAlign, TextDecoration,
};
pub use error::{FolioError, Result};
pub use hyphenation::{BreakInfo, Hyphenator, SOFT_HYPHEN};
pub use metrics::{CancelFlag, GlyphMetrics, PageSurface, RefreshMode, StyleFlags};
pub use navigation::{NavLimits, RawTocEntry};
pub use settings::{ParagraphAlign, ReaderSettings};
