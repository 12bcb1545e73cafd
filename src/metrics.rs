//! Interfaces to the host platform: glyph measurement, the bitmap
//! display, and cooperative cancellation.
//!
//! The core never rasterizes text or touches display hardware. Both
//! concerns arrive as trait objects; measurement must be pure for a
//! fixed input because measured widths are persisted into section
//! caches.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Per-word style bits carried through layout and serialization.
///
/// Stored as a single byte in section caches; the bit assignments are
/// stable.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StyleFlags(u8);

impl StyleFlags {
    /// No styling.
    pub const REGULAR: StyleFlags = StyleFlags(0);
    /// Bold face.
    pub const BOLD: StyleFlags = StyleFlags(1);
    /// Italic face.
    pub const ITALIC: StyleFlags = StyleFlags(2);
    /// Underline rule below the word.
    pub const UNDERLINE: StyleFlags = StyleFlags(4);

    /// Combine two flag sets.
    pub fn union(self, other: StyleFlags) -> StyleFlags {
        StyleFlags(self.0 | other.0)
    }

    /// True when every bit of `other` is set in `self`.
    pub fn contains(self, other: StyleFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_bold(self) -> bool {
        self.contains(Self::BOLD)
    }

    pub fn is_italic(self) -> bool {
        self.contains(Self::ITALIC)
    }

    pub fn is_underline(self) -> bool {
        self.contains(Self::UNDERLINE)
    }

    /// Raw byte for serialization.
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Rebuild from a serialized byte. Unknown bits are masked off.
    pub fn from_bits(bits: u8) -> StyleFlags {
        StyleFlags(bits & 0x07)
    }
}

/// Glyph-width oracle consumed by layout.
///
/// Implementations must be deterministic: the same `(font, text,
/// flags)` triple always measures the same width, otherwise cached
/// sections would disagree with fresh layout.
pub trait GlyphMetrics {
    /// Rendered width of `text` in pixels.
    fn text_width(&self, font_id: i32, text: &str, flags: StyleFlags) -> u32;

    /// Width of the inter-word space.
    fn space_width(&self, font_id: i32) -> u32;

    /// Horizontal advance of `text`, including trailing bearing.
    fn advance_x(&self, font_id: i32, text: &str) -> i32;

    /// Natural line height of the font.
    fn line_height(&self, font_id: i32) -> u32;

    /// Baseline distance from the top of the line box.
    fn ascender(&self, font_id: i32) -> i32;
}

/// Display refresh policy hint returned with each rendered page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefreshMode {
    /// Full waveform refresh (slow, clears ghosting).
    Full,
    /// Partial refresh (fast, accumulates ghosting).
    Partial,
    /// Fastest mode for transient UI.
    Fast,
}

/// Minimal bitmap display surface consumed by page rendering.
pub trait PageSurface {
    /// Draw a run of text at a pixel position.
    fn draw_text(&mut self, font_id: i32, x: i32, y: i32, text: &str, inverse: bool, flags: StyleFlags);

    /// Draw a 1-px line segment.
    fn draw_line(&mut self, x0: i32, y0: i32, x1: i32, y1: i32, set: bool);

    /// Set or clear one pixel.
    fn draw_pixel(&mut self, x: i32, y: i32, set: bool);

    /// Fill a rectangle.
    fn fill_rect(&mut self, x: i32, y: i32, w: u32, h: u32, set: bool);

    /// Push the buffer to the panel.
    fn present(&mut self, mode: RefreshMode);
}

/// Cooperative cancellation flag polled by streaming parsers.
///
/// Cloning shares the underlying flag.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Parsers notice at their next chunk
    /// boundary and return `FolioError::Cancelled`.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}
