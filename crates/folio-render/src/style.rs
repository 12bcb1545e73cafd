//! Resolved paragraph-level formatting.
//!
//! A [`BlockStyle`] is the pixel-space rendition of the cascaded CSS
//! for one block element: alignment, box spacing, and the first-line
//! indent. Lengths resolve at construction against the em size and
//! viewport, so layout and the section cache never see CSS units.

use std::io::{Read, Write};

use folio::css::{CssStyle, TextAlign};
use folio::error::Result;
use folio::serialize::{read_bool, read_i16, read_u8, write_bool, write_i16, write_u8};

/// Pixel-resolved block formatting shared by every line of a
/// paragraph.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockStyle {
    pub alignment: TextAlign,
    /// Whether alignment came from an explicit source (user setting
    /// or CSS) rather than the default.
    pub align_defined: bool,
    pub margin_top: i16,
    pub margin_bottom: i16,
    pub margin_left: i16,
    pub margin_right: i16,
    pub padding_top: i16,
    pub padding_bottom: i16,
    pub padding_left: i16,
    pub padding_right: i16,
    /// Explicit first-line indent in pixels.
    pub first_line_indent: i16,
    /// True when CSS defined `text-indent` (even as zero); false
    /// selects the em-width fallback in layout.
    pub indent_defined: bool,
}

impl Default for BlockStyle {
    fn default() -> Self {
        Self {
            alignment: TextAlign::Left,
            align_defined: false,
            margin_top: 0,
            margin_bottom: 0,
            margin_left: 0,
            margin_right: 0,
            padding_top: 0,
            padding_bottom: 0,
            padding_left: 0,
            padding_right: 0,
            first_line_indent: 0,
            indent_defined: false,
        }
    }
}

fn to_px_i16(len: folio::css::CssLength, em_px: f32, container: f32) -> i16 {
    let px = len.to_px(em_px, container);
    px.clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

impl BlockStyle {
    /// Block style with only an alignment set.
    pub fn aligned(alignment: TextAlign) -> Self {
        Self {
            alignment,
            align_defined: true,
            ..Self::default()
        }
    }

    /// Resolve a cascaded [`CssStyle`] against the em size and
    /// viewport width. CSS alignment overrides `base_align`; box
    /// lengths resolve with `%` against the viewport.
    pub fn from_css(
        css: &CssStyle,
        em_px: f32,
        base_align: TextAlign,
        base_align_defined: bool,
        viewport_width: u16,
    ) -> Self {
        let vw = f32::from(viewport_width);
        let (alignment, align_defined) = if css.has_text_align() {
            (css.text_align, true)
        } else {
            (base_align, base_align_defined)
        };
        Self {
            alignment,
            align_defined,
            margin_top: to_px_i16(css.margin_top, em_px, vw),
            margin_bottom: to_px_i16(css.margin_bottom, em_px, vw),
            margin_left: to_px_i16(css.margin_left, em_px, vw),
            margin_right: to_px_i16(css.margin_right, em_px, vw),
            padding_top: to_px_i16(css.padding_top, em_px, vw),
            padding_bottom: to_px_i16(css.padding_bottom, em_px, vw),
            padding_left: to_px_i16(css.padding_left, em_px, vw),
            padding_right: to_px_i16(css.padding_right, em_px, vw),
            first_line_indent: if css.has_text_indent() {
                to_px_i16(css.text_indent, em_px, vw)
            } else {
                0
            },
            indent_defined: css.has_text_indent(),
        }
    }

    /// Accumulate a nested block's style onto this one: explicit
    /// alignment and indent win, box spacing takes the larger of the
    /// two sides.
    pub fn combined(&self, overlay: &BlockStyle) -> BlockStyle {
        let (alignment, align_defined) = if overlay.align_defined {
            (overlay.alignment, true)
        } else {
            (self.alignment, self.align_defined)
        };
        let (first_line_indent, indent_defined) = if overlay.indent_defined {
            (overlay.first_line_indent, true)
        } else {
            (self.first_line_indent, self.indent_defined)
        };
        BlockStyle {
            alignment,
            align_defined,
            margin_top: self.margin_top.max(overlay.margin_top),
            margin_bottom: self.margin_bottom.max(overlay.margin_bottom),
            margin_left: self.margin_left.max(overlay.margin_left),
            margin_right: self.margin_right.max(overlay.margin_right),
            padding_top: self.padding_top.max(overlay.padding_top),
            padding_bottom: self.padding_bottom.max(overlay.padding_bottom),
            padding_left: self.padding_left.max(overlay.padding_left),
            padding_right: self.padding_right.max(overlay.padding_right),
            first_line_indent,
            indent_defined,
        }
    }

    /// Horizontal offset of the block's content from the viewport
    /// left edge.
    pub fn left_inset(&self) -> i16 {
        self.margin_left.saturating_add(self.padding_left)
    }

    /// Total horizontal pixels unavailable to text.
    pub fn horizontal_inset(&self) -> i32 {
        i32::from(self.margin_left)
            + i32::from(self.margin_right)
            + i32::from(self.padding_left)
            + i32::from(self.padding_right)
    }

    pub fn serialize(&self, w: &mut impl Write) -> Result<()> {
        write_u8(w, self.alignment.as_u8())?;
        write_bool(w, self.align_defined)?;
        write_i16(w, self.margin_top)?;
        write_i16(w, self.margin_bottom)?;
        write_i16(w, self.margin_left)?;
        write_i16(w, self.margin_right)?;
        write_i16(w, self.padding_top)?;
        write_i16(w, self.padding_bottom)?;
        write_i16(w, self.padding_left)?;
        write_i16(w, self.padding_right)?;
        write_i16(w, self.first_line_indent)?;
        write_bool(w, self.indent_defined)?;
        Ok(())
    }

    pub fn deserialize(r: &mut impl Read) -> Result<Self> {
        Ok(Self {
            alignment: TextAlign::from_u8(read_u8(r)?),
            align_defined: read_bool(r)?,
            margin_top: read_i16(r)?,
            margin_bottom: read_i16(r)?,
            margin_left: read_i16(r)?,
            margin_right: read_i16(r)?,
            padding_top: read_i16(r)?,
            padding_bottom: read_i16(r)?,
            padding_left: read_i16(r)?,
            padding_right: read_i16(r)?,
            first_line_indent: read_i16(r)?,
            indent_defined: read_bool(r)?,
        })
    }
}
