//! Page intermediate representation and its binary serialization.
//!
//! A page is an ordered list of placed elements. The element tag
//! byte values (1 = line, 2 = image) are part of the section cache
//! format and never change meaning.

use std::io::{Read, Write};

use folio::error::{FolioError, Result};
use folio::metrics::{GlyphMetrics, PageSurface};
use folio::serialize::{read_i16, read_str, read_u16, read_u8, write_i16, write_str, write_u16, write_u8};

use crate::paragraph::TextLine;

/// Serialized tag for a [`PageLine`].
pub const TAG_PAGE_LINE: u8 = 1;
/// Serialized tag for a [`PageImage`].
pub const TAG_PAGE_IMAGE: u8 = 2;

/// Deserialization guard for element counts.
const MAX_PAGE_ELEMENTS: usize = 10_000;

/// A line placed on a page.
#[derive(Clone, Debug, PartialEq)]
pub struct PageLine {
    pub line: TextLine,
    /// Pixel offset from the page origin (the block's left inset).
    pub x: i16,
    pub y: i16,
}

/// An image placeholder placed on a page.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageImage {
    /// Archive href of the image resource.
    pub href: String,
    pub width: i16,
    pub height: i16,
    pub x: i16,
    pub y: i16,
}

/// One placed element.
#[derive(Clone, Debug, PartialEq)]
pub enum PageElement {
    Line(PageLine),
    Image(PageImage),
}

impl PageElement {
    pub fn tag(&self) -> u8 {
        match self {
            Self::Line(_) => TAG_PAGE_LINE,
            Self::Image(_) => TAG_PAGE_IMAGE,
        }
    }
}

/// An ordered list of placed elements; the unit of the section cache.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Page {
    pub elements: Vec<PageElement>,
}

impl Page {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// True when any element is an image; such pages get a full
    /// refresh to avoid ghosting.
    pub fn has_images(&self) -> bool {
        self.elements
            .iter()
            .any(|el| matches!(el, PageElement::Image(_)))
    }

    /// Union rectangle of all image elements, `(x, y, w, h)` relative
    /// to the page origin. `None` without images.
    pub fn image_bounding_box(&self) -> Option<(i16, i16, i16, i16)> {
        let mut bounds: Option<(i16, i16, i16, i16)> = None; // min_x, min_y, max_x, max_y
        for el in &self.elements {
            if let PageElement::Image(img) = el {
                let right = img.x.saturating_add(img.width);
                let bottom = img.y.saturating_add(img.height);
                bounds = Some(match bounds {
                    None => (img.x, img.y, right, bottom),
                    Some((min_x, min_y, max_x, max_y)) => (
                        min_x.min(img.x),
                        min_y.min(img.y),
                        max_x.max(right),
                        max_y.max(bottom),
                    ),
                });
            }
        }
        bounds.map(|(min_x, min_y, max_x, max_y)| (min_x, min_y, max_x - min_x, max_y - min_y))
    }

    /// Draw the page at an offset. Images render as outlined boxes;
    /// actual raster data is the host's concern.
    pub fn render(
        &self,
        surface: &mut dyn PageSurface,
        metrics: &dyn GlyphMetrics,
        font_id: i32,
        x_offset: i32,
        y_offset: i32,
    ) {
        for el in &self.elements {
            match el {
                PageElement::Line(line) => {
                    line.line.render(
                        surface,
                        metrics,
                        font_id,
                        i32::from(line.x) + x_offset,
                        i32::from(line.y) + y_offset,
                    );
                }
                PageElement::Image(img) => {
                    let x = i32::from(img.x) + x_offset;
                    let y = i32::from(img.y) + y_offset;
                    let w = i32::from(img.width);
                    let h = i32::from(img.height);
                    surface.draw_line(x, y, x + w, y, true);
                    surface.draw_line(x, y + h, x + w, y + h, true);
                    surface.draw_line(x, y, x, y + h, true);
                    surface.draw_line(x + w, y, x + w, y + h, true);
                }
            }
        }
    }

    pub fn serialize(&self, w: &mut impl Write) -> Result<()> {
        let count = u16::try_from(self.elements.len())
            .map_err(|_| FolioError::Io("page element count exceeds u16".into()))?;
        write_u16(w, count)?;
        for el in &self.elements {
            write_u8(w, el.tag())?;
            match el {
                PageElement::Line(line) => {
                    write_i16(w, line.x)?;
                    write_i16(w, line.y)?;
                    line.line.serialize(w)?;
                }
                PageElement::Image(img) => {
                    write_i16(w, img.x)?;
                    write_i16(w, img.y)?;
                    write_str(w, &img.href)?;
                    write_i16(w, img.width)?;
                    write_i16(w, img.height)?;
                }
            }
        }
        Ok(())
    }

    pub fn deserialize(r: &mut impl Read) -> Result<Self> {
        let count = read_u16(r)? as usize;
        if count > MAX_PAGE_ELEMENTS {
            return Err(FolioError::CorruptCache(format!(
                "page declares {} elements",
                count
            )));
        }
        let mut elements = Vec::with_capacity(count);
        for _ in 0..count {
            let tag = read_u8(r)?;
            let x = read_i16(r)?;
            let y = read_i16(r)?;
            match tag {
                TAG_PAGE_LINE => {
                    let line = TextLine::deserialize(r)?;
                    elements.push(PageElement::Line(PageLine { line, x, y }));
                }
                TAG_PAGE_IMAGE => {
                    let href = read_str(r)?;
                    let width = read_i16(r)?;
                    let height = read_i16(r)?;
                    elements.push(PageElement::Image(PageImage {
                        href,
                        width,
                        height,
                        x,
                        y,
                    }));
                }
                other => {
                    return Err(FolioError::CorruptCache(format!(
                        "unknown page element tag {}",
                        other
                    )));
                }
            }
        }
        Ok(Self { elements })
    }
}
