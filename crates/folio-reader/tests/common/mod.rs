//! Shared fixtures for reader integration tests: an in-memory EPUB
//! builder and a deterministic glyph-width oracle.

use std::io::Cursor;

use folio::metrics::{GlyphMetrics, StyleFlags};
use folio::{Publication, ReaderSettings, ZipArchive};

pub struct ZipBuilder {
    data: Vec<u8>,
    central: Vec<u8>,
    count: u16,
}

impl ZipBuilder {
    pub fn new() -> Self {
        Self {
            data: Vec::with_capacity(1024),
            central: Vec::with_capacity(256),
            count: 0,
        }
    }

    pub fn add_stored(&mut self, name: &str, contents: &[u8]) -> &mut Self {
        self.add_entry(name, contents, contents.to_vec(), 0)
    }

    pub fn add_deflated(&mut self, name: &str, contents: &[u8]) -> &mut Self {
        let compressed = miniz_oxide::deflate::compress_to_vec(contents, 6);
        self.add_entry(name, contents, compressed, 8)
    }

    fn add_entry(&mut self, name: &str, contents: &[u8], payload: Vec<u8>, method: u16) -> &mut Self {
        let crc = crc32fast::hash(contents);
        let offset = self.data.len() as u32;

        self.data.extend_from_slice(&0x0403_4b50u32.to_le_bytes());
        self.data.extend_from_slice(&20u16.to_le_bytes());
        self.data.extend_from_slice(&0u16.to_le_bytes());
        self.data.extend_from_slice(&method.to_le_bytes());
        self.data.extend_from_slice(&0u32.to_le_bytes());
        self.data.extend_from_slice(&crc.to_le_bytes());
        self.data.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        self.data.extend_from_slice(&(contents.len() as u32).to_le_bytes());
        self.data.extend_from_slice(&(name.len() as u16).to_le_bytes());
        self.data.extend_from_slice(&0u16.to_le_bytes());
        self.data.extend_from_slice(name.as_bytes());
        self.data.extend_from_slice(&payload);

        self.central.extend_from_slice(&0x0201_4b50u32.to_le_bytes());
        self.central.extend_from_slice(&20u16.to_le_bytes());
        self.central.extend_from_slice(&20u16.to_le_bytes());
        self.central.extend_from_slice(&0u16.to_le_bytes());
        self.central.extend_from_slice(&method.to_le_bytes());
        self.central.extend_from_slice(&0u32.to_le_bytes());
        self.central.extend_from_slice(&crc.to_le_bytes());
        self.central.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        self.central.extend_from_slice(&(contents.len() as u32).to_le_bytes());
        self.central.extend_from_slice(&(name.len() as u16).to_le_bytes());
        self.central.extend_from_slice(&0u16.to_le_bytes());
        self.central.extend_from_slice(&0u16.to_le_bytes());
        self.central.extend_from_slice(&0u16.to_le_bytes());
        self.central.extend_from_slice(&0u16.to_le_bytes());
        self.central.extend_from_slice(&0u32.to_le_bytes());
        self.central.extend_from_slice(&offset.to_le_bytes());
        self.central.extend_from_slice(name.as_bytes());

        self.count += 1;
        self
    }

    pub fn finish(&self) -> Vec<u8> {
        let mut out = self.data.clone();
        let cd_offset = out.len() as u32;
        out.extend_from_slice(&self.central);
        let cd_size = self.central.len() as u32;
        out.extend_from_slice(&0x0605_4b50u32.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&self.count.to_le_bytes());
        out.extend_from_slice(&self.count.to_le_bytes());
        out.extend_from_slice(&cd_size.to_le_bytes());
        out.extend_from_slice(&cd_offset.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out
    }
}

const CONTAINER_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>"#;

/// A book whose chapters each carry `words_per_chapter` short words,
/// so page counts scale predictably with the viewport.
pub fn book_with_chapters(chapter_count: usize, words_per_chapter: usize) -> Vec<u8> {
    let mut manifest = String::new();
    let mut spine = String::new();
    for i in 0..chapter_count {
        manifest.push_str(&format!(
            r#"<item id="ch{i}" href="text/ch{i}.xhtml" media-type="application/xhtml+xml"/>"#
        ));
        spine.push_str(&format!(r#"<itemref idref="ch{i}"/>"#));
    }
    let opf = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<package xmlns="http://www.idpf.org/2007/opf" version="3.0">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/">
    <dc:title>Paged Book</dc:title>
    <dc:creator>Fixture</dc:creator>
    <dc:language>en</dc:language>
  </metadata>
  <manifest>{manifest}</manifest>
  <spine>{spine}</spine>
</package>"#
    );

    let mut builder = ZipBuilder::new();
    builder.add_stored("mimetype", b"application/epub+zip");
    builder.add_stored("META-INF/container.xml", CONTAINER_XML.as_bytes());
    builder.add_stored("OEBPS/content.opf", opf.as_bytes());
    for i in 0..chapter_count {
        let mut body = String::from("<html><body><p>");
        for w in 0..words_per_chapter {
            body.push_str(&format!("c{}w{} ", i, w));
        }
        body.push_str("</p></body></html>");
        builder.add_deflated(&format!("OEBPS/text/ch{}.xhtml", i), body.as_bytes());
    }
    builder.finish()
}

pub fn open_publication(bytes: Vec<u8>, path: &str, cache_root: &std::path::Path) -> Publication {
    let archive = ZipArchive::from_reader(Cursor::new(bytes)).expect("fixture archive");
    Publication::open(Box::new(archive), path, cache_root).expect("publication opens")
}

/// Deterministic oracle: glyph width scales with `char_px` so a font
/// change reliably changes pagination.
pub struct FixedMetrics {
    pub char_px: u32,
}

impl GlyphMetrics for FixedMetrics {
    fn text_width(&self, _font: i32, text: &str, _flags: StyleFlags) -> u32 {
        text.chars().count() as u32 * self.char_px
    }

    fn space_width(&self, _font: i32) -> u32 {
        self.char_px / 2
    }

    fn advance_x(&self, font: i32, text: &str) -> i32 {
        self.text_width(font, text, StyleFlags::REGULAR) as i32
    }

    fn line_height(&self, _font: i32) -> u32 {
        20
    }

    fn ascender(&self, _font: i32) -> i32 {
        15
    }
}

/// Settings tuned so the fixture chapters span several small pages.
pub fn small_viewport_settings() -> ReaderSettings {
    ReaderSettings {
        viewport_width: 120,
        viewport_height: 60,
        ..ReaderSettings::default()
    }
}
