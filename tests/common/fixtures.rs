//! EPUB fixture builders for integration tests: a minimal ZIP writer
//! plus canned publications assembled in memory.

use std::io::Cursor;

use folio::ZipArchive;

/// Minimal ZIP writer (stored and DEFLATE entries) sufficient for
/// the archive reader to open.
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

pub const CONTAINER_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>"#;

/// Open an in-memory archive through the public trait object path.
pub fn open_archive(bytes: Vec<u8>) -> Box<ZipArchive<Cursor<Vec<u8>>>> {
    Box::new(ZipArchive::from_reader(Cursor::new(bytes)).expect("fixture archive must parse"))
}

/// Scenario fixture: one spine item of exactly 1000 inflated bytes,
/// no TOC, title "A", author "B", language "en".
pub fn trivial_epub() -> Vec<u8> {
    let opf = r#"<?xml version="1.0" encoding="UTF-8"?>
<package xmlns="http://www.idpf.org/2007/opf" version="3.0">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/">
    <dc:title>A</dc:title>
    <dc:creator>B</dc:creator>
    <dc:language>en</dc:language>
  </metadata>
  <manifest>
    <item id="ch1" href="ch1.xhtml" media-type="application/xhtml+xml"/>
  </manifest>
  <spine>
    <itemref idref="ch1"/>
  </spine>
</package>"#;

    // Pad a valid chapter to exactly 1000 bytes of inflated size.
    let mut chapter = String::with_capacity(1000);
    chapter.push_str("<html><body><p>hello world</p>");
    while chapter.len() < 1000 - "</body></html>".len() - 9 {
        chapter.push_str("<!-- p -->");
    }
    while chapter.len() < 1000 - "</body></html>".len() {
        chapter.push(' ');
    }
    chapter.push_str("</body></html>");
    assert_eq!(chapter.len(), 1000);

    let mut builder = ZipBuilder::new();
    builder.add_stored("mimetype", b"application/epub+zip");
    builder.add_stored("META-INF/container.xml", CONTAINER_XML.as_bytes());
    builder.add_stored("OEBPS/content.opf", opf.as_bytes());
    builder.add_deflated("OEBPS/ch1.xhtml", chapter.as_bytes());
    builder.finish()
}

/// Scenario fixture: spine `[ch1, ch2]` with an NCX mapping
/// `Intro → ch1`, `End → ch2`, plus a stylesheet and a guide
/// text reference.
pub fn two_chapter_epub() -> Vec<u8> {
    let opf = r#"<?xml version="1.0" encoding="UTF-8"?>
<package xmlns="http://www.idpf.org/2007/opf" version="2.0">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/">
    <dc:title>Two Chapters</dc:title>
    <dc:creator>An Author</dc:creator>
    <dc:language>en-US</dc:language>
  </metadata>
  <manifest>
    <item id="ch1" href="text/ch1.xhtml" media-type="application/xhtml+xml"/>
    <item id="ch2" href="text/ch2.xhtml" media-type="application/xhtml+xml"/>
    <item id="css" href="styles/book.css" media-type="text/css"/>
    <item id="ncx" href="toc.ncx" media-type="application/x-dtbncx+xml"/>
    <item id="cover" href="images/cover.jpg" media-type="image/jpeg"/>
  </manifest>
  <spine toc="ncx">
    <itemref idref="ch1"/>
    <itemref idref="ch2"/>
  </spine>
  <guide>
    <reference type="text" href="text/ch1.xhtml"/>
  </guide>
</package>"#;

    let ncx = r#"<?xml version="1.0" encoding="UTF-8"?>
<ncx xmlns="http://www.daisy.org/z3986/2005/ncx/" version="2005-1">
  <navMap>
    <navPoint id="n1" playOrder="1">
      <navLabel><text>Intro</text></navLabel>
      <content src="text/ch1.xhtml"/>
    </navPoint>
    <navPoint id="n2" playOrder="2">
      <navLabel><text>End</text></navLabel>
      <content src="text/ch2.xhtml"/>
    </navPoint>
  </navMap>
</ncx>"#;

    let css = "p { text-align: justify; text-indent: 1em }\n.quote { font-style: italic }\n";
    let ch1 = r#"<html><body><h1>Intro</h1><p>The first chapter has a few words of text to paginate.</p><p class="quote">A styled quote follows the opening paragraph.</p></body></html>"#;
    let ch2 = r#"<html><body><h1>End</h1><p>The second chapter closes the tiny book with another paragraph.</p></body></html>"#;

    let mut builder = ZipBuilder::new();
    builder.add_stored("mimetype", b"application/epub+zip");
    builder.add_stored("META-INF/container.xml", CONTAINER_XML.as_bytes());
    builder.add_stored("OEBPS/content.opf", opf.as_bytes());
    builder.add_deflated("OEBPS/toc.ncx", ncx.as_bytes());
    builder.add_deflated("OEBPS/styles/book.css", css.as_bytes());
    builder.add_deflated("OEBPS/text/ch1.xhtml", ch1.as_bytes());
    builder.add_deflated("OEBPS/text/ch2.xhtml", ch2.as_bytes());
    builder.add_stored("OEBPS/images/cover.jpg", b"\xFF\xD8\xFF\xE0 not a real jpeg");
    builder.finish()
}

/// Fixture with an EPUB 3 nav document and a cover-image property.
pub fn nav_epub() -> Vec<u8> {
    let opf = r#"<?xml version="1.0" encoding="UTF-8"?>
<package xmlns="http://www.idpf.org/2007/opf" version="3.0">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/">
    <dc:title>Modern Book</dc:title>
    <dc:creator>Nav Author</dc:creator>
    <dc:language>de</dc:language>
  </metadata>
  <manifest>
    <item id="nav" href="nav.xhtml" media-type="application/xhtml+xml" properties="nav"/>
    <item id="ch1" href="text/ch1.xhtml" media-type="application/xhtml+xml"/>
    <item id="ch2" href="text/ch2.xhtml" media-type="application/xhtml+xml"/>
    <item id="cov" href="images/cover.jpg" media-type="image/jpeg" properties="cover-image"/>
  </manifest>
  <spine>
    <itemref idref="ch1"/>
    <itemref idref="ch2"/>
  </spine>
</package>"#;

    let nav = r#"<?xml version="1.0" encoding="UTF-8"?>
<html xmlns="http://www.w3.org/1999/xhtml" xmlns:epub="http://www.idpf.org/2007/ops">
<body>
<nav epub:type="toc">
  <ol>
    <li><a href="text/ch1.xhtml">Erstes Kapitel</a>
      <ol><li><a href="text/ch1.xhtml#s1">Abschnitt</a></li></ol>
    </li>
    <li><a href="text/ch2.xhtml">Zweites Kapitel</a></li>
  </ol>
</nav>
</body>
</html>"#;

    let ch = "<html><body><p>Inhalt des Kapitels.</p></body></html>";

    let mut builder = ZipBuilder::new();
    builder.add_stored("mimetype", b"application/epub+zip");
    builder.add_stored("META-INF/container.xml", CONTAINER_XML.as_bytes());
    builder.add_stored("OEBPS/content.opf", opf.as_bytes());
    builder.add_deflated("OEBPS/nav.xhtml", nav.as_bytes());
    builder.add_deflated("OEBPS/text/ch1.xhtml", ch.as_bytes());
    builder.add_deflated("OEBPS/text/ch2.xhtml", ch.as_bytes());
    builder.add_stored("OEBPS/images/cover.jpg", b"\xFF\xD8\xFF\xE0 cover bytes");
    builder.finish()
}
