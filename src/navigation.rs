//! Navigation-document parsing: EPUB 3 XHTML nav (`epub:type="toc"`)
//! and EPUB 2 NCX fallback.
//!
//! Both parsers emit a flat, document-ordered entry list. Hierarchy
//! is advisory: each entry carries its nesting `level` (≥ 1) and the
//! consumer decides how much indentation to show.

use std::io::BufRead;

use quick_xml::events::Event;
use quick_xml::reader::Reader;

use crate::error::{FolioError, Result};
use crate::opf::local_name;

/// Limits for navigation parsing and structure growth.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NavLimits {
    /// Maximum number of entries accepted.
    pub max_entries: usize,
    /// Maximum nesting depth.
    pub max_depth: usize,
    /// Maximum UTF-8 byte length for titles.
    pub max_title_bytes: usize,
    /// Maximum UTF-8 byte length for hrefs.
    pub max_href_bytes: usize,
}

impl Default for NavLimits {
    fn default() -> Self {
        Self {
            max_entries: 4096,
            max_depth: 64,
            max_title_bytes: 4096,
            max_href_bytes: 4096,
        }
    }
}

impl NavLimits {
    /// Embedded-focused preset with smaller bounds.
    pub fn embedded() -> Self {
        Self {
            max_entries: 1024,
            max_depth: 32,
            max_title_bytes: 1024,
            max_href_bytes: 2048,
        }
    }
}

/// One navigation target before spine resolution.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawTocEntry {
    /// Display title.
    pub title: String,
    /// Nesting depth, 1 for top-level entries.
    pub level: u8,
    /// Target href relative to the navigation document.
    pub src: String,
}

fn too_deep(depth: usize, limits: NavLimits) -> FolioError {
    FolioError::Parse(format!(
        "navigation depth exceeds max_depth ({} > {})",
        depth, limits.max_depth
    ))
}

fn too_many(count: usize, limits: NavLimits) -> FolioError {
    FolioError::Parse(format!(
        "navigation entries exceed max_entries ({} > {})",
        count, limits.max_entries
    ))
}

/// Parse an EPUB 2 NCX document into a flat TOC.
pub fn parse_ncx(content: impl BufRead) -> Result<Vec<RawTocEntry>> {
    parse_ncx_with_limits(content, NavLimits::default())
}

/// Parse an NCX with explicit limits.
pub fn parse_ncx_with_limits(
    content: impl BufRead,
    limits: NavLimits,
) -> Result<Vec<RawTocEntry>> {
    let mut reader = Reader::from_reader(content);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::with_capacity(256);

    let mut entries: Vec<RawTocEntry> = Vec::with_capacity(16);
    // Indices into `entries` for the open navPoint chain.
    let mut open_points: Vec<usize> = Vec::with_capacity(8);
    let mut in_nav_map = false;
    let mut in_label = false;
    let mut in_text = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => match local_name(e.name().as_ref()) {
                b"navMap" => in_nav_map = true,
                b"navPoint" if in_nav_map => {
                    if open_points.len() >= limits.max_depth {
                        return Err(too_deep(open_points.len() + 1, limits));
                    }
                    if entries.len() >= limits.max_entries {
                        return Err(too_many(entries.len() + 1, limits));
                    }
                    entries.push(RawTocEntry {
                        title: String::with_capacity(32),
                        level: (open_points.len() + 1).min(u8::MAX as usize) as u8,
                        src: String::new(),
                    });
                    open_points.push(entries.len() - 1);
                }
                b"navLabel" if !open_points.is_empty() => in_label = true,
                b"text" if in_label => in_text = true,
                b"content" => {
                    if let Some(point) = open_points.last() {
                        for attr in e.attributes().flatten() {
                            if local_name(attr.key.as_ref()) == b"src" {
                                let src = reader
                                    .decoder()
                                    .decode(attr.value.as_ref())
                                    .unwrap_or_default();
                                if src.len() > limits.max_href_bytes {
                                    return Err(FolioError::Parse(format!(
                                        "navigation href exceeds max_href_bytes ({} > {})",
                                        src.len(),
                                        limits.max_href_bytes
                                    )));
                                }
                                entries[*point].src = src.into_owned();
                            }
                        }
                    }
                }
                _ => {}
            },
            Ok(Event::Text(e)) => {
                if in_text {
                    if let Some(point) = open_points.last() {
                        let text = reader.decoder().decode(&e).unwrap_or_default();
                        let title = &mut entries[*point].title;
                        title.push_str(text.as_ref());
                        if title.len() > limits.max_title_bytes {
                            return Err(FolioError::Parse(format!(
                                "navigation title exceeds max_title_bytes ({} > {})",
                                title.len(),
                                limits.max_title_bytes
                            )));
                        }
                    }
                }
            }
            Ok(Event::End(e)) => match local_name(e.name().as_ref()) {
                b"navMap" => in_nav_map = false,
                b"navPoint" => {
                    open_points.pop();
                }
                b"navLabel" => in_label = false,
                b"text" => in_text = false,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(FolioError::Parse(format!("NCX parse error: {:?}", e)));
            }
            _ => {}
        }
        buf.clear();
    }

    entries.retain(|entry| !entry.title.is_empty() && !entry.src.is_empty());
    Ok(entries)
}

/// Parse an EPUB 3 nav document's `epub:type="toc"` list into a flat
/// TOC.
pub fn parse_nav(content: impl BufRead) -> Result<Vec<RawTocEntry>> {
    parse_nav_with_limits(content, NavLimits::default())
}

/// Parse a nav document with explicit limits.
pub fn parse_nav_with_limits(
    content: impl BufRead,
    limits: NavLimits,
) -> Result<Vec<RawTocEntry>> {
    let mut reader = Reader::from_reader(content);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::with_capacity(256);

    let mut entries: Vec<RawTocEntry> = Vec::with_capacity(16);
    let mut in_toc_nav = false;
    let mut li_depth = 0usize;
    // Index of the entry whose anchor text is being collected.
    let mut open_anchor: Option<usize> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match local_name(e.name().as_ref()) {
                b"nav" => {
                    for attr in e.attributes().flatten() {
                        let key = attr.key.as_ref();
                        if key == b"epub:type" || key.ends_with(b":type") {
                            let value = reader
                                .decoder()
                                .decode(attr.value.as_ref())
                                .unwrap_or_default();
                            in_toc_nav = value.as_ref() == "toc";
                        }
                    }
                }
                b"li" if in_toc_nav => {
                    li_depth += 1;
                    if li_depth > limits.max_depth {
                        return Err(too_deep(li_depth, limits));
                    }
                }
                b"a" if in_toc_nav && li_depth > 0 => {
                    if entries.len() >= limits.max_entries {
                        return Err(too_many(entries.len() + 1, limits));
                    }
                    let mut entry = RawTocEntry {
                        title: String::with_capacity(32),
                        level: li_depth.min(u8::MAX as usize) as u8,
                        src: String::new(),
                    };
                    for attr in e.attributes().flatten() {
                        if local_name(attr.key.as_ref()) == b"href" {
                            let href = reader
                                .decoder()
                                .decode(attr.value.as_ref())
                                .unwrap_or_default();
                            if href.len() > limits.max_href_bytes {
                                return Err(FolioError::Parse(format!(
                                    "navigation href exceeds max_href_bytes ({} > {})",
                                    href.len(),
                                    limits.max_href_bytes
                                )));
                            }
                            entry.src = href.into_owned();
                        }
                    }
                    entries.push(entry);
                    open_anchor = Some(entries.len() - 1);
                }
                _ => {}
            },
            Ok(Event::Text(e)) => {
                if let Some(idx) = open_anchor {
                    let text = reader.decoder().decode(&e).unwrap_or_default();
                    let title = &mut entries[idx].title;
                    // Space-join text fragments from formatted anchors
                    // (e.g. "Part <em>One</em>").
                    if !title.is_empty() && !title.ends_with(' ') && !text.starts_with(' ') {
                        title.push(' ');
                    }
                    title.push_str(text.as_ref());
                    if title.len() > limits.max_title_bytes {
                        return Err(FolioError::Parse(format!(
                            "navigation title exceeds max_title_bytes ({} > {})",
                            title.len(),
                            limits.max_title_bytes
                        )));
                    }
                }
            }
            Ok(Event::End(e)) => match local_name(e.name().as_ref()) {
                b"nav" => in_toc_nav = false,
                b"li" if in_toc_nav => li_depth = li_depth.saturating_sub(1),
                b"a" => open_anchor = None,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(FolioError::Parse(format!("nav parse error: {:?}", e)));
            }
            _ => {}
        }
        buf.clear();
    }

    entries.retain(|entry| !entry.title.is_empty() && !entry.src.is_empty());
    Ok(entries)
}
