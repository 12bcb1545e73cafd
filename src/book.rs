//! Publication indexing and the durable book binary.
//!
//! First open streams the archive once: container.xml locates the
//! package document, the package document yields metadata, manifest,
//! spine, and guide, the navigation document yields the TOC, and the
//! spine is cross-linked with cumulative inflated sizes. The result
//! persists as `book.bin`; subsequent opens read it back without
//! touching the package document. Stylesheets compile into
//! `css_rules.cache` in the same pass.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::archive::{normalize_entry_path, ArchiveReader, ZipArchive, ARCHIVE_CHUNK};
use crate::css::CssRuleSet;
use crate::error::{FolioError, Result};
use crate::navigation::{parse_nav, parse_ncx, RawTocEntry};
use crate::opf::{find_first_image_href, parse_container_xml, parse_package_doc, PackageDoc};
use crate::serialize::{
    fnv1a32, read_i32, read_str, read_u32, read_u8, write_i32, write_str, write_u32, write_u8,
};

/// Default name of the cache root directory.
pub const DEFAULT_CACHE_DIR: &str = ".folio";

/// `book.bin` magic: "FBK" plus a format revision byte.
pub const BOOK_BINARY_MAGIC: [u8; 4] = *b"FBK\x01";

const TAG_TITLE: u8 = 1;
const TAG_AUTHOR: u8 = 2;
const TAG_LANGUAGE: u8 = 3;
const TAG_COVER_HREF: u8 = 4;
const TAG_TEXT_REF_HREF: u8 = 5;
const TAG_SPINE: u8 = 6;
const TAG_TOC: u8 = 7;
const TAG_CONTENT_BASE: u8 = 8;

/// Sanity cap applied when reading array records back.
const MAX_ARRAY_ENTRIES: usize = 65_536;

/// Core metadata written once per book.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BookMetadata {
    pub title: String,
    pub author: String,
    /// BCP-47 tag as declared; the primary subtag drives hyphenation.
    pub language: String,
    /// Cover image href relative to the content base; empty when the
    /// publication declares none.
    pub cover_href: String,
    /// Guide text-start reference; empty when absent.
    pub text_reference_href: String,
}

/// One reading-order item.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SpineEntry {
    /// Path relative to the content base.
    pub href: String,
    /// Sum of inflated sizes of spine items `0..=i`.
    pub cumulative_size: u32,
    /// Smallest TOC index mapping here, or -1.
    pub toc_index: i32,
}

/// One navigation entry, in document order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TocEntry {
    pub title: String,
    /// Nesting depth, ≥ 1. Advisory.
    pub level: u8,
    /// Resolved spine index, or -1 when the target is not a spine
    /// item.
    pub spine_index: i32,
}

/// The durable index of one publication.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BookIndex {
    pub metadata: BookMetadata,
    pub spine: Vec<SpineEntry>,
    pub toc: Vec<TocEntry>,
    /// Directory inside the archive holding the package document,
    /// with a trailing slash (or empty for root).
    pub content_base: String,
}

impl BookIndex {
    pub fn spine_count(&self) -> usize {
        self.spine.len()
    }

    pub fn toc_count(&self) -> usize {
        self.toc.len()
    }

    pub fn spine_entry(&self, index: usize) -> Option<&SpineEntry> {
        self.spine.get(index)
    }

    pub fn toc_entry(&self, index: usize) -> Option<&TocEntry> {
        self.toc.get(index)
    }

    /// Total inflated size of the reading order.
    pub fn book_size_bytes(&self) -> u64 {
        self.spine.last().map_or(0, |e| u64::from(e.cumulative_size))
    }

    pub fn spine_index_for_toc(&self, toc_index: usize) -> Option<usize> {
        let spine = self.toc.get(toc_index)?.spine_index;
        usize::try_from(spine).ok()
    }

    pub fn toc_index_for_spine(&self, spine_index: usize) -> Option<usize> {
        let toc = self.spine.get(spine_index)?.toc_index;
        usize::try_from(toc).ok()
    }

    /// Spine index of the guide text-start reference, or 0.
    pub fn spine_index_for_text_reference(&self) -> usize {
        if self.metadata.text_reference_href.is_empty() {
            return 0;
        }
        self.spine
            .iter()
            .position(|e| e.href == self.metadata.text_reference_href)
            .unwrap_or(0)
    }

    /// Smallest spine index whose cumulative size reaches `percent`
    /// of the book.
    pub fn spine_index_for_percent(&self, percent: f32) -> usize {
        let total = self.book_size_bytes();
        if total == 0 || self.spine.is_empty() {
            return 0;
        }
        let target = (percent.clamp(0.0, 100.0) / 100.0 * total as f32) as u64;
        self.spine
            .iter()
            .position(|e| u64::from(e.cumulative_size) >= target)
            .unwrap_or(self.spine.len() - 1)
    }

    /// Fraction of the whole book read after `fraction_in_section` of
    /// spine item `spine_index`. Result is in `[0, 1]`.
    pub fn progress_fraction(&self, spine_index: usize, fraction_in_section: f32) -> f32 {
        let total = self.book_size_bytes();
        if total == 0 {
            return 0.0;
        }
        let spine_index = spine_index.min(self.spine.len().saturating_sub(1));
        let prev = if spine_index >= 1 {
            u64::from(self.spine[spine_index - 1].cumulative_size)
        } else {
            0
        };
        let current = u64::from(self.spine[spine_index].cumulative_size).saturating_sub(prev);
        let read = prev as f32 + fraction_in_section.clamp(0.0, 1.0) * current as f32;
        (read / total as f32).clamp(0.0, 1.0)
    }

    /// Serialize as tagged records under the `FBK` magic.
    pub fn save(&self, w: &mut impl Write) -> Result<()> {
        w.write_all(&BOOK_BINARY_MAGIC)?;
        write_record(w, TAG_TITLE, self.metadata.title.as_bytes())?;
        write_record(w, TAG_AUTHOR, self.metadata.author.as_bytes())?;
        write_record(w, TAG_LANGUAGE, self.metadata.language.as_bytes())?;
        write_record(w, TAG_COVER_HREF, self.metadata.cover_href.as_bytes())?;
        write_record(
            w,
            TAG_TEXT_REF_HREF,
            self.metadata.text_reference_href.as_bytes(),
        )?;
        write_record(w, TAG_CONTENT_BASE, self.content_base.as_bytes())?;

        let mut spine_payload = Vec::with_capacity(self.spine.len() * 32);
        write_u32(&mut spine_payload, self.spine.len() as u32)?;
        for entry in &self.spine {
            write_str(&mut spine_payload, &entry.href)?;
            write_u32(&mut spine_payload, entry.cumulative_size)?;
            write_i32(&mut spine_payload, entry.toc_index)?;
        }
        write_record(w, TAG_SPINE, &spine_payload)?;

        let mut toc_payload = Vec::with_capacity(self.toc.len() * 32);
        write_u32(&mut toc_payload, self.toc.len() as u32)?;
        for entry in &self.toc {
            write_str(&mut toc_payload, &entry.title)?;
            write_u8(&mut toc_payload, entry.level)?;
            write_i32(&mut toc_payload, entry.spine_index)?;
        }
        write_record(w, TAG_TOC, &toc_payload)?;

        Ok(())
    }

    /// Read a book binary back. Unknown tags are skipped so old
    /// readers tolerate format growth.
    pub fn load(r: &mut impl Read) -> Result<BookIndex> {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        if magic != BOOK_BINARY_MAGIC {
            return Err(FolioError::CorruptCache("book binary magic mismatch".into()));
        }

        let mut index = BookIndex::default();
        loop {
            let tag = match read_u8(r) {
                Ok(tag) => tag,
                Err(_) => break, // clean EOF between records
            };
            let len = read_u32(r)? as usize;
            if len > 16 * 1024 * 1024 {
                return Err(FolioError::CorruptCache(format!(
                    "book binary record of {} bytes",
                    len
                )));
            }
            let mut payload = vec![0u8; len];
            r.read_exact(&mut payload)?;
            let mut body = payload.as_slice();
            match tag {
                TAG_TITLE => index.metadata.title = record_string(&payload)?,
                TAG_AUTHOR => index.metadata.author = record_string(&payload)?,
                TAG_LANGUAGE => index.metadata.language = record_string(&payload)?,
                TAG_COVER_HREF => index.metadata.cover_href = record_string(&payload)?,
                TAG_TEXT_REF_HREF => {
                    index.metadata.text_reference_href = record_string(&payload)?
                }
                TAG_CONTENT_BASE => index.content_base = record_string(&payload)?,
                TAG_SPINE => {
                    let count = read_u32(&mut body)? as usize;
                    if count > MAX_ARRAY_ENTRIES {
                        return Err(FolioError::CorruptCache(format!(
                            "spine declares {} entries",
                            count
                        )));
                    }
                    index.spine = Vec::with_capacity(count);
                    for _ in 0..count {
                        index.spine.push(SpineEntry {
                            href: read_str(&mut body)?,
                            cumulative_size: read_u32(&mut body)?,
                            toc_index: read_i32(&mut body)?,
                        });
                    }
                }
                TAG_TOC => {
                    let count = read_u32(&mut body)? as usize;
                    if count > MAX_ARRAY_ENTRIES {
                        return Err(FolioError::CorruptCache(format!(
                            "toc declares {} entries",
                            count
                        )));
                    }
                    index.toc = Vec::with_capacity(count);
                    for _ in 0..count {
                        index.toc.push(TocEntry {
                            title: read_str(&mut body)?,
                            level: read_u8(&mut body)?,
                            spine_index: read_i32(&mut body)?,
                        });
                    }
                }
                _ => {} // forward compatibility
            }
        }
        Ok(index)
    }
}

fn write_record(w: &mut impl Write, tag: u8, payload: &[u8]) -> Result<()> {
    write_u8(w, tag)?;
    write_u32(w, payload.len() as u32)?;
    w.write_all(payload)?;
    Ok(())
}

fn record_string(payload: &[u8]) -> Result<String> {
    String::from_utf8(payload.to_vec())
        .map_err(|_| FolioError::CorruptCache("book binary string is not UTF-8".into()))
}

/// On-disk layout of one book's cache directory.
#[derive(Clone, Debug)]
pub struct CacheLayout {
    dir: PathBuf,
}

impl CacheLayout {
    /// `<root>/epub_<fnv1a32(archive_path)>` for the given book.
    pub fn for_book(cache_root: &Path, archive_path: &str) -> Self {
        Self {
            dir: cache_root.join(format!("epub_{:08x}", fnv1a32(archive_path.as_bytes()))),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn book_bin(&self) -> PathBuf {
        self.dir.join("book.bin")
    }

    pub fn css_cache(&self) -> PathBuf {
        self.dir.join("css_rules.cache")
    }

    pub fn sections_dir(&self) -> PathBuf {
        self.dir.join("sections")
    }

    pub fn section_file(&self, spine_index: usize) -> PathBuf {
        self.sections_dir().join(format!("{}.bin", spine_index))
    }

    pub fn progress_file(&self) -> PathBuf {
        self.dir.join("progress.bin")
    }

    pub fn temp_file(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

/// An opened publication: archive handle, durable index, and cache
/// directory. Sections and readers borrow it; it outlives them by
/// construction.
pub struct Publication {
    archive: Box<dyn ArchiveReader>,
    pub index: BookIndex,
    cache: CacheLayout,
}

impl std::fmt::Debug for Publication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publication")
            .field("index", &self.index)
            .field("cache", &self.cache)
            .finish()
    }
}

impl Publication {
    /// Open a publication archive from the filesystem.
    pub fn from_path(archive_path: &Path, cache_root: &Path) -> Result<Self> {
        let archive = ZipArchive::open(archive_path)?;
        Self::open(
            Box::new(archive),
            &archive_path.to_string_lossy(),
            cache_root,
        )
    }

    /// Open with an explicit archive reader. Loads `book.bin` when
    /// present and valid; otherwise indexes the archive and writes
    /// it.
    pub fn open(
        archive: Box<dyn ArchiveReader>,
        archive_path: &str,
        cache_root: &Path,
    ) -> Result<Self> {
        let cache = CacheLayout::for_book(cache_root, archive_path);

        if let Ok(file) = File::open(cache.book_bin()) {
            match BookIndex::load(&mut BufReader::new(file)) {
                Ok(index) => {
                    log::debug!("book binary loaded from {}", cache.book_bin().display());
                    return Ok(Self {
                        archive,
                        index,
                        cache,
                    });
                }
                Err(e) => {
                    log::warn!("book binary unreadable, rebuilding: {}", e);
                    let _ = std::fs::remove_file(cache.book_bin());
                }
            }
        }

        std::fs::create_dir_all(cache.dir())
            .map_err(|e| FolioError::CacheBuildFailed(format!("create cache dir: {}", e)))?;

        let index = match build_index(archive.as_ref(), &cache) {
            Ok(index) => index,
            Err(FolioError::NotAnEpub) => return Err(FolioError::NotAnEpub),
            Err(e) => {
                // Never leave half-written artifacts behind.
                let _ = std::fs::remove_file(cache.book_bin());
                let _ = std::fs::remove_file(cache.css_cache());
                return Err(FolioError::CacheBuildFailed(e.to_string()));
            }
        };

        // Reload what was written so every open sees identical state.
        let file = File::open(cache.book_bin())
            .map_err(|e| FolioError::CacheBuildFailed(format!("reopen book binary: {}", e)))?;
        let index_check = BookIndex::load(&mut BufReader::new(file))
            .map_err(|e| FolioError::CacheBuildFailed(e.to_string()))?;
        debug_assert_eq!(index, index_check);

        Ok(Self {
            archive,
            index: index_check,
            cache,
        })
    }

    pub fn cache(&self) -> &CacheLayout {
        &self.cache
    }

    pub fn title(&self) -> &str {
        &self.index.metadata.title
    }

    pub fn author(&self) -> &str {
        &self.index.metadata.author
    }

    pub fn language(&self) -> &str {
        &self.index.metadata.language
    }

    /// Navigation entries, or `TocMissing` when the book opened
    /// without a parseable table of contents.
    pub fn toc(&self) -> Result<&[TocEntry]> {
        if self.index.toc.is_empty() {
            return Err(FolioError::TocMissing);
        }
        Ok(&self.index.toc)
    }

    /// Cover image href, checked against the formats the renderer
    /// supports.
    pub fn cover_href(&self) -> Result<&str> {
        let href = &self.index.metadata.cover_href;
        if href.is_empty() {
            return Err(FolioError::CoverMissing);
        }
        let lower = href.to_ascii_lowercase();
        if lower.ends_with(".jpg") || lower.ends_with(".jpeg") {
            Ok(href)
        } else {
            Err(FolioError::UnsupportedImage(href.clone()))
        }
    }

    /// Resolve a content-base-relative href to an archive entry path.
    pub fn resolve_href(&self, href: &str) -> String {
        normalize_entry_path(&format!("{}{}", self.index.content_base, href))
    }

    pub fn item_size(&self, href: &str) -> Result<u64> {
        self.archive.inflated_size(&self.resolve_href(href))
    }

    pub fn read_item(&self, href: &str) -> Result<Vec<u8>> {
        self.archive.read_all(&self.resolve_href(href))
    }

    pub fn stream_item(&self, href: &str, sink: &mut dyn Write, chunk: usize) -> Result<()> {
        self.archive.read_stream(&self.resolve_href(href), sink, chunk)
    }

    /// Stream an item into a temp file under the cache directory and
    /// return its path. Callers remove the file when done.
    pub fn spool_item(&self, href: &str, temp_name: &str) -> Result<PathBuf> {
        let path = self.cache.temp_file(temp_name);
        spool(self.archive.as_ref(), &self.resolve_href(href), &path)?;
        Ok(path)
    }

    /// Compiled stylesheet rules: from `css_rules.cache` when valid,
    /// otherwise re-derived from the package document and re-cached.
    pub fn css_rules(&self) -> Result<CssRuleSet> {
        let mut rules = CssRuleSet::new();
        if let Ok(file) = File::open(self.cache.css_cache()) {
            if rules.load_cache(&mut BufReader::new(file)).is_ok() {
                return Ok(rules);
            }
            log::debug!("css cache invalid, reparsing stylesheets");
            let _ = std::fs::remove_file(self.cache.css_cache());
            rules.clear();
        }

        // The stylesheet list is not part of book.bin; recover it from
        // the package document.
        let opf_path = match locate_package_doc(self.archive.as_ref(), &self.cache) {
            Ok((path, _)) => path,
            Err(e) => {
                log::warn!("package document unavailable for css pass: {}", e);
                return Ok(rules);
            }
        };
        let doc = match parse_spooled_opf(self.archive.as_ref(), &self.cache, &opf_path, false) {
            Ok(doc) => doc,
            Err(e) => {
                log::warn!("package document unparseable for css pass: {}", e);
                return Ok(rules);
            }
        };
        let css_files = stylesheet_hrefs(&doc)?;
        load_css_files(self.archive.as_ref(), &self.cache, &self.index.content_base, &css_files, &mut rules)?;
        Ok(rules)
    }

    /// Delete every cached artifact for this book.
    pub fn clear_cache(&self) -> Result<()> {
        if !self.cache.dir().exists() {
            return Ok(());
        }
        std::fs::remove_dir_all(self.cache.dir())?;
        Ok(())
    }
}

/// Stream one archive entry into a file on disk.
fn spool(archive: &dyn ArchiveReader, entry: &str, path: &Path) -> Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    let result = archive.read_stream(entry, &mut writer, ARCHIVE_CHUNK);
    match result.and_then(|()| writer.flush().map_err(FolioError::from)) {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = std::fs::remove_file(path);
            Err(e)
        }
    }
}

/// Find the package document via container.xml. Returns the OPF path
/// and the content base directory (with trailing slash).
fn locate_package_doc(
    archive: &dyn ArchiveReader,
    cache: &CacheLayout,
) -> Result<(String, String)> {
    const CONTAINER: &str = "META-INF/container.xml";
    if !archive.exists(CONTAINER) {
        return Err(FolioError::NotAnEpub);
    }
    let temp = cache.temp_file(".container.xml");
    spool(archive, CONTAINER, &temp)?;
    let result = parse_container_xml(BufReader::new(File::open(&temp)?));
    let _ = std::fs::remove_file(&temp);
    let opf_path = normalize_entry_path(&result?);
    let content_base = match opf_path.rfind('/') {
        Some(pos) => opf_path[..=pos].to_string(),
        None => String::new(),
    };
    Ok((opf_path, content_base))
}

fn parse_spooled_opf(
    archive: &dyn ArchiveReader,
    cache: &CacheLayout,
    opf_path: &str,
    allow_spill: bool,
) -> Result<PackageDoc> {
    let temp = cache.temp_file(".content.opf");
    spool(archive, opf_path, &temp)?;
    let spill_dir = allow_spill.then(|| cache.dir());
    let result = parse_package_doc(BufReader::new(File::open(&temp)?), spill_dir);
    let _ = std::fs::remove_file(&temp);
    result
}

fn stylesheet_hrefs(doc: &PackageDoc) -> Result<Vec<String>> {
    let mut css_files = Vec::with_capacity(4);
    doc.manifest.for_each(|item| {
        if item.media_type.eq_ignore_ascii_case("text/css") {
            css_files.push(item.href.clone());
        }
    })?;
    Ok(css_files)
}

fn load_css_files(
    archive: &dyn ArchiveReader,
    cache: &CacheLayout,
    content_base: &str,
    css_files: &[String],
    rules: &mut CssRuleSet,
) -> Result<()> {
    for href in css_files {
        let entry = normalize_entry_path(&format!("{}{}", content_base, href));
        let temp = cache.temp_file(".tmp.css");
        if let Err(e) = spool(archive, &entry, &temp) {
            log::warn!("stylesheet {} unreadable: {}", entry, e);
            continue;
        }
        let mut reader = BufReader::new(File::open(&temp)?);
        if let Err(e) = rules.load_stream(&mut reader) {
            log::warn!("stylesheet {} unparseable: {}", entry, e);
        }
        let _ = std::fs::remove_file(&temp);
    }

    let mut writer = BufWriter::new(File::create(cache.css_cache())?);
    rules.save_cache(&mut writer)?;
    writer.flush()?;
    log::debug!(
        "compiled {} css rules from {} files",
        rules.rule_count(),
        css_files.len()
    );
    Ok(())
}

/// Suffix-match a navigation target against the spine entry paths.
fn match_spine_index(spine_paths: &[String], target: &str) -> i32 {
    if target.is_empty() {
        return -1;
    }
    for (i, path) in spine_paths.iter().enumerate() {
        if path == target
            || path.ends_with(&format!("/{}", target))
            || target.ends_with(&format!("/{}", path))
        {
            return i as i32;
        }
    }
    -1
}

/// Full archive indexing pass. Writes `book.bin` and the CSS cache.
fn build_index(archive: &dyn ArchiveReader, cache: &CacheLayout) -> Result<BookIndex> {
    let (opf_path, content_base) = locate_package_doc(archive, cache)?;
    log::debug!("package document at {}", opf_path);

    let doc = parse_spooled_opf(archive, cache, &opf_path, true)?;

    let mut metadata = BookMetadata {
        title: doc.title.clone(),
        author: doc.author.clone(),
        language: doc.language.clone(),
        cover_href: String::new(),
        text_reference_href: String::new(),
    };

    // Guide references: text start and the cover page fallback.
    let mut guide_cover_page = None;
    for reference in &doc.guide {
        match reference.ref_type.as_str() {
            "text" | "text-start" if metadata.text_reference_href.is_empty() => {
                metadata.text_reference_href = reference.href.clone();
            }
            "cover" | "cover-page" if guide_cover_page.is_none() => {
                guide_cover_page = Some(reference.href.clone());
            }
            _ => {}
        }
    }

    // Cover detection, in preference order.
    let mut cover_property_href = None;
    let mut nav_href = None;
    let mut css_files = Vec::with_capacity(4);
    doc.manifest.for_each(|item| {
        if cover_property_href.is_none()
            && item
                .properties
                .split_whitespace()
                .any(|p| p == "cover-image")
        {
            cover_property_href = Some(item.href.clone());
        }
        if nav_href.is_none() && item.properties.split_whitespace().any(|p| p == "nav") {
            nav_href = Some(item.href.clone());
        }
        if item.media_type.eq_ignore_ascii_case("text/css") {
            css_files.push(item.href.clone());
        }
    })?;

    metadata.cover_href = if let Some(href) = cover_property_href {
        href
    } else if let Some(item) = doc.manifest.get("cover")? {
        if item.media_type.starts_with("image/") {
            item.href
        } else {
            String::new()
        }
    } else {
        String::new()
    };
    if metadata.cover_href.is_empty() {
        if let Some(page_href) = guide_cover_page {
            metadata.cover_href =
                cover_from_guide_page(archive, cache, &content_base, &page_href).unwrap_or_default();
        }
    }
    if metadata.cover_href.is_empty() {
        log::debug!("no cover image found");
    }

    // Spine: resolve idrefs and sum inflated sizes.
    let mut spine = Vec::with_capacity(doc.spine_idrefs.len());
    let mut spine_paths = Vec::with_capacity(doc.spine_idrefs.len());
    let mut cumulative = 0u64;
    for idref in &doc.spine_idrefs {
        let Some(item) = doc.manifest.get(idref)? else {
            log::warn!("spine idref {} has no manifest item", idref);
            continue;
        };
        let full = normalize_entry_path(&format!("{}{}", content_base, item.href));
        let size = match archive.inflated_size(&full) {
            Ok(size) => size,
            Err(e) => {
                log::warn!("spine item {} missing from archive: {}", full, e);
                0
            }
        };
        cumulative = cumulative.saturating_add(size);
        spine.push(SpineEntry {
            href: item.href,
            cumulative_size: u32::try_from(cumulative).unwrap_or(u32::MAX),
            toc_index: -1,
        });
        spine_paths.push(full);
    }

    // TOC: prefer the EPUB 3 nav document, fall back to the NCX.
    let ncx_href = match &doc.spine_toc_idref {
        Some(idref) => doc.manifest.get(idref)?.map(|item| item.href),
        None => None,
    };
    let toc = build_toc(
        archive,
        cache,
        &content_base,
        nav_href.as_deref(),
        ncx_href.as_deref(),
        &spine_paths,
    );

    // Cross-link: smallest TOC index per spine item.
    for (toc_index, entry) in toc.iter().enumerate() {
        if let Ok(spine_index) = usize::try_from(entry.spine_index) {
            if let Some(spine_entry) = spine.get_mut(spine_index) {
                if spine_entry.toc_index < 0 {
                    spine_entry.toc_index = toc_index as i32;
                }
            }
        }
    }

    let index = BookIndex {
        metadata,
        spine,
        toc,
        content_base: content_base.clone(),
    };

    let mut writer = BufWriter::new(File::create(cache.book_bin())?);
    index.save(&mut writer)?;
    writer.flush()?;
    log::debug!(
        "book binary written: {} spine items, {} toc entries, {} bytes total",
        index.spine_count(),
        index.toc_count(),
        index.book_size_bytes()
    );

    // CSS pass runs last so a stylesheet problem never loses the
    // completed index.
    let mut rules = CssRuleSet::new();
    load_css_files(archive, cache, &content_base, &css_files, &mut rules)?;

    doc.manifest.cleanup();
    Ok(index)
}

/// Resolve the cover image referenced from a guide cover page.
fn cover_from_guide_page(
    archive: &dyn ArchiveReader,
    cache: &CacheLayout,
    content_base: &str,
    page_href: &str,
) -> Option<String> {
    let page_path = normalize_entry_path(&format!("{}{}", content_base, page_href));
    let temp = cache.temp_file(".cover_page.xhtml");
    spool(archive, &page_path, &temp).ok()?;
    let image = find_first_image_href(BufReader::new(File::open(&temp).ok()?));
    let _ = std::fs::remove_file(&temp);
    let image = image?;

    // Image src is relative to the cover page's own directory; map it
    // back to a content-base-relative href.
    let page_dir = match page_path.rfind('/') {
        Some(pos) => &page_path[..=pos],
        None => "",
    };
    let full = normalize_entry_path(&format!("{}{}", page_dir, image));
    Some(
        full.strip_prefix(content_base)
            .map(str::to_string)
            .unwrap_or(full),
    )
}

/// Parse whichever navigation document is available and resolve its
/// targets to spine indices.
fn build_toc(
    archive: &dyn ArchiveReader,
    cache: &CacheLayout,
    content_base: &str,
    nav_href: Option<&str>,
    ncx_href: Option<&str>,
    spine_paths: &[String],
) -> Vec<TocEntry> {
    let mut raw: Option<(Vec<RawTocEntry>, String)> = None;

    if let Some(href) = nav_href {
        match parse_spooled_toc(archive, cache, content_base, href, true) {
            Ok(entries) => raw = Some((entries, href.to_string())),
            Err(e) => log::warn!("nav document unparseable: {}", e),
        }
    }
    if raw.is_none() {
        if let Some(href) = ncx_href {
            match parse_spooled_toc(archive, cache, content_base, href, false) {
                Ok(entries) => raw = Some((entries, href.to_string())),
                Err(e) => log::warn!("ncx unparseable: {}", e),
            }
        }
    }

    let Some((entries, toc_doc_href)) = raw else {
        // Book still opens with an empty TOC.
        log::warn!("no parseable table of contents");
        return Vec::new();
    };

    // Nav targets are relative to the navigation document itself,
    // which may not share the package document's directory.
    let toc_doc_path = normalize_entry_path(&format!("{}{}", content_base, toc_doc_href));
    let toc_base = match toc_doc_path.rfind('/') {
        Some(pos) => &toc_doc_path[..=pos],
        None => "",
    };

    entries
        .into_iter()
        .map(|entry| {
            let target = entry.src.split('#').next().unwrap_or_default();
            let full = normalize_entry_path(&format!("{}{}", toc_base, target));
            TocEntry {
                title: entry.title,
                level: entry.level.max(1),
                spine_index: match_spine_index(spine_paths, &full),
            }
        })
        .collect()
}

fn parse_spooled_toc(
    archive: &dyn ArchiveReader,
    cache: &CacheLayout,
    content_base: &str,
    href: &str,
    is_nav: bool,
) -> Result<Vec<RawTocEntry>> {
    let entry = normalize_entry_path(&format!("{}{}", content_base, href));
    let temp = cache.temp_file(if is_nav { ".toc.nav" } else { ".toc.ncx" });
    spool(archive, &entry, &temp)?;
    let reader = BufReader::new(File::open(&temp)?);
    let result = if is_nav {
        parse_nav(reader)
    } else {
        parse_ncx(reader)
    };
    let _ = std::fs::remove_file(&temp);
    result
}
