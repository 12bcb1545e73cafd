//! Package-document parsing: `META-INF/container.xml`, the OPF
//! (metadata / manifest / spine / guide), and the guide cover-page
//! image scan.
//!
//! Everything is a single streaming pass over `quick-xml` events.
//! Manifests beyond [`LARGE_MANIFEST_THRESHOLD`] items spill to a
//! small disk file indexed by an FNV-1a hash of the item id (plus the
//! id length to keep collision chains short) so huge books never hold
//! their manifest in memory.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use quick_xml::events::Event;
use quick_xml::reader::Reader;

use crate::error::{FolioError, Result};
use crate::serialize::{fnv1a32, read_str, write_str};

/// Manifest size beyond which items spill to disk.
pub const LARGE_MANIFEST_THRESHOLD: usize = 400;

/// Spill file name inside the cache directory.
pub const MANIFEST_SPILL_NAME: &str = ".items.bin";

/// One `<item>` from the OPF manifest.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ManifestItem {
    pub id: String,
    pub href: String,
    pub media_type: String,
    pub properties: String,
}

/// One `<reference>` from the OPF guide.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GuideRef {
    pub ref_type: String,
    pub href: String,
}

/// Parsed package document.
pub struct PackageDoc {
    pub title: String,
    pub author: String,
    pub language: String,
    /// Spine idrefs in reading order.
    pub spine_idrefs: Vec<String>,
    /// `toc="…"` attribute of `<spine>` (NCX manifest id).
    pub spine_toc_idref: Option<String>,
    pub guide: Vec<GuideRef>,
    pub manifest: ManifestStore,
}

#[derive(Clone, Copy, Debug)]
struct SpillEntry {
    id_hash: u32,
    id_len: u16,
    offset: u32,
}

struct SpilledManifest {
    path: PathBuf,
    file: RefCell<File>,
    index: Vec<SpillEntry>,
    count: usize,
}

enum ManifestInner {
    Memory {
        items: Vec<ManifestItem>,
        by_id: HashMap<String, usize>,
    },
    Spilled(SpilledManifest),
}

/// Manifest items, in memory for normal books and disk-backed for
/// very large ones.
pub struct ManifestStore {
    inner: ManifestInner,
    spill_dir: Option<PathBuf>,
}

impl ManifestStore {
    fn new(spill_dir: Option<&Path>) -> Self {
        Self {
            inner: ManifestInner::Memory {
                items: Vec::with_capacity(32),
                by_id: HashMap::with_capacity(32),
            },
            spill_dir: spill_dir.map(Path::to_path_buf),
        }
    }

    pub fn len(&self) -> usize {
        match &self.inner {
            ManifestInner::Memory { items, .. } => items.len(),
            ManifestInner::Spilled(spilled) => spilled.count,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when items have spilled to disk.
    pub fn is_spilled(&self) -> bool {
        matches!(self.inner, ManifestInner::Spilled(_))
    }

    fn insert(&mut self, item: ManifestItem) -> Result<()> {
        if let ManifestInner::Memory { items, .. } = &self.inner {
            if items.len() >= LARGE_MANIFEST_THRESHOLD {
                if let Some(dir) = self.spill_dir.clone() {
                    self.spill_to(&dir)?;
                }
            }
        }
        match &mut self.inner {
            ManifestInner::Memory { items, by_id } => {
                by_id.entry(item.id.clone()).or_insert(items.len());
                items.push(item);
            }
            ManifestInner::Spilled(spilled) => spilled.append(&item)?,
        }
        Ok(())
    }

    fn spill_to(&mut self, dir: &Path) -> Result<()> {
        let ManifestInner::Memory { items, .. } = &self.inner else {
            return Ok(());
        };
        let path = dir.join(MANIFEST_SPILL_NAME);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| FolioError::Io(format!("create manifest spill: {}", e)))?;
        let mut spilled = SpilledManifest {
            path,
            file: RefCell::new(file),
            index: Vec::with_capacity(items.len() + 64),
            count: 0,
        };
        for item in items {
            spilled.append(item)?;
        }
        log::debug!(
            "manifest spilled to disk after {} items",
            spilled.count
        );
        self.inner = ManifestInner::Spilled(spilled);
        Ok(())
    }

    /// Sorts the spill index; call once after parsing completes.
    fn seal(&mut self) {
        if let ManifestInner::Spilled(spilled) = &mut self.inner {
            spilled
                .index
                .sort_unstable_by_key(|e| (e.id_hash, e.id_len, e.offset));
        }
    }

    /// Look up an item by manifest id.
    pub fn get(&self, id: &str) -> Result<Option<ManifestItem>> {
        match &self.inner {
            ManifestInner::Memory { items, by_id } => {
                Ok(by_id.get(id).map(|idx| items[*idx].clone()))
            }
            ManifestInner::Spilled(spilled) => spilled.get(id),
        }
    }

    /// Visit every item in document order.
    pub fn for_each(&self, mut f: impl FnMut(&ManifestItem)) -> Result<()> {
        match &self.inner {
            ManifestInner::Memory { items, .. } => {
                for item in items {
                    f(item);
                }
                Ok(())
            }
            ManifestInner::Spilled(spilled) => spilled.for_each(&mut f),
        }
    }

    /// Delete the spill file, if any. Lookups become invalid after.
    pub fn cleanup(self) {
        if let ManifestInner::Spilled(spilled) = self.inner {
            drop(spilled.file);
            if let Err(e) = std::fs::remove_file(&spilled.path) {
                log::debug!("manifest spill cleanup failed: {}", e);
            }
        }
    }
}

impl SpilledManifest {
    fn append(&mut self, item: &ManifestItem) -> Result<()> {
        let mut file = self.file.borrow_mut();
        let offset = file.seek(SeekFrom::End(0))?;
        let offset = u32::try_from(offset)
            .map_err(|_| FolioError::Io("manifest spill file too large".into()))?;
        write_str(&mut *file, &item.id)?;
        write_str(&mut *file, &item.href)?;
        write_str(&mut *file, &item.media_type)?;
        write_str(&mut *file, &item.properties)?;
        self.index.push(SpillEntry {
            id_hash: fnv1a32(item.id.as_bytes()),
            id_len: item.id.len().min(u16::MAX as usize) as u16,
            offset,
        });
        self.count += 1;
        Ok(())
    }

    fn read_at(&self, offset: u32) -> Result<ManifestItem> {
        let mut file = self.file.borrow_mut();
        file.seek(SeekFrom::Start(u64::from(offset)))?;
        Ok(ManifestItem {
            id: read_str(&mut *file)?,
            href: read_str(&mut *file)?,
            media_type: read_str(&mut *file)?,
            properties: read_str(&mut *file)?,
        })
    }

    fn get(&self, id: &str) -> Result<Option<ManifestItem>> {
        let hash = fnv1a32(id.as_bytes());
        let len = id.len().min(u16::MAX as usize) as u16;
        let start = self
            .index
            .partition_point(|e| (e.id_hash, e.id_len) < (hash, len));
        for entry in &self.index[start..] {
            if entry.id_hash != hash || entry.id_len != len {
                break;
            }
            let item = self.read_at(entry.offset)?;
            // Hash plus length caps collisions; the id compare settles them.
            if item.id == id {
                return Ok(Some(item));
            }
        }
        Ok(None)
    }

    fn for_each(&self, f: &mut impl FnMut(&ManifestItem)) -> Result<()> {
        let mut file = self.file.borrow_mut();
        file.seek(SeekFrom::Start(0))?;
        for _ in 0..self.count {
            let item = ManifestItem {
                id: read_str(&mut *file)?,
                href: read_str(&mut *file)?,
                media_type: read_str(&mut *file)?,
                properties: read_str(&mut *file)?,
            };
            f(&item);
        }
        Ok(())
    }
}

/// The part of a qualified name after any namespace prefix.
pub fn local_name(qname: &[u8]) -> &[u8] {
    match qname.iter().rposition(|b| *b == b':') {
        Some(pos) => &qname[pos + 1..],
        None => qname,
    }
}

/// Extract the first `<rootfile full-path="…">` from container.xml.
pub fn parse_container_xml(content: impl BufRead) -> Result<String> {
    let mut reader = Reader::from_reader(content);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::with_capacity(256);

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                if local_name(e.name().as_ref()) == b"rootfile" {
                    for attr in e.attributes().flatten() {
                        if local_name(attr.key.as_ref()) == b"full-path" {
                            let path = reader
                                .decoder()
                                .decode(attr.value.as_ref())
                                .unwrap_or_default()
                                .into_owned();
                            if !path.is_empty() {
                                return Ok(path);
                            }
                        }
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(FolioError::Parse(format!("container.xml: {:?}", e)));
            }
            _ => {}
        }
        buf.clear();
    }

    Err(FolioError::NotAnEpub)
}

#[derive(Clone, Copy, PartialEq)]
enum OpfSection {
    None,
    Metadata,
    Manifest,
    Spine,
    Guide,
}

#[derive(Clone, Copy, PartialEq)]
enum MetadataField {
    None,
    Title,
    Author,
    Language,
}

/// Stream-parse a package document.
///
/// `spill_dir` enables the large-manifest disk index; pass `None` to
/// keep everything in memory (tests, small tools).
pub fn parse_package_doc(content: impl BufRead, spill_dir: Option<&Path>) -> Result<PackageDoc> {
    let mut reader = Reader::from_reader(content);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::with_capacity(1024);

    let mut doc = PackageDoc {
        title: String::new(),
        author: String::new(),
        language: String::new(),
        spine_idrefs: Vec::with_capacity(16),
        spine_toc_idref: None,
        guide: Vec::with_capacity(4),
        manifest: ManifestStore::new(spill_dir),
    };

    let mut section = OpfSection::None;
    let mut field = MetadataField::None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = local_name(e.name().as_ref()).to_vec();
                match name.as_slice() {
                    b"metadata" => section = OpfSection::Metadata,
                    b"manifest" => section = OpfSection::Manifest,
                    b"spine" => {
                        section = OpfSection::Spine;
                        read_spine_attrs(&reader, &e, &mut doc)?;
                    }
                    b"guide" => section = OpfSection::Guide,
                    b"title" if section == OpfSection::Metadata && doc.title.is_empty() => {
                        field = MetadataField::Title;
                    }
                    b"creator" if section == OpfSection::Metadata && doc.author.is_empty() => {
                        field = MetadataField::Author;
                    }
                    b"language" if section == OpfSection::Metadata && doc.language.is_empty() => {
                        field = MetadataField::Language;
                    }
                    b"item" if section == OpfSection::Manifest => {
                        read_manifest_item(&reader, &e, &mut doc)?;
                    }
                    b"itemref" if section == OpfSection::Spine => {
                        read_spine_itemref(&reader, &e, &mut doc);
                    }
                    b"reference" if section == OpfSection::Guide => {
                        read_guide_reference(&reader, &e, &mut doc);
                    }
                    _ => {}
                }
            }
            Ok(Event::Empty(e)) => {
                let name = local_name(e.name().as_ref()).to_vec();
                match name.as_slice() {
                    b"item" if section == OpfSection::Manifest => {
                        read_manifest_item(&reader, &e, &mut doc)?;
                    }
                    b"itemref" if section == OpfSection::Spine => {
                        read_spine_itemref(&reader, &e, &mut doc);
                    }
                    b"reference" if section == OpfSection::Guide => {
                        read_guide_reference(&reader, &e, &mut doc);
                    }
                    b"spine" => read_spine_attrs(&reader, &e, &mut doc)?,
                    _ => {}
                }
            }
            Ok(Event::Text(e)) => {
                if field != MetadataField::None {
                    let text = reader.decoder().decode(&e).unwrap_or_default();
                    let target = match field {
                        MetadataField::Title => &mut doc.title,
                        MetadataField::Author => &mut doc.author,
                        MetadataField::Language => &mut doc.language,
                        MetadataField::None => unreachable!(),
                    };
                    target.push_str(text.as_ref());
                }
            }
            Ok(Event::End(e)) => {
                let name = local_name(e.name().as_ref()).to_vec();
                match name.as_slice() {
                    b"metadata" | b"manifest" | b"spine" | b"guide" => {
                        section = OpfSection::None;
                    }
                    b"title" | b"creator" | b"language" => field = MetadataField::None,
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(FolioError::Parse(format!("package document: {:?}", e)));
            }
            _ => {}
        }
        buf.clear();
    }

    doc.manifest.seal();
    log::debug!(
        "opf: {} manifest items, {} spine refs, {} guide refs",
        doc.manifest.len(),
        doc.spine_idrefs.len(),
        doc.guide.len()
    );
    Ok(doc)
}

fn attr_value<R: BufRead>(
    reader: &Reader<R>,
    e: &quick_xml::events::BytesStart<'_>,
    key: &[u8],
) -> Option<String> {
    for attr in e.attributes().flatten() {
        if local_name(attr.key.as_ref()) == key {
            return Some(
                reader
                    .decoder()
                    .decode(attr.value.as_ref())
                    .unwrap_or_default()
                    .into_owned(),
            );
        }
    }
    None
}

fn read_spine_attrs<R: BufRead>(
    reader: &Reader<R>,
    e: &quick_xml::events::BytesStart<'_>,
    doc: &mut PackageDoc,
) -> Result<()> {
    if let Some(toc) = attr_value(reader, e, b"toc") {
        if !toc.is_empty() {
            doc.spine_toc_idref = Some(toc);
        }
    }
    Ok(())
}

fn read_manifest_item<R: BufRead>(
    reader: &Reader<R>,
    e: &quick_xml::events::BytesStart<'_>,
    doc: &mut PackageDoc,
) -> Result<()> {
    let item = ManifestItem {
        id: attr_value(reader, e, b"id").unwrap_or_default(),
        href: attr_value(reader, e, b"href").unwrap_or_default(),
        media_type: attr_value(reader, e, b"media-type").unwrap_or_default(),
        properties: attr_value(reader, e, b"properties").unwrap_or_default(),
    };
    if item.id.is_empty() || item.href.is_empty() {
        return Ok(());
    }
    doc.manifest.insert(item)
}

fn read_spine_itemref<R: BufRead>(
    reader: &Reader<R>,
    e: &quick_xml::events::BytesStart<'_>,
    doc: &mut PackageDoc,
) {
    if let Some(idref) = attr_value(reader, e, b"idref") {
        if !idref.is_empty() {
            doc.spine_idrefs.push(idref);
        }
    }
}

fn read_guide_reference<R: BufRead>(
    reader: &Reader<R>,
    e: &quick_xml::events::BytesStart<'_>,
    doc: &mut PackageDoc,
) {
    let ref_type = attr_value(reader, e, b"type").unwrap_or_default();
    let href = attr_value(reader, e, b"href").unwrap_or_default();
    if !ref_type.is_empty() && !href.is_empty() {
        doc.guide.push(GuideRef { ref_type, href });
    }
}

/// First `<img src>` / `<image href>` in an XHTML document. Used to
/// resolve a guide cover page down to its actual image resource.
pub fn find_first_image_href(content: impl BufRead) -> Option<String> {
    let mut reader = Reader::from_reader(content);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::with_capacity(256);

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                let name = local_name(e.name().as_ref()).to_vec();
                let key: &[u8] = match name.as_slice() {
                    b"img" => b"src",
                    b"image" => b"href",
                    _ => {
                        buf.clear();
                        continue;
                    }
                };
                for attr in e.attributes().flatten() {
                    if local_name(attr.key.as_ref()) == key {
                        let value = reader
                            .decoder()
                            .decode(attr.value.as_ref())
                            .unwrap_or_default()
                            .into_owned();
                        if !value.is_empty() {
                            return Some(value);
                        }
                    }
                }
            }
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
        buf.clear();
    }
}
