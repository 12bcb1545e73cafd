//! The per-chapter section cache: pre-laid-out pages keyed by every
//! layout-relevant parameter.
//!
//! File layout: a fixed header (version + parameters + page count +
//! LUT offset), the serialized pages, then a trailing table of
//! absolute page offsets. The header is written first with
//! placeholder count/LUT fields and patched last, so a truncated
//! build is always detected on reopen.
//!
//! Write and read paths use separate types; a section file is never
//! open for both at once.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use folio::error::{FolioError, Result};
use folio::serialize::{
    read_bool, read_f32, read_i32, read_u16, read_u32, read_u8, write_bool, write_f32, write_i32,
    write_u16, write_u32, write_u8,
};
use folio::settings::{ParagraphAlign, ReaderSettings};

use crate::page::Page;

/// Increment on any layout-relevant format change.
pub const SECTION_FILE_VERSION: u8 = 13;

/// Header size in bytes:
/// version(1) font(4) compression(4) spacing(1) alignment(1)
/// width(2) height(2) hyphenation(1) embedded(1) bold(1)
/// page-count(2) lut-offset(4).
const HEADER_SIZE: u64 = 24;
/// Offset of the page-count/LUT-offset pair patched at finish.
const PATCH_OFFSET: u64 = HEADER_SIZE - 6;

/// The layout parameters a section file is keyed by. Any mismatch
/// invalidates the cache.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SectionParams {
    pub font_id: i32,
    pub line_compression: f32,
    pub extra_paragraph_spacing: bool,
    pub paragraph_alignment: ParagraphAlign,
    pub viewport_width: u16,
    pub viewport_height: u16,
    pub hyphenation: bool,
    pub embedded_style: bool,
    pub force_bold: bool,
}

impl SectionParams {
    /// Derive the cache key from reader settings.
    pub fn from_settings(settings: &ReaderSettings) -> Self {
        Self {
            font_id: settings.font_id,
            line_compression: settings.line_compression,
            extra_paragraph_spacing: settings.extra_paragraph_spacing,
            paragraph_alignment: settings.paragraph_alignment,
            viewport_width: settings.viewport_width,
            viewport_height: settings.viewport_height,
            hyphenation: settings.hyphenation_enabled,
            embedded_style: settings.embedded_style,
            force_bold: settings.force_bold,
        }
    }

    fn write(&self, w: &mut impl Write) -> Result<()> {
        write_i32(w, self.font_id)?;
        write_f32(w, self.line_compression)?;
        write_bool(w, self.extra_paragraph_spacing)?;
        write_u8(w, self.paragraph_alignment.as_u8())?;
        write_u16(w, self.viewport_width)?;
        write_u16(w, self.viewport_height)?;
        write_bool(w, self.hyphenation)?;
        write_bool(w, self.embedded_style)?;
        write_bool(w, self.force_bold)?;
        Ok(())
    }

    fn read(r: &mut impl Read) -> Result<Self> {
        Ok(Self {
            font_id: read_i32(r)?,
            line_compression: read_f32(r)?,
            extra_paragraph_spacing: read_bool(r)?,
            paragraph_alignment: ParagraphAlign::from_u8(read_u8(r)?),
            viewport_width: read_u16(r)?,
            viewport_height: read_u16(r)?,
            hyphenation: read_bool(r)?,
            embedded_style: read_bool(r)?,
            force_bold: read_bool(r)?,
        })
    }
}

/// Write handle for building a section file.
pub struct SectionWriter {
    file: File,
    path: PathBuf,
    offsets: Vec<u32>,
}

impl SectionWriter {
    /// Create the file and write the placeholder header.
    pub fn create(path: &Path, params: &SectionParams) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = File::create(path)?;
        write_u8(&mut file, SECTION_FILE_VERSION)?;
        params.write(&mut file)?;
        write_u16(&mut file, 0)?; // page count, patched at finish
        write_u32(&mut file, 0)?; // LUT offset, patched at finish
        Ok(Self {
            file,
            path: path.to_path_buf(),
            offsets: Vec::with_capacity(32),
        })
    }

    /// Serialize one page and record its offset for the LUT.
    pub fn write_page(&mut self, page: &Page) -> Result<()> {
        let position = self.file.stream_position()?;
        let position = u32::try_from(position)
            .map_err(|_| FolioError::Io("section file exceeds 4 GiB".into()))?;
        page.serialize(&mut self.file)?;
        self.offsets.push(position);
        log::debug!("section page {} at offset {}", self.offsets.len() - 1, position);
        Ok(())
    }

    pub fn page_count(&self) -> usize {
        self.offsets.len()
    }

    /// Append the LUT and patch the header. Consumes the writer; the
    /// file is complete after this returns.
    pub fn finish(mut self) -> Result<u16> {
        let page_count = u16::try_from(self.offsets.len())
            .map_err(|_| FolioError::Io("section exceeds 65535 pages".into()))?;

        let result = (|| -> Result<u16> {
            let lut_offset = u32::try_from(self.file.stream_position()?)
                .map_err(|_| FolioError::Io("section file exceeds 4 GiB".into()))?;
            for offset in &self.offsets {
                if *offset == 0 {
                    return Err(FolioError::CorruptCache(
                        "section page recorded at offset 0".into(),
                    ));
                }
                write_u32(&mut self.file, *offset)?;
            }
            self.file.seek(SeekFrom::Start(PATCH_OFFSET))?;
            write_u16(&mut self.file, page_count)?;
            write_u32(&mut self.file, lut_offset)?;
            self.file.flush()?;
            Ok(page_count)
        })();

        if result.is_err() {
            let _ = std::fs::remove_file(&self.path);
        }
        result
    }

    /// Drop the partial file.
    pub fn abort(self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Read handle over a validated section file.
pub struct SectionFile {
    file: BufReader<File>,
    lut_offset: u32,
    /// Number of cached pages.
    pub page_count: u16,
}

impl SectionFile {
    /// Open and validate against the requested parameters. On any
    /// mismatch (version, parameters, or an implausible trailer) the
    /// file is deleted and `CacheStale` is returned so the caller
    /// rebuilds.
    pub fn open(path: &Path, params: &SectionParams) -> Result<Self> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);

        let stale = |path: &Path, why: &str| -> FolioError {
            log::debug!("section cache {} invalid: {}", path.display(), why);
            let _ = std::fs::remove_file(path);
            FolioError::CacheStale
        };

        let version = match read_u8(&mut reader) {
            Ok(v) => v,
            Err(_) => return Err(stale(path, "truncated header")),
        };
        if version != SECTION_FILE_VERSION {
            return Err(stale(path, "version mismatch"));
        }
        let stored = match SectionParams::read(&mut reader) {
            Ok(p) => p,
            Err(_) => return Err(stale(path, "truncated header")),
        };
        if stored != *params {
            return Err(stale(path, "parameter mismatch"));
        }
        let page_count = match read_u16(&mut reader) {
            Ok(v) => v,
            Err(_) => return Err(stale(path, "truncated header")),
        };
        let lut_offset = match read_u32(&mut reader) {
            Ok(v) => v,
            Err(_) => return Err(stale(path, "truncated header")),
        };
        // An unpatched header means the build never completed.
        if page_count == 0 || u64::from(lut_offset) < HEADER_SIZE {
            return Err(stale(path, "unpatched or empty trailer"));
        }

        log::debug!(
            "section cache {} valid: {} pages",
            path.display(),
            page_count
        );
        Ok(Self {
            file: reader,
            lut_offset,
            page_count,
        })
    }

    /// Deserialize one page via the offset table.
    pub fn load_page(&mut self, index: u16) -> Result<Page> {
        if index >= self.page_count {
            return Err(FolioError::PageOutOfRange {
                index: usize::from(index),
                page_count: usize::from(self.page_count),
            });
        }
        self.file.seek(SeekFrom::Start(
            u64::from(self.lut_offset) + 4 * u64::from(index),
        ))?;
        let page_offset = read_u32(&mut self.file)?;
        if u64::from(page_offset) < HEADER_SIZE {
            return Err(FolioError::CorruptCache(format!(
                "page {} offset {} inside header",
                index, page_offset
            )));
        }
        self.file.seek(SeekFrom::Start(u64::from(page_offset)))?;
        Page::deserialize(&mut self.file)
    }
}
