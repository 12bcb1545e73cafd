//! Archive access: entry-name normalization, the [`ArchiveReader`]
//! contract consumed by the indexer and section builder, and a ZIP
//! implementation over any seekable reader.
//!
//! Reads are streaming: inflation happens in 1 KiB chunks so a whole
//! chapter is never resident as compressed-plus-inflated bytes at
//! once. Full reads (`read_all`) verify the entry CRC; streamed reads
//! verify it as a side effect of draining the whole entry.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use miniz_oxide::inflate::stream::{inflate, InflateState};
use miniz_oxide::{DataFormat, MZFlush, MZStatus};

use crate::error::{FolioError, Result};

const EOCD_SIG: u32 = 0x0605_4b50;
const CENTRAL_SIG: u32 = 0x0201_4b50;
const LOCAL_SIG: u32 = 0x0403_4b50;
const METHOD_STORED: u16 = 0;
const METHOD_DEFLATE: u16 = 8;

/// Streaming chunk size for archive reads.
pub const ARCHIVE_CHUNK: usize = 1024;

/// Read-only access to named entries of a publication archive.
///
/// Paths are forward-slash, normalized, with no leading slash; use
/// [`normalize_entry_path`] before lookup when joining hrefs.
pub trait ArchiveReader {
    /// True when a normalized entry path exists.
    fn exists(&self, path: &str) -> bool;

    /// Uncompressed size of an entry, without inflating it.
    fn inflated_size(&self, path: &str) -> Result<u64>;

    /// Inflate a whole entry into memory.
    fn read_all(&self, path: &str) -> Result<Vec<u8>>;

    /// Stream an entry into `sink` in `chunk`-sized pieces.
    fn read_stream(&self, path: &str, sink: &mut dyn Write, chunk: usize) -> Result<()>;
}

/// Collapses `.`/`..` segments and strips any leading slash so hrefs
/// joined from different base directories compare equal.
pub fn normalize_entry_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::with_capacity(8);
    for seg in path.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    segments.join("/")
}

#[derive(Clone, Copy, Debug)]
struct EntryInfo {
    method: u16,
    crc32: u32,
    compressed_size: u32,
    inflated_size: u32,
    local_header_offset: u32,
}

/// ZIP archive reader over any `Read + Seek` source.
///
/// The central directory is parsed once at open; entry reads seek to
/// the local header on demand.
#[derive(Debug)]
pub struct ZipArchive<R: Read + Seek = File> {
    source: RefCell<R>,
    entries: HashMap<String, EntryInfo>,
}

impl ZipArchive<File> {
    /// Open an archive file from the filesystem.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| FolioError::Io(format!("open {}: {}", path.display(), e)))?;
        Self::from_reader(file)
    }
}

impl<R: Read + Seek> ZipArchive<R> {
    /// Parse the central directory of an in-memory or on-disk archive.
    pub fn from_reader(mut source: R) -> Result<Self> {
        let entries = parse_central_directory(&mut source)?;
        Ok(Self {
            source: RefCell::new(source),
            entries,
        })
    }

    /// Number of entries in the archive.
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    fn entry(&self, path: &str) -> Result<EntryInfo> {
        let key = normalize_entry_path(path);
        self.entries
            .get(&key)
            .copied()
            .ok_or_else(|| FolioError::Io(format!("archive entry not found: {}", key)))
    }

    /// Seek past the local header and return the data start offset.
    fn data_offset(&self, info: EntryInfo) -> Result<u64> {
        let mut source = self.source.borrow_mut();
        source.seek(SeekFrom::Start(u64::from(info.local_header_offset)))?;
        let mut header = [0u8; 30];
        source.read_exact(&mut header)?;
        if read_le32(&header, 0) != LOCAL_SIG {
            return Err(FolioError::Parse("bad local file header signature".into()));
        }
        let name_len = u64::from(read_le16(&header, 26));
        let extra_len = u64::from(read_le16(&header, 28));
        Ok(u64::from(info.local_header_offset) + 30 + name_len + extra_len)
    }

    fn read_compressed(&self, info: EntryInfo) -> Result<Vec<u8>> {
        let offset = self.data_offset(info)?;
        let mut source = self.source.borrow_mut();
        source.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; info.compressed_size as usize];
        source.read_exact(&mut buf)?;
        Ok(buf)
    }
}

impl<R: Read + Seek> ArchiveReader for ZipArchive<R> {
    fn exists(&self, path: &str) -> bool {
        self.entries.contains_key(&normalize_entry_path(path))
    }

    fn inflated_size(&self, path: &str) -> Result<u64> {
        Ok(u64::from(self.entry(path)?.inflated_size))
    }

    fn read_all(&self, path: &str) -> Result<Vec<u8>> {
        let info = self.entry(path)?;
        let compressed = self.read_compressed(info)?;
        let data = match info.method {
            METHOD_STORED => compressed,
            METHOD_DEFLATE => miniz_oxide::inflate::decompress_to_vec_with_limit(
                &compressed,
                info.inflated_size as usize,
            )
            .map_err(|e| FolioError::Parse(format!("inflate {}: {:?}", path, e.status)))?,
            other => {
                return Err(FolioError::Parse(format!(
                    "unsupported compression method {} for {}",
                    other, path
                )))
            }
        };
        if data.len() != info.inflated_size as usize {
            return Err(FolioError::Parse(format!(
                "inflated size mismatch for {}: {} != {}",
                path,
                data.len(),
                info.inflated_size
            )));
        }
        if crc32fast::hash(&data) != info.crc32 {
            return Err(FolioError::Parse(format!("CRC mismatch for {}", path)));
        }
        Ok(data)
    }

    fn read_stream(&self, path: &str, sink: &mut dyn Write, chunk: usize) -> Result<()> {
        let info = self.entry(path)?;
        let chunk = chunk.clamp(1, 64 * 1024);
        let data_start = self.data_offset(info)?;
        let mut remaining_in = info.compressed_size as usize;
        let mut hasher = crc32fast::Hasher::new();

        let mut source = self.source.borrow_mut();
        source.seek(SeekFrom::Start(data_start))?;

        match info.method {
            METHOD_STORED => {
                let mut buf = vec![0u8; chunk];
                while remaining_in > 0 {
                    let take = remaining_in.min(chunk);
                    source.read_exact(&mut buf[..take])?;
                    hasher.update(&buf[..take]);
                    sink.write_all(&buf[..take])?;
                    remaining_in -= take;
                }
            }
            METHOD_DEFLATE => {
                let mut state = InflateState::new_boxed(DataFormat::Raw);
                let mut in_buf = vec![0u8; chunk];
                let mut out_buf = vec![0u8; chunk];
                let mut in_len = 0usize;
                let mut in_pos = 0usize;
                let mut total_out = 0u64;
                loop {
                    if in_pos == in_len && remaining_in > 0 {
                        in_len = remaining_in.min(chunk);
                        source.read_exact(&mut in_buf[..in_len])?;
                        remaining_in -= in_len;
                        in_pos = 0;
                    }
                    let flush = if remaining_in == 0 {
                        MZFlush::Finish
                    } else {
                        MZFlush::None
                    };
                    let res = inflate(&mut state, &in_buf[in_pos..in_len], &mut out_buf, flush);
                    in_pos += res.bytes_consumed;
                    if res.bytes_written > 0 {
                        hasher.update(&out_buf[..res.bytes_written]);
                        sink.write_all(&out_buf[..res.bytes_written])?;
                        total_out += res.bytes_written as u64;
                    }
                    match res.status {
                        Ok(MZStatus::StreamEnd) => break,
                        Ok(_) => {
                            if remaining_in == 0 && in_pos == in_len && res.bytes_written == 0 {
                                return Err(FolioError::Parse(format!(
                                    "truncated deflate stream for {}",
                                    path
                                )));
                            }
                        }
                        Err(e) => {
                            return Err(FolioError::Parse(format!(
                                "inflate {}: {:?}",
                                path, e
                            )))
                        }
                    }
                }
                if total_out != u64::from(info.inflated_size) {
                    return Err(FolioError::Parse(format!(
                        "inflated size mismatch for {}: {} != {}",
                        path, total_out, info.inflated_size
                    )));
                }
            }
            other => {
                return Err(FolioError::Parse(format!(
                    "unsupported compression method {} for {}",
                    other, path
                )))
            }
        }

        if hasher.finalize() != info.crc32 {
            return Err(FolioError::Parse(format!("CRC mismatch for {}", path)));
        }
        Ok(())
    }
}

fn read_le16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn read_le32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn parse_central_directory<R: Read + Seek>(source: &mut R) -> Result<HashMap<String, EntryInfo>> {
    let file_len = source.seek(SeekFrom::End(0))?;
    // EOCD is 22 bytes plus a comment of at most 65535 bytes.
    let tail_len = file_len.min(22 + 65_535);
    if tail_len < 22 {
        return Err(FolioError::Parse("archive too small for a ZIP".into()));
    }
    source.seek(SeekFrom::Start(file_len - tail_len))?;
    let mut tail = vec![0u8; tail_len as usize];
    source.read_exact(&mut tail)?;

    let mut eocd_at = None;
    for i in (0..=tail.len() - 22).rev() {
        if read_le32(&tail, i) == EOCD_SIG {
            eocd_at = Some(i);
            break;
        }
    }
    let eocd = eocd_at.ok_or_else(|| FolioError::Parse("no end-of-central-directory record".into()))?;
    let entry_count = read_le16(&tail, eocd + 10) as usize;
    let cd_size = read_le32(&tail, eocd + 12) as u64;
    let cd_offset = u64::from(read_le32(&tail, eocd + 16));

    if cd_offset + cd_size > file_len {
        return Err(FolioError::Parse("central directory extends past EOF".into()));
    }

    source.seek(SeekFrom::Start(cd_offset))?;
    let mut cd = vec![0u8; cd_size as usize];
    source.read_exact(&mut cd)?;

    let mut entries = HashMap::with_capacity(entry_count);
    let mut pos = 0usize;
    for _ in 0..entry_count {
        if pos + 46 > cd.len() {
            return Err(FolioError::Parse("truncated central directory".into()));
        }
        if read_le32(&cd, pos) != CENTRAL_SIG {
            return Err(FolioError::Parse("bad central directory signature".into()));
        }
        let method = read_le16(&cd, pos + 10);
        let crc32 = read_le32(&cd, pos + 16);
        let compressed_size = read_le32(&cd, pos + 20);
        let inflated_size = read_le32(&cd, pos + 24);
        let name_len = read_le16(&cd, pos + 28) as usize;
        let extra_len = read_le16(&cd, pos + 30) as usize;
        let comment_len = read_le16(&cd, pos + 32) as usize;
        let local_header_offset = read_le32(&cd, pos + 42);
        let name_start = pos + 46;
        let name_end = name_start + name_len;
        if name_end > cd.len() {
            return Err(FolioError::Parse("truncated central directory name".into()));
        }
        let name = std::str::from_utf8(&cd[name_start..name_end])
            .map_err(|_| FolioError::Parse("entry name is not UTF-8".into()))?;
        // Directory placeholders carry no data worth indexing.
        if !name.ends_with('/') {
            entries.insert(
                normalize_entry_path(name),
                EntryInfo {
                    method,
                    crc32,
                    compressed_size,
                    inflated_size,
                    local_header_offset,
                },
            );
        }
        pos = name_end + extra_len + comment_len;
    }

    Ok(entries)
}
