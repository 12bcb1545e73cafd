//! Plain-text reading: greedy word-wrap pagination over a flat file,
//! with a parameter-keyed byte-offset index so reopening is instant.
//!
//! The file streams through 8 KiB windows; a page stops when it has
//! its full line count or the window ends mid-line, recording the
//! byte offset just past the last fully consumed line.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use folio::error::{FolioError, Result};
use folio::metrics::{GlyphMetrics, PageSurface, RefreshMode, StyleFlags};
use folio::serialize::{read_i32, read_u32, read_u8, write_i32, write_u32, write_u8};
use folio::settings::{ParagraphAlign, ReaderSettings};
use folio::CacheLayout;

/// Index cache magic ("TXTI" as a little-endian u32).
pub const TXT_INDEX_MAGIC: u32 = 0x5458_5449;
/// Bump when the index format or pagination algorithm changes.
pub const TXT_INDEX_VERSION: u8 = 2;

/// Window size for streaming reads.
const WINDOW_BYTES: usize = 8 * 1024;

/// Plain-text reader with its own page index.
pub struct TxtReader {
    path: PathBuf,
    cache: CacheLayout,
    metrics: Box<dyn GlyphMetrics>,

    font_id: i32,
    screen_margin: u16,
    alignment: ParagraphAlign,
    viewport_width: u16,
    lines_per_page: usize,
    line_height: i32,
    refresh_frequency: u8,

    file_size: u32,
    page_offsets: Vec<u32>,
    current_page: usize,
    pages_until_full_refresh: u8,
}

impl TxtReader {
    /// Open a text file: computes the viewport line budget, loads or
    /// builds the page index, and restores saved progress.
    pub fn open(
        path: &Path,
        cache_root: &Path,
        settings: &ReaderSettings,
        metrics: Box<dyn GlyphMetrics>,
    ) -> Result<Self> {
        let file_size = u32::try_from(std::fs::metadata(path)?.len())
            .map_err(|_| FolioError::Io("text file exceeds 4 GiB".into()))?;
        let cache = CacheLayout::for_book(cache_root, &path.to_string_lossy());
        std::fs::create_dir_all(cache.dir())?;

        let line_height = metrics.line_height(settings.font_id).max(1) as i32;
        let lines_per_page =
            usize::try_from(i32::from(settings.viewport_height) / line_height).unwrap_or(1).max(1);

        let mut reader = Self {
            path: path.to_path_buf(),
            cache,
            metrics,
            font_id: settings.font_id,
            screen_margin: settings.screen_margin,
            alignment: settings.paragraph_alignment,
            viewport_width: settings.viewport_width,
            lines_per_page,
            line_height,
            refresh_frequency: settings.refresh_frequency.max(1),
            file_size,
            page_offsets: Vec::with_capacity(64),
            current_page: 0,
            pages_until_full_refresh: settings.refresh_frequency.max(1),
        };

        if !reader.load_index_cache()? {
            reader.build_index()?;
            reader.save_index_cache()?;
        }
        reader.load_progress();
        Ok(reader)
    }

    pub fn page_count(&self) -> usize {
        self.page_offsets.len()
    }

    pub fn current_page(&self) -> usize {
        self.current_page
    }

    /// Fraction of the file read, by page position.
    pub fn progress(&self) -> f32 {
        if self.page_offsets.is_empty() {
            return 0.0;
        }
        (self.current_page + 1) as f32 / self.page_offsets.len() as f32
    }

    pub fn next_page(&mut self) -> bool {
        if self.current_page + 1 < self.page_offsets.len() {
            self.current_page += 1;
            true
        } else {
            false
        }
    }

    pub fn prev_page(&mut self) -> bool {
        if self.current_page > 0 {
            self.current_page -= 1;
            true
        } else {
            false
        }
    }

    /// Wrapped lines of the current page.
    pub fn page_lines(&self) -> Result<Vec<String>> {
        let Some(offset) = self.page_offsets.get(self.current_page).copied() else {
            return Ok(Vec::new());
        };
        let (lines, _) = self.load_page_at(offset)?;
        Ok(lines)
    }

    /// Draw the current page with the configured alignment and
    /// persist progress. Justified text renders left-aligned here;
    /// plain text has no word-gap model.
    pub fn render_current(&mut self, surface: &mut dyn PageSurface) -> Result<RefreshMode> {
        let lines = self.page_lines()?;
        let margin = i32::from(self.screen_margin);
        let content_width = i32::from(self.viewport_width);

        let mut y = margin;
        for line in &lines {
            if !line.is_empty() {
                let x = match self.alignment {
                    ParagraphAlign::Center => {
                        let width =
                            self.metrics.text_width(self.font_id, line, StyleFlags::REGULAR) as i32;
                        margin + (content_width - width).max(0) / 2
                    }
                    ParagraphAlign::Right => {
                        let width =
                            self.metrics.text_width(self.font_id, line, StyleFlags::REGULAR) as i32;
                        margin + (content_width - width).max(0)
                    }
                    _ => margin,
                };
                surface.draw_text(self.font_id, x, y, line, false, StyleFlags::REGULAR);
            }
            y += self.line_height;
        }

        let refresh = if self.pages_until_full_refresh <= 1 {
            self.pages_until_full_refresh = self.refresh_frequency;
            RefreshMode::Full
        } else {
            self.pages_until_full_refresh -= 1;
            RefreshMode::Partial
        };
        surface.present(refresh);
        self.save_progress()?;
        Ok(refresh)
    }

    /// Walk the whole file once, recording each page's start offset.
    fn build_index(&mut self) -> Result<()> {
        self.page_offsets.clear();
        self.page_offsets.push(0);
        log::debug!("building text page index for {} bytes", self.file_size);

        let mut offset = 0u32;
        while offset < self.file_size {
            let (lines, next_offset) = self.load_page_at(offset)?;
            if lines.is_empty() || next_offset <= offset {
                break; // no forward progress; never loop
            }
            offset = next_offset;
            if offset < self.file_size {
                self.page_offsets.push(offset);
            }
        }
        log::debug!("text page index built: {} pages", self.page_offsets.len());
        Ok(())
    }

    /// Read one window at `offset` and wrap it into at most
    /// `lines_per_page` lines. Returns the lines and the byte offset
    /// immediately after the last fully consumed content.
    fn load_page_at(&self, offset: u32) -> Result<(Vec<String>, u32)> {
        let mut lines: Vec<String> = Vec::with_capacity(self.lines_per_page);
        if offset >= self.file_size {
            return Ok((lines, offset));
        }

        let window = (self.file_size - offset).min(WINDOW_BYTES as u32) as usize;
        let mut buffer = vec![0u8; window];
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(u64::from(offset)))?;
        file.read_exact(&mut buffer)?;

        let viewport = self.viewport_width as u32;
        let mut pos = 0usize;

        while pos < window && lines.len() < self.lines_per_page {
            // Find end of the source line.
            let mut line_end = pos;
            while line_end < window && buffer[line_end] != b'\n' {
                line_end += 1;
            }

            let line_complete =
                line_end < window || u64::from(offset) + line_end as u64 >= u64::from(self.file_size);
            if !line_complete && !lines.is_empty() {
                // Mid-line at the window edge: stop the page here so
                // the next window re-reads the whole line.
                break;
            }

            let content_len = line_end - pos;
            let has_cr = content_len > 0 && buffer[pos + content_len - 1] == b'\r';
            let display_len = if has_cr { content_len - 1 } else { content_len };

            let mut line =
                String::from_utf8_lossy(&buffer[pos..pos + display_len]).into_owned();
            let mut line_byte_pos = 0usize;

            if line.is_empty() {
                lines.push(String::new());
                pos = line_end + 1;
                continue;
            }

            // Greedy wrap within the source line.
            while !line.is_empty() && lines.len() < self.lines_per_page {
                let width = self
                    .metrics
                    .text_width(self.font_id, &line, StyleFlags::REGULAR);
                if width <= viewport {
                    lines.push(std::mem::take(&mut line));
                    line_byte_pos = display_len;
                    break;
                }

                // Shrink to fit: prefer a space break, fall back to a
                // character boundary.
                let mut break_pos = line.len();
                while break_pos > 0
                    && self
                        .metrics
                        .text_width(self.font_id, &line[..break_pos], StyleFlags::REGULAR)
                        > viewport
                {
                    match line[..break_pos].rfind(' ') {
                        Some(space_pos) if space_pos > 0 => break_pos = space_pos,
                        _ => {
                            break_pos -= 1;
                            while break_pos > 0 && !line.is_char_boundary(break_pos) {
                                break_pos -= 1;
                            }
                        }
                    }
                }
                if break_pos == 0 {
                    break_pos = line
                        .char_indices()
                        .nth(1)
                        .map_or(line.len(), |(idx, _)| idx);
                }

                lines.push(line[..break_pos].to_string());

                let mut skip = break_pos;
                if line[break_pos..].starts_with(' ') {
                    skip += 1;
                }
                line_byte_pos += skip;
                line = line[skip..].to_string();
            }

            if line.is_empty() {
                // Source line fully consumed; step past the newline.
                pos = line_end + 1;
            } else {
                // Page filled mid-line; resume exactly here next time.
                pos += line_byte_pos;
                break;
            }
        }

        // Guarantee forward progress even on degenerate input.
        if pos == 0 && !lines.is_empty() {
            pos = 1;
        }

        let next_offset = (u64::from(offset) + pos as u64).min(u64::from(self.file_size)) as u32;
        Ok((lines, next_offset))
    }

    fn index_path(&self) -> PathBuf {
        self.cache.dir().join("index.bin")
    }

    /// Validate and load the page index cache. Any parameter
    /// mismatch rebuilds.
    fn load_index_cache(&mut self) -> Result<bool> {
        let Ok(file) = File::open(self.index_path()) else {
            return Ok(false);
        };
        let mut r = BufReader::new(file);

        let valid = (|| -> Result<bool> {
            if read_u32(&mut r)? != TXT_INDEX_MAGIC {
                return Ok(false);
            }
            if read_u8(&mut r)? != TXT_INDEX_VERSION {
                return Ok(false);
            }
            if read_u32(&mut r)? != self.file_size {
                return Ok(false);
            }
            if read_i32(&mut r)? != i32::from(self.viewport_width) {
                return Ok(false);
            }
            if read_i32(&mut r)? != self.lines_per_page as i32 {
                return Ok(false);
            }
            if read_i32(&mut r)? != self.font_id {
                return Ok(false);
            }
            if read_i32(&mut r)? != i32::from(self.screen_margin) {
                return Ok(false);
            }
            if read_u8(&mut r)? != self.alignment.as_u8() {
                return Ok(false);
            }
            let pages = read_u32(&mut r)? as usize;
            if pages > 1_000_000 {
                return Err(FolioError::CorruptCache(format!(
                    "text index declares {} pages",
                    pages
                )));
            }
            let mut offsets = Vec::with_capacity(pages);
            for _ in 0..pages {
                offsets.push(read_u32(&mut r)?);
            }
            self.page_offsets = offsets;
            Ok(true)
        })();

        match valid {
            Ok(true) => {
                log::debug!("text page index loaded: {} pages", self.page_offsets.len());
                Ok(true)
            }
            Ok(false) => {
                log::debug!("text page index mismatch, rebuilding");
                Ok(false)
            }
            Err(e) => {
                log::debug!("text page index unreadable ({}), rebuilding", e);
                Ok(false)
            }
        }
    }

    fn save_index_cache(&self) -> Result<()> {
        let mut w = BufWriter::new(File::create(self.index_path())?);
        write_u32(&mut w, TXT_INDEX_MAGIC)?;
        write_u8(&mut w, TXT_INDEX_VERSION)?;
        write_u32(&mut w, self.file_size)?;
        write_i32(&mut w, i32::from(self.viewport_width))?;
        write_i32(&mut w, self.lines_per_page as i32)?;
        write_i32(&mut w, self.font_id)?;
        write_i32(&mut w, i32::from(self.screen_margin))?;
        write_u8(&mut w, self.alignment.as_u8())?;
        write_u32(&mut w, self.page_offsets.len() as u32)?;
        for offset in &self.page_offsets {
            write_u32(&mut w, *offset)?;
        }
        w.flush()?;
        Ok(())
    }

    fn load_progress(&mut self) {
        let Ok(mut file) = File::open(self.cache.progress_file()) else {
            return;
        };
        let mut data = [0u8; 4];
        if file.read_exact(&mut data).is_ok() {
            let page = usize::from(u16::from_le_bytes([data[0], data[1]]));
            self.current_page = page.min(self.page_offsets.len().saturating_sub(1));
            log::debug!(
                "text progress loaded: page {}/{}",
                self.current_page,
                self.page_offsets.len()
            );
        }
    }

    fn save_progress(&self) -> Result<()> {
        let page = u16::try_from(self.current_page).unwrap_or(u16::MAX);
        let mut data = [0u8; 4];
        data[0..2].copy_from_slice(&page.to_le_bytes());
        let mut file = File::create(self.cache.progress_file())?;
        file.write_all(&data)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedMetrics;

    impl GlyphMetrics for FixedMetrics {
        fn text_width(&self, _font: i32, text: &str, _flags: StyleFlags) -> u32 {
            text.chars().count() as u32 * 10
        }
        fn space_width(&self, _font: i32) -> u32 {
            10
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

    fn settings() -> ReaderSettings {
        ReaderSettings {
            viewport_width: 100, // 10 chars per line
            viewport_height: 40, // 2 lines per page
            ..ReaderSettings::default()
        }
    }

    fn write_file(dir: &Path, content: &str) -> PathBuf {
        let path = dir.join("book.txt");
        std::fs::write(&path, content).unwrap();
        path
    }

    fn open(path: &Path, cache: &Path) -> TxtReader {
        TxtReader::open(path, cache, &settings(), Box::new(FixedMetrics)).unwrap()
    }

    #[test]
    fn wraps_long_lines_at_spaces() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "aaa bbb ccc ddd eee\n");
        let reader = open(&path, dir.path());

        let lines = reader.page_lines().unwrap();
        // 10-char budget: "aaa bbb" fits, "ccc ddd eee" wraps on.
        assert_eq!(lines[0], "aaa bbb");
        assert!(lines.len() <= 2);
    }

    #[test]
    fn short_file_is_one_page() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "hello\nworld\n");
        let reader = open(&path, dir.path());
        assert_eq!(reader.page_count(), 1);
        assert_eq!(reader.page_lines().unwrap(), vec!["hello", "world"]);
    }

    #[test]
    fn long_file_paginates_and_navigates() {
        let dir = tempfile::tempdir().unwrap();
        let mut content = String::new();
        for i in 0..10 {
            content.push_str(&format!("line{}\n", i));
        }
        let path = write_file(dir.path(), &content);
        let mut reader = open(&path, dir.path());

        // 10 short lines at 2 lines/page.
        assert_eq!(reader.page_count(), 5);
        assert_eq!(reader.page_lines().unwrap(), vec!["line0", "line1"]);
        assert!(reader.next_page());
        assert_eq!(reader.page_lines().unwrap(), vec!["line2", "line3"]);
        assert!(reader.prev_page());
        assert_eq!(reader.current_page(), 0);
        assert!(!reader.prev_page());
    }

    #[test]
    fn crlf_endings_are_stripped() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "one\r\ntwo\r\n");
        let reader = open(&path, dir.path());
        assert_eq!(reader.page_lines().unwrap(), vec!["one", "two"]);
    }

    #[test]
    fn index_cache_is_reused_and_invalidated() {
        let dir = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "alpha beta gamma delta epsilon zeta\n");

        let first = open(&path, cache_dir.path());
        let count = first.page_count();
        let index_path = first.index_path();
        assert!(index_path.exists());
        drop(first);

        // Same parameters: index reused with identical results.
        let second = open(&path, cache_dir.path());
        assert_eq!(second.page_count(), count);
        drop(second);

        // Changed font: the cached index no longer applies.
        let mut changed = settings();
        changed.font_id = 9;
        let third =
            TxtReader::open(&path, cache_dir.path(), &changed, Box::new(FixedMetrics)).unwrap();
        assert_eq!(third.page_count(), count); // same oracle, same wrap
    }

    #[test]
    fn changed_file_size_invalidates_index() {
        let dir = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "short\n");
        let reader = open(&path, cache_dir.path());
        assert_eq!(reader.page_count(), 1);
        drop(reader);

        let mut content = String::new();
        for i in 0..20 {
            content.push_str(&format!("appended line {}\n", i));
        }
        std::fs::write(&path, &content).unwrap();

        let reader = open(&path, cache_dir.path());
        assert!(reader.page_count() > 1);
    }

    #[test]
    fn progress_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        let mut content = String::new();
        for i in 0..10 {
            content.push_str(&format!("line{}\n", i));
        }
        let path = write_file(dir.path(), &content);

        let mut reader = open(&path, cache_dir.path());
        reader.next_page();
        reader.next_page();
        assert_eq!(reader.current_page(), 2);
        reader.save_progress().unwrap();
        drop(reader);

        let reader = open(&path, cache_dir.path());
        assert_eq!(reader.current_page(), 2);
    }

    #[test]
    fn unbreakable_run_splits_at_char_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), &format!("{}\n", "x".repeat(25)));
        let reader = open(&path, dir.path());
        let lines = reader.page_lines().unwrap();
        assert_eq!(lines[0], "x".repeat(10));
        assert_eq!(lines[1], "x".repeat(10));
    }

    #[test]
    fn empty_file_has_no_pages_beyond_origin() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "");
        let reader = open(&path, dir.path());
        assert_eq!(reader.page_count(), 1);
        assert!(reader.page_lines().unwrap().is_empty());
    }
}
