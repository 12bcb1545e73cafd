//! The paginated reading runtime: maps `(spine index, page index)`
//! onto cached sections, persists progress, and hands out refresh
//! hints.

use std::fs::File;
use std::io::{BufReader, Read, Write};

use folio::error::{FolioError, Result};
use folio::hyphenation::Hyphenator;
use folio::metrics::{GlyphMetrics, PageSurface, RefreshMode};
use folio::settings::ReaderSettings;
use folio::Publication;
use folio_render::{parse_chapter, ChapterContext, Page, SectionFile, SectionParams, SectionWriter};

/// Where to land inside the next loaded section.
#[derive(Clone, Copy, Debug, PartialEq)]
enum PendingPage {
    At(u16),
    Last,
    /// Proportional position for percent jumps.
    Fraction(f32),
}

/// One rendered page plus the context a display host needs.
pub struct RenderedPage {
    pub page: Page,
    /// Refresh policy hint; image pages and the periodic countdown
    /// force a full refresh.
    pub refresh: RefreshMode,
    pub spine_index: usize,
    pub page_index: u16,
    pub page_count: u16,
}

/// Sequential reading state over one publication.
///
/// All operations take `&mut self`; the runtime is single-writer by
/// construction and never holds a section open for read and write at
/// the same time.
pub struct BookReader {
    publication: Publication,
    settings: ReaderSettings,
    metrics: Box<dyn GlyphMetrics>,
    hyphenator: Hyphenator,

    current_spine: usize,
    current_page: u16,
    section: Option<SectionFile>,
    pending: PendingPage,

    /// Page count recorded with the last saved progress; a mismatch
    /// after a settings change triggers proportional repositioning.
    saved_page_count: u16,
    saved_spine: usize,

    pages_until_full_refresh: u8,
}

impl BookReader {
    /// Open a publication for reading: loads saved progress and, on a
    /// fresh book, jumps to the guide text-start reference.
    pub fn open(
        publication: Publication,
        settings: ReaderSettings,
        metrics: Box<dyn GlyphMetrics>,
    ) -> Result<Self> {
        let hyphenator = Hyphenator::for_language(publication.language());
        let mut reader = Self {
            publication,
            pages_until_full_refresh: settings.refresh_frequency.max(1),
            settings,
            metrics,
            hyphenator,
            current_spine: 0,
            current_page: 0,
            section: None,
            pending: PendingPage::At(0),
            saved_page_count: 0,
            saved_spine: 0,
        };
        reader.load_progress();

        // A book that was never read (or parked at spine 0) starts at
        // the text reference, skipping front matter.
        if reader.current_spine == 0 {
            let text_start = reader.publication.index.spine_index_for_text_reference();
            if text_start != 0 {
                log::debug!("first open, jumping to text reference at spine {}", text_start);
                reader.current_spine = text_start;
                reader.pending = PendingPage::At(0);
            }
        }
        Ok(reader)
    }

    pub fn publication(&self) -> &Publication {
        &self.publication
    }

    pub fn current_spine(&self) -> usize {
        self.current_spine
    }

    pub fn current_page(&self) -> u16 {
        self.current_page
    }

    /// Page count of the currently loaded section, 0 before load.
    pub fn section_page_count(&self) -> u16 {
        self.section.as_ref().map_or(0, |s| s.page_count)
    }

    /// Fraction of the whole book read, in `[0, 1]`.
    pub fn progress(&self) -> f32 {
        let fraction = match &self.section {
            Some(section) if section.page_count > 0 => {
                f32::from(self.current_page + 1) / f32::from(section.page_count)
            }
            _ => 0.0,
        };
        self.publication
            .index
            .progress_fraction(self.current_spine, fraction)
    }

    /// Load (or lazily build) the current section and resolve the
    /// pending page position.
    fn ensure_section(&mut self) -> Result<()> {
        if self.section.is_some() {
            return Ok(());
        }
        let spine_count = self.publication.index.spine_count();
        if spine_count == 0 {
            return Err(FolioError::CacheBuildFailed("publication has no spine".into()));
        }
        self.current_spine = self.current_spine.min(spine_count - 1);

        let path = self.publication.cache().section_file(self.current_spine);
        let params = SectionParams::from_settings(&self.settings);

        let section = match SectionFile::open(&path, &params) {
            Ok(section) => section,
            Err(FolioError::Io(_)) | Err(FolioError::CacheStale) => {
                log::debug!("section {} cache miss, building", self.current_spine);
                self.build_section(&params)?;
                SectionFile::open(&path, &params)?
            }
            Err(e) => {
                log::warn!("section {} cache unreadable ({}), rebuilding", self.current_spine, e);
                let _ = std::fs::remove_file(&path);
                self.build_section(&params)?;
                SectionFile::open(&path, &params)?
            }
        };

        let last = section.page_count.saturating_sub(1);
        let page = match self.pending {
            PendingPage::At(requested) => {
                // A settings change altered pagination since progress
                // was saved: reposition proportionally instead of
                // drifting. The raw requested page feeds the formula,
                // never a value already clamped to the new range.
                if self.saved_page_count > 0
                    && self.current_spine == self.saved_spine
                    && section.page_count != self.saved_page_count
                {
                    let fraction = f32::from(requested) / f32::from(self.saved_page_count);
                    let scaled =
                        ((fraction * f32::from(section.page_count)).round() as u16).min(last);
                    log::debug!(
                        "page count changed {} -> {}, repositioned to page {}",
                        self.saved_page_count,
                        section.page_count,
                        scaled
                    );
                    scaled
                } else {
                    requested.min(last)
                }
            }
            PendingPage::Last => last,
            PendingPage::Fraction(f) => {
                ((f.clamp(0.0, 1.0) * f32::from(section.page_count)) as u16).min(last)
            }
        };
        self.saved_page_count = 0;

        self.current_page = page;
        self.pending = PendingPage::At(page);
        self.section = Some(section);
        Ok(())
    }

    /// Stream the chapter through the section parser into a fresh
    /// cache file.
    fn build_section(&self, params: &SectionParams) -> Result<()> {
        let Some(entry) = self.publication.index.spine_entry(self.current_spine) else {
            return Err(FolioError::CacheBuildFailed(format!(
                "spine index {} out of range",
                self.current_spine
            )));
        };
        let href = entry.href.clone();

        let temp_name = format!(".tmp_{}.html", self.current_spine);
        let temp_path = self.publication.spool_item(&href, &temp_name)?;

        let css_rules = if self.settings.embedded_style {
            match self.publication.css_rules() {
                Ok(rules) => Some(rules),
                Err(e) => {
                    log::warn!("stylesheets unavailable, rendering unstyled: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let path = self.publication.cache().section_file(self.current_spine);
        let mut writer = SectionWriter::create(&path, params)?;

        let ctx = ChapterContext {
            settings: &self.settings,
            css: css_rules.as_ref(),
            metrics: self.metrics.as_ref(),
            hyphenator: &self.hyphenator,
            cancel: None,
        };

        let mut write_error: Option<FolioError> = None;
        let parse_result = {
            let reader = BufReader::new(File::open(&temp_path)?);
            parse_chapter(reader, &ctx, &mut |page| {
                if write_error.is_none() {
                    if let Err(e) = writer.write_page(&page) {
                        write_error = Some(e);
                    }
                }
            })
        };
        let _ = std::fs::remove_file(&temp_path);

        if let Err(e) = parse_result {
            writer.abort();
            return Err(FolioError::CacheBuildFailed(e.to_string()));
        }
        if let Some(e) = write_error {
            writer.abort();
            return Err(FolioError::CacheBuildFailed(e.to_string()));
        }

        let page_count = writer.finish()?;
        log::debug!(
            "section {} built: {} pages",
            self.current_spine,
            page_count
        );
        Ok(())
    }

    /// Load the current page, compute the refresh hint, and persist
    /// progress. Out-of-range positions clamp; a corrupt cache is
    /// rebuilt once.
    pub fn page(&mut self) -> Result<RenderedPage> {
        self.ensure_section()?;
        let mut rebuilt = false;
        loop {
            let Some(section) = self.section.as_mut() else {
                return Err(FolioError::CacheBuildFailed("section not loaded".into()));
            };
            let page_count = section.page_count;
            if self.current_page >= page_count {
                log::warn!(
                    "page {} out of range (count {}), clamping",
                    self.current_page,
                    page_count
                );
                self.current_page = page_count.saturating_sub(1);
            }
            match section.load_page(self.current_page) {
                Ok(page) => {
                    let refresh = if self.pages_until_full_refresh <= 1 || page.has_images() {
                        self.pages_until_full_refresh = self.settings.refresh_frequency.max(1);
                        RefreshMode::Full
                    } else {
                        self.pages_until_full_refresh -= 1;
                        RefreshMode::Partial
                    };
                    self.save_progress()?;
                    return Ok(RenderedPage {
                        page,
                        refresh,
                        spine_index: self.current_spine,
                        page_index: self.current_page,
                        page_count,
                    });
                }
                Err(e) if !rebuilt => {
                    // One-shot latency, not a user error: drop the
                    // cache and rebuild it.
                    log::warn!("section page unreadable ({}), rebuilding cache", e);
                    self.section = None;
                    let path = self.publication.cache().section_file(self.current_spine);
                    let _ = std::fs::remove_file(&path);
                    self.ensure_section()?;
                    rebuilt = true;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Render the current page to a display surface, applying the
    /// configured screen margin, and present it with the refresh
    /// hint.
    pub fn render_current(&mut self, surface: &mut dyn PageSurface) -> Result<RefreshMode> {
        let rendered = self.page()?;
        let margin = i32::from(self.settings.screen_margin);
        rendered
            .page
            .render(surface, self.metrics.as_ref(), self.settings.font_id, margin, margin);
        surface.present(rendered.refresh);
        Ok(rendered.refresh)
    }

    /// Advance one page, crossing into the next section at the end.
    /// Returns false at the end of the book.
    pub fn next_page(&mut self) -> Result<bool> {
        self.ensure_section()?;
        let page_count = self.section_page_count();
        if self.current_page + 1 < page_count {
            self.current_page += 1;
            self.pending = PendingPage::At(self.current_page);
            return Ok(true);
        }
        if self.current_spine + 1 < self.publication.index.spine_count() {
            self.current_spine += 1;
            self.current_page = 0;
            self.section = None;
            self.pending = PendingPage::At(0);
            return Ok(true);
        }
        Ok(false)
    }

    /// Step back one page, landing on the previous section's last
    /// page at a boundary. Returns false at the start of the book.
    pub fn prev_page(&mut self) -> Result<bool> {
        self.ensure_section()?;
        if self.current_page > 0 {
            self.current_page -= 1;
            self.pending = PendingPage::At(self.current_page);
            return Ok(true);
        }
        if self.current_spine > 0 {
            self.current_spine -= 1;
            self.section = None;
            self.pending = PendingPage::Last;
            return Ok(true);
        }
        Ok(false)
    }

    /// Jump to a spine item, starting at its first page.
    pub fn go_to_spine(&mut self, spine_index: usize) {
        let clamped = spine_index.min(self.publication.index.spine_count().saturating_sub(1));
        if clamped != self.current_spine || self.section.is_none() {
            self.current_spine = clamped;
            self.section = None;
        }
        self.current_page = 0;
        self.pending = PendingPage::At(0);
    }

    /// Jump to a position expressed as a percentage of the book's
    /// bytes, landing proportionally inside the covering section.
    pub fn go_to_percent(&mut self, percent: f32) {
        let index = &self.publication.index;
        let spine = index.spine_index_for_percent(percent);
        let total = index.book_size_bytes();

        let fraction = if total == 0 {
            0.0
        } else {
            let target = percent.clamp(0.0, 100.0) / 100.0 * total as f32;
            let prev = if spine >= 1 {
                index.spine_entry(spine - 1).map_or(0, |e| e.cumulative_size)
            } else {
                0
            };
            let end = index.spine_entry(spine).map_or(prev, |e| e.cumulative_size);
            let section_bytes = end.saturating_sub(prev);
            if section_bytes == 0 {
                0.0
            } else {
                ((target - prev as f32) / section_bytes as f32).clamp(0.0, 1.0)
            }
        };

        self.current_spine = spine;
        self.section = None;
        self.pending = PendingPage::Fraction(fraction);
    }

    fn load_progress(&mut self) {
        let path = self.publication.cache().progress_file();
        let Ok(mut file) = File::open(&path) else {
            return;
        };
        let mut data = [0u8; 6];
        let Ok(read) = file.read(&mut data) else {
            return;
        };
        // Legacy 4-byte records lack the page-count word.
        if read != 4 && read != 6 {
            return;
        }
        self.current_spine = usize::from(u16::from_le_bytes([data[0], data[1]]));
        let page = u16::from_le_bytes([data[2], data[3]]);
        self.current_page = page;
        self.pending = PendingPage::At(page);
        self.saved_spine = self.current_spine;
        if read == 6 {
            self.saved_page_count = u16::from_le_bytes([data[4], data[5]]);
        }
        log::debug!(
            "progress loaded: spine {}, page {}",
            self.current_spine,
            self.current_page
        );
    }

    /// Persist `{spine, page, page_count}` atomically (write a temp
    /// file, rename over the old record).
    pub fn save_progress(&self) -> Result<()> {
        let path = self.publication.cache().progress_file();
        let temp = path.with_extension("bin.tmp");

        let spine = u16::try_from(self.current_spine).unwrap_or(u16::MAX);
        let mut data = [0u8; 6];
        data[0..2].copy_from_slice(&spine.to_le_bytes());
        data[2..4].copy_from_slice(&self.current_page.to_le_bytes());
        data[4..6].copy_from_slice(&self.section_page_count().to_le_bytes());

        let mut file = File::create(&temp)?;
        file.write_all(&data)?;
        file.flush()?;
        drop(file);
        std::fs::rename(&temp, &path)?;
        Ok(())
    }
}
