//! Streaming chapter parser: folds XHTML structure and CSS into
//! styled paragraphs, runs them through layout, and assembles pages.
//!
//! The parser is a single pass over `quick-xml` events with bounded
//! state: a depth counter, skip/bold/italic/underline depth markers,
//! an inline-style stack popped by matching depth, one in-flight
//! paragraph, and a word buffer capped at [`MAX_WORD_BYTES`].

use std::io::BufRead;

use heapless::Vec as BoundedVec;
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use smallvec::SmallVec;

use folio::css::{CssRuleSet, CssStyle, FontStyle, FontWeight, TextAlign, TextDecoration};
use folio::entities::resolve_entity;
use folio::error::{FolioError, Result};
use folio::hyphenation::Hyphenator;
use folio::metrics::{CancelFlag, GlyphMetrics, StyleFlags};
use folio::opf::local_name;
use folio::settings::{ParagraphAlign, ReaderSettings};

use crate::page::{Page, PageElement, PageLine};
use crate::paragraph::{ParsedParagraph, TextLine, PARAGRAPH_FLUSH_WORDS};
use crate::style::BlockStyle;

/// Word buffer cap; longer words flush in fragments that rejoin as
/// continuations.
pub const MAX_WORD_BYTES: usize = 200;

const BULLET: &str = "\u{2022}";

/// Everything a chapter parse needs from its environment.
pub struct ChapterContext<'a> {
    pub settings: &'a ReaderSettings,
    /// Compiled publication styles; `None` disables embedded styling
    /// (inline `style` attributes included).
    pub css: Option<&'a CssRuleSet>,
    pub metrics: &'a dyn GlyphMetrics,
    pub hyphenator: &'a Hyphenator,
    /// Polled between events; raising it aborts with `Cancelled`.
    pub cancel: Option<&'a CancelFlag>,
}

fn is_header_tag(tag: &str) -> bool {
    matches!(tag, "h1" | "h2" | "h3" | "h4" | "h5" | "h6")
}

fn is_block_tag(tag: &str) -> bool {
    matches!(tag, "p" | "li" | "div" | "br" | "blockquote")
}

fn is_bold_tag(tag: &str) -> bool {
    matches!(tag, "b" | "strong")
}

fn is_italic_tag(tag: &str) -> bool {
    matches!(tag, "i" | "em")
}

fn is_underline_tag(tag: &str) -> bool {
    matches!(tag, "u" | "ins")
}

fn is_image_tag(tag: &str) -> bool {
    matches!(tag, "img" | "image")
}

#[derive(Default)]
struct ElementAttrs {
    class: String,
    style: String,
    role: String,
    epub_type: String,
    alt: String,
}

struct StyleEntry {
    depth: usize,
    bold: Option<bool>,
    italic: Option<bool>,
    underline: Option<bool>,
}

struct SectionBuilder<'a, 'b> {
    ctx: &'a ChapterContext<'a>,
    on_page: &'b mut dyn FnMut(Page),

    depth: usize,
    skip_until: usize,
    bold_until: usize,
    italic_until: usize,
    underline_until: usize,
    inline_stack: SmallVec<[StyleEntry; 8]>,
    effective_bold: bool,
    effective_italic: bool,
    effective_underline: bool,
    current_css: CssStyle,

    paragraph: Option<ParsedParagraph>,
    word_buf: BoundedVec<u8, MAX_WORD_BYTES>,
    next_word_continues: bool,

    page: Page,
    next_y: i32,
    line_height: i32,
    em_px: f32,
}

impl<'a, 'b> SectionBuilder<'a, 'b> {
    fn new(ctx: &'a ChapterContext<'a>, on_page: &'b mut dyn FnMut(Page)) -> Self {
        let em_px =
            ctx.metrics.line_height(ctx.settings.font_id) as f32 * ctx.settings.line_compression;
        Self {
            ctx,
            on_page,
            depth: 0,
            skip_until: usize::MAX,
            bold_until: usize::MAX,
            italic_until: usize::MAX,
            underline_until: usize::MAX,
            inline_stack: SmallVec::new(),
            effective_bold: false,
            effective_italic: false,
            effective_underline: false,
            current_css: CssStyle::new(),
            paragraph: None,
            word_buf: BoundedVec::new(),
            next_word_continues: false,
            page: Page::new(),
            next_y: 0,
            line_height: em_px as i32,
            em_px,
        }
    }

    /// User alignment preference with the book-style sentinel
    /// resolved to the justify default.
    fn base_alignment(&self) -> TextAlign {
        match self.ctx.settings.paragraph_alignment {
            ParagraphAlign::Left => TextAlign::Left,
            ParagraphAlign::Center => TextAlign::Center,
            ParagraphAlign::Right => TextAlign::Right,
            ParagraphAlign::Justify | ParagraphAlign::BookStyle => TextAlign::Justify,
        }
    }

    /// Cascade + inline style for an element; empty when embedded
    /// styling is off.
    fn resolve_css(&self, tag: &str, attrs: &ElementAttrs) -> CssStyle {
        let Some(rules) = self.ctx.css else {
            return CssStyle::new();
        };
        let mut style = rules.resolve(tag, &attrs.class);
        if !attrs.style.is_empty() {
            style.apply_over(&CssRuleSet::parse_inline(&attrs.style));
        }
        style
    }

    fn block_style_from(&self, css: &CssStyle, base_align: TextAlign) -> BlockStyle {
        BlockStyle::from_css(
            css,
            self.em_px,
            base_align,
            true,
            self.ctx.settings.viewport_width,
        )
    }

    /// Recompute effective bold/italic/underline from the block CSS
    /// and the inline style stack, in push order.
    fn update_effective(&mut self) {
        self.effective_bold =
            self.current_css.has_font_weight() && self.current_css.font_weight == FontWeight::Bold;
        self.effective_italic =
            self.current_css.has_font_style() && self.current_css.font_style == FontStyle::Italic;
        self.effective_underline = self.current_css.has_text_decoration()
            && self.current_css.text_decoration == TextDecoration::Underline;

        for entry in &self.inline_stack {
            if let Some(bold) = entry.bold {
                self.effective_bold = bold;
            }
            if let Some(italic) = entry.italic {
                self.effective_italic = italic;
            }
            if let Some(underline) = entry.underline {
                self.effective_underline = underline;
            }
        }
    }

    fn current_flags(&self) -> StyleFlags {
        let mut flags = StyleFlags::REGULAR;
        if self.bold_until < self.depth || self.effective_bold || self.ctx.settings.force_bold {
            flags = flags.union(StyleFlags::BOLD);
        }
        if self.italic_until < self.depth || self.effective_italic {
            flags = flags.union(StyleFlags::ITALIC);
        }
        if self.underline_until < self.depth || self.effective_underline {
            flags = flags.union(StyleFlags::UNDERLINE);
        }
        flags
    }

    /// Move the buffered word fragment into the paragraph.
    fn flush_word(&mut self) {
        if self.word_buf.is_empty() {
            return;
        }
        let text = String::from_utf8_lossy(&self.word_buf).into_owned();
        let flags = self.current_flags();
        let continues = self.next_word_continues;
        if let Some(paragraph) = &mut self.paragraph {
            paragraph.add_word(text, flags, continues);
        }
        self.word_buf.clear();
        self.next_word_continues = false;
    }

    /// Finalize the open paragraph (unless it is still empty, in
    /// which case block styles accumulate) and begin a new one.
    fn start_paragraph(&mut self, block_style: BlockStyle) {
        self.next_word_continues = false;
        if let Some(paragraph) = &mut self.paragraph {
            if paragraph.is_empty() {
                // A parent block with no direct text (e.g. a margined
                // div around a heading) still contributes spacing.
                let merged = paragraph.block_style().combined(&block_style);
                paragraph.set_block_style(merged);
                return;
            }
            self.make_pages();
        }
        self.paragraph = Some(ParsedParagraph::new(
            self.ctx.settings.extra_paragraph_spacing,
            self.ctx.settings.hyphenation_enabled,
            block_style,
        ));
    }

    /// Lay the open paragraph out into lines and page them, applying
    /// the block's vertical spacing.
    fn make_pages(&mut self) {
        let Some(mut paragraph) = self.paragraph.take() else {
            return;
        };
        let block_style = *paragraph.block_style();

        self.next_y += i32::from(block_style.margin_top.max(0))
            + i32::from(block_style.padding_top.max(0));

        let viewport = i32::from(self.ctx.settings.viewport_width);
        let inset = block_style.horizontal_inset();
        let effective = if inset < viewport {
            (viewport - inset) as u16
        } else {
            self.ctx.settings.viewport_width
        };

        let mut lines = Vec::with_capacity(8);
        paragraph.layout_into_lines(
            self.ctx.metrics,
            self.ctx.settings.font_id,
            effective,
            self.ctx.hyphenator,
            true,
            &mut |line| lines.push(line),
        );
        for line in lines {
            self.add_line(line);
        }

        self.next_y += i32::from(block_style.margin_bottom.max(0))
            + i32::from(block_style.padding_bottom.max(0));
        if self.ctx.settings.extra_paragraph_spacing {
            self.next_y += self.line_height / 2;
        }
    }

    /// Mid-paragraph memory-bound flush: page out everything except
    /// the last (possibly partial) line and keep streaming.
    fn eager_flush(&mut self) {
        let over_cap = self
            .paragraph
            .as_ref()
            .is_some_and(|p| p.word_count() > PARAGRAPH_FLUSH_WORDS);
        if !over_cap {
            return;
        }
        log::debug!("paragraph exceeds {} words, flushing early", PARAGRAPH_FLUSH_WORDS);
        let Some(mut paragraph) = self.paragraph.take() else {
            return;
        };
        let block_style = *paragraph.block_style();
        let viewport = i32::from(self.ctx.settings.viewport_width);
        let inset = block_style.horizontal_inset();
        let effective = if inset < viewport {
            (viewport - inset) as u16
        } else {
            self.ctx.settings.viewport_width
        };
        let mut lines = Vec::with_capacity(8);
        paragraph.layout_into_lines(
            self.ctx.metrics,
            self.ctx.settings.font_id,
            effective,
            self.ctx.hyphenator,
            false,
            &mut |line| lines.push(line),
        );
        for line in lines {
            self.add_line(line);
        }
        self.paragraph = Some(paragraph);
    }

    /// Place one line, starting a fresh page when it would overflow
    /// the viewport height.
    fn add_line(&mut self, line: TextLine) {
        if self.next_y + self.line_height > i32::from(self.ctx.settings.viewport_height) {
            let finished = std::mem::take(&mut self.page);
            (self.on_page)(finished);
            self.next_y = 0;
        }
        let x = line.block_style.left_inset();
        let y = self.next_y.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
        self.page.elements.push(PageElement::Line(PageLine { line, x, y }));
        self.next_y += self.line_height;
    }

    /// Character data: whitespace delimits words, the BOM is dropped,
    /// and the bounded buffer flushes partial words as continuations.
    fn feed_text(&mut self, text: &str) {
        for c in text.chars() {
            if matches!(c, ' ' | '\r' | '\n' | '\t') {
                if !self.word_buf.is_empty() {
                    self.flush_word();
                }
                self.next_word_continues = false;
                continue;
            }
            if c == '\u{FEFF}' {
                continue;
            }
            let mut utf8 = [0u8; 4];
            let encoded = c.encode_utf8(&mut utf8);
            if self.word_buf.len() + encoded.len() > MAX_WORD_BYTES {
                self.flush_word();
                // The next fragment is the same visual word.
                self.next_word_continues = true;
            }
            let _ = self.word_buf.extend_from_slice(encoded.as_bytes());
        }
        self.eager_flush();
    }

    /// Italicized placeholder text for a self-closing img/table
    /// element, flushed immediately with the surrounding style
    /// markers untouched.
    fn feed_placeholder(&mut self, text: &str) {
        let saved = self.italic_until;
        self.italic_until = self.italic_until.min(self.depth.saturating_sub(1));
        self.feed_text(text);
        self.flush_word();
        self.italic_until = saved;
        self.next_word_continues = false;
    }

    fn push_inline_entry(&mut self, entry: StyleEntry) {
        // Flush so preceding text keeps the style it was typed under.
        if !self.word_buf.is_empty() {
            self.flush_word();
            self.next_word_continues = true;
        }
        self.inline_stack.push(entry);
        self.update_effective();
    }

    fn handle_element(&mut self, tag: &str, attrs: &ElementAttrs, is_empty: bool) {
        // Inside a skipped subtree only the depth advances.
        if self.skip_until < self.depth {
            if !is_empty {
                self.depth += 1;
            }
            return;
        }

        // Print-layout page markers carry no reflowable content.
        if attrs.role == "doc-pagebreak" || attrs.epub_type == "pagebreak" {
            if !is_empty {
                self.skip_until = self.depth;
                self.depth += 1;
            }
            return;
        }

        if tag == "head" {
            if !is_empty {
                self.skip_until = self.depth;
                self.depth += 1;
            }
            return;
        }

        if tag == "table" {
            self.start_paragraph(BlockStyle::aligned(TextAlign::Center));
            if is_empty {
                self.feed_placeholder("[Table omitted]");
            } else {
                self.italic_until = self.italic_until.min(self.depth);
                self.depth += 1;
                self.feed_text("[Table omitted]");
                self.skip_until = self.depth - 1;
            }
            return;
        }

        if is_image_tag(tag) {
            let alt = if attrs.alt.is_empty() {
                "[Image]".to_string()
            } else {
                format!("[Image: {}]", attrs.alt)
            };
            self.start_paragraph(BlockStyle::aligned(TextAlign::Center));
            if is_empty {
                self.feed_placeholder(&alt);
            } else {
                self.italic_until = self.italic_until.min(self.depth);
                self.depth += 1;
                self.feed_text(&alt);
                self.skip_until = self.depth - 1;
            }
            return;
        }

        let css = self.resolve_css(tag, attrs);

        if is_header_tag(tag) {
            self.current_css = css;
            let style = self.block_style_from(&self.current_css, TextAlign::Center);
            self.start_paragraph(style);
            self.bold_until = self.bold_until.min(self.depth);
            self.update_effective();
        } else if is_block_tag(tag) {
            if tag == "br" {
                if !self.word_buf.is_empty() {
                    self.flush_word();
                }
                let style = self
                    .paragraph
                    .as_ref()
                    .map_or_else(BlockStyle::default, |p| *p.block_style());
                self.start_paragraph(style);
            } else {
                self.current_css = css;
                let style = self.block_style_from(&self.current_css, self.base_alignment());
                self.start_paragraph(style);
                self.update_effective();
                if tag == "li" {
                    if let Some(paragraph) = &mut self.paragraph {
                        paragraph.add_word(BULLET.to_string(), StyleFlags::REGULAR, false);
                    }
                }
            }
        } else if is_underline_tag(tag) && !is_empty {
            self.underline_until = self.underline_until.min(self.depth);
            self.push_inline_entry(StyleEntry {
                depth: self.depth,
                bold: css
                    .has_font_weight()
                    .then(|| css.font_weight == FontWeight::Bold),
                italic: css
                    .has_font_style()
                    .then(|| css.font_style == FontStyle::Italic),
                underline: Some(true),
            });
        } else if is_bold_tag(tag) && !is_empty {
            self.bold_until = self.bold_until.min(self.depth);
            self.push_inline_entry(StyleEntry {
                depth: self.depth,
                bold: Some(true),
                italic: css
                    .has_font_style()
                    .then(|| css.font_style == FontStyle::Italic),
                underline: css
                    .has_text_decoration()
                    .then(|| css.text_decoration == TextDecoration::Underline),
            });
        } else if is_italic_tag(tag) && !is_empty {
            self.italic_until = self.italic_until.min(self.depth);
            self.push_inline_entry(StyleEntry {
                depth: self.depth,
                bold: css
                    .has_font_weight()
                    .then(|| css.font_weight == FontWeight::Bold),
                italic: Some(true),
                underline: css
                    .has_text_decoration()
                    .then(|| css.text_decoration == TextDecoration::Underline),
            });
        } else if !is_empty
            && (css.has_font_weight() || css.has_font_style() || css.has_text_decoration())
        {
            // span and friends only matter when their CSS changes an
            // inline property.
            self.push_inline_entry(StyleEntry {
                depth: self.depth,
                bold: css
                    .has_font_weight()
                    .then(|| css.font_weight == FontWeight::Bold),
                italic: css
                    .has_font_style()
                    .then(|| css.font_style == FontStyle::Italic),
                underline: css
                    .has_text_decoration()
                    .then(|| css.text_decoration == TextDecoration::Underline),
            });
        }

        if !is_empty {
            self.depth += 1;
        }
    }

    fn handle_end(&mut self, tag: &str) {
        let closing_depth = self.depth.saturating_sub(1);
        let will_pop_stack = self
            .inline_stack
            .last()
            .is_some_and(|entry| entry.depth == closing_depth);
        let will_clear_marker = self.bold_until == closing_depth
            || self.italic_until == closing_depth
            || self.underline_until == closing_depth;
        let header_or_block = is_header_tag(tag) || is_block_tag(tag);

        // Any buffered fragment must be flushed with the style it was
        // typed under, before that style is popped.
        if !self.word_buf.is_empty() {
            let is_inline_tag = !header_or_block
                && tag != "table"
                && !is_image_tag(tag)
                && self.depth != 1;
            let should_flush = will_pop_stack
                || will_clear_marker
                || header_or_block
                || is_bold_tag(tag)
                || is_italic_tag(tag)
                || is_underline_tag(tag)
                || tag == "table"
                || is_image_tag(tag)
                || self.depth == 1;
            if should_flush {
                self.flush_word();
                if is_inline_tag {
                    // Closing an inline element splits a visual word.
                    self.next_word_continues = true;
                }
            }
        }

        self.depth = closing_depth;

        if self.skip_until == self.depth {
            self.skip_until = usize::MAX;
        }
        if self.bold_until == self.depth {
            self.bold_until = usize::MAX;
        }
        if self.italic_until == self.depth {
            self.italic_until = usize::MAX;
        }
        if self.underline_until == self.depth {
            self.underline_until = usize::MAX;
        }

        if self
            .inline_stack
            .last()
            .is_some_and(|entry| entry.depth == self.depth)
        {
            self.inline_stack.pop();
            self.update_effective();
        }

        if header_or_block {
            self.current_css = CssStyle::new();
            self.update_effective();
        }
    }

    /// End of document: flush the in-flight paragraph and emit the
    /// final page.
    fn finish(mut self) {
        if !self.word_buf.is_empty() {
            self.flush_word();
        }
        if self.paragraph.is_some() {
            self.make_pages();
        }
        let final_page = std::mem::take(&mut self.page);
        (self.on_page)(final_page);
    }
}

fn extract_attrs<R: BufRead>(reader: &Reader<R>, e: &BytesStart<'_>) -> ElementAttrs {
    let mut attrs = ElementAttrs::default();
    for attr in e.attributes().flatten() {
        let key = attr.key.as_ref();
        let value = || {
            reader
                .decoder()
                .decode(attr.value.as_ref())
                .unwrap_or_default()
                .into_owned()
        };
        if key == b"class" {
            attrs.class = value();
        } else if key == b"style" {
            attrs.style = value();
        } else if key == b"role" {
            attrs.role = value();
        } else if key == b"epub:type" || key.ends_with(b":type") {
            attrs.epub_type = value();
        } else if key == b"alt" {
            attrs.alt = value();
        }
    }
    attrs
}

/// Parse one chapter document and stream finished pages to
/// `on_page`. Every chapter produces at least one (possibly empty)
/// page.
pub fn parse_chapter<R: BufRead>(
    content: R,
    ctx: &ChapterContext<'_>,
    on_page: &mut dyn FnMut(Page),
) -> Result<()> {
    let mut builder = SectionBuilder::new(ctx, on_page);

    // The initial block carries the user's alignment until the first
    // block tag provides its own.
    let initial = BlockStyle::aligned(builder.base_alignment());
    builder.start_paragraph(initial);

    let mut reader = Reader::from_reader(content);
    reader.config_mut().trim_text(false);
    reader.config_mut().check_end_names = false;
    let mut buf = Vec::with_capacity(1024);

    loop {
        if ctx.cancel.is_some_and(CancelFlag::is_cancelled) {
            return Err(FolioError::Cancelled);
        }
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let tag = String::from_utf8_lossy(local_name(e.name().as_ref()))
                    .to_ascii_lowercase();
                let attrs = extract_attrs(&reader, &e);
                builder.handle_element(&tag, &attrs, false);
            }
            Ok(Event::Empty(e)) => {
                let tag = String::from_utf8_lossy(local_name(e.name().as_ref()))
                    .to_ascii_lowercase();
                let attrs = extract_attrs(&reader, &e);
                builder.handle_element(&tag, &attrs, true);
            }
            Ok(Event::End(e)) => {
                let tag = String::from_utf8_lossy(local_name(e.name().as_ref()))
                    .to_ascii_lowercase();
                builder.handle_end(&tag);
            }
            Ok(Event::Text(e)) => {
                if builder.skip_until >= builder.depth {
                    match e.decode() {
                        Ok(text) => builder.feed_text(text.as_ref()),
                        Err(err) => log::warn!("undecodable text node skipped: {:?}", err),
                    }
                }
            }
            Ok(Event::CData(e)) => {
                if builder.skip_until >= builder.depth {
                    match reader.decoder().decode(&e) {
                        Ok(text) => builder.feed_text(text.as_ref()),
                        Err(err) => log::warn!("undecodable cdata skipped: {:?}", err),
                    }
                }
            }
            Ok(Event::GeneralRef(e)) => {
                if builder.skip_until >= builder.depth {
                    match e.decode() {
                        Ok(name) => match resolve_entity(name.as_ref()) {
                            Some(expansion) => builder.feed_text(&expansion),
                            None => log::debug!("unknown entity &{};", name),
                        },
                        Err(err) => log::warn!("undecodable entity skipped: {:?}", err),
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(err) => {
                return Err(FolioError::Parse(format!("chapter XML: {:?}", err)));
            }
            _ => {}
        }
        buf.clear();
    }

    builder.finish();
    Ok(())
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
            5
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
            viewport_width: 200,
            viewport_height: 60, // three 20 px lines per page
            paragraph_alignment: ParagraphAlign::Left,
            ..ReaderSettings::default()
        }
    }

    fn paginate(html: &str, settings: &ReaderSettings, css: Option<&CssRuleSet>) -> Vec<Page> {
        let metrics = FixedMetrics;
        let hyphenator = Hyphenator::disabled();
        let ctx = ChapterContext {
            settings,
            css,
            metrics: &metrics,
            hyphenator: &hyphenator,
            cancel: None,
        };
        let mut pages = Vec::new();
        parse_chapter(html.as_bytes(), &ctx, &mut |page| pages.push(page)).unwrap();
        pages
    }

    fn all_words(pages: &[Page]) -> Vec<String> {
        let mut words = Vec::new();
        for page in pages {
            for el in &page.elements {
                if let PageElement::Line(line) = el {
                    for word in &line.line.words {
                        words.push(word.text.clone());
                    }
                }
            }
        }
        words
    }

    fn all_lines(pages: &[Page]) -> Vec<&PageLine> {
        pages
            .iter()
            .flat_map(|p| p.elements.iter())
            .filter_map(|el| match el {
                PageElement::Line(line) => Some(line),
                PageElement::Image(_) => None,
            })
            .collect()
    }

    #[test]
    fn plain_paragraphs_produce_words() {
        let pages = paginate(
            "<html><body><p>one two</p><p>three</p></body></html>",
            &settings(),
            None,
        );
        assert!(!pages.is_empty());
        assert_eq!(all_words(&pages), vec!["one", "two", "three"]);
    }

    #[test]
    fn empty_chapter_still_emits_one_page() {
        let pages = paginate("<html><body></body></html>", &settings(), None);
        assert_eq!(pages.len(), 1);
        assert!(pages[0].is_empty());
    }

    #[test]
    fn head_subtree_is_skipped() {
        let pages = paginate(
            "<html><head><title>Ignored Title</title><style>p{}</style></head>\
             <body><p>kept</p></body></html>",
            &settings(),
            None,
        );
        assert_eq!(all_words(&pages), vec!["kept"]);
    }

    #[test]
    fn inline_styles_set_flags_and_continuations() {
        let pages = paginate(
            "<html><body><p>a<b>b</b><i>c</i> d<u>e</u></p></body></html>",
            &settings(),
            None,
        );
        let lines = all_lines(&pages);
        let words: Vec<_> = lines.iter().flat_map(|l| l.line.words.iter()).collect();
        assert_eq!(words.len(), 5);
        assert_eq!(words[0].text, "a");
        assert!(words[1].flags.is_bold());
        assert!(words[2].flags.is_italic());
        assert!(!words[3].flags.is_bold());
        assert!(words[4].flags.is_underline());

        // a·b·c form one visual word: no inter-word gaps.
        assert_eq!(u32::from(words[1].x), u32::from(words[0].x) + 10);
        assert_eq!(u32::from(words[2].x), u32::from(words[1].x) + 10);
        // d starts after a real space; e attaches to d.
        assert_eq!(u32::from(words[4].x), u32::from(words[3].x) + 10);
    }

    #[test]
    fn nested_inline_styles_unwind_by_depth() {
        let pages = paginate(
            "<html><body><p><b>one <i>two</i> three</b> four</p></body></html>",
            &settings(),
            None,
        );
        let words: Vec<_> = all_lines(&pages)
            .iter()
            .flat_map(|l| l.line.words.clone())
            .collect();
        assert_eq!(words.len(), 4);
        assert!(words[0].flags.is_bold() && !words[0].flags.is_italic());
        assert!(words[1].flags.is_bold() && words[1].flags.is_italic());
        assert!(words[2].flags.is_bold() && !words[2].flags.is_italic());
        assert!(!words[3].flags.is_bold());
    }

    #[test]
    fn img_emits_centered_alt_placeholder() {
        let pages = paginate(
            r#"<html><body><p>before</p><img src="x.jpg" alt="A map"/><p>after</p></body></html>"#,
            &settings(),
            None,
        );
        let words = all_words(&pages);
        assert!(words.contains(&"[Image:".to_string()));
        assert!(words.contains(&"map]".to_string()));
        let lines = all_lines(&pages);
        let image_line = lines
            .iter()
            .find(|l| l.line.words.iter().any(|w| w.text.starts_with("[Image")))
            .unwrap();
        assert_eq!(image_line.line.block_style.alignment, TextAlign::Center);
        assert!(image_line
            .line
            .words
            .iter()
            .all(|w| w.flags.is_italic()));
    }

    #[test]
    fn table_contents_are_replaced_by_placeholder() {
        let pages = paginate(
            "<html><body><table><tr><td>cell data</td></tr></table><p>after</p></body></html>",
            &settings(),
            None,
        );
        let words = all_words(&pages);
        assert!(words.contains(&"[Table".to_string()));
        assert!(words.contains(&"omitted]".to_string()));
        assert!(!words.contains(&"cell".to_string()));
        assert!(words.contains(&"after".to_string()));
    }

    #[test]
    fn pagebreak_markers_are_skipped() {
        let pages = paginate(
            r#"<html><body><p>one</p><span role="doc-pagebreak">14</span><span epub:type="pagebreak">15</span><p>two</p></body></html>"#,
            &settings(),
            None,
        );
        let words = all_words(&pages);
        assert!(!words.contains(&"14".to_string()));
        assert!(!words.contains(&"15".to_string()));
        assert!(words.contains(&"two".to_string()));
    }

    #[test]
    fn li_gets_bullet_prefix() {
        let pages = paginate(
            "<html><body><ul><li>item</li></ul></body></html>",
            &settings(),
            None,
        );
        let words = all_words(&pages);
        assert_eq!(words[0], "\u{2022}");
        assert_eq!(words[1], "item");
    }

    #[test]
    fn br_splits_paragraph_without_new_css() {
        let pages = paginate(
            "<html><body><p>line one<br/>line two</p></body></html>",
            &settings(),
            None,
        );
        let lines = all_lines(&pages);
        // "line one" and "line two" are separate paragraphs, so at
        // least two lines even though both fit one line widthwise.
        assert!(lines.len() >= 2);
        assert_eq!(lines[0].line.words.last().unwrap().text, "one");
        assert_eq!(lines[1].line.words.first().unwrap().text, "line");
    }

    #[test]
    fn pages_break_at_viewport_height() {
        // Nine short paragraphs at 20 px each against a 60 px page.
        let html = format!(
            "<html><body>{}</body></html>",
            (0..9)
                .map(|i| format!("<p>w{}</p>", i))
                .collect::<String>()
        );
        let pages = paginate(&html, &settings(), None);
        assert_eq!(pages.len(), 3);
        for page in &pages {
            for el in &page.elements {
                if let PageElement::Line(line) = el {
                    assert!(i32::from(line.y) + 20 <= 60);
                }
            }
        }
    }

    #[test]
    fn css_margins_offset_lines() {
        let mut rules = CssRuleSet::new();
        rules.load_str(".spaced { margin-top: 10px; margin-left: 8px; padding-left: 2px }");
        let pages = paginate(
            r#"<html><body><p>plain</p><p class="spaced">offset</p></body></html>"#,
            &settings(),
            Some(&rules),
        );
        let lines = all_lines(&pages);
        assert_eq!(lines[0].y, 0);
        assert_eq!(lines[0].x, 0);
        // Second paragraph: 20 px line + 10 px margin-top.
        assert_eq!(lines[1].y, 30);
        assert_eq!(lines[1].x, 10); // margin-left + padding-left
    }

    #[test]
    fn embedded_style_off_ignores_css_and_inline_styles() {
        let mut rules = CssRuleSet::new();
        rules.load_str("p { margin-top: 50px }");
        let pages = paginate(
            r#"<html><body><p style="margin-top: 50px">word</p></body></html>"#,
            &settings(),
            None, // embedded styling disabled
        );
        let lines = all_lines(&pages);
        assert_eq!(lines[0].y, 0);
    }

    #[test]
    fn headers_default_to_centered() {
        let pages = paginate(
            "<html><body><h1>Title</h1><p>body</p></body></html>",
            &settings(),
            None,
        );
        let lines = all_lines(&pages);
        assert_eq!(lines[0].line.block_style.alignment, TextAlign::Center);
        assert!(lines[0].line.words[0].flags.is_bold());
        assert_eq!(lines[1].line.block_style.alignment, TextAlign::Left);
        assert!(!lines[1].line.words[0].flags.is_bold());
    }

    #[test]
    fn embedded_css_overrides_header_centering() {
        let mut rules = CssRuleSet::new();
        rules.load_str("h1 { text-align: right }");
        let pages = paginate(
            "<html><body><h1>Title</h1></body></html>",
            &settings(),
            Some(&rules),
        );
        let lines = all_lines(&pages);
        assert_eq!(lines[0].line.block_style.alignment, TextAlign::Right);
    }

    #[test]
    fn force_bold_applies_to_every_word() {
        let mut cfg = settings();
        cfg.force_bold = true;
        let pages = paginate("<html><body><p>a b</p></body></html>", &cfg, None);
        for line in all_lines(&pages) {
            for word in &line.line.words {
                assert!(word.flags.is_bold());
            }
        }
    }

    #[test]
    fn oversized_word_buffer_flushes_as_continuation() {
        let long_word = "x".repeat(MAX_WORD_BYTES + 50);
        let mut cfg = settings();
        cfg.viewport_width = 10_000; // keep it on one line
        let html = format!("<html><body><p>{}</p></body></html>", long_word);
        let pages = paginate(&html, &cfg, None);
        let lines = all_lines(&pages);
        let words = &lines[0].line.words;
        assert_eq!(words.len(), 2);
        assert_eq!(words[0].text.len(), MAX_WORD_BYTES);
        // The fragments abut with no gap.
        assert_eq!(
            u32::from(words[1].x),
            u32::from(words[0].x) + words[0].text.len() as u32 * 10
        );
    }

    #[test]
    fn named_and_numeric_entities_resolve() {
        let pages = paginate(
            "<html><body><p>caf&eacute; &#8212;dash</p></body></html>",
            &settings(),
            None,
        );
        let words = all_words(&pages);
        assert!(words.contains(&"café".to_string()));
        assert!(words.contains(&"\u{2014}dash".to_string()));
    }

    #[test]
    fn very_long_paragraph_flushes_eagerly() {
        let mut body = String::from("<html><body><p>");
        for i in 0..900 {
            body.push_str(&format!("w{} ", i));
        }
        body.push_str("</p></body></html>");
        let pages = paginate(&body, &settings(), None);
        // 900 words wrap far past one page.
        assert!(pages.len() > 3);
        let words = all_words(&pages);
        assert_eq!(words.len(), 900);
        assert_eq!(words[0], "w0");
        assert_eq!(words[899], "w899");
    }

    #[test]
    fn cancellation_aborts_the_parse() {
        let metrics = FixedMetrics;
        let hyphenator = Hyphenator::disabled();
        let cancel = CancelFlag::new();
        cancel.cancel();
        let cfg = settings();
        let ctx = ChapterContext {
            settings: &cfg,
            css: None,
            metrics: &metrics,
            hyphenator: &hyphenator,
            cancel: Some(&cancel),
        };
        let mut pages = Vec::new();
        let err = parse_chapter(
            "<html><body><p>text</p></body></html>".as_bytes(),
            &ctx,
            &mut |page| pages.push(page),
        )
        .unwrap_err();
        assert!(matches!(err, FolioError::Cancelled));
        assert!(pages.is_empty());
    }
}
