//! In-flight paragraphs and line breaking.
//!
//! A [`ParsedParagraph`] accumulates styled words during a chapter
//! parse and is consumed destructively by layout: each emitted
//! [`TextLine`] takes ownership of its words. Two breaking modes:
//! Knuth-style minimum-cost when hyphenation is off, greedy packing
//! with inline hyphen splitting when it is on.

use std::io::{Read, Write};

use folio::error::{FolioError, Result};
use folio::hyphenation::{Hyphenator, SOFT_HYPHEN};
use folio::metrics::{GlyphMetrics, StyleFlags};
use folio::serialize::{read_str, read_u16, read_u8, write_str, write_u16, write_u8};

use crate::style::BlockStyle;
use folio::css::TextAlign;

/// Buffered-word threshold that triggers a mid-paragraph eager
/// layout flush in the chapter parser.
pub const PARAGRAPH_FLUSH_WORDS: usize = 750;

/// Deserialization guard: no plausible line carries more words.
const MAX_LINE_WORDS: usize = 10_000;

const MAX_COST: i64 = i32::MAX as i64;

/// Em space used for the fallback first-line indent width.
const EM_SPACE: &str = "\u{2003}";

/// One word with its inline styling.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StyledWord {
    pub text: String,
    pub flags: StyleFlags,
    /// Attaches to the previous word with no intervening space.
    pub continues: bool,
}

/// A laid-out word with its viewport x position.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LineWord {
    pub text: String,
    pub x: u16,
    pub flags: StyleFlags,
}

/// One immutable line of laid-out words sharing a block style.
#[derive(Clone, Debug, PartialEq)]
pub struct TextLine {
    pub words: Vec<LineWord>,
    pub block_style: BlockStyle,
}

impl TextLine {
    /// Draw every word, with underline rules 2 px below the baseline.
    pub fn render(
        &self,
        surface: &mut dyn folio::metrics::PageSurface,
        metrics: &dyn GlyphMetrics,
        font_id: i32,
        x: i32,
        y: i32,
    ) {
        for word in &self.words {
            let word_x = i32::from(word.x) + x;
            surface.draw_text(font_id, word_x, y, &word.text, true, word.flags);
            if word.flags.is_underline() {
                let width = metrics.text_width(font_id, &word.text, word.flags) as i32;
                let underline_y = y + metrics.ascender(font_id) + 2;
                surface.draw_line(word_x, underline_y, word_x + width, underline_y, true);
            }
        }
    }

    pub fn serialize(&self, w: &mut impl Write) -> Result<()> {
        let count = u16::try_from(self.words.len())
            .map_err(|_| FolioError::Io("line word count exceeds u16".into()))?;
        write_u16(w, count)?;
        for word in &self.words {
            write_str(w, &word.text)?;
        }
        for word in &self.words {
            write_u16(w, word.x)?;
        }
        for word in &self.words {
            write_u8(w, word.flags.bits())?;
        }
        self.block_style.serialize(w)
    }

    pub fn deserialize(r: &mut impl Read) -> Result<Self> {
        let count = read_u16(r)? as usize;
        if count > MAX_LINE_WORDS {
            return Err(FolioError::CorruptCache(format!(
                "line declares {} words",
                count
            )));
        }
        let mut texts = Vec::with_capacity(count);
        for _ in 0..count {
            texts.push(read_str(r)?);
        }
        let mut xs = Vec::with_capacity(count);
        for _ in 0..count {
            xs.push(read_u16(r)?);
        }
        let mut flags = Vec::with_capacity(count);
        for _ in 0..count {
            flags.push(StyleFlags::from_bits(read_u8(r)?));
        }
        let block_style = BlockStyle::deserialize(r)?;
        let words = texts
            .into_iter()
            .zip(xs)
            .zip(flags)
            .map(|((text, x), flags)| LineWord { text, x, flags })
            .collect();
        Ok(Self { words, block_style })
    }
}

fn strip_soft_hyphens(text: &str) -> String {
    if text.contains(SOFT_HYPHEN) {
        text.chars().filter(|c| *c != SOFT_HYPHEN).collect()
    } else {
        text.to_string()
    }
}

/// Rendered width with soft hyphens ignored and an optional visible
/// hyphen appended.
fn measure_word(
    metrics: &dyn GlyphMetrics,
    font_id: i32,
    text: &str,
    flags: StyleFlags,
    append_hyphen: bool,
) -> u16 {
    let width = if !append_hyphen && !text.contains(SOFT_HYPHEN) {
        metrics.text_width(font_id, text, flags)
    } else {
        let mut sanitized = strip_soft_hyphens(text);
        if append_hyphen {
            sanitized.push('-');
        }
        metrics.text_width(font_id, &sanitized, flags)
    };
    width.min(u32::from(u16::MAX)) as u16
}

/// An in-flight paragraph: the word arena plus its block formatting.
pub struct ParsedParagraph {
    words: Vec<StyledWord>,
    block_style: BlockStyle,
    extra_paragraph_spacing: bool,
    hyphenation_enabled: bool,
}

impl ParsedParagraph {
    pub fn new(
        extra_paragraph_spacing: bool,
        hyphenation_enabled: bool,
        block_style: BlockStyle,
    ) -> Self {
        Self {
            words: Vec::with_capacity(16),
            block_style,
            extra_paragraph_spacing,
            hyphenation_enabled,
        }
    }

    pub fn add_word(&mut self, text: String, flags: StyleFlags, continues: bool) {
        if text.is_empty() {
            return;
        }
        self.words.push(StyledWord {
            text,
            flags,
            continues,
        });
    }

    pub fn word_count(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn block_style(&self) -> &BlockStyle {
        &self.block_style
    }

    pub fn set_block_style(&mut self, style: BlockStyle) {
        self.block_style = style;
    }

    /// First-line indent in pixels: the CSS indent when defined, an
    /// em width as visual fallback otherwise. Only left/justified
    /// paragraphs without extra paragraph spacing indent.
    fn first_line_indent(&self, metrics: &dyn GlyphMetrics, font_id: i32) -> i32 {
        if self.extra_paragraph_spacing
            || !matches!(
                self.block_style.alignment,
                TextAlign::Justify | TextAlign::Left
            )
        {
            return 0;
        }
        if self.block_style.indent_defined {
            i32::from(self.block_style.first_line_indent).max(0)
        } else {
            metrics.text_width(font_id, EM_SPACE, StyleFlags::REGULAR) as i32
        }
    }

    /// Break the buffered words into lines and hand each to `emit`.
    ///
    /// With `include_last_line = false` the final (possibly partial)
    /// line stays buffered; the chapter parser uses this for the
    /// memory-bound mid-paragraph flush. Consumed words are removed.
    pub fn layout_into_lines(
        &mut self,
        metrics: &dyn GlyphMetrics,
        font_id: i32,
        viewport_width: u16,
        hyphenator: &Hyphenator,
        include_last_line: bool,
        emit: &mut dyn FnMut(TextLine),
    ) {
        if self.words.is_empty() {
            return;
        }

        let page_width = i32::from(viewport_width);
        let space = metrics.space_width(font_id) as i32;
        let indent = self.first_line_indent(metrics, font_id);

        let mut widths: Vec<u16> = self
            .words
            .iter()
            .map(|w| measure_word(metrics, font_id, &w.text, w.flags, false))
            .collect();

        let breaks = if self.hyphenation_enabled {
            self.compute_breaks_greedy(
                metrics, font_id, hyphenator, &mut widths, page_width, space, indent,
            )
        } else {
            self.presplit_oversized(metrics, font_id, hyphenator, &mut widths, page_width, indent);
            self.compute_breaks_optimal(&widths, page_width, space, indent)
        };

        let line_count = if include_last_line {
            breaks.len()
        } else {
            breaks.len().saturating_sub(1)
        };

        let mut start = 0usize;
        for (i, end) in breaks.iter().copied().take(line_count).enumerate() {
            let is_first = i == 0;
            let is_last = i == breaks.len() - 1;
            self.extract_line(
                start..end, is_first, is_last, &widths, page_width, space, indent, emit,
            );
            start = end;
        }
        self.words.drain(..start);
    }

    /// Split any word that cannot fit alone on a line, using fallback
    /// hyphenation, so the optimal pass always has a legal break set.
    fn presplit_oversized(
        &mut self,
        metrics: &dyn GlyphMetrics,
        font_id: i32,
        hyphenator: &Hyphenator,
        widths: &mut Vec<u16>,
        page_width: i32,
        indent: i32,
    ) {
        let mut i = 0usize;
        while i < widths.len() {
            let effective = if i == 0 { page_width - indent } else { page_width };
            while i32::from(widths[i]) > effective {
                if !self.hyphenate_word_at(i, effective, metrics, font_id, widths, true, hyphenator)
                {
                    break;
                }
            }
            i += 1;
        }
    }

    /// Minimum-badness line breaking: cost of a non-final line is the
    /// squared leftover space, the final line is free. Breaks are
    /// illegal in front of continuation words.
    fn compute_breaks_optimal(
        &self,
        widths: &[u16],
        page_width: i32,
        space: i32,
        indent: i32,
    ) -> Vec<usize> {
        let n = widths.len();
        let mut dp = vec![0i64; n];
        let mut ans = vec![0usize; n];
        dp[n - 1] = 0;
        ans[n - 1] = n - 1;

        for i in (0..n.saturating_sub(1)).rev() {
            let mut current_len = 0i64;
            dp[i] = MAX_COST;
            let effective = i64::from(if i == 0 { page_width - indent } else { page_width });

            for j in i..n {
                let gap = if j > i && !self.words[j].continues {
                    i64::from(space)
                } else {
                    0
                };
                current_len += i64::from(widths[j]) + gap;
                if current_len > effective {
                    break;
                }
                // A break after j is illegal when j+1 attaches to it.
                if j + 1 < n && self.words[j + 1].continues {
                    continue;
                }
                let cost = if j == n - 1 {
                    0
                } else {
                    let remaining = effective - current_len;
                    (remaining * remaining).saturating_add(dp[j + 1]).min(MAX_COST)
                };
                if cost < dp[i] {
                    dp[i] = cost;
                    ans[i] = j;
                }
            }

            // Oversized word: no legal configuration. Put it alone on
            // a line and inherit the next suffix's cost so earlier
            // words still find valid configurations.
            if dp[i] == MAX_COST {
                ans[i] = i;
                dp[i] = if i + 1 < n { dp[i + 1] } else { 0 };
            }
        }

        let mut breaks = Vec::with_capacity(8);
        let mut current = 0usize;
        while current < n {
            let mut next = ans[current] + 1;
            if next <= current {
                next = current + 1; // forced advance, no stalls
            }
            breaks.push(next);
            current = next;
        }
        breaks
    }

    /// Greedy packing that opportunistically splits the overflowing
    /// word when a hyphenated prefix fits the remaining width.
    #[allow(clippy::too_many_arguments)]
    fn compute_breaks_greedy(
        &mut self,
        metrics: &dyn GlyphMetrics,
        font_id: i32,
        hyphenator: &Hyphenator,
        widths: &mut Vec<u16>,
        page_width: i32,
        space: i32,
        indent: i32,
    ) -> Vec<usize> {
        let mut breaks = Vec::with_capacity(8);
        let mut current = 0usize;
        let mut is_first_line = true;

        while current < widths.len() {
            let line_start = current;
            let mut line_width = 0i32;
            let effective = if is_first_line { page_width - indent } else { page_width };

            while current < widths.len() {
                let is_first_word = current == line_start;
                let spacing = if is_first_word || self.words[current].continues {
                    0
                } else {
                    space
                };
                let candidate = spacing + i32::from(widths[current]);

                if line_width + candidate <= effective {
                    line_width += candidate;
                    current += 1;
                    continue;
                }

                // Overflow: try to split at a hyphenation point.
                let available = effective - line_width - spacing;
                let allow_fallback = is_first_word; // only a lone word may brute-force split
                if available > 0
                    && self.hyphenate_word_at(
                        current,
                        available,
                        metrics,
                        font_id,
                        widths,
                        allow_fallback,
                        hyphenator,
                    )
                {
                    line_width += spacing + i32::from(widths[current]);
                    current += 1;
                    break;
                }

                // Could not split: force at least one word per line.
                if current == line_start {
                    line_width += candidate;
                    current += 1;
                }
                break;
            }

            // Never leave a continuation word orphaned at a line
            // start; move the whole continuation group down.
            while current > line_start + 1
                && current < widths.len()
                && self.words[current].continues
            {
                current -= 1;
            }

            breaks.push(current);
            is_first_line = false;
        }

        breaks
    }

    /// Split `words[index]` at the widest legal break whose prefix
    /// fits `available` pixels. The prefix keeps its slot; the
    /// remainder is inserted after it with the original word's
    /// continuation flag.
    fn hyphenate_word_at(
        &mut self,
        index: usize,
        available: i32,
        metrics: &dyn GlyphMetrics,
        font_id: i32,
        widths: &mut Vec<u16>,
        allow_fallback: bool,
        hyphenator: &Hyphenator,
    ) -> bool {
        if available <= 0 || index >= self.words.len() {
            return false;
        }
        let flags = self.words[index].flags;
        let word = self.words[index].text.clone();

        let break_infos = hyphenator.break_offsets(&word, allow_fallback);
        if break_infos.is_empty() {
            return false;
        }

        let mut chosen: Option<(usize, i32, bool)> = None;
        for info in &break_infos {
            let offset = info.byte_offset;
            if offset == 0 || offset >= word.len() {
                continue;
            }
            let prefix_width =
                i32::from(measure_word(metrics, font_id, &word[..offset], flags, info.needs_hyphen));
            if prefix_width > available {
                continue;
            }
            if let Some((_, best, _)) = chosen {
                if prefix_width <= best {
                    continue;
                }
            }
            chosen = Some((offset, prefix_width, info.needs_hyphen));
        }
        let Some((offset, prefix_width, needs_hyphen)) = chosen else {
            return false;
        };

        let remainder = word[offset..].to_string();
        let mut prefix = word[..offset].to_string();
        if needs_hyphen {
            prefix.push('-');
        }

        let original_continued = self.words[index].continues;
        self.words[index].text = prefix;
        self.words[index].continues = false;
        widths[index] = prefix_width.clamp(0, i32::from(u16::MAX)) as u16;

        let remainder_width = measure_word(metrics, font_id, &remainder, flags, false);
        self.words.insert(
            index + 1,
            StyledWord {
                text: remainder,
                flags,
                continues: original_continued,
            },
        );
        widths.insert(index + 1, remainder_width);
        true
    }

    /// Build one line from `range`, computing justification spacing
    /// and per-word x positions, and emit it.
    #[allow(clippy::too_many_arguments)]
    fn extract_line(
        &mut self,
        range: std::ops::Range<usize>,
        is_first: bool,
        is_last: bool,
        widths: &[u16],
        page_width: i32,
        space: i32,
        indent: i32,
        emit: &mut dyn FnMut(TextLine),
    ) {
        let count = range.len();
        let mut width_sum = 0i32;
        let mut gap_count = 0i32;
        for (k, idx) in range.clone().enumerate() {
            width_sum += i32::from(widths[idx]);
            if k > 0 && !self.words[idx].continues {
                gap_count += 1;
            }
        }

        let line_indent = if is_first { indent } else { 0 };
        let effective = page_width - line_indent;
        let spare = effective - width_sum;

        let mut spacing = space;
        if self.block_style.alignment == TextAlign::Justify && !is_last && gap_count >= 1 {
            spacing = spare.max(0) / gap_count;
        }

        let mut x = line_indent;
        match self.block_style.alignment {
            TextAlign::Right => x = (spare - gap_count * space).max(0),
            TextAlign::Center => x = ((spare - gap_count * space) / 2).max(0),
            _ => {}
        }

        let mut line_words = Vec::with_capacity(count);
        for (k, idx) in range.enumerate() {
            let taken = std::mem::take(&mut self.words[idx].text);
            line_words.push(LineWord {
                text: strip_soft_hyphens(&taken),
                x: x.clamp(0, i32::from(u16::MAX)) as u16,
                flags: self.words[idx].flags,
            });
            let next_is_continuation =
                k + 1 < count && self.words[idx + 1].continues;
            x += i32::from(widths[idx]) + if next_is_continuation { 0 } else { spacing };
        }

        emit(TextLine {
            words: line_words,
            block_style: self.block_style,
        });
    }
}
