//! Stylesheet compiler: parses publication CSS into a normalized
//! selector → style map and serializes it to a binary cache.
//!
//! The supported subset is deliberately small: tag, `.class`, and
//! `tag.class` selectors over the block/inline properties an e-ink
//! text renderer can honor. Everything else (combinators,
//! pseudo-classes, attribute selectors, ids, unknown properties) is
//! skipped without error.

use std::collections::BTreeMap;
use std::io::Read;

use smallvec::SmallVec;

use crate::error::{FolioError, Result};
use crate::serialize::{
    read_f32, read_str, read_u16, read_u8, write_f32, write_str, write_u16, write_u8,
};

/// Cache format version; bump on any layout-relevant change.
pub const CSS_CACHE_VERSION: u8 = 2;

/// Per-file input cap. Excess bytes are dropped without error.
pub const MAX_CSS_BYTES: usize = 64 * 1024;

/// Upper bound on cached rules; larger counts are corruption.
const MAX_CACHED_RULES: usize = 4096;

/// Text alignment values. Discriminants are serialized.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum TextAlign {
    /// Flush both edges with stretched inter-word gaps.
    Justify = 0,
    #[default]
    Left = 1,
    Center = 2,
    Right = 3,
}

impl TextAlign {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Justify,
            2 => Self::Center,
            3 => Self::Right,
            _ => Self::Left,
        }
    }
}

/// `font-style` subset.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum FontStyle {
    #[default]
    Normal = 0,
    Italic = 1,
}

/// `font-weight` collapsed to the two faces the renderer has.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum FontWeight {
    #[default]
    Normal = 0,
    Bold = 1,
}

/// `text-decoration` subset.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum TextDecoration {
    #[default]
    None = 0,
    Underline = 1,
}

/// Length units kept for deferred resolution.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum CssUnit {
    #[default]
    Px = 0,
    Em = 1,
    Rem = 2,
    Pt = 3,
    Percent = 4,
}

impl CssUnit {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Em,
            2 => Self::Rem,
            3 => Self::Pt,
            4 => Self::Percent,
            _ => Self::Px,
        }
    }
}

/// A CSS length with its unit, resolved lazily against an em size
/// and (for percentages) a container width.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CssLength {
    pub value: f32,
    pub unit: CssUnit,
}

impl CssLength {
    pub fn px(value: f32) -> Self {
        Self {
            value,
            unit: CssUnit::Px,
        }
    }

    /// Resolve to pixels. `container_width` is only consulted for
    /// percentage units.
    pub fn to_px(self, em_size: f32, container_width: f32) -> f32 {
        match self.unit {
            CssUnit::Em | CssUnit::Rem => self.value * em_size,
            CssUnit::Pt => self.value * 1.33,
            CssUnit::Percent => self.value * container_width / 100.0,
            CssUnit::Px => self.value,
        }
    }
}

// Defined-property bits; the serialized order is frozen.
const DEF_TEXT_ALIGN: u16 = 1 << 0;
const DEF_FONT_STYLE: u16 = 1 << 1;
const DEF_FONT_WEIGHT: u16 = 1 << 2;
const DEF_TEXT_DECORATION: u16 = 1 << 3;
const DEF_TEXT_INDENT: u16 = 1 << 4;
const DEF_MARGIN_TOP: u16 = 1 << 5;
const DEF_MARGIN_BOTTOM: u16 = 1 << 6;
const DEF_MARGIN_LEFT: u16 = 1 << 7;
const DEF_MARGIN_RIGHT: u16 = 1 << 8;
const DEF_PADDING_TOP: u16 = 1 << 9;
const DEF_PADDING_BOTTOM: u16 = 1 << 10;
const DEF_PADDING_LEFT: u16 = 1 << 11;
const DEF_PADDING_RIGHT: u16 = 1 << 12;
const DEF_IMAGE_WIDTH: u16 = 1 << 13;
const DEF_IMAGE_HEIGHT: u16 = 1 << 14;

/// A set of optional style properties with defined-flags per field.
///
/// Composition is field-wise: [`apply_over`](Self::apply_over) copies
/// only the fields the overlay actually defines.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CssStyle {
    pub text_align: TextAlign,
    pub font_style: FontStyle,
    pub font_weight: FontWeight,
    pub text_decoration: TextDecoration,
    pub text_indent: CssLength,
    pub margin_top: CssLength,
    pub margin_bottom: CssLength,
    pub margin_left: CssLength,
    pub margin_right: CssLength,
    pub padding_top: CssLength,
    pub padding_bottom: CssLength,
    pub padding_left: CssLength,
    pub padding_right: CssLength,
    pub image_width: CssLength,
    pub image_height: CssLength,
    defined: u16,
}

macro_rules! style_field {
    ($has:ident, $set:ident, $field:ident, $ty:ty, $bit:ident) => {
        pub fn $has(&self) -> bool {
            self.defined & $bit != 0
        }

        pub fn $set(&mut self, value: $ty) {
            self.$field = value;
            self.defined |= $bit;
        }
    };
}

impl CssStyle {
    pub fn new() -> Self {
        Self::default()
    }

    style_field!(has_text_align, set_text_align, text_align, TextAlign, DEF_TEXT_ALIGN);
    style_field!(has_font_style, set_font_style, font_style, FontStyle, DEF_FONT_STYLE);
    style_field!(has_font_weight, set_font_weight, font_weight, FontWeight, DEF_FONT_WEIGHT);
    style_field!(
        has_text_decoration,
        set_text_decoration,
        text_decoration,
        TextDecoration,
        DEF_TEXT_DECORATION
    );
    style_field!(has_text_indent, set_text_indent, text_indent, CssLength, DEF_TEXT_INDENT);
    style_field!(has_margin_top, set_margin_top, margin_top, CssLength, DEF_MARGIN_TOP);
    style_field!(
        has_margin_bottom,
        set_margin_bottom,
        margin_bottom,
        CssLength,
        DEF_MARGIN_BOTTOM
    );
    style_field!(has_margin_left, set_margin_left, margin_left, CssLength, DEF_MARGIN_LEFT);
    style_field!(
        has_margin_right,
        set_margin_right,
        margin_right,
        CssLength,
        DEF_MARGIN_RIGHT
    );
    style_field!(has_padding_top, set_padding_top, padding_top, CssLength, DEF_PADDING_TOP);
    style_field!(
        has_padding_bottom,
        set_padding_bottom,
        padding_bottom,
        CssLength,
        DEF_PADDING_BOTTOM
    );
    style_field!(
        has_padding_left,
        set_padding_left,
        padding_left,
        CssLength,
        DEF_PADDING_LEFT
    );
    style_field!(
        has_padding_right,
        set_padding_right,
        padding_right,
        CssLength,
        DEF_PADDING_RIGHT
    );
    style_field!(has_image_width, set_image_width, image_width, CssLength, DEF_IMAGE_WIDTH);
    style_field!(
        has_image_height,
        set_image_height,
        image_height,
        CssLength,
        DEF_IMAGE_HEIGHT
    );

    /// True when at least one property has been set.
    pub fn any_set(&self) -> bool {
        self.defined != 0
    }

    /// Overlay `other` onto `self`, keeping fields the overlay does
    /// not define.
    pub fn apply_over(&mut self, other: &CssStyle) {
        if other.has_text_align() {
            self.set_text_align(other.text_align);
        }
        if other.has_font_style() {
            self.set_font_style(other.font_style);
        }
        if other.has_font_weight() {
            self.set_font_weight(other.font_weight);
        }
        if other.has_text_decoration() {
            self.set_text_decoration(other.text_decoration);
        }
        if other.has_text_indent() {
            self.set_text_indent(other.text_indent);
        }
        if other.has_margin_top() {
            self.set_margin_top(other.margin_top);
        }
        if other.has_margin_bottom() {
            self.set_margin_bottom(other.margin_bottom);
        }
        if other.has_margin_left() {
            self.set_margin_left(other.margin_left);
        }
        if other.has_margin_right() {
            self.set_margin_right(other.margin_right);
        }
        if other.has_padding_top() {
            self.set_padding_top(other.padding_top);
        }
        if other.has_padding_bottom() {
            self.set_padding_bottom(other.padding_bottom);
        }
        if other.has_padding_left() {
            self.set_padding_left(other.padding_left);
        }
        if other.has_padding_right() {
            self.set_padding_right(other.padding_right);
        }
        if other.has_image_width() {
            self.set_image_width(other.image_width);
        }
        if other.has_image_height() {
            self.set_image_height(other.image_height);
        }
    }
}

/// Compiled selector → style map for one publication.
#[derive(Clone, Debug, Default)]
pub struct CssRuleSet {
    // BTreeMap keeps cache serialization deterministic.
    rules: BTreeMap<String, CssStyle>,
}

impl CssRuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn clear(&mut self) {
        self.rules.clear();
    }

    /// Append rules from a stylesheet source, merging duplicates in
    /// declaration order (later files win on conflicts).
    pub fn load_str(&mut self, css: &str) {
        let css = if css.len() > MAX_CSS_BYTES {
            // Cut at a char boundary inside the cap.
            let mut end = MAX_CSS_BYTES;
            while end > 0 && !css.is_char_boundary(end) {
                end -= 1;
            }
            &css[..end]
        } else {
            css
        };
        let cleaned = strip_comments(css);
        let mut pos = 0usize;
        while let Some((selector_group, body)) = extract_next_rule(&cleaned, &mut pos) {
            self.process_rule(&selector_group, &body);
        }
        log::debug!("css: {} rules after load", self.rules.len());
    }

    /// Read up to [`MAX_CSS_BYTES`] from a stream and append the
    /// rules. Bytes past the cap are discarded without error.
    pub fn load_stream(&mut self, reader: &mut impl Read) -> Result<()> {
        let mut content = Vec::with_capacity(4096);
        let mut buf = [0u8; 512];
        while content.len() < MAX_CSS_BYTES {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            let room = MAX_CSS_BYTES - content.len();
            content.extend_from_slice(&buf[..n.min(room)]);
        }
        let text = String::from_utf8_lossy(&content);
        self.load_str(&text);
        Ok(())
    }

    /// Resolve the cascade for an element: tag style, then each class
    /// in attribute order, then each `tag.class`.
    pub fn resolve(&self, tag: &str, class_attr: &str) -> CssStyle {
        let mut result = CssStyle::new();
        let tag = normalized(tag);

        if let Some(style) = self.rules.get(&tag) {
            result.apply_over(style);
        }

        if !class_attr.is_empty() {
            let classes: SmallVec<[String; 4]> = split_whitespace(class_attr)
                .into_iter()
                .map(|c| normalized(&c))
                .collect();

            for class in &classes {
                if let Some(style) = self.rules.get(&format!(".{}", class)) {
                    result.apply_over(style);
                }
            }
            for class in &classes {
                if let Some(style) = self.rules.get(&format!("{}.{}", tag, class)) {
                    result.apply_over(style);
                }
            }
        }

        result
    }

    /// Parse a single `style="…"` declaration block.
    pub fn parse_inline(style_attr: &str) -> CssStyle {
        parse_declarations(style_attr)
    }

    /// Write the binary cache (version 2).
    pub fn save_cache(&self, w: &mut impl std::io::Write) -> Result<()> {
        write_u8(w, CSS_CACHE_VERSION)?;
        let count = u16::try_from(self.rules.len())
            .map_err(|_| FolioError::Io("too many CSS rules to cache".into()))?;
        write_u16(w, count)?;
        for (selector, style) in &self.rules {
            write_str(w, selector)?;
            write_u8(w, style.text_align.as_u8())?;
            write_u8(w, style.font_style as u8)?;
            write_u8(w, style.font_weight as u8)?;
            write_u8(w, style.text_decoration as u8)?;
            for len in [
                style.text_indent,
                style.margin_top,
                style.margin_bottom,
                style.margin_left,
                style.margin_right,
                style.padding_top,
                style.padding_bottom,
                style.padding_left,
                style.padding_right,
                style.image_width,
                style.image_height,
            ] {
                write_f32(w, len.value)?;
                write_u8(w, len.unit as u8)?;
            }
            write_u16(w, style.defined)?;
        }
        log::debug!("css: saved {} rules to cache", count);
        Ok(())
    }

    /// Load the binary cache, replacing the in-memory map. A version
    /// mismatch reports `CacheStale`; short or implausible data
    /// reports `CorruptCache`. The map is left empty on failure.
    pub fn load_cache(&mut self, r: &mut impl Read) -> Result<()> {
        self.rules.clear();
        let version = read_u8(r)?;
        if version != CSS_CACHE_VERSION {
            log::debug!(
                "css: cache version mismatch (got {}, expected {})",
                version,
                CSS_CACHE_VERSION
            );
            return Err(FolioError::CacheStale);
        }
        let count = read_u16(r)? as usize;
        if count > MAX_CACHED_RULES {
            return Err(FolioError::CorruptCache(format!(
                "css cache declares {} rules",
                count
            )));
        }
        for _ in 0..count {
            let selector = match read_str(r) {
                Ok(s) => s,
                Err(e) => {
                    self.rules.clear();
                    return Err(e);
                }
            };
            let result = (|| -> Result<CssStyle> {
                let mut style = CssStyle::new();
                style.text_align = TextAlign::from_u8(read_u8(r)?);
                style.font_style = if read_u8(r)? == 1 {
                    FontStyle::Italic
                } else {
                    FontStyle::Normal
                };
                style.font_weight = if read_u8(r)? == 1 {
                    FontWeight::Bold
                } else {
                    FontWeight::Normal
                };
                style.text_decoration = if read_u8(r)? == 1 {
                    TextDecoration::Underline
                } else {
                    TextDecoration::None
                };
                let mut lengths = [CssLength::default(); 11];
                for len in &mut lengths {
                    len.value = read_f32(r)?;
                    len.unit = CssUnit::from_u8(read_u8(r)?);
                }
                [
                    style.text_indent,
                    style.margin_top,
                    style.margin_bottom,
                    style.margin_left,
                    style.margin_right,
                    style.padding_top,
                    style.padding_bottom,
                    style.padding_left,
                    style.padding_right,
                    style.image_width,
                    style.image_height,
                ] = lengths;
                style.defined = read_u16(r)?;
                Ok(style)
            })();
            match result {
                Ok(style) => {
                    self.rules.insert(selector, style);
                }
                Err(e) => {
                    self.rules.clear();
                    return Err(e);
                }
            }
        }
        log::debug!("css: loaded {} rules from cache", self.rules.len());
        Ok(())
    }

    fn process_rule(&mut self, selector_group: &str, declarations: &str) {
        let style = parse_declarations(declarations);
        if !style.any_set() {
            return;
        }
        for selector in split_on_char(selector_group, ',') {
            if !is_supported_selector(&selector) {
                continue;
            }
            self.rules
                .entry(selector)
                .and_modify(|existing| existing.apply_over(&style))
                .or_insert(style);
        }
    }
}

/// CSS whitespace per the tokenizer grammar.
fn is_css_whitespace(c: char) -> bool {
    matches!(c, ' ' | '\t' | '\n' | '\r' | '\x0c')
}

/// Collapse whitespace runs to single spaces, trim, lowercase.
fn normalized(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut in_space = true;
    for c in s.chars() {
        if is_css_whitespace(c) {
            if !in_space {
                result.push(' ');
                in_space = true;
            }
        } else {
            result.extend(c.to_lowercase());
            in_space = false;
        }
    }
    if result.ends_with(' ') {
        result.pop();
    }
    result
}

fn split_on_char(s: &str, delimiter: char) -> Vec<String> {
    s.split(delimiter)
        .map(normalized)
        .filter(|part| !part.is_empty())
        .collect()
}

fn split_whitespace(s: &str) -> Vec<String> {
    s.split(is_css_whitespace)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

/// Keys are `tag`, `.class`, or `tag.class`; anything with
/// combinators, pseudo-classes, attribute parts, or ids is skipped.
fn is_supported_selector(key: &str) -> bool {
    if key.is_empty() || key.contains(|c: char| " >+~:[#*()".contains(c)) {
        return false;
    }
    let mut parts = key.splitn(3, '.');
    let tag = parts.next().unwrap_or("");
    let class = parts.next();
    if parts.next().is_some() {
        return false; // more than one dot
    }
    let ident_ok = |s: &str| {
        !s.is_empty()
            && s.chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    };
    match class {
        None => ident_ok(tag),
        Some(class) => (tag.is_empty() || ident_ok(tag)) && ident_ok(class),
    }
}

/// Remove `/* … */` comments. An unterminated comment discards the
/// rest of the input.
fn strip_comments(css: &str) -> String {
    let bytes = css.as_bytes();
    let mut result = String::with_capacity(css.len());
    let mut pos = 0usize;
    while pos < bytes.len() {
        if bytes[pos] == b'/' && pos + 1 < bytes.len() && bytes[pos + 1] == b'*' {
            match css[pos + 2..].find("*/") {
                Some(end) => pos += 2 + end + 2,
                None => break,
            }
        } else {
            let ch_len = css[pos..].chars().next().map_or(1, char::len_utf8);
            result.push_str(&css[pos..pos + ch_len]);
            pos += ch_len;
        }
    }
    result
}

/// Advance past an `@`-rule: to the `;` of a simple rule or past the
/// matching `}` of a block rule.
fn skip_at_rule(css: &str, start: usize) -> usize {
    let bytes = css.as_bytes();
    let mut pos = start + 1;
    let mut brace_depth = 0i32;
    while pos < bytes.len() {
        match bytes[pos] {
            b'{' => brace_depth += 1,
            b'}' => {
                brace_depth -= 1;
                if brace_depth == 0 {
                    return pos + 1;
                }
            }
            b';' if brace_depth == 0 => return pos + 1,
            _ => {}
        }
        pos += 1;
    }
    css.len()
}

/// Pull the next `selectors { declarations }` rule out of the input.
fn extract_next_rule(css: &str, pos: &mut usize) -> Option<(String, String)> {
    let bytes = css.as_bytes();
    loop {
        while *pos < bytes.len() && is_css_whitespace(bytes[*pos] as char) {
            *pos += 1;
        }
        if *pos >= bytes.len() {
            return None;
        }
        if bytes[*pos] == b'@' {
            *pos = skip_at_rule(css, *pos);
            continue;
        }
        break;
    }

    let brace = css[*pos..].find('{')? + *pos;
    let selector = css[*pos..brace].to_string();

    let mut depth = 1i32;
    let body_start = brace + 1;
    let mut body_end = body_start;
    while body_end < bytes.len() && depth > 0 {
        match bytes[body_end] {
            b'{' => depth += 1,
            b'}' => depth -= 1,
            _ => {}
        }
        body_end += 1;
    }
    let body = if body_end > body_start {
        css[body_start..body_end.saturating_sub(1)].to_string()
    } else {
        String::new()
    };
    *pos = body_end;
    Some((selector, body))
}

fn parse_declarations(block: &str) -> CssStyle {
    let mut style = CssStyle::new();

    for decl in split_on_char(block, ';') {
        let Some(colon) = decl.find(':') else { continue };
        if colon == 0 {
            continue;
        }
        let name = normalized(&decl[..colon]);
        let value = normalized(&decl[colon + 1..]);
        if name.is_empty() || value.is_empty() {
            continue;
        }

        match name.as_str() {
            "text-align" => style.set_text_align(interpret_alignment(&value)),
            "font-style" => style.set_font_style(interpret_font_style(&value)),
            "font-weight" => style.set_font_weight(interpret_font_weight(&value)),
            "text-decoration" | "text-decoration-line" => {
                style.set_text_decoration(interpret_decoration(&value))
            }
            "text-indent" => style.set_text_indent(interpret_length(&value)),
            "margin-top" => style.set_margin_top(interpret_length(&value)),
            "margin-bottom" => style.set_margin_bottom(interpret_length(&value)),
            "margin-left" => style.set_margin_left(interpret_length(&value)),
            "margin-right" => style.set_margin_right(interpret_length(&value)),
            "margin" => {
                let values = split_whitespace(&value);
                if let Some(shorthand) = interpret_shorthand(&values) {
                    let [top, right, bottom, left] = shorthand;
                    style.set_margin_top(top);
                    style.set_margin_right(right);
                    style.set_margin_bottom(bottom);
                    style.set_margin_left(left);
                }
            }
            "padding-top" => style.set_padding_top(interpret_length(&value)),
            "padding-bottom" => style.set_padding_bottom(interpret_length(&value)),
            "padding-left" => style.set_padding_left(interpret_length(&value)),
            "padding-right" => style.set_padding_right(interpret_length(&value)),
            "padding" => {
                let values = split_whitespace(&value);
                if let Some(shorthand) = interpret_shorthand(&values) {
                    let [top, right, bottom, left] = shorthand;
                    style.set_padding_top(top);
                    style.set_padding_right(right);
                    style.set_padding_bottom(bottom);
                    style.set_padding_left(left);
                }
            }
            _ => {}
        }
    }

    style
}

fn interpret_alignment(value: &str) -> TextAlign {
    match value {
        "right" | "end" => TextAlign::Right,
        "center" => TextAlign::Center,
        "justify" => TextAlign::Justify,
        _ => TextAlign::Left,
    }
}

fn interpret_font_style(value: &str) -> FontStyle {
    match value {
        "italic" | "oblique" => FontStyle::Italic,
        _ => FontStyle::Normal,
    }
}

fn interpret_font_weight(value: &str) -> FontWeight {
    match value {
        "bold" | "bolder" => FontWeight::Bold,
        "normal" | "lighter" => FontWeight::Normal,
        numeric => match numeric.parse::<i32>() {
            Ok(weight) if weight >= 700 => FontWeight::Bold,
            _ => FontWeight::Normal,
        },
    }
}

fn interpret_decoration(value: &str) -> TextDecoration {
    // text-decoration may carry several space-separated values.
    if value.contains("underline") {
        TextDecoration::Underline
    } else {
        TextDecoration::None
    }
}

fn interpret_length(value: &str) -> CssLength {
    if value.is_empty() {
        return CssLength::default();
    }

    let unit_start = value
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit() && *c != '.' && *c != '-' && *c != '+')
        .map_or(value.len(), |(i, _)| i);
    let (num_part, unit_part) = value.split_at(unit_start);

    let Ok(numeric) = num_part.parse::<f32>() else {
        return CssLength::default();
    };

    let unit = match unit_part.trim() {
        "em" => CssUnit::Em,
        "rem" => CssUnit::Rem,
        "pt" => CssUnit::Pt,
        "%" => CssUnit::Percent,
        // px and unitless both resolve as pixels
        _ => CssUnit::Px,
    };

    CssLength {
        value: numeric,
        unit,
    }
}

/// 1–4 value shorthand expansion to `[top, right, bottom, left]`.
fn interpret_shorthand(values: &[String]) -> Option<[CssLength; 4]> {
    if values.is_empty() {
        return None;
    }
    let top = interpret_length(&values[0]);
    let right = values.get(1).map_or(top, |v| interpret_length(v));
    let bottom = values.get(2).map_or(top, |v| interpret_length(v));
    let left = values.get(3).map_or(right, |v| interpret_length(v));
    Some([top, right, bottom, left])
}
