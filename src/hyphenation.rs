//! Word-break discovery for the line breaker.
//!
//! Break sources, in precedence order: explicit hyphens and soft
//! hyphens inside the word, then language boundary rules applied to
//! each alphabetic segment, then (only on request, when everything
//! else came up empty) a brute-force enumeration used to split words
//! wider than the viewport.
//!
//! The language registry is a compile-time table keyed by lowercase
//! BCP-47 primary subtags; lookup order is the table order, which is
//! fixed.

/// Soft hyphen (U+00AD): an invisible break hint that becomes a
/// visible `-` only when the break is taken.
pub const SOFT_HYPHEN: char = '\u{00AD}';

/// One legal break inside a word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BreakInfo {
    /// Byte offset of the first code point of the remainder.
    pub byte_offset: usize,
    /// True when taking this break must insert a visible hyphen
    /// (pattern and soft-hyphen breaks); false when the word already
    /// shows one (explicit `-`).
    pub needs_hyphen: bool,
}

/// Boundary rules for one language.
struct LanguageRules {
    tag: &'static str,
    min_prefix: usize,
    min_suffix: usize,
    vowels: &'static str,
    suffixes: &'static [&'static str],
}

/// Fallback affix bounds when no language is active.
const DEFAULT_MIN_PREFIX: usize = 2;
const DEFAULT_MIN_SUFFIX: usize = 2;

/// Compile-time language registry. Order is part of the API surface
/// for tests; keep entries sorted by tag.
static LANGUAGES: &[LanguageRules] = &[
    LanguageRules {
        tag: "de",
        min_prefix: 2,
        min_suffix: 3,
        vowels: "aeiouyäöü",
        suffixes: &["ung", "heit", "keit", "lich", "isch", "chen", "schaft"],
    },
    LanguageRules {
        tag: "en",
        min_prefix: 2,
        min_suffix: 3,
        vowels: "aeiouy",
        suffixes: &[
            "tion", "sion", "ment", "ness", "less", "able", "ible", "ally", "ingly", "edly",
            "ing", "ed", "ly",
        ],
    },
    LanguageRules {
        tag: "es",
        min_prefix: 2,
        min_suffix: 3,
        vowels: "aeiouáéíóúü",
        suffixes: &["ción", "sión", "mente", "miento", "dad"],
    },
    LanguageRules {
        tag: "fr",
        min_prefix: 2,
        min_suffix: 3,
        vowels: "aeiouyàâéèêëîïôûùü",
        suffixes: &["ment", "tion", "euse", "eur", "aise"],
    },
    LanguageRules {
        tag: "it",
        min_prefix: 2,
        min_suffix: 3,
        vowels: "aeiouàèéìòù",
        suffixes: &["zione", "mente", "ezza"],
    },
];

fn rules_for_language(tag: &str) -> Option<&'static LanguageRules> {
    let primary: String = tag
        .chars()
        .take_while(|c| *c != '-' && *c != '_')
        .flat_map(char::to_lowercase)
        .collect();
    if primary.is_empty() {
        return None;
    }
    LANGUAGES.iter().find(|rules| rules.tag == primary)
}

/// Language-aware word-break oracle.
///
/// Constructed per publication from its language metadata; a tag
/// outside the registry disables rule-based breaks (explicit hyphens
/// and fallback enumeration still work).
#[derive(Default)]
pub struct Hyphenator {
    rules: Option<&'static LanguageRules>,
}

impl Hyphenator {
    /// A hyphenator with rule-based breaks disabled.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Build from a BCP-47 tag (primary subtag, case-insensitive).
    pub fn for_language(tag: &str) -> Self {
        Self {
            rules: rules_for_language(tag),
        }
    }

    /// Swap the active language.
    pub fn set_language(&mut self, tag: &str) {
        self.rules = rules_for_language(tag);
    }

    /// True when a registry language is active.
    pub fn has_language(&self) -> bool {
        self.rules.is_some()
    }

    /// All legal break offsets for `word`, ascending, deduplicated.
    ///
    /// Guarantees: `0 < offset < word.len()` and the code points on
    /// both sides of every break are alphabetic.
    pub fn break_offsets(&self, word: &str, allow_fallback: bool) -> Vec<BreakInfo> {
        if word.is_empty() {
            return Vec::new();
        }

        let cps: Vec<(usize, char)> = word.char_indices().collect();

        // Trim surrounding punctuation and footnote digits so quotes
        // and trailing references never count toward affix lengths.
        let mut start = 0usize;
        let mut end = cps.len();
        while start < end && !cps[start].1.is_alphabetic() {
            start += 1;
        }
        while end > start && !cps[end - 1].1.is_alphabetic() {
            end -= 1;
        }
        if end - start < 2 {
            return Vec::new();
        }
        let trimmed = &cps[start..end];

        let mut breaks = explicit_breaks(trimmed);

        if !breaks.is_empty() {
            // Words with explicit hyphens still get rule breaks inside
            // each segment, so a long trailing compound part can split
            // mid-segment when only the first part fits.
            if let Some(rules) = self.rules {
                let mut seg_start = 0usize;
                for i in 0..=trimmed.len() {
                    let at_end = i == trimmed.len();
                    if at_end || is_explicit_hyphen(trimmed[i].1) {
                        if i > seg_start {
                            for idx in rule_breaks(&trimmed[seg_start..i], rules) {
                                breaks.push(BreakInfo {
                                    byte_offset: trimmed[seg_start + idx].0,
                                    needs_hyphen: true,
                                });
                            }
                        }
                        seg_start = i + 1;
                    }
                }
            }
            finalize(word, &cps, breaks)
        } else {
            let mut indexes: Vec<usize> = match self.rules {
                Some(rules) => rule_breaks(trimmed, rules),
                None => Vec::new(),
            };

            if indexes.is_empty() && allow_fallback {
                let min_prefix = self.rules.map_or(DEFAULT_MIN_PREFIX, |r| r.min_prefix);
                let min_suffix = self.rules.map_or(DEFAULT_MIN_SUFFIX, |r| r.min_suffix);
                let len = trimmed.len();
                if len >= min_prefix + min_suffix {
                    for idx in min_prefix..=(len - min_suffix) {
                        if trimmed[idx - 1].1.is_alphabetic() && trimmed[idx].1.is_alphabetic() {
                            indexes.push(idx);
                        }
                    }
                }
            }

            let breaks = indexes
                .into_iter()
                .map(|idx| BreakInfo {
                    byte_offset: trimmed[idx].0,
                    needs_hyphen: true,
                })
                .collect();
            finalize(word, &cps, breaks)
        }
    }
}

fn is_explicit_hyphen(c: char) -> bool {
    c == '-' || c == SOFT_HYPHEN || c == '\u{2010}'
}

/// Breaks at hyphen markers positioned between alphabetic neighbors.
/// The offset points past the marker so rendering resumes after it.
fn explicit_breaks(trimmed: &[(usize, char)]) -> Vec<BreakInfo> {
    let mut breaks = Vec::new();
    for i in 1..trimmed.len().saturating_sub(1) {
        let c = trimmed[i].1;
        if is_explicit_hyphen(c)
            && trimmed[i - 1].1.is_alphabetic()
            && trimmed[i + 1].1.is_alphabetic()
        {
            breaks.push(BreakInfo {
                byte_offset: trimmed[i + 1].0,
                needs_hyphen: c == SOFT_HYPHEN,
            });
        }
    }
    breaks
}

/// Rule-based break indexes inside one alphabetic segment:
/// vowel/consonant transitions plus known suffix seams, constrained
/// by the language's affix minimums.
fn rule_breaks(segment: &[(usize, char)], rules: &LanguageRules) -> Vec<usize> {
    let len = segment.len();
    if len < rules.min_prefix + rules.min_suffix {
        return Vec::new();
    }
    let is_vowel = |c: char| {
        c.to_lowercase()
            .next()
            .is_some_and(|lower| rules.vowels.contains(lower))
    };

    let mut candidates = Vec::with_capacity(len / 2);
    for i in rules.min_prefix..=(len - rules.min_suffix) {
        let prev = segment[i - 1].1;
        let next = segment[i].1;
        if !prev.is_alphabetic() || !next.is_alphabetic() {
            continue;
        }
        if is_vowel(prev) != is_vowel(next) {
            candidates.push(i);
        }
    }

    let lower: String = segment.iter().flat_map(|(_, c)| c.to_lowercase()).collect();
    for suffix in rules.suffixes {
        if lower.ends_with(suffix) {
            let split = len.saturating_sub(suffix.chars().count());
            if split >= rules.min_prefix && len - split >= rules.min_suffix {
                candidates.push(split);
            }
        }
    }

    candidates.sort_unstable();
    candidates.dedup();
    candidates
}

/// Sort, deduplicate, and enforce the public invariants against the
/// original (untrimmed) word.
fn finalize(word: &str, cps: &[(usize, char)], mut breaks: Vec<BreakInfo>) -> Vec<BreakInfo> {
    breaks.sort_by_key(|b| b.byte_offset);
    breaks.dedup_by_key(|b| b.byte_offset);
    breaks.retain(|b| {
        if b.byte_offset == 0 || b.byte_offset >= word.len() {
            return false;
        }
        let Some(pos) = cps.iter().position(|(off, _)| *off == b.byte_offset) else {
            return false;
        };
        // The code point before the break may be a visible hyphen
        // marker (explicit breaks land after it); anything else must
        // be alphabetic on both sides.
        let prev = cps[pos - 1].1;
        (prev.is_alphabetic() || is_explicit_hyphen(prev)) && cps[pos].1.is_alphabetic()
    });
    breaks
}
