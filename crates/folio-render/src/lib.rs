//! Chapter pagination for the folio reading core: styled words and
//! paragraph layout, the page IR with its binary serialization, the
//! streaming chapter parser, and the parameter-keyed section cache.

#![cfg_attr(
    not(test),
    deny(
        clippy::expect_used,
        clippy::unwrap_used,
        clippy::panic,
        clippy::todo,
        clippy::unimplemented
    )
)]

mod chapter;
mod page;
mod paragraph;
mod section;
mod style;

pub use chapter::{parse_chapter, ChapterContext};
pub use page::{Page, PageElement, PageImage, PageLine, TAG_PAGE_IMAGE, TAG_PAGE_LINE};
pub use paragraph::{LineWord, ParsedParagraph, StyledWord, TextLine, PARAGRAPH_FLUSH_WORDS};
pub use section::{SectionFile, SectionParams, SectionWriter, SECTION_FILE_VERSION};
pub use style::BlockStyle;
