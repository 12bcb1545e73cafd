//! End-to-end publication indexing over real (in-memory) archives.

mod common;

use common::fixtures::{nav_epub, open_archive, trivial_epub, two_chapter_epub, ZipBuilder};
use folio::{FolioError, Publication};

#[test]
fn trivial_open_indexes_metadata_and_spine() {
    let cache_root = tempfile::tempdir().unwrap();
    let publication = Publication::open(
        open_archive(trivial_epub()),
        "/books/trivial.epub",
        cache_root.path(),
    )
    .unwrap();

    assert_eq!(publication.index.spine_count(), 1);
    assert_eq!(publication.index.spine[0].cumulative_size, 1000);
    assert_eq!(publication.index.toc_count(), 0);
    assert_eq!(publication.title(), "A");
    assert_eq!(publication.author(), "B");
    assert_eq!(publication.language(), "en");
    assert_eq!(publication.index.book_size_bytes(), 1000);
}

#[test]
fn two_item_ncx_toc_cross_links_with_spine() {
    let cache_root = tempfile::tempdir().unwrap();
    let publication = Publication::open(
        open_archive(two_chapter_epub()),
        "/books/two.epub",
        cache_root.path(),
    )
    .unwrap();

    let index = &publication.index;
    assert_eq!(index.toc_count(), 2);
    let toc = publication.toc().unwrap();
    assert_eq!(toc[0].title, "Intro");
    assert_eq!(toc[1].title, "End");
    assert_eq!(index.spine_index_for_toc(0), Some(0));
    assert_eq!(index.spine_index_for_toc(1), Some(1));
    assert_eq!(index.toc_index_for_spine(1), Some(1));

    // Cumulative sizes are non-decreasing and end at the book size.
    let mut prev = 0u32;
    for entry in &index.spine {
        assert!(entry.cumulative_size >= prev);
        prev = entry.cumulative_size;
    }
    assert_eq!(u64::from(prev), index.book_size_bytes());
}

#[test]
fn guide_text_reference_resolves() {
    let cache_root = tempfile::tempdir().unwrap();
    let publication = Publication::open(
        open_archive(two_chapter_epub()),
        "/books/two.epub",
        cache_root.path(),
    )
    .unwrap();
    assert_eq!(
        publication.index.metadata.text_reference_href,
        "text/ch1.xhtml"
    );
    assert_eq!(publication.index.spine_index_for_text_reference(), 0);
}

#[test]
fn cover_by_id_and_jpeg_extension_is_accepted() {
    let cache_root = tempfile::tempdir().unwrap();
    let publication = Publication::open(
        open_archive(two_chapter_epub()),
        "/books/two.epub",
        cache_root.path(),
    )
    .unwrap();
    assert_eq!(publication.cover_href().unwrap(), "images/cover.jpg");
}

#[test]
fn nav_document_is_preferred_and_flattened() {
    let cache_root = tempfile::tempdir().unwrap();
    let publication = Publication::open(
        open_archive(nav_epub()),
        "/books/nav.epub",
        cache_root.path(),
    )
    .unwrap();

    let index = &publication.index;
    assert_eq!(index.toc_count(), 3);
    assert_eq!(index.toc[0].title, "Erstes Kapitel");
    assert_eq!(index.toc[0].level, 1);
    assert_eq!(index.toc[0].spine_index, 0);
    assert_eq!(index.toc[1].title, "Abschnitt");
    assert_eq!(index.toc[1].level, 2);
    assert_eq!(index.toc[1].spine_index, 0); // fragment discarded
    assert_eq!(index.toc[2].spine_index, 1);

    // Smallest TOC index wins the spine back-link.
    assert_eq!(index.toc_index_for_spine(0), Some(0));
    assert_eq!(index.toc_index_for_spine(1), Some(2));

    // cover-image property beats everything else.
    assert_eq!(publication.cover_href().unwrap(), "images/cover.jpg");
}

#[test]
fn second_open_uses_book_binary() {
    let cache_root = tempfile::tempdir().unwrap();
    let first = Publication::open(
        open_archive(two_chapter_epub()),
        "/books/two.epub",
        cache_root.path(),
    )
    .unwrap();
    let book_bin = first.cache().book_bin();
    assert!(book_bin.exists());
    let written = std::fs::read(&book_bin).unwrap();
    drop(first);

    let second = Publication::open(
        open_archive(two_chapter_epub()),
        "/books/two.epub",
        cache_root.path(),
    )
    .unwrap();
    assert_eq!(std::fs::read(&book_bin).unwrap(), written);
    assert_eq!(second.index.toc_count(), 2);
    assert_eq!(second.index.spine_count(), 2);
}

#[test]
fn css_pass_writes_rules_cache() {
    let cache_root = tempfile::tempdir().unwrap();
    let publication = Publication::open(
        open_archive(two_chapter_epub()),
        "/books/two.epub",
        cache_root.path(),
    )
    .unwrap();

    assert!(publication.cache().css_cache().exists());
    let rules = publication.css_rules().unwrap();
    assert!(rules.rule_count() >= 2);
    let style = rules.resolve("p", "");
    assert!(style.has_text_align());

    // Deleting the cache file recovers via a fresh stylesheet pass.
    std::fs::remove_file(publication.cache().css_cache()).unwrap();
    let rules = publication.css_rules().unwrap();
    assert!(rules.resolve("p", "").has_text_align());
    assert!(publication.cache().css_cache().exists());
}

#[test]
fn missing_container_is_not_an_epub() {
    let cache_root = tempfile::tempdir().unwrap();
    let mut builder = ZipBuilder::new();
    builder.add_stored("mimetype", b"application/epub+zip");
    builder.add_stored("OEBPS/content.opf", b"<package/>");
    let err = Publication::open(
        open_archive(builder.finish()),
        "/books/broken.epub",
        cache_root.path(),
    )
    .unwrap_err();
    assert!(matches!(err, FolioError::NotAnEpub));
}

#[test]
fn toc_less_book_still_opens() {
    let cache_root = tempfile::tempdir().unwrap();
    let publication = Publication::open(
        open_archive(trivial_epub()),
        "/books/trivial.epub",
        cache_root.path(),
    )
    .unwrap();
    assert_eq!(publication.index.toc_count(), 0);
    assert!(matches!(publication.toc(), Err(FolioError::TocMissing)));
    assert!(matches!(
        publication.cover_href(),
        Err(FolioError::CoverMissing)
    ));
}

#[test]
fn clear_cache_removes_book_directory() {
    let cache_root = tempfile::tempdir().unwrap();
    let publication = Publication::open(
        open_archive(trivial_epub()),
        "/books/trivial.epub",
        cache_root.path(),
    )
    .unwrap();
    assert!(publication.cache().dir().exists());
    publication.clear_cache().unwrap();
    assert!(!publication.cache().dir().exists());
}

#[test]
fn item_reads_resolve_against_content_base() {
    let cache_root = tempfile::tempdir().unwrap();
    let publication = Publication::open(
        open_archive(two_chapter_epub()),
        "/books/two.epub",
        cache_root.path(),
    )
    .unwrap();

    let size = publication.item_size("text/ch1.xhtml").unwrap();
    let body = publication.read_item("text/ch1.xhtml").unwrap();
    assert_eq!(body.len() as u64, size);
    assert!(String::from_utf8_lossy(&body).contains("first chapter"));

    let mut sink = Vec::new();
    publication
        .stream_item("text/ch1.xhtml", &mut sink, 256)
        .unwrap();
    assert_eq!(sink, body);
}
