//! Reader runtime flows: page turns across section boundaries,
//! progress persistence, and positional jumps.

mod common;

use common::{book_with_chapters, open_publication, small_viewport_settings, FixedMetrics};
use folio::metrics::RefreshMode;
use folio_reader::BookReader;

fn open_reader(cache_root: &std::path::Path) -> BookReader {
    let publication = open_publication(
        book_with_chapters(3, 40),
        "/books/paged.epub",
        cache_root,
    );
    BookReader::open(
        publication,
        small_viewport_settings(),
        Box::new(FixedMetrics { char_px: 10 }),
    )
    .unwrap()
}

#[test]
fn pages_turn_forward_across_sections_to_the_end() {
    let cache_root = tempfile::tempdir().unwrap();
    let mut reader = open_reader(cache_root.path());

    let first = reader.page().unwrap();
    assert_eq!(first.spine_index, 0);
    assert_eq!(first.page_index, 0);
    assert!(first.page_count > 1);
    assert!(!first.page.is_empty());

    let mut turns = 0usize;
    let mut last_spine = 0usize;
    while reader.next_page().unwrap() {
        let page = reader.page().unwrap();
        assert!(page.spine_index >= last_spine);
        last_spine = page.spine_index;
        turns += 1;
        assert!(turns < 500, "page turning must terminate");
    }
    assert_eq!(last_spine, 2, "reader must reach the final section");

    // At the very end, next_page reports no movement.
    assert!(!reader.next_page().unwrap());
}

#[test]
fn progress_fraction_strictly_increases_across_next_page() {
    let cache_root = tempfile::tempdir().unwrap();
    let mut reader = open_reader(cache_root.path());
    let _ = reader.page().unwrap();

    let mut last = reader.progress();
    assert!(last > 0.0);
    while reader.next_page().unwrap() {
        let _ = reader.page().unwrap();
        let progress = reader.progress();
        assert!(
            progress > last,
            "progress must strictly increase ({} -> {})",
            last,
            progress
        );
        assert!((0.0..=1.0).contains(&progress));
        last = progress;
    }
}

#[test]
fn prev_page_crosses_back_to_previous_section_last_page() {
    let cache_root = tempfile::tempdir().unwrap();
    let mut reader = open_reader(cache_root.path());

    let first = reader.page().unwrap();
    let first_count = first.page_count;

    // Walk to the start of section 1.
    while reader.current_spine() == 0 {
        assert!(reader.next_page().unwrap());
        let _ = reader.page().unwrap();
    }
    assert_eq!(reader.current_page(), 0);

    // One step back lands on the last page of section 0.
    assert!(reader.prev_page().unwrap());
    let back = reader.page().unwrap();
    assert_eq!(back.spine_index, 0);
    assert_eq!(back.page_index, first_count - 1);
}

#[test]
fn progress_round_trips_through_disk() {
    let cache_root = tempfile::tempdir().unwrap();
    let saved_position = {
        let mut reader = open_reader(cache_root.path());
        let _ = reader.page().unwrap();
        for _ in 0..3 {
            assert!(reader.next_page().unwrap());
        }
        let page = reader.page().unwrap(); // persists (spine, page)
        (page.spine_index, page.page_index)
    };

    let mut reader = open_reader(cache_root.path());
    let resumed = reader.page().unwrap();
    assert_eq!((resumed.spine_index, resumed.page_index), saved_position);
}

#[test]
fn go_to_spine_resets_to_first_page() {
    let cache_root = tempfile::tempdir().unwrap();
    let mut reader = open_reader(cache_root.path());
    let _ = reader.page().unwrap();

    reader.go_to_spine(2);
    let page = reader.page().unwrap();
    assert_eq!(page.spine_index, 2);
    assert_eq!(page.page_index, 0);

    // Out-of-range jumps clamp to the last section.
    reader.go_to_spine(99);
    let page = reader.page().unwrap();
    assert_eq!(page.spine_index, 2);
}

#[test]
fn go_to_percent_lands_in_covering_section() {
    let cache_root = tempfile::tempdir().unwrap();
    let mut reader = open_reader(cache_root.path());
    let _ = reader.page().unwrap();

    reader.go_to_percent(0.0);
    let page = reader.page().unwrap();
    assert_eq!(page.spine_index, 0);
    assert_eq!(page.page_index, 0);

    reader.go_to_percent(100.0);
    let page = reader.page().unwrap();
    assert_eq!(page.spine_index, 2);
    assert_eq!(page.page_index, page.page_count - 1);

    // Mid-book lands in the middle chapter of three equal chapters.
    reader.go_to_percent(50.0);
    let page = reader.page().unwrap();
    assert_eq!(page.spine_index, 1);
}

#[test]
fn refresh_hint_counts_down_to_full() {
    let cache_root = tempfile::tempdir().unwrap();
    let publication = open_publication(
        book_with_chapters(1, 200),
        "/books/refresh.epub",
        cache_root.path(),
    );
    let mut settings = small_viewport_settings();
    settings.refresh_frequency = 3;
    let mut reader = BookReader::open(
        publication,
        settings,
        Box::new(FixedMetrics { char_px: 10 }),
    )
    .unwrap();

    // Countdown starts at 3: two partials, then a full, repeating.
    let mut modes = Vec::new();
    for _ in 0..6 {
        modes.push(reader.page().unwrap().refresh);
        if !reader.next_page().unwrap() {
            break;
        }
    }
    assert_eq!(modes[0], RefreshMode::Partial);
    assert_eq!(modes[1], RefreshMode::Partial);
    assert_eq!(modes[2], RefreshMode::Full);
    assert_eq!(modes[3], RefreshMode::Partial);
}

#[test]
fn text_start_reference_skips_front_matter_on_first_open() {
    let cache_root = tempfile::tempdir().unwrap();

    // Build a book whose guide points at the second chapter.
    let mut manifest = String::new();
    let mut spine = String::new();
    for i in 0..2 {
        manifest.push_str(&format!(
            r#"<item id="ch{i}" href="text/ch{i}.xhtml" media-type="application/xhtml+xml"/>"#
        ));
        spine.push_str(&format!(r#"<itemref idref="ch{i}"/>"#));
    }
    let opf = format!(
        r#"<package xmlns="http://www.idpf.org/2007/opf" version="2.0">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/">
    <dc:title>Guided</dc:title><dc:creator>F</dc:creator><dc:language>en</dc:language>
  </metadata>
  <manifest>{manifest}</manifest>
  <spine>{spine}</spine>
  <guide><reference type="text" href="text/ch1.xhtml"/></guide>
</package>"#
    );

    let mut builder = common::ZipBuilder::new();
    builder.add_stored("mimetype", b"application/epub+zip");
    builder.add_stored(
        "META-INF/container.xml",
        br#"<container><rootfiles><rootfile full-path="OEBPS/content.opf"/></rootfiles></container>"#,
    );
    builder.add_stored("OEBPS/content.opf", opf.as_bytes());
    for i in 0..2 {
        builder.add_deflated(
            &format!("OEBPS/text/ch{}.xhtml", i),
            b"<html><body><p>words here</p></body></html>",
        );
    }

    let publication =
        common::open_publication(builder.finish(), "/books/guided.epub", cache_root.path());
    let mut reader = BookReader::open(
        publication,
        small_viewport_settings(),
        Box::new(FixedMetrics { char_px: 10 }),
    )
    .unwrap();

    let page = reader.page().unwrap();
    assert_eq!(page.spine_index, 1, "first open starts at the text reference");
}
