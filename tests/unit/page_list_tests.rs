use obsfs::fs::page_list::{ByteRange, PageList};

fn assert_intact(pages: &PageList) {
    pages
        .check_integrity()
        .expect("page list invariants must hold");
}

#[test]
fn new_list_is_single_clean_page() {
    let pages = PageList::new(100);
    assert_intact(&pages);
    assert_eq!(pages.size(), 100);
    assert!(pages.get_untreated().is_empty());
    assert_eq!(pages.get_unloaded(0, 100), vec![ByteRange::new(0, 100)]);
}

#[test]
fn empty_file_has_no_pages() {
    let pages = PageList::new(0);
    assert_intact(&pages);
    assert!(pages.get_untreated().is_empty());
    assert!(pages.get_last_update_untreated().is_none());
}

#[test]
fn mark_dirty_splits_and_reports_untreated() {
    let mut pages = PageList::new(100);
    pages.mark_dirty(10, 20);
    assert_intact(&pages);
    assert_eq!(pages.get_untreated(), vec![ByteRange::new(10, 20)]);

    pages.mark_dirty(50, 10);
    assert_intact(&pages);
    assert_eq!(
        pages.get_untreated(),
        vec![ByteRange::new(10, 20), ByteRange::new(50, 10)]
    );
}

#[test]
fn adjacent_dirty_ranges_coalesce() {
    let mut pages = PageList::new(100);
    pages.mark_dirty(0, 10);
    pages.mark_dirty(10, 10);
    assert_intact(&pages);
    assert_eq!(pages.get_untreated(), vec![ByteRange::new(0, 20)]);
}

#[test]
fn dirty_past_end_grows_file() {
    let mut pages = PageList::new(10);
    pages.mark_dirty(20, 5);
    assert_intact(&pages);
    assert_eq!(pages.size(), 25);
    assert_eq!(pages.get_untreated(), vec![ByteRange::new(20, 5)]);
    // The hole between old end and the write is neither loaded nor dirty.
    assert_eq!(pages.get_unloaded(0, 25), vec![ByteRange::new(0, 20)]);
}

#[test]
fn mark_uploaded_clears_modified() {
    let mut pages = PageList::new(40);
    pages.mark_dirty(0, 40);
    pages.mark_uploaded(0, 20);
    assert_intact(&pages);
    assert_eq!(pages.get_untreated(), vec![ByteRange::new(20, 20)]);

    pages.mark_uploaded(20, 20);
    assert!(pages.get_untreated().is_empty());
}

#[test]
fn redirty_after_upload_is_untreated_again() {
    let mut pages = PageList::new(30);
    pages.mark_dirty(0, 30);
    pages.mark_uploaded(0, 30);
    pages.mark_dirty(5, 3);
    assert_intact(&pages);
    assert_eq!(pages.get_untreated(), vec![ByteRange::new(5, 3)]);
}

#[test]
fn last_update_untreated_tracks_newest_run() {
    let mut pages = PageList::new(100);
    pages.mark_dirty(0, 10);
    pages.mark_dirty(50, 10);
    assert_eq!(
        pages.get_last_update_untreated(),
        Some(ByteRange::new(50, 10))
    );

    // Touching the first run again makes it the most recent one.
    pages.mark_dirty(5, 2);
    assert_eq!(
        pages.get_last_update_untreated(),
        Some(ByteRange::new(0, 10))
    );
}

#[test]
fn appending_writes_extend_the_last_run() {
    let mut pages = PageList::new(0);
    pages.mark_dirty(0, 10);
    pages.mark_dirty(10, 10);
    pages.mark_dirty(20, 5);
    assert_eq!(
        pages.get_last_update_untreated(),
        Some(ByteRange::new(0, 25))
    );
}

#[test]
fn replace_last_update_untreated_keeps_fragments() {
    let mut pages = PageList::new(0);
    // Streamed write of 25 bytes; the flush extracts the aligned [0, 20)
    // slab and returns the 5-byte tail to untreated state.
    pages.mark_dirty(0, 25);
    pages
        .replace_last_update_untreated(0, 0, 20, 5)
        .expect("replacement ranges are ordered");
    assert_intact(&pages);
    assert_eq!(pages.get_untreated(), vec![ByteRange::new(20, 5)]);
    assert_eq!(
        pages.get_last_update_untreated(),
        Some(ByteRange::new(20, 5))
    );
}

#[test]
fn replace_with_leading_fragment() {
    let mut pages = PageList::new(0);
    // Run starts unaligned at 5; slab [10, 20) extracted, fragments (5,5)
    // and (20,3) stay untreated with the trailing one most recent.
    pages.mark_dirty(5, 18);
    pages
        .replace_last_update_untreated(5, 5, 20, 3)
        .expect("replacement ranges are ordered");
    assert_intact(&pages);
    assert_eq!(
        pages.get_untreated(),
        vec![ByteRange::new(5, 5), ByteRange::new(20, 3)]
    );
    assert_eq!(
        pages.get_last_update_untreated(),
        Some(ByteRange::new(20, 3))
    );
}

#[test]
fn replace_rejects_reversed_ranges() {
    let mut pages = PageList::new(0);
    pages.mark_dirty(0, 30);
    assert!(pages.replace_last_update_untreated(10, 10, 5, 5).is_err());
}

#[test]
fn shrink_drops_tail_pages() {
    let mut pages = PageList::new(100);
    pages.mark_dirty(80, 20);
    pages.set_size(50);
    assert_intact(&pages);
    assert_eq!(pages.size(), 50);
    assert!(pages.get_untreated().is_empty());
}

#[test]
fn mark_loaded_reduces_unloaded_ranges() {
    let mut pages = PageList::new(100);
    pages.mark_loaded(0, 30);
    pages.mark_loaded(60, 40);
    assert_intact(&pages);
    assert_eq!(pages.get_unloaded(0, 100), vec![ByteRange::new(30, 30)]);
    assert_eq!(pages.get_unloaded(0, 20), Vec::<ByteRange>::new());
    assert_eq!(pages.get_unloaded(25, 10), vec![ByteRange::new(30, 5)]);
}

// Deterministic pseudo-random op soup; the invariants must survive any
// interleaving of the three mark operations.
#[test]
fn random_operations_preserve_invariants() {
    let mut pages = PageList::new(1000);
    let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
    let mut next = || {
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        seed
    };

    for _ in 0..500 {
        let start = next() % 1000;
        let size = next() % 200 + 1;
        match next() % 3 {
            0 => pages.mark_dirty(start, size),
            1 => pages.mark_loaded(start, size),
            _ => pages.mark_uploaded(start, size),
        }
        assert_intact(&pages);
    }

    // Untreated ranges never overlap and are strictly ordered.
    let untreated = pages.get_untreated();
    for pair in untreated.windows(2) {
        assert!(pair[0].end() < pair[1].start);
    }
}
