//! Iterator pinning contract (spec §8 scenario S6): every node on the
//! iterator's work list stays pinned until visited, and dropping or
//! invalidating the iterator releases everything outstanding.

use xtreedb::{DataRecord, Index, Mbr, Mode, Params, QueryMode};

fn record(row: &str, x: f64, y: f64) -> DataRecord {
    DataRecord {
        row_id: row.as_bytes().to_vec(),
        points: vec![vec![x, y]],
        key: Mbr::from_point(&[x, y]).unwrap(),
    }
}

fn params() -> Params {
    let mut p = Params::new(2);
    p.set_mode(Mode::InMemory).set_fanout(4).set_shortlist(4);
    p
}

fn whole_plane() -> Mbr {
    let mut m = Mbr::from_point(&[0.0, 0.0]).unwrap();
    m.expand_point(&[1000.0, 1000.0]).unwrap();
    m
}

#[test]
fn a_fresh_iterator_has_the_root_pinned() {
    let index = Index::create(params(), None).unwrap();
    for i in 0..30 {
        index.insert(record(&format!("r{}", i), i as f64, i as f64)).unwrap();
    }
    let it = index.iterate(whole_plane(), QueryMode::Intersects);
    assert_eq!(it.pinned_nodes().len(), 1);
}

#[test]
fn exhausting_the_iterator_unpins_everything() {
    let index = Index::create(params(), None).unwrap();
    for i in 0..30 {
        index.insert(record(&format!("r{}", i), i as f64, i as f64)).unwrap();
    }
    let mut it = index.iterate(whole_plane(), QueryMode::Intersects);
    while it.has_next() {
        it.next_page().unwrap();
    }
    assert!(it.pinned_nodes().is_empty());
}

#[test]
fn invalidating_mid_iteration_releases_pinned_nodes() {
    let index = Index::create(params(), None).unwrap();
    for i in 0..30 {
        index.insert(record(&format!("r{}", i), i as f64, i as f64)).unwrap();
    }
    let mut it = index.iterate(whole_plane(), QueryMode::Intersects);
    assert!(it.has_next());
    it.invalidate();
    assert!(!it.has_next());
    assert!(it.next_page().unwrap().is_empty());
}

#[test]
fn a_read_iterator_does_not_block_further_reads() {
    let index = Index::create(params(), None).unwrap();
    index.insert(record("a", 1.0, 1.0)).unwrap();
    let it1 = index.iterate(whole_plane(), QueryMode::Intersects);
    let it2 = index.iterate(whole_plane(), QueryMode::Intersects);
    assert!(it1.has_next());
    assert!(it2.has_next());
}
