//! Insert and range-query behavior over an in-memory index (spec §8 L1,
//! scenarios S1-S3).

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
    p.set_mode(Mode::InMemory).set_fanout(8).set_shortlist(8);
    p
}

fn collect(index: &Index, query: Mbr, mode: QueryMode) -> Vec<Vec<u8>> {
    let mut it = index.iterate(query, mode);
    let mut rows = Vec::new();
    while it.has_next() {
        for r in it.next_page().unwrap() {
            rows.push(r.row_id);
        }
    }
    rows
}

#[test]
fn insert_then_intersecting_query_finds_the_point() {
    let index = Index::create(params(), None).unwrap();
    index.insert(record("a", 3.0, 4.0)).unwrap();

    let rows = collect(&index, Mbr::from_point(&[3.0, 4.0]).unwrap(), QueryMode::Intersects);
    assert_eq!(rows, vec![b"a".to_vec()]);
}

#[test]
fn query_outside_every_record_returns_nothing() {
    let index = Index::create(params(), None).unwrap();
    for i in 0..20 {
        index.insert(record(&format!("r{}", i), i as f64, i as f64)).unwrap();
    }
    let mut far = Mbr::from_point(&[1000.0, 1000.0]).unwrap();
    far.expand_point(&[1001.0, 1001.0]).unwrap();
    let rows = collect(&index, far, QueryMode::Intersects);
    assert!(rows.is_empty());
}

#[test]
fn many_inserts_force_splits_and_every_record_stays_queryable() {
    let index = Index::create(params(), None).unwrap();
    let n = 200;
    for i in 0..n {
        index.insert(record(&format!("r{}", i), i as f64, (n - i) as f64)).unwrap();
    }

    let mut whole = Mbr::from_point(&[0.0, 0.0]).unwrap();
    whole.expand_point(&[n as f64, n as f64]).unwrap();
    let rows = collect(&index, whole, QueryMode::Intersects);
    assert_eq!(rows.len(), n as usize);
}

#[test]
fn contains_mode_excludes_partially_overlapping_records() {
    let index = Index::create(params(), None).unwrap();
    index.insert(record("inside", 1.0, 1.0)).unwrap();
    index.insert(record("outside", 50.0, 50.0)).unwrap();

    let mut window = Mbr::from_point(&[0.0, 0.0]).unwrap();
    window.expand_point(&[10.0, 10.0]).unwrap();
    let rows = collect(&index, window, QueryMode::Contains);
    assert_eq!(rows, vec![b"inside".to_vec()]);
}

#[test]
fn rejects_a_record_with_the_wrong_dimension() {
    let index = Index::create(params(), None).unwrap();
    let bad = DataRecord {
        row_id: b"bad".to_vec(),
        points: vec![vec![1.0, 2.0, 3.0]],
        key: Mbr::from_point(&[1.0, 2.0, 3.0]).unwrap(),
    };
    assert!(index.insert(bad).is_err());
}
