//! Mmap-mode snapshot save/load round trip (spec §8 L2, scenarios S4-S5).

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
    p.set_mode(Mode::Mmap).set_fanout(8).set_shortlist(8);
    p
}

#[test]
fn records_survive_a_close_and_recover_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("snapshot.xtr");

    {
        let index = Index::create(params(), Some(&path)).unwrap();
        for i in 0..30 {
            index.insert(record(&format!("r{}", i), i as f64, i as f64)).unwrap();
        }
        index.close().unwrap();
    }

    let recovered = Index::recover(params(), &path).unwrap();
    let mut whole = Mbr::from_point(&[0.0, 0.0]).unwrap();
    whole.expand_point(&[30.0, 30.0]).unwrap();
    let mut it = recovered.iterate(whole, QueryMode::Intersects);
    let mut rows = Vec::new();
    while it.has_next() {
        for r in it.next_page().unwrap() {
            rows.push(r.row_id);
        }
    }
    assert_eq!(rows.len(), 30);
}

#[test]
fn recovering_with_mismatched_dimensions_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("snapshot.xtr");
    {
        let index = Index::create(params(), Some(&path)).unwrap();
        index.insert(record("a", 1.0, 1.0)).unwrap();
        index.close().unwrap();
    }

    let mut mismatched = Params::new(3);
    mismatched.set_mode(Mode::Mmap);
    assert!(Index::recover(mismatched, &path).is_err());
}

#[test]
fn further_inserts_after_recovery_keep_working() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("snapshot.xtr");
    {
        let index = Index::create(params(), Some(&path)).unwrap();
        index.insert(record("a", 1.0, 1.0)).unwrap();
        index.close().unwrap();
    }

    let recovered = Index::recover(params(), &path).unwrap();
    recovered.insert(record("b", 2.0, 2.0)).unwrap();

    let mut whole = Mbr::from_point(&[0.0, 0.0]).unwrap();
    whole.expand_point(&[5.0, 5.0]).unwrap();
    let mut it = recovered.iterate(whole, QueryMode::Intersects);
    let mut rows = Vec::new();
    while it.has_next() {
        for r in it.next_page().unwrap() {
            rows.push(r.row_id);
        }
    }
    rows.sort();
    assert_eq!(rows, vec![b"a".to_vec(), b"b".to_vec()]);
}
