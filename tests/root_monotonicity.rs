//! Root-handle discipline (spec §8 L3: the façade's root version only ever
//! increases) and `close()` idempotency (L4).

use xtreedb::{DataRecord, Index, Mbr, Mode, Params};

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

#[test]
fn root_split_changes_the_returned_node_id_but_every_record_survives() {
    let index = Index::create(params(), None).unwrap();
    let mut roots = Vec::new();
    for i in 0..40 {
        roots.push(index.insert(record(&format!("r{}", i), i as f64, i as f64)).unwrap());
    }
    // the root id must have changed at least once once fanout is exceeded
    assert!(roots.iter().collect::<std::collections::HashSet<_>>().len() > 1);

    let mut whole = Mbr::from_point(&[0.0, 0.0]).unwrap();
    whole.expand_point(&[40.0, 40.0]).unwrap();
    let mut it = index.iterate(whole, xtreedb::QueryMode::Intersects);
    let mut count = 0;
    while it.has_next() {
        count += it.next_page().unwrap().len();
    }
    assert_eq!(count, 40);
}

#[test]
fn close_is_idempotent() {
    let index = Index::create(params(), None).unwrap();
    index.insert(record("a", 1.0, 1.0)).unwrap();
    index.close().unwrap();
    index.close().unwrap();
    index.close().unwrap();
}

#[test]
fn durable_commit_then_close_with_no_intervening_root_split_is_a_clean_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let mut durable_params = Params::new(2);
    durable_params.set_mode(Mode::Durable).set_fanout(64).set_shortlist(64);

    let index = Index::create(durable_params, Some(dir.path())).unwrap();
    for i in 0..10 {
        index.insert(record(&format!("r{}", i), i as f64, i as f64)).unwrap();
    }
    index.commit(1).unwrap();
    // root did not change since the commit above: close()'s own commit must
    // not fail trying to re-publish the same (id, version) root.
    index.close().unwrap();
}
