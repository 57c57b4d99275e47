//! On-disk encoding for nodes and data records (spec §4.4). Little-endian,
//! naturally-aligned-enough for a straightforward `mmap` read; every
//! multi-byte field is fixed width so decoding never needs a length table
//! beyond the explicit counts the format carries.

use std::convert::TryInto;

use crate::mbr::Mbr;
use crate::types::NodeId;
use crate::{err_at, Error, Result};

/// Pre-defined size classes a node or record's encoded size is rounded up
/// into (spec §4.4). A node whose encoded size outgrows its current class
/// triggers `reallocate`.
pub const SIZE_CLASSES: &[usize] = &[
    64, 128, 256, 512, 1024, 2048, 4096, 8192, 16384, 32768, 65536, 131_072, 262_144, 524_288,
    1_048_576, 2_097_152, 4_194_304, 8_388_608, 16_777_216,
];

/// Smallest size class able to hold `n` bytes.
pub fn size_class_for(n: usize) -> Result<usize> {
    SIZE_CLASSES
        .iter()
        .copied()
        .find(|&c| c >= n)
        .ok_or(())
        .or_else(|_| err_at!(Fatal, msg: "encoded size {} exceeds largest size class", n))
}

fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn get_u64(b: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(b[off..off + 8].try_into().unwrap())
}

/// One interior/leaf child reference as stored in a node's wire encoding:
/// the referenced child's stable identity, its MBR, and whether it is
/// itself a leaf-held data record.
pub struct WireChild {
    pub id: NodeId,
    pub mbr: Mbr,
    pub is_leaf_child: bool,
}

/// Encode a node: header (n_children, is_leaf, is_supernode, padding) + the
/// node's own MBR (2*dim ordered-float words) + per-child entries.
pub fn encode_node(dim: usize, mbr: &Mbr, is_leaf: bool, is_supernode: bool, children: &[WireChild]) -> Vec<u8> {
    let mut buf = Vec::new();
    put_u64(&mut buf, children.len() as u64);
    buf.push(is_leaf as u8);
    buf.push(is_supernode as u8);
    buf.extend_from_slice(&[0u8; 6]); // padding to 16-byte header
    for i in 0..dim {
        put_u64(&mut buf, mbr.min_bound(i));
        put_u64(&mut buf, mbr.max_bound(i));
    }
    for child in children {
        put_u64(&mut buf, child.id.0);
        for i in 0..dim {
            put_u64(&mut buf, child.mbr.min_bound(i));
            put_u64(&mut buf, child.mbr.max_bound(i));
        }
        buf.push(child.is_leaf_child as u8);
        buf.extend_from_slice(&[0u8; 7]);
    }
    buf
}

pub struct DecodedNode {
    pub mbr: Mbr,
    pub is_leaf: bool,
    pub is_supernode: bool,
    pub children: Vec<WireChild>,
}

pub fn decode_node(dim: usize, bytes: &[u8]) -> Result<DecodedNode> {
    if bytes.len() < 16 {
        return err_at!(SnapshotCorrupt, msg: "node header truncated");
    }
    let n_children = get_u64(bytes, 0) as usize;
    let is_leaf = bytes[8] != 0;
    let is_supernode = bytes[9] != 0;
    let mbr_bytes = 16 * dim;
    let mbr_start = 16;
    if bytes.len() < mbr_start + mbr_bytes {
        return err_at!(SnapshotCorrupt, msg: "node mbr truncated");
    }
    let mut min = Vec::with_capacity(dim);
    let mut max = Vec::with_capacity(dim);
    for i in 0..dim {
        min.push(get_u64(bytes, mbr_start + i * 16));
        max.push(get_u64(bytes, mbr_start + i * 16 + 8));
    }
    let mbr = Mbr::from_bounds(min, max)?;

    let child_entry_len = 8 + 16 * dim + 8;
    let children_start = mbr_start + mbr_bytes;
    if bytes.len() < children_start + n_children * child_entry_len {
        return err_at!(SnapshotCorrupt, msg: "node children truncated");
    }
    let mut children = Vec::with_capacity(n_children);
    for i in 0..n_children {
        let base = children_start + i * child_entry_len;
        let id = NodeId(get_u64(bytes, base));
        let mut cmin = Vec::with_capacity(dim);
        let mut cmax = Vec::with_capacity(dim);
        for d in 0..dim {
            cmin.push(get_u64(bytes, base + 8 + d * 16));
            cmax.push(get_u64(bytes, base + 8 + d * 16 + 8));
        }
        let cmbr = Mbr::from_bounds(cmin, cmax)?;
        let is_leaf_child = bytes[base + 8 + 16 * dim] != 0;
        children.push(WireChild {
            id,
            mbr: cmbr,
            is_leaf_child,
        });
    }

    Ok(DecodedNode {
        mbr,
        is_leaf,
        is_supernode,
        children,
    })
}

/// Encode a data record: MBR + length-prefixed row id + point count + raw
/// doubles.
pub fn encode_record(dim: usize, row_id: &[u8], points: &[Vec<f64>], mbr: &Mbr) -> Vec<u8> {
    let mut buf = Vec::new();
    for i in 0..dim {
        put_u64(&mut buf, mbr.min_bound(i));
        put_u64(&mut buf, mbr.max_bound(i));
    }
    put_u64(&mut buf, row_id.len() as u64);
    buf.extend_from_slice(row_id);
    put_u64(&mut buf, points.len() as u64);
    for p in points {
        for v in p {
            buf.extend_from_slice(&v.to_le_bytes());
        }
    }
    buf
}

pub fn decode_record(dim: usize, bytes: &[u8]) -> Result<(Mbr, Vec<u8>, Vec<Vec<f64>>)> {
    let mbr_bytes = 16 * dim;
    if bytes.len() < mbr_bytes + 8 {
        return err_at!(SnapshotCorrupt, msg: "record header truncated");
    }
    let mut min = Vec::with_capacity(dim);
    let mut max = Vec::with_capacity(dim);
    for i in 0..dim {
        min.push(get_u64(bytes, i * 16));
        max.push(get_u64(bytes, i * 16 + 8));
    }
    let mbr = Mbr::from_bounds(min, max)?;

    let mut off = mbr_bytes;
    let row_len = get_u64(bytes, off) as usize;
    off += 8;
    if bytes.len() < off + row_len + 8 {
        return err_at!(SnapshotCorrupt, msg: "record row-id truncated");
    }
    let row_id = bytes[off..off + row_len].to_vec();
    off += row_len;

    let n_points = get_u64(bytes, off) as usize;
    off += 8;
    let point_bytes = n_points * dim * 8;
    if bytes.len() < off + point_bytes {
        return err_at!(SnapshotCorrupt, msg: "record points truncated");
    }
    let mut points = Vec::with_capacity(n_points);
    for _ in 0..n_points {
        let mut p = Vec::with_capacity(dim);
        for d in 0..dim {
            let v = f64::from_le_bytes(bytes[off + d * 8..off + d * 8 + 8].try_into().unwrap());
            p.push(v);
        }
        off += dim * 8;
        points.push(p);
    }

    Ok((mbr, row_id, points))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mbr(dim: usize, lo: f64, hi: f64) -> Mbr {
        let mut m = Mbr::from_point(&vec![lo; dim]).unwrap();
        m.expand_point(&vec![hi; dim]).unwrap();
        m
    }

    #[test]
    fn node_round_trips() {
        let dim = 2;
        let m = mbr(dim, 0.0, 10.0);
        let children = vec![
            WireChild {
                id: NodeId(1),
                mbr: mbr(dim, 0.0, 5.0),
                is_leaf_child: true,
            },
            WireChild {
                id: NodeId(2),
                mbr: mbr(dim, 5.0, 10.0),
                is_leaf_child: false,
            },
        ];
        let bytes = encode_node(dim, &m, true, false, &children);
        let decoded = decode_node(dim, &bytes).unwrap();
        assert!(decoded.is_leaf);
        assert!(!decoded.is_supernode);
        assert_eq!(decoded.children.len(), 2);
        assert_eq!(decoded.children[0].id, NodeId(1));
        assert!(decoded.children[0].is_leaf_child);
        assert!(!decoded.children[1].is_leaf_child);
        assert_eq!(decoded.mbr, m);
    }

    #[test]
    fn record_round_trips() {
        let dim = 2;
        let m = mbr(dim, 1.0, 2.0);
        let points = vec![vec![1.0, 1.0], vec![2.0, 2.0]];
        let bytes = encode_record(dim, b"row-42", &points, &m);
        let (dmbr, row_id, dpoints) = decode_record(dim, &bytes).unwrap();
        assert_eq!(dmbr, m);
        assert_eq!(row_id, b"row-42");
        assert_eq!(dpoints, points);
    }

    #[test]
    fn size_class_rounds_up() {
        assert_eq!(size_class_for(1).unwrap(), 64);
        assert_eq!(size_class_for(64).unwrap(), 64);
        assert_eq!(size_class_for(65).unwrap(), 128);
    }
}
