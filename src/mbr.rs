//! Minimum Bounding Rectangle key: a fixed-dimension, runtime-`dim`
//! axis-aligned rectangle stored as ordered-float unsigned bounds so that
//! arithmetic and on-disk comparison agree.
//!
//! Dimension is a per-index runtime parameter (spec: immutable once the
//! index is created), so `Mbr` carries `dim` rather than encoding it in the
//! type, mirroring how the teacher keeps `z_blocksize`/`m_blocksize` as
//! runtime fields on `Config` rather than const generics.

use crate::{err_at, ofloat, Error, Result};

/// A k-dimensional bounding rectangle. `min[i] <= max[i]` for every `i`
/// unless the rectangle is the empty sentinel (`min[i] = POS_INF`,
/// `max[i] = NEG_INF`), which is the unit element under [Mbr::expand_mbr].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mbr {
    dim: usize,
    min: Vec<u64>,
    max: Vec<u64>,
}

impl Mbr {
    /// An empty MBR: the unit element under expansion.
    pub fn empty(dim: usize) -> Mbr {
        Mbr {
            dim,
            min: vec![ofloat::POS_INF; dim],
            max: vec![ofloat::NEG_INF; dim],
        }
    }

    /// Build an MBR directly from encoded bounds, validating `min <= max`
    /// per axis (the empty sentinel is accepted as a special case).
    pub fn from_bounds(min: Vec<u64>, max: Vec<u64>) -> Result<Mbr> {
        if min.len() != max.len() {
            return err_at!(InvalidInput, msg: "min/max dimension mismatch {}/{}", min.len(), max.len());
        }
        let dim = min.len();
        let is_empty = min.iter().all(|v| *v == ofloat::POS_INF)
            && max.iter().all(|v| *v == ofloat::NEG_INF);
        if !is_empty {
            for i in 0..dim {
                if min[i] > max[i] {
                    return err_at!(InvalidInput, msg: "min[{}] > max[{}]", i, i);
                }
            }
        }
        Ok(Mbr { dim, min, max })
    }

    /// Build a degenerate MBR covering a single point.
    pub fn from_point(point: &[f64]) -> Result<Mbr> {
        let dim = point.len();
        let mut min = Vec::with_capacity(dim);
        let mut max = Vec::with_capacity(dim);
        for p in point {
            let u = ofloat::encode(*p)?;
            min.push(u);
            max.push(u);
        }
        Ok(Mbr { dim, min, max })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn min_bound(&self, i: usize) -> u64 {
        self.min[i]
    }

    pub fn max_bound(&self, i: usize) -> u64 {
        self.max[i]
    }

    pub fn is_empty(&self) -> bool {
        self.min.iter().all(|v| *v == ofloat::POS_INF)
            && self.max.iter().all(|v| *v == ofloat::NEG_INF)
    }

    fn check_dim(&self, other_dim: usize) -> Result<()> {
        if self.dim != other_dim {
            err_at!(InvalidInput, msg: "dimension mismatch {}/{}", self.dim, other_dim)
        } else {
            Ok(())
        }
    }

    /// Expand this MBR, in place, to also cover `point`.
    pub fn expand_point(&mut self, point: &[f64]) -> Result<()> {
        self.check_dim(point.len())?;
        for i in 0..self.dim {
            let u = ofloat::encode(point[i])?;
            if u < self.min[i] {
                self.min[i] = u;
            }
            if u > self.max[i] {
                self.max[i] = u;
            }
        }
        Ok(())
    }

    /// Expand this MBR, in place, to also cover `other`.
    pub fn expand_mbr(&mut self, other: &Mbr) -> Result<()> {
        self.check_dim(other.dim)?;
        if other.is_empty() {
            return Ok(());
        }
        if self.is_empty() {
            self.min = other.min.clone();
            self.max = other.max.clone();
            return Ok(());
        }
        for i in 0..self.dim {
            if other.min[i] < self.min[i] {
                self.min[i] = other.min[i];
            }
            if other.max[i] > self.max[i] {
                self.max[i] = other.max[i];
            }
        }
        Ok(())
    }

    /// Return the union of `self` and `other` as a new MBR.
    pub fn union(&self, other: &Mbr) -> Result<Mbr> {
        let mut out = self.clone();
        out.expand_mbr(other)?;
        Ok(out)
    }

    /// `true` when every axis of `self` overlaps the corresponding axis of
    /// `other`. The 2-D case is unrolled for the hot path.
    pub fn intersects(&self, other: &Mbr) -> Result<bool> {
        self.check_dim(other.dim)?;
        if self.is_empty() || other.is_empty() {
            return Ok(false);
        }
        if self.dim == 2 {
            return Ok(self.min[0] <= other.max[0]
                && other.min[0] <= self.max[0]
                && self.min[1] <= other.max[1]
                && other.min[1] <= self.max[1]);
        }
        for i in 0..self.dim {
            if self.min[i] > other.max[i] || other.min[i] > self.max[i] {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// `true` when `other` is fully contained within `self`.
    pub fn contains(&self, other: &Mbr) -> Result<bool> {
        self.check_dim(other.dim)?;
        if other.is_empty() {
            return Ok(true);
        }
        if self.is_empty() {
            return Ok(false);
        }
        for i in 0..self.dim {
            if self.min[i] > other.min[i] || self.max[i] < other.max[i] {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn edge(&self, i: usize) -> f64 {
        ofloat::decode(self.max[i]) - ofloat::decode(self.min[i])
    }

    /// Product of per-axis edge lengths. Zero for the empty MBR.
    pub fn area(&self) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        (0..self.dim).map(|i| self.edge(i)).product()
    }

    /// Sum of per-axis edge lengths.
    pub fn margin(&self) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        (0..self.dim).map(|i| self.edge(i)).sum()
    }

    /// Area of the intersection of `self` and `other` (0 when disjoint).
    pub fn overlap_area(&self, other: &Mbr) -> Result<f64> {
        self.check_dim(other.dim)?;
        if self.is_empty() || other.is_empty() {
            return Ok(0.0);
        }
        let mut area = 1.0;
        for i in 0..self.dim {
            let lo = self.min[i].max(other.min[i]);
            let hi = self.max[i].min(other.max[i]);
            if hi <= lo {
                return Ok(0.0);
            }
            area *= ofloat::decode(hi) - ofloat::decode(lo);
        }
        Ok(area)
    }

    /// `overlap(self, other) / min(area(self), area(other))`. When both
    /// areas are zero (degenerate point MBRs), area-ratio overlap is
    /// undefined; treat coincident/touching rectangles as total overlap
    /// (`1.0`) rather than `0.0`, so a cluster of identical points still
    /// reads as maximally overlapping and cannot pass as a "good" split.
    pub fn percent_overlap(&self, other: &Mbr) -> Result<f64> {
        let denom = self.area().min(other.area());
        if denom <= 0.0 {
            return Ok(if self.intersects(other)? { 1.0 } else { 0.0 });
        }
        Ok(self.overlap_area(other)? / denom)
    }

    /// `area(self ∪ other) − area(self)`.
    pub fn area_enlargement(&self, other: &Mbr) -> Result<f64> {
        let union = self.union(other)?;
        Ok(union.area() - self.area())
    }

    /// Sum of `area_enlargement(self, k)` needed to admit `other` against
    /// every key in `siblings`, used by `chooseSubtree`'s overlap-enlargement
    /// tie-break: how much would each sibling's overlap with `self` grow if
    /// `self` were enlarged to also cover `other`.
    pub fn overlap_enlargement_against(&self, other: &Mbr, siblings: &[Mbr]) -> Result<f64> {
        let enlarged = self.union(other)?;
        let mut total = 0.0;
        for sib in siblings {
            let before = self.overlap_area(sib)?;
            let after = enlarged.overlap_area(sib)?;
            total += after - before;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mbr(min: [f64; 2], max: [f64; 2]) -> Mbr {
        let mut m = Mbr::from_point(&min).unwrap();
        m.expand_point(&max).unwrap();
        m
    }

    #[test]
    fn empty_is_unit_element() {
        let mut e = Mbr::empty(2);
        let a = mbr([0.0, 0.0], [10.0, 10.0]);
        e.expand_mbr(&a).unwrap();
        assert_eq!(e, a);
    }

    #[test]
    fn area_and_margin() {
        let a = mbr([0.0, 0.0], [10.0, 4.0]);
        assert_eq!(a.area(), 40.0);
        assert_eq!(a.margin(), 14.0);
    }

    #[test]
    fn intersects_and_contains() {
        let a = mbr([0.0, 0.0], [10.0, 10.0]);
        let b = mbr([5.0, 5.0], [15.0, 15.0]);
        let c = mbr([2.0, 2.0], [3.0, 3.0]);
        assert!(a.intersects(&b).unwrap());
        assert!(!a.contains(&b).unwrap());
        assert!(a.contains(&c).unwrap());
        assert!(a.intersects(&c).unwrap());
    }

    #[test]
    fn disjoint_does_not_intersect() {
        let a = mbr([0.0, 0.0], [1.0, 1.0]);
        let b = mbr([5.0, 5.0], [6.0, 6.0]);
        assert!(!a.intersects(&b).unwrap());
    }

    #[test]
    fn overlap_area_and_percent() {
        let a = mbr([0.0, 0.0], [10.0, 10.0]);
        let b = mbr([5.0, 0.0], [15.0, 10.0]);
        assert_eq!(a.overlap_area(&b).unwrap(), 50.0);
        assert_eq!(a.percent_overlap(&b).unwrap(), 0.5);
    }

    #[test]
    fn area_enlargement_for_disjoint_union() {
        let a = mbr([0.0, 0.0], [1.0, 1.0]);
        let b = mbr([2.0, 2.0], [3.0, 3.0]);
        // union covers [0,0]-[3,3] -> area 9, minus area(a)=1
        assert_eq!(a.area_enlargement(&b).unwrap(), 8.0);
    }

    #[test]
    fn percent_overlap_of_coincident_zero_area_points_is_total() {
        let a = Mbr::from_point(&[3.0, 3.0]).unwrap();
        let b = Mbr::from_point(&[3.0, 3.0]).unwrap();
        assert_eq!(a.percent_overlap(&b).unwrap(), 1.0);
    }

    #[test]
    fn percent_overlap_of_disjoint_zero_area_points_is_zero() {
        let a = Mbr::from_point(&[0.0, 0.0]).unwrap();
        let b = Mbr::from_point(&[5.0, 5.0]).unwrap();
        assert_eq!(a.percent_overlap(&b).unwrap(), 0.0);
    }

    #[test]
    fn dimension_mismatch_errors() {
        let a = Mbr::empty(2);
        let b = Mbr::empty(3);
        assert!(a.intersects(&b).is_err());
    }
}
