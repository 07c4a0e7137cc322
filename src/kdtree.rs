//! Indexed k-d trees over small fixed dimensions.
//!
//! The pipeline uses two instantiations: 3D over unit vectors or
//! heliocentric positions, and 4D over (scaled time, unit vector) where
//! the time axis is weighted so one day equals a configurable number of
//! degrees. Queries return indices into the point vector the tree was
//! built from, so callers can map hits back to their own catalogs.

use crate::spherical::celestial_to_unit;
use crate::types::DEGPRAD;

/// A point in the tree: coordinates plus the caller's index for the
/// record it came from.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct KdPoint<const N: usize> {
    pub coords: [f64; N],
    pub index: usize,
}

impl<const N: usize> KdPoint<N> {
    pub fn new(coords: [f64; N], index: usize) -> Self {
        Self { coords, index }
    }

    /// Squared Euclidean distance to another point.
    pub fn dist2(&self, other: &[f64; N]) -> f64 {
        let mut acc = 0.0;
        for k in 0..N {
            let d = self.coords[k] - other[k];
            acc += d * d;
        }
        acc
    }
}

/// Build a 4D point from a detection epoch and sky position. `timescale`
/// is the number of degrees equivalent to one day; dividing by DEGPRAD
/// puts the time axis in the same radian-like units as the unit-vector
/// axes, so the Euclidean metric blends angular and temporal separation.
pub fn time_sky_point(
    mjd: f64,
    mjd_ref: f64,
    ra_deg: f64,
    dec_deg: f64,
    timescale: f64,
    index: usize,
) -> KdPoint<4> {
    let u = celestial_to_unit(ra_deg, dec_deg);
    KdPoint::new([(mjd - mjd_ref) * timescale / DEGPRAD, u.x, u.y, u.z], index)
}

#[derive(Clone, Debug)]
struct KdNode<const N: usize> {
    point: KdPoint<N>,
    axis: usize,
    left: Option<usize>,
    right: Option<usize>,
}

/// Balanced k-d tree built by recursive median split on the axis of
/// widest extent. Build is O(n log n); range and nearest queries are
/// O(log n + k) expected for balanced data.
#[derive(Clone, Debug)]
pub struct KdTree<const N: usize> {
    nodes: Vec<KdNode<N>>,
    root: Option<usize>,
}

impl<const N: usize> KdTree<N> {
    pub fn build(points: &[KdPoint<N>]) -> Self {
        let mut scratch: Vec<KdPoint<N>> = points.to_vec();
        let mut nodes = Vec::with_capacity(points.len());
        let root = Self::build_rec(&mut scratch, &mut nodes);
        Self { nodes, root }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn build_rec(pts: &mut [KdPoint<N>], nodes: &mut Vec<KdNode<N>>) -> Option<usize> {
        if pts.is_empty() {
            return None;
        }
        // Split on the axis of widest extent.
        let mut axis = 0;
        let mut widest = -1.0;
        for k in 0..N {
            let mut lo = f64::INFINITY;
            let mut hi = f64::NEG_INFINITY;
            for p in pts.iter() {
                lo = lo.min(p.coords[k]);
                hi = hi.max(p.coords[k]);
            }
            if hi - lo > widest {
                widest = hi - lo;
                axis = k;
            }
        }
        let mid = pts.len() / 2;
        pts.select_nth_unstable_by(mid, |a, b| {
            a.coords[axis]
                .total_cmp(&b.coords[axis])
                .then(a.index.cmp(&b.index))
        });
        let point = pts[mid];
        let slot = nodes.len();
        nodes.push(KdNode {
            point,
            axis,
            left: None,
            right: None,
        });
        let (lo, rest) = pts.split_at_mut(mid);
        let hi = &mut rest[1..];
        let left = Self::build_rec(lo, nodes);
        let right = Self::build_rec(hi, nodes);
        nodes[slot].left = left;
        nodes[slot].right = right;
        Some(slot)
    }

    /// All point indices within Euclidean distance `radius` of `center`,
    /// ascending.
    pub fn range_query(&self, center: &[f64; N], radius: f64) -> Vec<usize> {
        let mut out = Vec::new();
        if let Some(root) = self.root {
            self.range_rec(root, center, radius, radius * radius, &mut out);
        }
        out.sort_unstable();
        out
    }

    fn range_rec(&self, node: usize, center: &[f64; N], radius: f64, r2: f64, out: &mut Vec<usize>) {
        let n = &self.nodes[node];
        if n.point.dist2(center) <= r2 {
            out.push(n.point.index);
        }
        let delta = center[n.axis] - n.point.coords[n.axis];
        // Only descend into a subtree whose bounding hyperplane is within
        // the query radius.
        if delta <= radius
            && let Some(l) = n.left
        {
            self.range_rec(l, center, radius, r2, out);
        }
        if delta >= -radius
            && let Some(r) = n.right
        {
            self.range_rec(r, center, radius, r2, out);
        }
    }

    /// Index and distance of the point nearest to `query`, or None for an
    /// empty tree. Ties go to the lower index.
    pub fn nearest(&self, query: &[f64; N]) -> Option<(usize, f64)> {
        let root = self.root?;
        let mut best = (usize::MAX, f64::INFINITY);
        self.nearest_rec(root, query, &mut best);
        Some((best.0, best.1.sqrt()))
    }

    fn nearest_rec(&self, node: usize, query: &[f64; N], best: &mut (usize, f64)) {
        let n = &self.nodes[node];
        let d2 = n.point.dist2(query);
        if d2 < best.1 || (d2 == best.1 && n.point.index < best.0) {
            *best = (n.point.index, d2);
        }
        let delta = query[n.axis] - n.point.coords[n.axis];
        let (near, far) = if delta <= 0.0 {
            (n.left, n.right)
        } else {
            (n.right, n.left)
        };
        if let Some(nn) = near {
            self.nearest_rec(nn, query, best);
        }
        // The far subtree can only help if the splitting hyperplane is
        // closer than the current best.
        if delta * delta <= best.1
            && let Some(ff) = far
        {
            self.nearest_rec(ff, query, best);
        }
    }
}
