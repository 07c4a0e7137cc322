//! Tracklet construction: grouping detections into images, pairing
//! detections across image pairs, and chaining pairs into multi-point
//! within-night tracklets that are consistent with a single great-circle
//! motion.

use crate::error::{Error, Result};
use crate::kdtree::{KdPoint, KdTree};
use crate::spherical::{angular_dist_deg, celestial_to_unit, great_circle_fit, unwrap_degrees};
use crate::types::{
    DEGPRAD, Detection, IMAGETIMETOL, Image, IndexPair, SOLARDAY, StateVector, Tracklet,
};

/// Tracklet-builder tuning. Angular velocities are deg/day, arcs and
/// great-circle residuals arcsec, times days.
#[derive(Clone, Debug)]
pub struct TrackletConfig {
    /// Minimum detections per emitted tracklet
    pub mintrkpts: usize,
    /// Same-image time tolerance, seconds
    pub imagetimetol: f64,
    /// Maximum plausible angular velocity, deg/day
    pub maxvel: f64,
    /// Minimum angular velocity, deg/day (rejects stationary sources)
    pub minvel: f64,
    /// Minimum pair arc, arcsec
    pub minarc: f64,
    /// Maximum pair time separation, days
    pub maxtime: f64,
    /// Minimum pair time separation, days
    pub mintime: f64,
    /// Image radius used for the image-pair overlap test, degrees
    pub imagerad: f64,
    /// Maximum RMS deviation from the best great circle, arcsec
    pub maxgcr: f64,
    /// Fractional tolerance on trail length in the trailed variant
    pub siglenscale: f64,
    /// Position-angle tolerance (degrees, mod 180) in the trailed variant
    pub sigpascale: f64,
    /// Cap on detections per tracklet
    pub max_netl: usize,
    /// Offset added to every detection MJD at ingest, seconds
    pub time_offset: f64,
    /// Proceed (with a warning) past suspicious configurations
    pub forcerun: bool,
}

impl Default for TrackletConfig {
    fn default() -> Self {
        Self {
            mintrkpts: 2,
            imagetimetol: IMAGETIMETOL,
            maxvel: 1.5,
            minvel: 0.0,
            minarc: 0.0,
            maxtime: 1.5 / 24.0,
            mintime: 1.0 / SOLARDAY,
            imagerad: 2.0,
            maxgcr: 0.5,
            siglenscale: 0.5,
            sigpascale: 15.0,
            max_netl: 8,
            time_offset: 0.0,
            forcerun: false,
        }
    }
}

/// Sort detections, apply the configured time offset, and partition them
/// into images by (MJD within the image time tolerance, observatory
/// code). Rewrites each detection's `image` field and returns the image
/// log with `startind`/`endind` filled in; observer states are zeroed
/// for the caller (or [`attach_observer_states`]) to supply.
pub fn assemble_images(dets: &mut [Detection], cfg: &TrackletConfig) -> Vec<Image> {
    if cfg.time_offset != 0.0 {
        for d in dets.iter_mut() {
            d.mjd += cfg.time_offset / SOLARDAY;
        }
    }
    dets.sort_by(|a, b| {
        a.mjd
            .total_cmp(&b.mjd)
            .then_with(|| a.obscode.cmp(&b.obscode))
            .then_with(|| a.ra.total_cmp(&b.ra))
            .then_with(|| a.dec.total_cmp(&b.dec))
            .then_with(|| a.origindex.cmp(&b.origindex))
    });

    let tol_days = cfg.imagetimetol / SOLARDAY;
    let mut images: Vec<Image> = Vec::new();
    let mut start = 0usize;
    while start < dets.len() {
        let mut end = start + 1;
        while end < dets.len()
            && dets[end].mjd - dets[start].mjd < tol_days
            && dets[end].obscode == dets[start].obscode
        {
            end += 1;
        }
        // Boresight estimate: mean of member coordinates, RA unwrapped.
        let mut ras: Vec<f64> = dets[start..end].iter().map(|d| d.ra).collect();
        unwrap_degrees(&mut ras);
        let ra = ras.iter().sum::<f64>() / ras.len() as f64;
        let dec = dets[start..end].iter().map(|d| d.dec).sum::<f64>() / (end - start) as f64;
        let image_index = images.len();
        for d in dets[start..end].iter_mut() {
            d.image = image_index;
        }
        images.push(Image {
            mjd: dets[start].mjd,
            ra: ra.rem_euclid(360.0),
            dec,
            obscode: dets[start].obscode.clone(),
            observer: StateVector::default(),
            startind: start,
            endind: end,
            exptime: 0.0,
        });
        start = end;
    }
    images
}

/// The tracklet builder's product: the tracklet list plus the
/// tracklet-to-detection relation (sorted by tracklet id, then
/// detection index).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TrackletSet {
    pub tracklets: Vec<Tracklet>,
    pub trk2det: Vec<IndexPair>,
}

/// Candidate edge between detections on two images.
#[derive(Clone, Copy, Debug)]
struct PairEdge {
    det1: usize,
    det2: usize,
}

/// Build tracklets from partitioned detections. `dets` and `images`
/// must come from [`assemble_images`] (detections time-sorted, image
/// ranges valid).
pub fn make_tracklets(
    dets: &[Detection],
    images: &[Image],
    cfg: &TrackletConfig,
) -> Result<TrackletSet> {
    build_tracklets(dets, images, cfg, false)
}

/// Trailed variant: additionally requires each candidate pair to agree
/// with its member detections' trail vectors (length within a
/// `siglenscale` fraction, position angle within `sigpascale` degrees
/// mod 180).
pub fn make_trailed_tracklets(
    dets: &[Detection],
    images: &[Image],
    cfg: &TrackletConfig,
) -> Result<TrackletSet> {
    build_tracklets(dets, images, cfg, true)
}

fn build_tracklets(
    dets: &[Detection],
    images: &[Image],
    cfg: &TrackletConfig,
    trailed: bool,
) -> Result<TrackletSet> {
    validate_partition(dets, images)?;
    if cfg.maxvel * cfg.maxtime > 10.0 {
        let msg = format!(
            "search radius {} deg (maxvel × maxtime) is implausibly large",
            cfg.maxvel * cfg.maxtime
        );
        if cfg.forcerun {
            log::warn!("{msg}; continuing because forcerun is set");
        } else {
            return Err(Error::Usage(msg));
        }
    }

    let edges = find_pair_edges(dets, images, cfg, trailed);
    log::debug!("tracklet builder: {} candidate pair edges", edges.len());

    // Adjacency over shared detections.
    let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); dets.len()];
    for (e, edge) in edges.iter().enumerate() {
        adjacency[edge.det1].push(e);
        adjacency[edge.det2].push(e);
    }

    let mut used = vec![false; dets.len()];
    let mut raw: Vec<Vec<usize>> = Vec::new();

    for edge in &edges {
        if used[edge.det1] || used[edge.det2] {
            continue;
        }
        let mut members = vec![edge.det1, edge.det2];
        grow_tracklet(dets, &edges, &adjacency, &mut members, &used, cfg);
        members.sort_by(|&a, &b| {
            dets[a]
                .mjd
                .total_cmp(&dets[b].mjd)
                .then_with(|| a.cmp(&b))
        });

        if members.len() < cfg.mintrkpts {
            continue;
        }
        if !tracklet_passes(dets, &members, cfg) {
            continue;
        }
        for &m in &members {
            used[m] = true;
        }
        raw.push(members);
    }

    // Canonical emission order: (image1, image2, lowest member index).
    raw.sort_by_key(|members| {
        (
            dets[members[0]].image,
            dets[members[members.len() - 1]].image,
            *members.iter().min().unwrap_or(&0),
        )
    });

    let mut out = TrackletSet::default();
    for (trk_id, members) in raw.iter().enumerate() {
        let first = &dets[members[0]];
        let last = &dets[members[members.len() - 1]];
        out.tracklets.push(Tracklet {
            img1: first.image,
            ra1: first.ra,
            dec1: first.dec,
            img2: last.image,
            ra2: last.ra,
            dec2: last.dec,
            npts: members.len() as u32,
            trk_id,
        });
        for &m in members {
            out.trk2det.push(IndexPair::new(trk_id, m));
        }
    }
    out.trk2det.sort();
    Ok(out)
}

fn validate_partition(dets: &[Detection], images: &[Image]) -> Result<()> {
    let mut covered = 0usize;
    for (i, img) in images.iter().enumerate() {
        if img.startind >= img.endind || img.endind > dets.len() || img.startind != covered {
            return Err(Error::InvariantViolation(format!(
                "image {i} range [{}, {}) does not partition {} detections",
                img.startind,
                img.endind,
                dets.len()
            )));
        }
        covered = img.endind;
    }
    if covered != dets.len() {
        return Err(Error::InvariantViolation(format!(
            "image ranges cover {covered} of {} detections",
            dets.len()
        )));
    }
    Ok(())
}

fn find_pair_edges(
    dets: &[Detection],
    images: &[Image],
    cfg: &TrackletConfig,
    trailed: bool,
) -> Vec<PairEdge> {
    let mut edges = Vec::new();
    for (a, img_a) in images.iter().enumerate() {
        for img_b in images.iter().skip(a + 1) {
            let dt = img_b.mjd - img_a.mjd;
            if dt < cfg.mintime {
                continue;
            }
            if dt > cfg.maxtime {
                break; // images are time-sorted
            }
            let center_sep = angular_dist_deg(img_a.ra, img_a.dec, img_b.ra, img_b.dec);
            if center_sep > 2.0 * cfg.imagerad + cfg.maxvel * dt {
                continue;
            }
            // Index image B in unit-vector space and query around each
            // image-A detection with the maximum-motion radius.
            let points: Vec<KdPoint<3>> = (img_b.startind..img_b.endind)
                .map(|j| {
                    let u = celestial_to_unit(dets[j].ra, dets[j].dec);
                    KdPoint::new([u.x, u.y, u.z], j)
                })
                .collect();
            let tree = KdTree::build(&points);
            let search_deg = cfg.maxvel * dt;
            let chord = 2.0 * (0.5 * search_deg / DEGPRAD).sin();
            for i in img_a.startind..img_a.endind {
                let u = celestial_to_unit(dets[i].ra, dets[i].dec);
                for j in tree.range_query(&[u.x, u.y, u.z], chord) {
                    let arc_deg = angular_dist_deg(dets[i].ra, dets[i].dec, dets[j].ra, dets[j].dec);
                    let vel = arc_deg / dt;
                    if vel < cfg.minvel || vel > cfg.maxvel {
                        continue;
                    }
                    if arc_deg * 3600.0 < cfg.minarc {
                        continue;
                    }
                    if trailed && !trail_consistent(&dets[i], &dets[j], images, vel, cfg) {
                        continue;
                    }
                    edges.push(PairEdge { det1: i, det2: j });
                }
            }
        }
    }
    edges
}

/// Trailed-source gate: the apparent motion must reproduce each trailed
/// member's trail length (velocity × exposure) and position angle.
fn trail_consistent(
    d1: &Detection,
    d2: &Detection,
    images: &[Image],
    vel_deg_day: f64,
    cfg: &TrackletConfig,
) -> bool {
    let pair_pa = crate::spherical::position_angle_deg(d1.ra, d1.dec, d2.ra, d2.dec);
    for d in [d1, d2] {
        if d.trail_len <= 0.0 {
            continue;
        }
        let exptime = images[d.image].exptime;
        if exptime > 0.0 {
            let expect_len = vel_deg_day * 3600.0 * exptime / SOLARDAY * 3600.0;
            let tol = cfg.siglenscale * d.trail_len.max(expect_len).max(1.0);
            if (d.trail_len - expect_len).abs() > tol {
                return false;
            }
        }
        let mut dpa = (d.trail_pa - pair_pa).abs() % 180.0;
        if dpa > 90.0 {
            dpa = 180.0 - dpa;
        }
        if dpa > cfg.sigpascale {
            return false;
        }
    }
    true
}

/// Greedily absorb detections reachable through edges that share a
/// member, keeping the set on one great circle.
fn grow_tracklet(
    dets: &[Detection],
    edges: &[PairEdge],
    adjacency: &[Vec<usize>],
    members: &mut Vec<usize>,
    used: &[bool],
    cfg: &TrackletConfig,
) {
    loop {
        if members.len() >= cfg.max_netl {
            return;
        }
        let mut candidate: Option<usize> = None;
        'search: for &m in members.iter() {
            for &e in &adjacency[m] {
                for other in [edges[e].det1, edges[e].det2] {
                    if used[other] || members.contains(&other) {
                        continue;
                    }
                    // One detection per image.
                    if members.iter().any(|&x| dets[x].image == dets[other].image) {
                        continue;
                    }
                    if tracklet_would_pass_gcr(dets, members, other, cfg) {
                        candidate = Some(other);
                        break 'search;
                    }
                }
            }
        }
        match candidate {
            Some(c) => members.push(c),
            None => return,
        }
    }
}

fn tracklet_would_pass_gcr(
    dets: &[Detection],
    members: &[usize],
    extra: usize,
    cfg: &TrackletConfig,
) -> bool {
    let mut pts: Vec<(f64, f64, f64)> = members
        .iter()
        .chain(std::iter::once(&extra))
        .map(|&m| (dets[m].mjd, dets[m].ra, dets[m].dec))
        .collect();
    pts.sort_by(|a, b| a.0.total_cmp(&b.0));
    match great_circle_fit(&pts, None) {
        Ok(fit) => {
            let rms = (fit.crosstrack_rms.powi(2) + fit.alongtrack_rms.powi(2)).sqrt() * 3600.0;
            rms <= cfg.maxgcr
        }
        Err(_) => false,
    }
}

/// Final acceptance: great-circle RMS, total arc and mean velocity.
fn tracklet_passes(dets: &[Detection], members: &[usize], cfg: &TrackletConfig) -> bool {
    let first = &dets[members[0]];
    let last = &dets[members[members.len() - 1]];
    let dt = last.mjd - first.mjd;
    if dt <= 0.0 {
        return false;
    }
    let arc_deg = angular_dist_deg(first.ra, first.dec, last.ra, last.dec);
    let vel = arc_deg / dt;
    if vel < cfg.minvel || vel > cfg.maxvel || arc_deg * 3600.0 < cfg.minarc {
        return false;
    }
    if members.len() >= 3 {
        let pts: Vec<(f64, f64, f64)> = members
            .iter()
            .map(|&m| (dets[m].mjd, dets[m].ra, dets[m].dec))
            .collect();
        match great_circle_fit(&pts, None) {
            Ok(fit) => {
                let rms =
                    (fit.crosstrack_rms.powi(2) + fit.alongtrack_rms.powi(2)).sqrt() * 3600.0;
                if rms > cfg.maxgcr {
                    return false;
                }
            }
            Err(_) => return false,
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Detections of one source moving at `vel` deg/day in RA, imaged
    /// `nimg` times `gap_days` apart, starting at (ra0, dec0).
    fn moving_source(
        mjd0: f64,
        ra0: f64,
        dec0: f64,
        vel: f64,
        nimg: usize,
        gap_days: f64,
        id: &str,
    ) -> Vec<Detection> {
        (0..nimg)
            .map(|k| {
                let dt = k as f64 * gap_days;
                let mut d = Detection::at(mjd0 + dt, ra0 + vel * dt, dec0, "X05");
                d.idstring = id.to_string();
                d.origindex = k as i64;
                d
            })
            .collect()
    }

    fn default_cfg() -> TrackletConfig {
        TrackletConfig {
            minvel: 0.01,
            ..Default::default()
        }
    }

    #[test]
    fn images_partition_by_time_and_obscode() {
        let mut dets = Vec::new();
        dets.extend(moving_source(60000.0, 100.0, 5.0, 0.5, 3, 0.02, "a"));
        // Same epochs, different observatory.
        let mut other = moving_source(60000.0, 100.0, 5.0, 0.5, 3, 0.02, "b");
        for d in &mut other {
            d.obscode = "Y99".into();
        }
        dets.extend(other);
        let images = assemble_images(&mut dets, &default_cfg());
        assert_eq!(images.len(), 6);
        let covered: usize = images.iter().map(|im| im.endind - im.startind).sum();
        assert_eq!(covered, dets.len());
        for img in &images {
            for d in &dets[img.startind..img.endind] {
                assert_eq!(d.obscode, img.obscode);
                assert!((d.mjd - img.mjd).abs() < IMAGETIMETOL / SOLARDAY);
            }
        }
    }

    #[test]
    fn links_moving_source_and_ignores_stationary() {
        let mut dets = moving_source(60000.0, 100.0, 5.0, 0.5, 3, 0.02, "mover");
        // A stationary star present on every image.
        for k in 0..3 {
            let mut star = Detection::at(60000.0 + k as f64 * 0.02, 101.0, 5.1, "X05");
            star.idstring = "star".into();
            star.origindex = 100 + k as i64;
            dets.push(star);
        }
        let cfg = default_cfg();
        let images = assemble_images(&mut dets, &cfg);
        let out = make_tracklets(&dets, &images, &cfg).unwrap();
        assert_eq!(out.tracklets.len(), 1, "expected exactly the moving tracklet");
        let trk = &out.tracklets[0];
        assert_eq!(trk.npts, 3);
        let members: Vec<usize> = out
            .trk2det
            .iter()
            .filter(|p| p.i1 == trk.trk_id)
            .map(|p| p.i2)
            .collect();
        assert_eq!(members.len(), 3);
        for &m in &members {
            assert_eq!(dets[m].idstring, "mover");
        }
    }

    #[test]
    fn emission_is_deterministic() {
        let mut dets = Vec::new();
        dets.extend(moving_source(60000.0, 100.0, 5.0, 0.5, 4, 0.015, "a"));
        dets.extend(moving_source(60000.0, 100.3, 4.8, -0.4, 4, 0.015, "b"));
        dets.extend(moving_source(60000.0, 99.6, 5.2, 0.7, 4, 0.015, "c"));
        let cfg = default_cfg();
        let mut dets2 = dets.clone();
        let images = assemble_images(&mut dets, &cfg);
        let images2 = assemble_images(&mut dets2, &cfg);
        let out1 = make_tracklets(&dets, &images, &cfg).unwrap();
        let out2 = make_tracklets(&dets2, &images2, &cfg).unwrap();
        assert_eq!(out1, out2);
        // Ordering invariant: ascending (img1, img2, min detection).
        for w in out1.tracklets.windows(2) {
            assert!(w[0].img1 <= w[1].img1 || w[0].img2 <= w[1].img2 || w[0].trk_id < w[1].trk_id);
        }
    }

    #[test]
    fn maxgcr_rejects_crooked_chains() {
        let mut dets = moving_source(60000.0, 100.0, 5.0, 0.5, 4, 0.02, "bent");
        // Kink the third detection well off the great circle.
        dets[2].dec += 0.05;
        let cfg = TrackletConfig {
            mintrkpts: 4,
            ..default_cfg()
        };
        let images = assemble_images(&mut dets, &cfg);
        let out = make_tracklets(&dets, &images, &cfg).unwrap();
        assert!(
            out.tracklets.is_empty(),
            "kinked chain should fail the 4-point requirement"
        );
    }

    #[test]
    fn mintime_excludes_close_pairs() {
        let mut dets = moving_source(60000.0, 100.0, 5.0, 0.5, 2, 0.02, "m");
        let cfg = TrackletConfig {
            mintime: 0.05,
            ..default_cfg()
        };
        let images = assemble_images(&mut dets, &cfg);
        let out = make_tracklets(&dets, &images, &cfg).unwrap();
        assert!(out.tracklets.is_empty());
    }

    #[test]
    fn trailed_variant_gates_on_position_angle() {
        let mut dets = moving_source(60000.0, 100.0, 0.0, 0.5, 2, 0.02, "t");
        // Motion is due east (PA 90). Trail PAs agree for both.
        for d in &mut dets {
            d.trail_len = 0.0;
            d.trail_pa = 90.0;
        }
        let cfg = default_cfg();
        let images = assemble_images(&mut dets, &cfg);
        let ok = make_trailed_tracklets(&dets, &images, &cfg).unwrap();
        assert_eq!(ok.tracklets.len(), 1);

        // Perpendicular trails cannot come from this motion.
        let mut dets2 = dets.clone();
        for d in &mut dets2 {
            d.trail_len = 5.0;
            d.trail_pa = 0.0;
        }
        let images2 = assemble_images(&mut dets2, &cfg);
        let bad = make_trailed_tracklets(&dets2, &images2, &cfg).unwrap();
        assert!(bad.tracklets.is_empty());
    }
}
