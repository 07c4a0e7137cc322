//! Heliocentric-hypothesis linking: propagate tracklet states to a
//! common reference epoch under assumed radial motion, then cluster the
//! resulting state vectors.
//!
//! For every hypothesis the linker projects each tracklet's line of
//! sight onto the implied heliocentric sphere, first-differences the
//! endpoints into a velocity, carries the state to the reference MJD,
//! and runs a DBSCAN-style density clustering over the propagated
//! positions. Hypotheses are swept in parallel; output order is
//! (hypothesis index, seed tracklet index) regardless of thread timing.

use std::sync::atomic::{AtomicBool, Ordering};

use glam::DVec3;
use rayon::prelude::*;

use crate::analysis::{MetricWeights, count_nights, nightly_counts};
use crate::error::{Error, Result};
use crate::kdtree::{KdPoint, KdTree};
use crate::kepler::kepler_propagate;
use crate::spherical::celestial_to_unit;
use crate::types::{
    AU_KM, Cluster, Detection, GMSUN_KM3_SEC2, Hypothesis, Image, IndexPair, SOLARDAY,
    StateVector, Tracklet,
};

/// Linker tuning. Distances in the clustering space are kilometers;
/// geocentric bounds are AU.
#[derive(Clone, Debug)]
pub struct LinkerConfig {
    /// Reference epoch every tracklet state is propagated to, UTC MJD
    pub mjd_ref: f64,
    /// DBSCAN neighbourhood radius, km
    pub clustrad: f64,
    /// Recentering stops once the cluster mean moves less than this, km
    pub clustchangerad: f64,
    /// Minimum neighbours (self included) for a DBSCAN core point
    pub dbscan_npt: usize,
    /// Minimum distinct observing nights per cluster
    pub minobsnights: usize,
    /// Minimum cluster timespan, days
    pub mintimespan: f64,
    /// Geocentric distance bounds for accepted projections, AU
    pub mingeodist: f64,
    pub maxgeodist: f64,
    /// Ratio of the geometric distance ladder built by
    /// [`distance_ladder`]
    pub geologstep: f64,
    /// Projections closer than this (AU) must pass the impact-parameter
    /// guard
    pub mingeoobs: f64,
    /// Minimum Earth-impact parameter for close projections, km
    pub minimpactpar: f64,
    /// Propagate to the reference epoch with universal Kepler (true) or
    /// linearly (false)
    pub use_univar: bool,
    /// Hyperbolic excess speed allowed on top of escape speed, km/s
    pub max_v_inf: f64,
    /// Characteristic time converting velocity to commensurate position
    /// units in the cluster space, days
    pub vel_timescale_days: f64,
    pub weights: MetricWeights,
}

impl Default for LinkerConfig {
    fn default() -> Self {
        Self {
            mjd_ref: 0.0,
            clustrad: 1.0e5,
            clustchangerad: 1.0e4,
            dbscan_npt: 3,
            minobsnights: 3,
            mintimespan: 1.0,
            mingeodist: 0.001,
            maxgeodist: 100.0,
            geologstep: 1.5,
            mingeoobs: 0.0,
            minimpactpar: 0.0,
            use_univar: false,
            max_v_inf: 0.0,
            vel_timescale_days: 5.0,
            weights: MetricWeights::default(),
        }
    }
}

/// Geometric ladder of distances from `min_au` to `max_au` with the
/// given ratio between rungs; used to build hypothesis grids.
pub fn distance_ladder(min_au: f64, max_au: f64, ratio: f64) -> Vec<f64> {
    let mut out = Vec::new();
    if min_au <= 0.0 || max_au < min_au || ratio <= 1.0 {
        return out;
    }
    let mut r = min_au;
    while r <= max_au * (1.0 + 1e-12) {
        out.push(r);
        r *= ratio;
    }
    out
}

/// Intersections of the line of sight `observer + rho * u` with the
/// heliocentric sphere of radius `r_km`: the observer-to-target
/// distances of the near and far crossings, when they exist and are in
/// front of the observer.
pub fn sphere_intersect(observer: DVec3, u: DVec3, r_km: f64) -> [Option<f64>; 2] {
    let ou = observer.dot(u);
    let disc = ou * ou - (observer.length_squared() - r_km * r_km);
    if disc < 0.0 {
        return [None, None];
    }
    let sq = disc.sqrt();
    let near = -ou - sq;
    let far = -ou + sq;
    [
        (near > 0.0).then_some(near),
        (far > 0.0 && far > near).then_some(far),
    ]
}

/// The linker's product: clusters plus the cluster→detection relation.
#[derive(Clone, Debug, Default)]
pub struct LinkerOutput {
    pub clusters: Vec<Cluster>,
    pub clust2det: Vec<IndexPair>,
}

/// One tracklet propagated to the reference epoch under a hypothesis.
#[derive(Clone, Debug)]
struct RefPoint {
    trk: usize,
    state: StateVector,
}

/// Link tracklets into candidate discoveries.
///
/// `trk2det` must be sorted by (tracklet, detection). The optional
/// `cancel` flag is checked at hypothesis boundaries; once raised, the
/// sweep stops after the hypotheses already in flight.
pub fn link_tracklets(
    dets: &[Detection],
    images: &[Image],
    tracklets: &[Tracklet],
    trk2det: &[IndexPair],
    hypotheses: &[Hypothesis],
    cfg: &LinkerConfig,
    cancel: Option<&AtomicBool>,
) -> Result<LinkerOutput> {
    if cfg.mjd_ref <= 0.0 {
        return Err(Error::Usage(
            "linker reference MJD must be set explicitly".into(),
        ));
    }
    let members = tracklet_members(tracklets.len(), trk2det, dets)?;

    let per_hyp: Vec<Vec<Vec<RefPoint>>> = hypotheses
        .par_iter()
        .enumerate()
        .map(|(h, hyp)| {
            if let Some(flag) = cancel
                && flag.load(Ordering::Relaxed)
            {
                log::info!("linker cancelled before hypothesis {h}");
                return Vec::new();
            }
            link_one_hypothesis(dets, images, &members, hyp, cfg)
        })
        .collect();

    // Flatten in hypothesis order and attach detection mappings.
    let mut out = LinkerOutput::default();
    for (h, found) in per_hyp.into_iter().enumerate() {
        for member_points in found {
            let cluster = summarize_cluster(
                dets,
                &members,
                &member_points,
                &hypotheses[h],
                cfg,
                out.clusters.len(),
            );
            let Some((cluster, det_ids)) = cluster else {
                continue;
            };
            for &d in &det_ids {
                out.clust2det.push(IndexPair::new(cluster.clusternum, d));
            }
            out.clusters.push(cluster);
        }
    }
    log::info!(
        "linker: {} clusters from {} hypotheses over {} tracklets",
        out.clusters.len(),
        hypotheses.len(),
        tracklets.len()
    );
    Ok(out)
}

/// Member detection indices of every tracklet, time-sorted.
fn tracklet_members(
    ntrk: usize,
    trk2det: &[IndexPair],
    dets: &[Detection],
) -> Result<Vec<Vec<usize>>> {
    let mut members: Vec<Vec<usize>> = vec![Vec::new(); ntrk];
    for pair in trk2det {
        if pair.i1 >= ntrk || pair.i2 >= dets.len() {
            return Err(Error::InvariantViolation(format!(
                "trk2det pair ({}, {}) out of range",
                pair.i1, pair.i2
            )));
        }
        members[pair.i1].push(pair.i2);
    }
    for (t, m) in members.iter_mut().enumerate() {
        if m.len() < 2 {
            return Err(Error::InvariantViolation(format!(
                "tracklet {t} has {} member detections",
                m.len()
            )));
        }
        m.sort_by(|&a, &b| dets[a].mjd.total_cmp(&dets[b].mjd).then(a.cmp(&b)));
    }
    Ok(members)
}

/// Project one tracklet endpoint onto the hypothesis sphere.
/// `branch` 0 takes the near crossing, 1 the far crossing.
fn project_endpoint(
    det: &Detection,
    image: &Image,
    hyp: &Hypothesis,
    cfg: &LinkerConfig,
    branch: usize,
) -> Option<DVec3> {
    let dt_days = det.mjd - cfg.mjd_ref;
    let r_km = hyp.radius_at(dt_days) * AU_KM;
    if r_km <= 0.0 {
        return None;
    }
    let u = celestial_to_unit(det.ra, det.dec);
    let rho = sphere_intersect(image.observer.pos, u, r_km)[branch]?;
    let rho_au = rho / AU_KM;
    if rho_au < cfg.mingeodist || rho_au > cfg.maxgeodist {
        return None;
    }
    Some(image.observer.pos + u * rho)
}

/// All clusterable reference-epoch states for one hypothesis.
fn hypothesis_points(
    dets: &[Detection],
    images: &[Image],
    members: &[Vec<usize>],
    hyp: &Hypothesis,
    cfg: &LinkerConfig,
) -> Vec<RefPoint> {
    let mut points = Vec::new();
    for (trk, m) in members.iter().enumerate() {
        let d1 = &dets[m[0]];
        let d2 = &dets[m[m.len() - 1]];
        let (img1, img2) = (&images[d1.image], &images[d2.image]);
        let dt_sec = (d2.mjd - d1.mjd) * SOLARDAY;
        if dt_sec <= 0.0 {
            continue;
        }
        // Try the near and the far sphere crossing as independent
        // candidates; an observer inside the sphere only has the far one.
        for branch in 0..2 {
            let Some(p1) = project_endpoint(d1, img1, hyp, cfg, branch) else {
                continue;
            };
            let Some(p2) = project_endpoint(d2, img2, hyp, cfg, branch) else {
                continue;
            };
            let vel = (p2 - p1) / dt_sec;
            let pos = (p1 + p2) * 0.5;
            let tmid = 0.5 * (d1.mjd + d2.mjd);

            // Unbound motion beyond the allowed hyperbolic excess is
            // unphysical for the hypothesis distance.
            let r = pos.length();
            let vcap2 = 2.0 * GMSUN_KM3_SEC2 / r + cfg.max_v_inf * cfg.max_v_inf;
            if cfg.max_v_inf >= 0.0 && vel.length_squared() > vcap2 {
                continue;
            }

            // Earth-grazing projections need a plausible impact parameter.
            let rho1 = (p1 - img1.observer.pos).length() / AU_KM;
            if rho1 < cfg.mingeoobs && cfg.minimpactpar > 0.0 {
                let r_geo = p1 - img1.observer.pos;
                let v_geo = vel - img1.observer.vel;
                if v_geo.length() > 0.0 {
                    let b = r_geo.cross(v_geo).length() / v_geo.length();
                    if b < cfg.minimpactpar {
                        continue;
                    }
                }
            }

            let state = StateVector::new(pos, vel);
            let dt_ref = (cfg.mjd_ref - tmid) * SOLARDAY;
            let at_ref = if cfg.use_univar {
                match kepler_propagate(GMSUN_KM3_SEC2, &state, dt_ref) {
                    Ok(s) => s,
                    Err(_) => continue,
                }
            } else {
                StateVector::new(pos + vel * dt_ref, vel)
            };
            points.push(RefPoint { trk, state: at_ref });
        }
    }
    points
}

/// DBSCAN over the propagated positions; returns the member points of
/// each cluster, in seed order.
fn link_one_hypothesis(
    dets: &[Detection],
    images: &[Image],
    members: &[Vec<usize>],
    hyp: &Hypothesis,
    cfg: &LinkerConfig,
) -> Vec<Vec<RefPoint>> {
    let points = hypothesis_points(dets, images, members, hyp, cfg);
    if points.len() < cfg.dbscan_npt {
        return Vec::new();
    }
    let kd_points: Vec<KdPoint<3>> = points
        .iter()
        .enumerate()
        .map(|(i, p)| KdPoint::new([p.state.pos.x, p.state.pos.y, p.state.pos.z], i))
        .collect();
    let tree = KdTree::build(&kd_points);

    let mut assigned = vec![false; points.len()];
    let mut found = Vec::new();
    for seed in 0..points.len() {
        if assigned[seed] {
            continue;
        }
        let seed_nbrs = tree.range_query(&kd_points[seed].coords, cfg.clustrad);
        if seed_nbrs.len() < cfg.dbscan_npt {
            continue;
        }
        // Connected component reachable through core points.
        let mut member_set = Vec::new();
        let mut queue = vec![seed];
        while let Some(p) = queue.pop() {
            if assigned[p] {
                continue;
            }
            assigned[p] = true;
            member_set.push(p);
            let nbrs = tree.range_query(&kd_points[p].coords, cfg.clustrad);
            if nbrs.len() >= cfg.dbscan_npt {
                for n in nbrs {
                    if !assigned[n] {
                        queue.push(n);
                    }
                }
            }
        }

        // Recenter on the mean until it settles.
        let mut mean = mean_pos(&points, &member_set);
        for _ in 0..20 {
            let around: Vec<usize> =
                tree.range_query(&[mean.x, mean.y, mean.z], cfg.clustrad);
            if around.is_empty() {
                break;
            }
            let new_mean = mean_pos(&points, &around);
            let shift = (new_mean - mean).length();
            member_set = around;
            mean = new_mean;
            if shift <= cfg.clustchangerad {
                break;
            }
        }
        member_set.sort_unstable();
        for &p in &member_set {
            assigned[p] = true;
        }
        found.push(member_set.iter().map(|&p| points[p].clone()).collect());
    }

    found
}

fn mean_pos(points: &[RefPoint], idx: &[usize]) -> DVec3 {
    let mut m = DVec3::ZERO;
    for &i in idx {
        m += points[i].state.pos;
    }
    m / idx.len() as f64
}

/// Build the cluster record for a member-point list; None when the
/// night or timespan floors fail.
fn summarize_cluster(
    dets: &[Detection],
    members: &[Vec<usize>],
    member_points: &[RefPoint],
    hyp: &Hypothesis,
    cfg: &LinkerConfig,
    clusternum: usize,
) -> Option<(Cluster, Vec<usize>)> {
    if member_points.is_empty() {
        return None;
    }
    // Distinct member detections.
    let mut det_ids: Vec<usize> = member_points
        .iter()
        .flat_map(|p| members[p.trk].iter().copied())
        .collect();
    det_ids.sort_unstable();
    det_ids.dedup();

    let mut mjds: Vec<f64> = det_ids.iter().map(|&d| dets[d].mjd).collect();
    mjds.sort_by(|a, b| a.total_cmp(b));
    let timespan = mjds[mjds.len() - 1] - mjds[0];
    let obsnights = count_nights(&mjds);
    if obsnights < cfg.minobsnights || timespan < cfg.mintimespan {
        return None;
    }

    // Mean state and spread over the propagated member states.
    let k_sec = cfg.vel_timescale_days * SOLARDAY;
    let n = member_points.len() as f64;
    let mut mean = StateVector::default();
    for p in member_points {
        mean.pos += p.state.pos;
        mean.vel += p.state.vel;
    }
    mean.pos /= n;
    mean.vel /= n;
    let mut pvar = 0.0;
    let mut vvar = 0.0;
    for p in member_points {
        pvar += (p.state.pos - mean.pos).length_squared();
        vvar += (p.state.vel - mean.vel).length_squared();
    }
    let pos_rms = (pvar / n).sqrt();
    let vel_rms = (vvar / n).sqrt() * k_sec;
    let tot_rms = (pos_rms * pos_rms + vel_rms * vel_rms).sqrt();

    let rating = if det_ids
        .iter()
        .all(|&d| dets[d].idstring == dets[det_ids[0]].idstring)
    {
        "PURE"
    } else {
        "MIXED"
    };

    let counts = nightly_counts(&mjds);
    let metric = cfg
        .weights
        .evaluate(det_ids.len(), obsnights, timespan, tot_rms, &counts);

    Some((
        Cluster {
            clusternum,
            pos_rms,
            vel_rms,
            tot_rms,
            astrom_rms: 0.0,
            pairnum: member_points.len(),
            timespan,
            uniquepoints: det_ids.len(),
            obsnights,
            metric,
            rating: rating.into(),
            reference_mjd: cfg.mjd_ref,
            hypothesis: *hyp,
            mean_state: mean,
            orbit: None,
        },
        det_ids,
    ))
}
