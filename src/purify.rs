//! Linkage purification: orbit-fit every candidate cluster, reject
//! astrometric outliers, drop weak linkages, and collapse duplicates.
//!
//! Every cluster gets a Herget seed and a full perturbed fit. While the
//! astrometric RMS stays above threshold, the worst weighted residual
//! is dropped and the fit repeated, bounded by `rejfrac` and
//! `maxrejnum`. Surviving clusters are de-duplicated greedily by
//! detection overlap, best metric first.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

use rayon::prelude::*;

use crate::analysis::{MetricWeights, count_nights, nightly_counts};
use crate::ephemeris::SolarSystem;
use crate::error::Result;
use crate::herget::{HergetConfig, herget_fit};
use crate::kepler::kepler_propagate;
use crate::linker::sphere_intersect;
use crate::orbitfit::{FitConfig, OrbitFit, full_fit};
use crate::spherical::celestial_to_unit;
use crate::types::{
    Cluster, ClusterOrbit, DEGPRAD, Detection, GMSUN_KM3_SEC2, Image, IndexPair, Observation,
    SOLARDAY, TTDELTAT,
};

/// Purifier tuning.
#[derive(Clone, Debug)]
pub struct PurifyConfig {
    /// Epoch to express accepted orbits at; 0 uses each cluster's mean
    /// observation MJD
    pub useorb_mjd: f64,
    /// Fraction of a cluster's detections the rejection loop may drop
    pub rejfrac: f64,
    /// Absolute cap on rejected detections per cluster
    pub maxrejnum: usize,
    /// Accept a cluster once its astrometric RMS (arcsec) is below this
    pub max_astrom_rms: f64,
    /// Minimum distinct observing nights after rejection
    pub minobsnights: usize,
    /// Minimum detections after rejection
    pub minpointnum: usize,
    /// Enable the heliocentric-vane out-of-plane cut
    pub use_heliovane: bool,
    /// Maximum out-of-plane deviation from the fitted orbit plane,
    /// degrees
    pub max_oop: f64,
    pub weights: MetricWeights,
    pub herget: HergetConfig,
    pub fit: FitConfig,
}

impl Default for PurifyConfig {
    fn default() -> Self {
        Self {
            useorb_mjd: 0.0,
            rejfrac: 0.5,
            maxrejnum: 50,
            max_astrom_rms: 1.0,
            minobsnights: 3,
            minpointnum: 6,
            use_heliovane: false,
            max_oop: 5.0,
            weights: MetricWeights::default(),
            herget: HergetConfig::default(),
            fit: FitConfig::default(),
        }
    }
}

/// Purifier product: accepted clusters sorted by descending metric,
/// with orbits attached, plus the rebuilt cluster→detection relation.
#[derive(Clone, Debug, Default)]
pub struct PurifyOutput {
    pub clusters: Vec<Cluster>,
    pub clust2det: Vec<IndexPair>,
}

/// One cluster's purification outcome before de-duplication.
struct Purified {
    source_index: usize,
    cluster: Cluster,
    det_ids: Vec<usize>,
}

/// Purify candidate linkages. `inclust2det` must be sorted by (cluster,
/// detection). Clusters whose fits fail are marked unfit (metric 0) and
/// silently dropped; hard errors inside a fit do not abort the batch.
pub fn link_purify(
    model: &SolarSystem,
    dets: &[Detection],
    images: &[Image],
    inclust: &[Cluster],
    inclust2det: &[IndexPair],
    cfg: &PurifyConfig,
    cancel: Option<&AtomicBool>,
) -> Result<PurifyOutput> {
    // Member detections per incoming cluster.
    let mut members: Vec<Vec<usize>> = vec![Vec::new(); inclust.len()];
    for pair in inclust2det {
        if pair.i1 < members.len() && pair.i2 < dets.len() {
            members[pair.i1].push(pair.i2);
        }
    }

    let purified: Vec<Option<Purified>> = inclust
        .par_iter()
        .enumerate()
        .map(|(ci, cluster)| {
            if let Some(flag) = cancel
                && flag.load(Ordering::Relaxed)
            {
                return None;
            }
            purify_one(model, dets, images, cluster, &members[ci], ci, cfg)
        })
        .collect();

    // Greedy de-duplication: best metric first, ties to lower RMS then
    // lower incoming index.
    let mut accepted: Vec<Purified> = purified.into_iter().flatten().collect();
    accepted.sort_by(|a, b| {
        b.cluster
            .metric
            .total_cmp(&a.cluster.metric)
            .then(a.cluster.astrom_rms.total_cmp(&b.cluster.astrom_rms))
            .then(a.source_index.cmp(&b.source_index))
    });
    let mut used_dets: HashSet<usize> = HashSet::new();
    let mut out = PurifyOutput::default();
    for mut p in accepted {
        if p.det_ids.iter().any(|d| used_dets.contains(d)) {
            continue;
        }
        used_dets.extend(p.det_ids.iter().copied());
        p.cluster.clusternum = out.clusters.len();
        for &d in &p.det_ids {
            out.clust2det.push(IndexPair::new(p.cluster.clusternum, d));
        }
        out.clusters.push(p.cluster);
    }
    log::info!(
        "purifier: {} of {} clusters survive",
        out.clusters.len(),
        inclust.len()
    );
    Ok(out)
}

/// Observation view of a member detection list, time-sorted.
fn observations(dets: &[Detection], images: &[Image], det_ids: &[usize]) -> Vec<Observation> {
    let mut obs: Vec<(usize, Observation)> = det_ids
        .iter()
        .map(|&d| {
            let det = &dets[d];
            let sigma = if det.sig_across > 0.0 && det.sig_along > 0.0 {
                0.5 * (det.sig_across + det.sig_along)
            } else {
                1.0
            };
            (
                d,
                Observation {
                    mjd: det.mjd,
                    ra: det.ra,
                    dec: det.dec,
                    sigma,
                    observer: images[det.image].observer,
                },
            )
        })
        .collect();
    obs.sort_by(|a, b| a.1.mjd.total_cmp(&b.1.mjd).then(a.0.cmp(&b.0)));
    obs.into_iter().map(|(_, o)| o).collect()
}

fn purify_one(
    model: &SolarSystem,
    dets: &[Detection],
    images: &[Image],
    cluster: &Cluster,
    member_ids: &[usize],
    source_index: usize,
    cfg: &PurifyConfig,
) -> Option<Purified> {
    let mut ids: Vec<usize> = member_ids.to_vec();
    ids.sort_by(|&a, &b| dets[a].mjd.total_cmp(&dets[b].mjd).then(a.cmp(&b)));
    ids.dedup();

    // Observations the ephemeris cannot cover are not fittable; demote
    // them instead of aborting the cluster.
    let before = ids.len();
    ids.retain(|&d| {
        let tdb = dets[d].mjd + TTDELTAT / SOLARDAY;
        tdb >= model.earth.start_mjd() && tdb <= model.earth.end_mjd()
    });
    if ids.len() < before {
        log::warn!(
            "cluster {source_index}: {} observations outside the ephemeris span dropped",
            before - ids.len()
        );
    }
    if ids.len() < cfg.minpointnum.max(3) {
        return None;
    }

    let reject_cap = cfg
        .maxrejnum
        .min((cfg.rejfrac * ids.len() as f64).floor() as usize);
    let mut rejected = 0usize;

    let mut fit = fit_once(model, dets, images, &ids, cfg)?;
    while fit.astrom_rms() > cfg.max_astrom_rms
        && rejected < reject_cap
        && ids.len() > cfg.minpointnum.max(3)
    {
        // Drop the worst weighted residual and refit.
        let obs = observations(dets, images, &ids);
        let worst = fit
            .residuals
            .resid
            .iter()
            .zip(obs.iter())
            .enumerate()
            .max_by(|(_, (ra, oa)), (_, (rb, ob))| {
                (*ra / oa.sigma).total_cmp(&(*rb / ob.sigma))
            })
            .map(|(k, _)| k)?;
        ids.remove(worst);
        rejected += 1;
        fit = fit_once(model, dets, images, &ids, cfg)?;
    }

    if fit.astrom_rms() > cfg.max_astrom_rms {
        log::debug!(
            "cluster {source_index}: RMS {:.3} arcsec never reached {:.3}, marked unfit",
            fit.astrom_rms(),
            cfg.max_astrom_rms
        );
        return None;
    }

    let mjds: Vec<f64> = ids.iter().map(|&d| dets[d].mjd).collect();
    let obsnights = count_nights(&mjds);
    if obsnights < cfg.minobsnights || ids.len() < cfg.minpointnum {
        return None;
    }
    if cfg.use_heliovane
        && !passes_heliovane(&fit, &observations(dets, images, &ids), cfg.max_oop)
    {
        log::debug!("cluster {source_index}: heliocentric vane cut failed");
        return None;
    }

    // Express the accepted orbit at the requested epoch.
    let anchor = if cfg.useorb_mjd > 0.0 {
        cfg.useorb_mjd
    } else {
        mjds.iter().sum::<f64>() / mjds.len() as f64
    };
    let state_at_anchor =
        kepler_propagate(GMSUN_KM3_SEC2, &fit.state, (anchor - fit.mjd) * SOLARDAY).ok()?;

    let timespan = mjds[mjds.len() - 1] - mjds[0];
    let counts = nightly_counts(&mjds);
    let metric = cfg.weights.evaluate(
        ids.len(),
        obsnights,
        timespan,
        fit.astrom_rms(),
        &counts,
    );
    let rating = if ids
        .iter()
        .all(|&d| dets[d].idstring == dets[ids[0]].idstring)
    {
        "PURE"
    } else {
        "MIXED"
    };

    let mut updated = cluster.clone();
    updated.uniquepoints = ids.len();
    updated.obsnights = obsnights;
    updated.timespan = timespan;
    updated.astrom_rms = fit.astrom_rms();
    updated.metric = metric;
    updated.rating = rating.into();
    updated.orbit = Some(ClusterOrbit {
        a: fit.elements.a,
        e: fit.elements.e,
        mjd: anchor,
        state: state_at_anchor,
        eval_count: fit.eval_count,
        astrom_rms: fit.astrom_rms(),
    });

    Some(Purified {
        source_index,
        cluster: updated,
        det_ids: ids,
    })
}

/// Herget seed plus full perturbed fit over the given member set.
fn fit_once(
    model: &SolarSystem,
    dets: &[Detection],
    images: &[Image],
    ids: &[usize],
    cfg: &PurifyConfig,
) -> Option<OrbitFit> {
    let obs = observations(dets, images, ids);
    let seed = match herget_fit(&obs, &cfg.herget) {
        Ok(h) => h,
        Err(e) => {
            log::debug!("Herget seed failed: {e}");
            return None;
        }
    };
    match full_fit(model, &seed.state, seed.mjd, &obs, &cfg.fit) {
        Ok(f) => Some(f),
        Err(e) => {
            log::debug!("full fit failed: {e}");
            None
        }
    }
}

/// Out-of-plane test against the observed astrometry: each observed
/// line of sight, projected onto the heliocentric sphere the fitted
/// orbit occupies at that epoch, must stay within `max_oop` degrees of
/// the fitted orbit plane. The fitted trajectory itself is in its own
/// plane by construction; only the measured rays can wander out of it.
fn passes_heliovane(fit: &OrbitFit, obs: &[Observation], max_oop: f64) -> bool {
    let h = fit.state.pos.cross(fit.state.vel);
    if h.length() == 0.0 {
        return false;
    }
    let pole = h.normalize();
    for o in obs {
        let Ok(s) = kepler_propagate(GMSUN_KM3_SEC2, &fit.state, (o.mjd - fit.mjd) * SOLARDAY)
        else {
            return false;
        };
        let u = celestial_to_unit(o.ra, o.dec);
        // Project the observed ray onto the orbit's heliocentric
        // distance, taking the crossing nearest the fitted range.
        let fit_rho = (s.pos - o.observer.pos).length();
        let roots = sphere_intersect(o.observer.pos, u, s.pos.length());
        let rho = match (roots[0], roots[1]) {
            (Some(near), Some(far)) => {
                if (near - fit_rho).abs() <= (far - fit_rho).abs() {
                    near
                } else {
                    far
                }
            }
            (Some(near), None) => near,
            (None, Some(far)) => far,
            (None, None) => return false,
        };
        let helio = o.observer.pos + u * rho;
        let oop = (helio.normalize().dot(pole)).clamp(-1.0, 1.0).asin().abs() * DEGPRAD;
        if oop > max_oop {
            return false;
        }
    }
    true
}

/// Member detection indices of one cluster in a cluster→detection
/// relation.
pub fn cluster_members(clust2det: &[IndexPair], clusternum: usize) -> Vec<usize> {
    clust2det
        .iter()
        .filter(|p| p.i1 == clusternum)
        .map(|p| p.i2)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_bounds_are_sane() {
        let cfg = PurifyConfig::default();
        assert!(cfg.rejfrac > 0.0 && cfg.rejfrac <= 1.0);
        assert!(cfg.minpointnum >= 3);
        assert!(cfg.max_astrom_rms > 0.0);
    }

    #[test]
    fn member_lookup_filters_by_cluster() {
        let map = vec![
            IndexPair::new(0, 3),
            IndexPair::new(0, 7),
            IndexPair::new(1, 2),
        ];
        assert_eq!(cluster_members(&map, 0), vec![3, 7]);
        assert_eq!(cluster_members(&map, 1), vec![2]);
        assert!(cluster_members(&map, 2).is_empty());
    }
}
