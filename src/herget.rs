//! Method-of-Herget preliminary orbit fitting.
//!
//! The orbit is parameterized by the two observer-to-target distances at
//! a pair of anchor epochs. Each trial (ρ₁, ρ₂) implies heliocentric
//! endpoint positions; Lambert's problem supplies the connecting
//! velocity, Kepler propagation predicts every observation, and chi
//! square scores the trial. A downhill simplex walks the two-parameter
//! surface.

use glam::DVec3;

use crate::error::{Error, Result};
use crate::kepler::{kepler_propagate, solve_lambert};
use crate::orbitfit::{ResidualSet, sky_residuals};
use crate::spherical::celestial_to_unit;
use crate::types::{AU_KM, GMSUN_KM3_SEC2, Observation, SOLARDAY, StateVector};

/// Score assigned to unphysical trial points so the simplex retreats
/// from them.
const LARGERR: f64 = 1e30;

/// Simplex shape and termination settings.
#[derive(Clone, Debug)]
pub struct HergetConfig {
    /// Starting geocentric distance at the first anchor, AU
    pub geodist1: f64,
    /// Starting geocentric distance at the second anchor, AU
    pub geodist2: f64,
    /// Initial simplex construction: 0 = additive offsets, 1 =
    /// multiplicative offsets, 2 = point-and-ratio
    pub simptype: u8,
    /// Scale of the initial simplex (AU for additive, fractional
    /// otherwise)
    pub simplex_scale: f64,
    /// Relative chi-square spread at which the simplex has converged
    pub ftol: f64,
    /// Cap on simplex iterations
    pub max_iter: u32,
}

impl Default for HergetConfig {
    fn default() -> Self {
        Self {
            geodist1: 1.0,
            geodist2: 1.1,
            simptype: 0,
            simplex_scale: 0.2,
            ftol: 1e-6,
            max_iter: 500,
        }
    }
}

/// Result of a Herget fit.
#[derive(Clone, Debug)]
pub struct HergetResult {
    /// Best-fit state at `mjd`
    pub state: StateVector,
    /// Reference epoch: midpoint of the anchor epochs, UTC MJD
    pub mjd: f64,
    /// Converged geocentric distances, AU
    pub geodist1: f64,
    pub geodist2: f64,
    pub chisq: f64,
    pub residuals: ResidualSet,
    /// Chi-square evaluations consumed
    pub eval_count: u32,
}

/// Chi-square of one (ρ₁, ρ₂) trial; also returns the implied state at
/// the first anchor epoch when the trial is physical.
fn evaluate_trial(
    obs: &[Observation],
    rho1_au: f64,
    rho2_au: f64,
) -> (f64, Option<(StateVector, ResidualSet)>) {
    if rho1_au <= 0.0 || rho2_au <= 0.0 {
        return (LARGERR, None);
    }
    let first = &obs[0];
    let last = &obs[obs.len() - 1];
    let p1 = first.observer.pos + celestial_to_unit(first.ra, first.dec) * (rho1_au * AU_KM);
    let p2 = last.observer.pos + celestial_to_unit(last.ra, last.dec) * (rho2_au * AU_KM);
    let tof = (last.mjd - first.mjd) * SOLARDAY;
    let Some(lambert) = solve_lambert(p1, p2, tof, GMSUN_KM3_SEC2, true) else {
        return (LARGERR, None);
    };
    let state1 = StateVector::new(p1, lambert.v1);

    let mut positions = Vec::with_capacity(obs.len());
    for o in obs {
        match kepler_propagate(GMSUN_KM3_SEC2, &state1, (o.mjd - first.mjd) * SOLARDAY) {
            Ok(s) => positions.push(s.pos),
            Err(_) => return (LARGERR, None),
        }
    }
    let set = sky_residuals(obs, &positions);
    (set.chisq, Some((state1, set)))
}

/// Initial simplex vertices for the configured shape.
fn initial_simplex(cfg: &HergetConfig) -> [[f64; 2]; 3] {
    let (d1, d2, s) = (cfg.geodist1, cfg.geodist2, cfg.simplex_scale);
    match cfg.simptype {
        1 => [
            [d1, d2],
            [d1 * (1.0 + s), d2],
            [d1, d2 * (1.0 + s)],
        ],
        2 => [
            [d1, d2],
            [d1 * (1.0 + s), d2 * (1.0 + s)],
            [d1 * (1.0 + s), d2 * (1.0 - s)],
        ],
        _ => [[d1, d2], [d1 + s, d2], [d1, d2 + s]],
    }
}

/// Fit geocentric distances at the arc endpoints by downhill simplex.
///
/// `obs` must be time-sorted with at least two distinct epochs; the
/// first and last observations anchor the two distances. Fails
/// `NonConvergent` when no trial in the walk was physical.
pub fn herget_fit(obs: &[Observation], cfg: &HergetConfig) -> Result<HergetResult> {
    if obs.len() < 2 {
        return Err(Error::Usage(format!(
            "Herget fit needs at least 2 observations, got {}",
            obs.len()
        )));
    }
    if obs[obs.len() - 1].mjd - obs[0].mjd < 1e-6 {
        return Err(Error::Usage(
            "Herget fit anchors must be at distinct epochs".into(),
        ));
    }

    let mut eval_count: u32 = 0;
    let mut score = |v: &[f64; 2]| -> f64 {
        eval_count += 1;
        evaluate_trial(obs, v[0], v[1]).0
    };

    let mut verts = initial_simplex(cfg);
    let mut vals = [score(&verts[0]), score(&verts[1]), score(&verts[2])];

    for _ in 0..cfg.max_iter {
        // Order: best, middle, worst.
        let mut idx = [0usize, 1, 2];
        idx.sort_by(|&a, &b| vals[a].total_cmp(&vals[b]));
        let (best, mid, worst) = (idx[0], idx[1], idx[2]);

        let spread = (vals[worst] - vals[best]).abs();
        if spread <= cfg.ftol * vals[best].abs().max(1e-30) {
            break;
        }

        let centroid = [
            0.5 * (verts[best][0] + verts[mid][0]),
            0.5 * (verts[best][1] + verts[mid][1]),
        ];
        let reflect = [
            centroid[0] + (centroid[0] - verts[worst][0]),
            centroid[1] + (centroid[1] - verts[worst][1]),
        ];
        let f_reflect = score(&reflect);

        if f_reflect < vals[best] {
            // Try expanding past the reflection.
            let expand = [
                centroid[0] + 2.0 * (centroid[0] - verts[worst][0]),
                centroid[1] + 2.0 * (centroid[1] - verts[worst][1]),
            ];
            let f_expand = score(&expand);
            if f_expand < f_reflect {
                verts[worst] = expand;
                vals[worst] = f_expand;
            } else {
                verts[worst] = reflect;
                vals[worst] = f_reflect;
            }
        } else if f_reflect < vals[mid] {
            verts[worst] = reflect;
            vals[worst] = f_reflect;
        } else {
            let contract = [
                centroid[0] + 0.5 * (verts[worst][0] - centroid[0]),
                centroid[1] + 0.5 * (verts[worst][1] - centroid[1]),
            ];
            let f_contract = score(&contract);
            if f_contract < vals[worst] {
                verts[worst] = contract;
                vals[worst] = f_contract;
            } else {
                // Shrink toward the best vertex.
                for k in 0..3 {
                    if k == best {
                        continue;
                    }
                    verts[k] = [
                        verts[best][0] + 0.5 * (verts[k][0] - verts[best][0]),
                        verts[best][1] + 0.5 * (verts[k][1] - verts[best][1]),
                    ];
                    vals[k] = score(&verts[k]);
                }
            }
        }
    }

    let mut idx = [0usize, 1, 2];
    idx.sort_by(|&a, &b| vals[a].total_cmp(&vals[b]));
    let best = idx[0];
    let (chisq, detail) = evaluate_trial(obs, verts[best][0], verts[best][1]);
    eval_count += 1;
    let Some((state1, residuals)) = detail else {
        return Err(Error::non_convergent(
            "Herget simplex found no physical solution",
            eval_count,
        ));
    };

    // Express the state at the arc midpoint.
    let mjd_ref = 0.5 * (obs[0].mjd + obs[obs.len() - 1].mjd);
    let state = kepler_propagate(
        GMSUN_KM3_SEC2,
        &state1,
        (mjd_ref - obs[0].mjd) * SOLARDAY,
    )?;

    Ok(HergetResult {
        state,
        mjd: mjd_ref,
        geodist1: verts[best][0],
        geodist2: verts[best][1],
        chisq,
        residuals,
        eval_count,
    })
}

/// Pick the densest sub-arc no longer than `kepspan` days: the window
/// maximizing (point count) × (window span). Returns (start index,
/// length) into the time-sorted epochs.
pub fn best_fit_window(mjds: &[f64], kepspan: f64) -> (usize, usize) {
    let n = mjds.len();
    let mut best = (0usize, n.min(1));
    let mut best_metric = 0.0f64;
    for i in 0..n {
        let mut j = i;
        while j < n && mjds[j] - mjds[i] < kepspan {
            j += 1;
        }
        let count = j - i;
        if count == 0 {
            continue;
        }
        let metric = count as f64 * (mjds[j - 1] - mjds[i]);
        if metric > best_metric {
            best_metric = metric;
            best = (i, count);
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orbitfit::predicted_radec;
    use approx::assert_abs_diff_eq;

    /// Noiseless observations of a circular 2.5 AU orbit seen from a
    /// fixed observer at 1 AU on the x axis.
    fn circular_arc(n: usize, spacing_days: f64) -> (Vec<Observation>, StateVector, f64) {
        let r = 2.5 * AU_KM;
        let v = (GMSUN_KM3_SEC2 / r).sqrt();
        let truth = StateVector::new(DVec3::new(r, 0.0, 0.0), DVec3::new(0.0, v * 0.94, v * 0.34));
        let t0 = 59000.0;
        let observer = StateVector::new(DVec3::new(AU_KM, 0.0, 0.0), DVec3::ZERO);
        let obs = (0..n)
            .map(|k| {
                let mjd = t0 + k as f64 * spacing_days;
                let s = kepler_propagate(GMSUN_KM3_SEC2, &truth, (mjd - t0) * SOLARDAY).unwrap();
                let (ra, dec) = predicted_radec(s.pos, observer.pos);
                Observation {
                    mjd,
                    ra,
                    dec,
                    sigma: 1.0,
                    observer,
                }
            })
            .collect();
        (obs, truth, t0)
    }

    #[test]
    fn recovers_geocentric_distance_of_circular_orbit() {
        let (obs, truth, t0) = circular_arc(12, 2.0);
        // True geocentric distance at both anchors is 1.5 AU.
        let cfg = HergetConfig {
            geodist1: 1.2,
            geodist2: 1.2,
            ..Default::default()
        };
        let fit = herget_fit(&obs, &cfg).unwrap();
        assert!(fit.chisq < 1e-6, "chisq = {}", fit.chisq);
        assert_abs_diff_eq!(fit.geodist1, 1.5, epsilon = 0.01);
        // Fitted state must match the true trajectory at the midpoint.
        let span = obs.last().unwrap().mjd - t0;
        let expect =
            kepler_propagate(GMSUN_KM3_SEC2, &truth, 0.5 * span * SOLARDAY).unwrap();
        assert!(
            (fit.state.pos - expect.pos).length() < 5e4,
            "midpoint position off by {} km",
            (fit.state.pos - expect.pos).length()
        );
    }

    #[test]
    fn multiplicative_simplex_also_converges() {
        let (obs, _, _) = circular_arc(8, 3.0);
        let cfg = HergetConfig {
            geodist1: 1.3,
            geodist2: 1.3,
            simptype: 1,
            ..Default::default()
        };
        let fit = herget_fit(&obs, &cfg).unwrap();
        assert!(fit.chisq < 1e-4, "chisq = {}", fit.chisq);
    }

    #[test]
    fn rejects_single_epoch_arcs() {
        let (obs, _, _) = circular_arc(5, 2.0);
        let same: Vec<Observation> = obs.iter().map(|o| {
            let mut c = o.clone();
            c.mjd = obs[0].mjd;
            c
        }).collect();
        assert!(herget_fit(&same, &HergetConfig::default()).is_err());
    }

    #[test]
    fn window_selector_prefers_dense_stretch() {
        // Five clustered epochs, then two stragglers far away.
        let mjds = [0.0, 0.5, 1.0, 1.5, 2.0, 30.0, 60.0];
        let (start, count) = best_fit_window(&mjds, 14.0);
        assert_eq!(start, 0);
        assert_eq!(count, 5);
    }
}
