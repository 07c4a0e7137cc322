//! Full six-dimensional orbit fitting against the N-body integrator,
//! plus the predicted-position and residual machinery shared with the
//! Herget fitter.
//!
//! The fit is a damped differential corrector: finite-difference
//! Jacobian of the predicted astrometry with respect to the six state
//! components, weighted normal equations, and a step scale that halves
//! after three successive non-improving iterations.

use glam::DVec3;
use nalgebra::{SMatrix, SVector};

use crate::ephemeris::SolarSystem;
use crate::error::{Error, Result};
use crate::integrator::RadauIntegrator;
use crate::kepler::{Elements, state_to_elements};
use crate::spherical::{angular_dist_deg, unit_to_celestial};
use crate::types::{DEGPRAD, GMSUN_KM3_SEC2, Observation, StateVector};

/// Apparent (RA, Dec) in degrees of a heliocentric target position seen
/// from a heliocentric observer position.
pub fn predicted_radec(target_pos: DVec3, observer_pos: DVec3) -> (f64, f64) {
    unit_to_celestial(target_pos - observer_pos)
}

/// Astrometric residuals of one trajectory against a set of
/// observations.
#[derive(Clone, Debug, Default)]
pub struct ResidualSet {
    /// Predicted RA per observation, degrees
    pub fit_ra: Vec<f64>,
    /// Predicted Dec per observation, degrees
    pub fit_dec: Vec<f64>,
    /// RA residual × cos(Dec), arcsec
    pub dra: Vec<f64>,
    /// Dec residual, arcsec
    pub ddec: Vec<f64>,
    /// Total angular residual per observation, arcsec
    pub resid: Vec<f64>,
    /// Sum of (residual/sigma)²
    pub chisq: f64,
    /// RMS of the total residuals, arcsec
    pub astrom_rms: f64,
}

/// Compare predicted target positions with the observations they belong
/// to. `target_pos` holds the heliocentric position at each observation
/// epoch, in observation order.
pub fn sky_residuals(obs: &[Observation], target_pos: &[DVec3]) -> ResidualSet {
    let n = obs.len();
    let mut set = ResidualSet {
        fit_ra: Vec::with_capacity(n),
        fit_dec: Vec::with_capacity(n),
        dra: Vec::with_capacity(n),
        ddec: Vec::with_capacity(n),
        resid: Vec::with_capacity(n),
        ..Default::default()
    };
    let mut sum2 = 0.0;
    for (o, &pos) in obs.iter().zip(target_pos) {
        let (pra, pdec) = predicted_radec(pos, o.observer.pos);
        // Wrap the RA difference before scaling by cos(Dec).
        let mut dra_deg = o.ra - pra;
        if dra_deg > 180.0 {
            dra_deg -= 360.0;
        } else if dra_deg < -180.0 {
            dra_deg += 360.0;
        }
        let dra = dra_deg * (o.dec / DEGPRAD).cos() * 3600.0;
        let ddec = (o.dec - pdec) * 3600.0;
        let dist = angular_dist_deg(o.ra, o.dec, pra, pdec) * 3600.0;
        sum2 += dist * dist;
        set.chisq += dist * dist / (o.sigma * o.sigma);
        set.fit_ra.push(pra);
        set.fit_dec.push(pdec);
        set.dra.push(dra);
        set.ddec.push(ddec);
        set.resid.push(dist);
    }
    set.astrom_rms = if n > 0 { (sum2 / n as f64).sqrt() } else { 0.0 };
    set
}

/// Tuning for the full six-dimensional fit.
#[derive(Clone, Debug)]
pub struct FitConfig {
    /// Stop when an accepted iteration changes chi-square by less than
    /// this.
    pub min_chi_change: f64,
    /// Stop as soon as the astrometric RMS (arcsec) drops below this.
    pub astrom_rms_thresh: f64,
    /// Iteration cap.
    pub max_iter: u32,
    /// Relative size of the Jacobian perturbations.
    pub perturb_frac: f64,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            min_chi_change: 0.01,
            astrom_rms_thresh: 0.1,
            max_iter: 50,
            perturb_frac: 1e-6,
        }
    }
}

/// A converged (or cap-terminated) orbit fit.
#[derive(Clone, Debug)]
pub struct OrbitFit {
    /// Fitted heliocentric state at `mjd`
    pub state: StateVector,
    /// Epoch of the state, UTC MJD
    pub mjd: f64,
    pub elements: Elements,
    /// Accepted corrector iterations
    pub iterations: u32,
    /// Total trajectory evaluations (including Jacobian columns)
    pub eval_count: u32,
    pub residuals: ResidualSet,
}

impl OrbitFit {
    pub fn astrom_rms(&self) -> f64 {
        self.residuals.astrom_rms
    }

    pub fn chisq(&self) -> f64 {
        self.residuals.chisq
    }
}

/// Refine a seed state by weighted least squares against `obs`,
/// propagating trial trajectories with the N-body integrator.
///
/// `obs` must be sorted by MJD. Fails `NonConvergent` when the normal
/// matrix is singular or the step scale underflows; integrator errors
/// (ephemeris range, solar impact) propagate.
pub fn full_fit(
    model: &SolarSystem,
    seed: &StateVector,
    ref_mjd: f64,
    obs: &[Observation],
    cfg: &FitConfig,
) -> Result<OrbitFit> {
    if obs.len() < 3 {
        return Err(Error::Usage(format!(
            "orbit fit needs at least 3 observations, got {}",
            obs.len()
        )));
    }
    let integ = RadauIntegrator::new(model)?;
    let epochs: Vec<f64> = obs.iter().map(|o| o.mjd).collect();
    let mut eval_count: u32 = 0;

    let mut evaluate = |state: &StateVector| -> Result<ResidualSet> {
        eval_count += 1;
        let states = integ.propagate_to_epochs(state, ref_mjd, &epochs)?;
        let pos: Vec<DVec3> = states.iter().map(|s| s.pos).collect();
        Ok(sky_residuals(obs, &pos))
    };

    let mut cur_state = *seed;
    let mut cur = evaluate(&cur_state)?;
    let mut step_scale = 1.0f64;
    let mut bad_steps = 0u32;
    let mut iterations = 0u32;

    for _ in 0..cfg.max_iter {
        if cur.astrom_rms < cfg.astrom_rms_thresh {
            break;
        }
        // Finite-difference Jacobian of the residual vector.
        let pos_scale = cur_state.pos.length().max(1.0);
        let vel_scale = cur_state.vel.length().max(1e-6);
        let mut grads: Vec<[SVector<f64, 6>; 2]> = vec![[SVector::zeros(); 2]; obs.len()];
        for comp in 0..6 {
            let delta = cfg.perturb_frac * if comp < 3 { pos_scale } else { vel_scale };
            let mut pert = cur_state;
            match comp {
                0 => pert.pos.x += delta,
                1 => pert.pos.y += delta,
                2 => pert.pos.z += delta,
                3 => pert.vel.x += delta,
                4 => pert.vel.y += delta,
                _ => pert.vel.z += delta,
            }
            let pset = evaluate(&pert)?;
            for k in 0..obs.len() {
                // d(predicted)/d(component) = -d(residual)/d(component)
                grads[k][0][comp] = (cur.dra[k] - pset.dra[k]) / delta;
                grads[k][1][comp] = (cur.ddec[k] - pset.ddec[k]) / delta;
            }
        }

        // Weighted normal equations.
        let mut normal = SMatrix::<f64, 6, 6>::zeros();
        let mut rhs = SVector::<f64, 6>::zeros();
        for k in 0..obs.len() {
            let w = 1.0 / (obs[k].sigma * obs[k].sigma);
            for (axis, r) in [(0usize, cur.dra[k]), (1usize, cur.ddec[k])] {
                let g = grads[k][axis];
                normal += g * g.transpose() * w;
                rhs += g * (r * w);
            }
        }
        let correction = normal.lu().solve(&rhs).ok_or_else(|| {
            Error::non_convergent("orbit fit: singular normal matrix", iterations)
        })?;

        let mut trial = cur_state;
        trial.pos += DVec3::new(correction[0], correction[1], correction[2]) * step_scale;
        trial.vel += DVec3::new(correction[3], correction[4], correction[5]) * step_scale;
        let trial_set = evaluate(&trial)?;

        if trial_set.chisq < cur.chisq {
            let improvement = cur.chisq - trial_set.chisq;
            cur_state = trial;
            cur = trial_set;
            iterations += 1;
            bad_steps = 0;
            if improvement < cfg.min_chi_change {
                break;
            }
        } else {
            bad_steps += 1;
            if bad_steps >= 3 {
                step_scale /= 2.0;
                bad_steps = 0;
                if step_scale < 1e-6 {
                    return Err(Error::non_convergent(
                        "orbit fit: step scale underflow",
                        iterations,
                    ));
                }
            }
        }
    }

    Ok(OrbitFit {
        state: cur_state,
        mjd: ref_mjd,
        elements: state_to_elements(GMSUN_KM3_SEC2, &cur_state),
        iterations,
        eval_count,
        residuals: cur,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ephemeris::EphemerisTable;
    use crate::kepler::kepler_propagate;
    use crate::types::{AU_KM, SOLARDAY};
    use approx::assert_abs_diff_eq;

    fn sun_only_model() -> SolarSystem {
        let mjd: Vec<f64> = (0..120).map(|i| 59000.0 + i as f64).collect();
        let zeros = vec![StateVector::default(); mjd.len()];
        let table = EphemerisTable::from_samples(mjd, zeros).unwrap();
        SolarSystem::from_parts(8, 1.0, table.clone(), table, vec![])
    }

    /// Observations of a Kepler orbit from a stationary observer at 1 AU.
    fn synthetic_obs(truth: &StateVector, ref_mjd: f64, mjds: &[f64]) -> Vec<Observation> {
        let observer = StateVector::new(DVec3::new(AU_KM, 0.0, 0.0), DVec3::ZERO);
        mjds.iter()
            .map(|&mjd| {
                let s =
                    kepler_propagate(GMSUN_KM3_SEC2, truth, (mjd - ref_mjd) * SOLARDAY).unwrap();
                let (ra, dec) = predicted_radec(s.pos, observer.pos);
                Observation {
                    mjd,
                    ra,
                    dec,
                    sigma: 1.0,
                    observer,
                }
            })
            .collect()
    }

    #[test]
    fn residuals_of_truth_are_zero() {
        let truth = StateVector::new(
            DVec3::new(0.0, 2.5 * AU_KM, 0.0),
            DVec3::new(-16.0, 0.0, 2.0),
        );
        let mjds: Vec<f64> = (0..10).map(|i| 59030.0 + i as f64 * 3.0).collect();
        let obs = synthetic_obs(&truth, 59030.0, &mjds);
        let pos: Vec<DVec3> = mjds
            .iter()
            .map(|&m| {
                kepler_propagate(GMSUN_KM3_SEC2, &truth, (m - 59030.0) * SOLARDAY)
                    .unwrap()
                    .pos
            })
            .collect();
        let set = sky_residuals(&obs, &pos);
        assert!(set.astrom_rms < 1e-9, "rms = {}", set.astrom_rms);
        assert!(set.chisq < 1e-15);
    }

    #[test]
    fn recovers_perturbed_seed() {
        let model = sun_only_model();
        let truth = StateVector::new(
            DVec3::new(0.0, 2.5 * AU_KM, 0.0),
            DVec3::new(-16.0, 0.0, 2.0),
        );
        let ref_mjd = 59030.0;
        let mjds: Vec<f64> = (0..12).map(|i| 59002.0 + i as f64 * 5.0).collect();
        let obs = synthetic_obs(&truth, ref_mjd, &mjds);

        // Seed displaced by ~2000 km and 5 m/s.
        let seed = StateVector::new(
            truth.pos + DVec3::new(2000.0, -1500.0, 800.0),
            truth.vel + DVec3::new(0.003, -0.005, 0.002),
        );
        let fit = full_fit(&model, &seed, ref_mjd, &obs, &FitConfig::default()).unwrap();
        assert!(
            fit.astrom_rms() < 0.05,
            "rms after fit = {} arcsec",
            fit.astrom_rms()
        );
        assert!((fit.state.pos - truth.pos).length() < 500.0);
        let truth_el = state_to_elements(GMSUN_KM3_SEC2, &truth);
        assert_abs_diff_eq!(fit.elements.a / AU_KM, truth_el.a / AU_KM, epsilon = 0.01);
        assert!(fit.eval_count > 0);
    }

    #[test]
    fn too_few_observations_is_usage_error() {
        let model = sun_only_model();
        let seed = StateVector::new(DVec3::new(2.5 * AU_KM, 0.0, 0.0), DVec3::new(0.0, 18.0, 0.0));
        let obs = synthetic_obs(&seed, 59030.0, &[59030.0, 59031.0]);
        assert!(matches!(
            full_fit(&model, &seed, 59030.0, &obs, &FitConfig::default()),
            Err(Error::Usage(_))
        ));
    }
}
