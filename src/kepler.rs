//! Two-body machinery in the universal-variables formulation: Stumpff
//! functions, Keplerian propagation between epochs, orbital elements from
//! a state vector, and a Lambert solver.
//!
//! The universal-variable form handles elliptic, parabolic and hyperbolic
//! orbits with one code path, which matters because linking hypotheses
//! routinely imply unbound trial orbits.

use glam::DVec3;

use crate::error::{Error, Result};
use crate::types::{DEGPRAD, StateVector};

const KEPLER_MAX_ITER: u32 = 100;
const KEPLER_TOL: f64 = 1e-10;

/// Stumpff function C(z) - handles elliptic/parabolic/hyperbolic cases.
pub fn stumpff_c(z: f64) -> f64 {
    if z > 1e-4 {
        // Elliptic
        let sqrt_z = z.sqrt();
        (1.0 - sqrt_z.cos()) / z
    } else if z < -1e-4 {
        // Hyperbolic
        let sqrt_neg_z = (-z).sqrt();
        (sqrt_neg_z.cosh() - 1.0) / (-z)
    } else {
        // Parabolic limit: Taylor expansion for numerical stability
        1.0 / 2.0 - z / 24.0 + z * z / 720.0 - z * z * z / 40320.0
    }
}

/// Stumpff function S(z) - handles elliptic/parabolic/hyperbolic cases.
pub fn stumpff_s(z: f64) -> f64 {
    if z > 1e-4 {
        // Elliptic
        let sqrt_z = z.sqrt();
        (sqrt_z - sqrt_z.sin()) / sqrt_z.powi(3)
    } else if z < -1e-4 {
        // Hyperbolic
        let sqrt_neg_z = (-z).sqrt();
        (sqrt_neg_z.sinh() - sqrt_neg_z) / sqrt_neg_z.powi(3)
    } else {
        // Parabolic limit: Taylor expansion
        1.0 / 6.0 - z / 120.0 + z * z / 5040.0 - z * z * z / 362880.0
    }
}

/// Propagate a two-body state by `dt_sec` seconds around a central mass
/// with gravitational parameter `gm` (km³/s²).
///
/// Newton iteration on the universal anomaly; fails `NonConvergent` if
/// the iteration cap is exceeded.
pub fn kepler_propagate(gm: f64, state: &StateVector, dt_sec: f64) -> Result<StateVector> {
    if dt_sec == 0.0 {
        return Ok(*state);
    }
    let r0 = state.pos.length();
    let v02 = state.vel.length_squared();
    if r0 < 1e-9 {
        return Err(Error::InvariantViolation(
            "Kepler propagation from the origin".into(),
        ));
    }
    let sqrt_mu = gm.sqrt();
    let vr0 = state.pos.dot(state.vel) / r0;
    // Reciprocal semi-major axis; sign selects the conic.
    let alpha = 2.0 / r0 - v02 / gm;

    let mut chi = if alpha > 1e-12 {
        sqrt_mu * dt_sec * alpha
    } else if alpha < -1e-12 {
        let a = 1.0 / alpha;
        let num = -2.0 * gm * alpha * dt_sec;
        let den = state.pos.dot(state.vel) + dt_sec.signum() * (-gm * a).sqrt() * (1.0 - r0 * alpha);
        if (num / den) > 0.0 {
            dt_sec.signum() * (-a).sqrt() * (num / den).ln()
        } else {
            sqrt_mu * dt_sec / r0
        }
    } else {
        // Near-parabolic: small-anomaly starting value.
        sqrt_mu * dt_sec / r0
    };

    let mut converged = false;
    for _ in 0..KEPLER_MAX_ITER {
        let z = alpha * chi * chi;
        let c = stumpff_c(z);
        let s = stumpff_s(z);
        let chi2 = chi * chi;
        let f = (vr0 * r0 / sqrt_mu) * chi2 * c + (1.0 - alpha * r0) * chi2 * chi * s + r0 * chi
            - sqrt_mu * dt_sec;
        let fprime = chi2 * c + (vr0 * r0 / sqrt_mu) * chi * (1.0 - z * s) + r0 * (1.0 - z * c);
        let delta = f / fprime;
        chi -= delta;
        if delta.abs() < KEPLER_TOL * chi.abs().max(1.0) {
            converged = true;
            break;
        }
    }
    if !converged {
        return Err(Error::non_convergent(
            "universal Kepler iteration",
            KEPLER_MAX_ITER,
        ));
    }

    let z = alpha * chi * chi;
    let c = stumpff_c(z);
    let s = stumpff_s(z);
    let f = 1.0 - chi * chi * c / r0;
    let g = dt_sec - chi * chi * chi * s / sqrt_mu;
    let pos = state.pos * f + state.vel * g;
    let r1 = pos.length();
    let gdot = 1.0 - chi * chi * c / r1;
    let fdot = sqrt_mu / (r0 * r1) * chi * (z * s - 1.0);
    let vel = state.pos * fdot + state.vel * gdot;
    Ok(StateVector::new(pos, vel))
}

/// Orbital elements recoverable from a single state vector.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Elements {
    /// Semi-major axis, km (negative for hyperbolic orbits)
    pub a: f64,
    /// Eccentricity
    pub e: f64,
    /// Inclination to the equatorial plane, degrees
    pub incl: f64,
}

/// Compute (a, e, i) from a heliocentric state.
pub fn state_to_elements(gm: f64, state: &StateVector) -> Elements {
    let r = state.pos.length();
    let v2 = state.vel.length_squared();
    let energy = v2 / 2.0 - gm / r;
    let a = if energy.abs() > 1e-16 {
        -gm / (2.0 * energy)
    } else {
        f64::INFINITY
    };
    let evec = (state.pos * (v2 - gm / r) - state.vel * state.pos.dot(state.vel)) / gm;
    let h = state.pos.cross(state.vel);
    let incl = if h.length() > 0.0 {
        (h.z / h.length()).clamp(-1.0, 1.0).acos() * DEGPRAD
    } else {
        0.0
    };
    Elements {
        a,
        e: evec.length(),
        incl,
    }
}

/// Result of the Lambert solver.
#[derive(Debug, Clone, Copy)]
pub struct LambertSolution {
    /// Departure velocity (at r1), km/s
    pub v1: DVec3,
    /// Arrival velocity (at r2), km/s
    pub v2: DVec3,
    /// Semi-major axis of the transfer orbit (negative for hyperbolic), km
    pub semi_major_axis: f64,
}

/// Solve Lambert's problem: the orbit connecting two position vectors in
/// a given time of flight.
///
/// Universal-variable bisection on psi. `prograde` selects the solution
/// whose angular momentum has positive z (counter-clockwise seen from
/// the north); short linking arcs always want the prograde/short-way
/// branch.
///
/// Returns `None` when the geometry is degenerate or the iteration does
/// not converge; callers treat that as an unphysical trial.
pub fn solve_lambert(
    r1: DVec3,
    r2: DVec3,
    tof_sec: f64,
    mu: f64,
    prograde: bool,
) -> Option<LambertSolution> {
    let r1_mag = r1.length();
    let r2_mag = r2.length();

    if r1_mag < 1e-6 || r2_mag < 1e-6 || tof_sec < 1e-6 {
        return None; // Degenerate case
    }

    let cross = r1.cross(r2);
    let cos_dnu = (r1.dot(r2) / (r1_mag * r2_mag)).clamp(-1.0, 1.0);

    // Transfer-angle orientation from the z-component of the plane normal.
    let sin_mag = (1.0 - cos_dnu * cos_dnu).sqrt();
    let sin_dnu = if prograde {
        if cross.z >= 0.0 { sin_mag } else { -sin_mag }
    } else if cross.z >= 0.0 {
        -sin_mag
    } else {
        sin_mag
    };

    // Near-180° transfers leave the orbit plane unconstrained.
    if (1.0 + cos_dnu).abs() < 1e-10 {
        return None;
    }

    let a_coeff = (r1_mag * r2_mag * (1.0 + cos_dnu)).sqrt();
    let a_coeff = if sin_dnu >= 0.0 { a_coeff } else { -a_coeff };

    // Parabolic time of flight separates the elliptic and hyperbolic
    // branches of psi.
    let chord = (r2 - r1).length();
    let s = (r1_mag + r2_mag + chord) / 2.0;
    let t_parabolic = (2.0 / 3.0) * (s.powi(3) / mu).sqrt() * (1.0 - ((s - chord) / s).powf(1.5));

    let mut psi_low: f64;
    let mut psi_high: f64;
    if tof_sec < t_parabolic {
        psi_low = -4.0 * std::f64::consts::PI * std::f64::consts::PI;
        psi_high = 0.0;
    } else {
        psi_low = 0.0;
        psi_high = 4.0 * std::f64::consts::PI * std::f64::consts::PI;
    }

    const MAX_ITER: usize = 60;
    const TOL: f64 = 1e-9;

    let mut psi = (psi_low + psi_high) / 2.0;

    for _ in 0..MAX_ITER {
        let c = stumpff_c(psi);
        let s_stumpff = stumpff_s(psi);

        let y = r1_mag + r2_mag + a_coeff * (psi * s_stumpff - 1.0) / c.sqrt();

        if c.abs() < 1e-12 || y < 0.0 {
            if sin_dnu >= 0.0 {
                psi_low = psi;
            } else {
                psi_high = psi;
            }
            psi = (psi_low + psi_high) / 2.0;
            continue;
        }

        let chi = (y / c).sqrt();
        let chi3 = chi.powi(3);
        let tof_calc = (chi3 * s_stumpff + a_coeff * y.sqrt()) / mu.sqrt();
        let dt = tof_sec - tof_calc;

        if dt.abs() < TOL * tof_sec {
            let f = 1.0 - y / r1_mag;
            let g = a_coeff * (y / mu).sqrt();
            let g_dot = 1.0 - y / r2_mag;

            if g.abs() < 1e-12 {
                return None; // Degenerate
            }

            let v1 = (r2 - r1 * f) / g;
            let v2 = (r2 * g_dot - r1) / g;

            let energy = v1.length_squared() / 2.0 - mu / r1_mag;
            let semi_major = if energy.abs() > 1e-16 {
                -mu / (2.0 * energy)
            } else {
                f64::INFINITY
            };

            return Some(LambertSolution {
                v1,
                v2,
                semi_major_axis: semi_major,
            });
        }

        if dt > 0.0 {
            psi_low = psi;
        } else {
            psi_high = psi;
        }
        psi = (psi_low + psi_high) / 2.0;
    }

    None // Didn't converge
}
