//! Observatory sites and topocentric observer states.
//!
//! An observer state is the Earth's state from the ephemeris tables plus
//! a rigid-body correction for the site, computed from the observatory's
//! east longitude and parallax constants via a sidereal-time term.

use std::fs;
use std::path::Path;

use glam::DVec3;

use crate::error::{Error, Result};
use crate::types::{
    DEGPRAD, EARTH_EQUAT_RADIUS_KM, Observatory, SOLARDAY, StateVector, TTDELTAT,
};

use super::table::EphemerisTable;

/// Sidereal rotation rate of the Earth, radians per second.
const EARTH_ROT_RAD_SEC: f64 = 2.0 * std::f64::consts::PI * 1.002_737_909_35 / SOLARDAY;

/// Parse an observatory-code file: each non-comment line holds
/// `obscode east_longitude_deg plxcos plxsin`.
pub fn read_obscode_file(path: impl AsRef<Path>) -> Result<Vec<Observatory>> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    let mut out = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let toks: Vec<&str> = line.split_whitespace().collect();
        if toks.len() < 4 {
            return Err(Error::parse(
                path,
                lineno + 1,
                format!("expected 4 fields, found {}", toks.len()),
            ));
        }
        let mut nums = [0.0f64; 3];
        for (k, slot) in nums.iter_mut().enumerate() {
            *slot = toks[k + 1].parse().map_err(|_| {
                Error::parse(
                    path,
                    lineno + 1,
                    format!("unparseable number '{}'", toks[k + 1]),
                )
            })?;
        }
        if toks[0].len() > 3 {
            log::warn!("observatory code '{}' longer than 3 characters", toks[0]);
        }
        out.push(Observatory {
            obscode: toks[0].to_string(),
            lon_deg: nums[0],
            plxcos: nums[1],
            plxsin: nums[2],
        });
    }
    Ok(out)
}

/// Find a site by observatory code.
pub fn obscode_lookup<'a>(sites: &'a [Observatory], code: &str) -> Result<&'a Observatory> {
    sites
        .iter()
        .find(|o| o.obscode == code)
        .ok_or_else(|| Error::LookupFail(format!("unknown observatory code '{code}'")))
}

/// Greenwich mean sidereal angle at a UTC MJD, degrees in [0, 360).
pub fn gmst_deg(mjd_utc: f64) -> f64 {
    // Days from J2000.0 (JD 2451545.0 = MJD 51544.5).
    let d = mjd_utc - 51544.5;
    (280.460_618_37 + 360.985_647_366_29 * d).rem_euclid(360.0)
}

/// Geocentric position and velocity of a site at a UTC epoch, equatorial
/// km and km/s.
pub fn site_offset(mjd_utc: f64, site: &Observatory) -> StateVector {
    let lst = (gmst_deg(mjd_utc) + site.lon_deg) / DEGPRAD;
    let pos = DVec3::new(
        EARTH_EQUAT_RADIUS_KM * site.plxcos * lst.cos(),
        EARTH_EQUAT_RADIUS_KM * site.plxcos * lst.sin(),
        EARTH_EQUAT_RADIUS_KM * site.plxsin,
    );
    // Rigid rotation about the polar axis.
    let vel = DVec3::new(-pos.y, pos.x, 0.0) * EARTH_ROT_RAD_SEC;
    StateVector::new(pos, vel)
}

/// Heliocentric observer state at a UTC epoch.
///
/// `earth` and `sun` are barycentric tables on a TDB grid; the query
/// adds the TT−UTC offset before sampling and subtracts the Sun state so
/// the result is heliocentric. Pass a `sun` table of zeros when the
/// Earth table is already heliocentric.
pub fn observer_state(
    mjd_utc: f64,
    site: &Observatory,
    earth: &EphemerisTable,
    sun: &EphemerisTable,
    polyorder: usize,
) -> Result<StateVector> {
    let mjd_tdb = mjd_utc + TTDELTAT / SOLARDAY;
    let e = earth.state_at(mjd_tdb, polyorder)?;
    let s = sun.state_at(mjd_tdb, polyorder)?;
    let geo = site_offset(mjd_utc, site);
    Ok(StateVector::new(
        e.pos - s.pos + geo.pos,
        e.vel - s.vel + geo.vel,
    ))
}
