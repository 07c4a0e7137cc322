//! Shared fixtures for the end-to-end tests: synthetic orbiters, an
//! Earth-like observer, and a Sun-only solar-system model.

use glam::DVec3;

use helioseek::ephemeris::{EphemerisTable, SolarSystem};
use helioseek::kepler::kepler_propagate;
use helioseek::orbitfit::predicted_radec;
use helioseek::tracklet::{TrackletConfig, assemble_images};
use helioseek::types::{
    AU_KM, Detection, GMSUN_KM3_SEC2, Image, SOLARDAY, StateVector,
};

/// Reference epoch all fixtures are anchored to.
pub const T0: f64 = 60200.0;

/// Heliocentric state of a body on a circular orbit of radius `r_au`,
/// `phase_deg` along the orbit from the +x axis, orbit plane tilted by
/// `incl_deg` about the x axis.
pub fn circular_state(r_au: f64, phase_deg: f64, incl_deg: f64) -> StateVector {
    let r = r_au * AU_KM;
    let v = (GMSUN_KM3_SEC2 / r).sqrt();
    let (sp, cp) = phase_deg.to_radians().sin_cos();
    let (si, ci) = incl_deg.to_radians().sin_cos();
    let pos = DVec3::new(r * cp, r * sp * ci, r * sp * si);
    let vel = DVec3::new(-v * sp, v * cp * ci, v * cp * si);
    StateVector::new(pos, vel)
}

/// Earth-proxy heliocentric observer state: circular 1 AU orbit in the
/// equatorial plane.
pub fn earth_state(mjd: f64) -> StateVector {
    let truth = circular_state(1.0, 0.0, 0.0);
    kepler_propagate(GMSUN_KM3_SEC2, &truth, (mjd - T0) * SOLARDAY).unwrap()
}

/// Sun-only model whose step grid covers `[T0 - margin, T0 + ndays]`.
pub fn sun_only_model(ndays: usize) -> SolarSystem {
    let start = T0 - 10.0;
    let mjd: Vec<f64> = (0..(ndays + 21)).map(|i| start + i as f64).collect();
    let zeros = vec![StateVector::default(); mjd.len()];
    let table = EphemerisTable::from_samples(mjd, zeros).unwrap();
    SolarSystem::from_parts(8, 1.0, table.clone(), table, vec![])
}

/// Exposure epochs: `nights` nights spaced `night_gap` days, with
/// `per_night` exposures `intra_gap` days apart inside each night.
pub fn survey_epochs(nights: usize, per_night: usize, night_gap: f64, intra_gap: f64) -> Vec<f64> {
    let mut epochs = Vec::new();
    for n in 0..nights {
        for e in 0..per_night {
            epochs.push(T0 + n as f64 * night_gap + e as f64 * intra_gap);
        }
    }
    epochs
}

/// Observe a set of objects at every epoch from the Earth-proxy
/// observatory, returning the partitioned detection catalog and image
/// log (observer states filled in).
pub fn build_survey(
    objects: &[(StateVector, &str)],
    epochs: &[f64],
    cfg: &TrackletConfig,
) -> (Vec<Detection>, Vec<Image>) {
    let mut dets = Vec::new();
    for &mjd in epochs {
        let observer = earth_state(mjd);
        for (k, (truth, id)) in objects.iter().enumerate() {
            let state = kepler_propagate(GMSUN_KM3_SEC2, truth, (mjd - T0) * SOLARDAY).unwrap();
            let (ra, dec) = predicted_radec(state.pos, observer.pos);
            let mut d = Detection::at(mjd, ra, dec, "X05");
            d.idstring = id.to_string();
            d.mag = 20.0 + 0.1 * k as f64;
            d.band = "r".into();
            d.origindex = (dets.len()) as i64;
            dets.push(d);
        }
    }
    let mut images = assemble_images(&mut dets, cfg);
    for img in &mut images {
        img.observer = earth_state(img.mjd);
        img.exptime = 30.0;
    }
    (dets, images)
}
