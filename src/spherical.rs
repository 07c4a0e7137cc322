//! Spherical astronomy primitives: unit-vector conversions, pole
//! rotations, great-circle fits and the small statistics helpers the
//! rest of the pipeline leans on.
//!
//! Angles cross the API in degrees and are converted to radians at the
//! trig boundary. Longitude sequences are unwrapped across 0/360 before
//! any differencing.

use glam::DVec3;
use nalgebra::{DMatrix, DVector, Matrix3, Vector3};

use crate::error::{Error, Result};
use crate::types::DEGPRAD;

/// Convert (RA, Dec) in degrees to a J2000 equatorial unit vector.
pub fn celestial_to_unit(ra_deg: f64, dec_deg: f64) -> DVec3 {
    let ra = ra_deg / DEGPRAD;
    let dec = dec_deg / DEGPRAD;
    DVec3::new(
        ra.cos() * dec.cos(),
        ra.sin() * dec.cos(),
        dec.sin(),
    )
}

/// Convert a direction vector (need not be normalized) to (RA, Dec) in
/// degrees, RA in [0, 360).
pub fn unit_to_celestial(v: DVec3) -> (f64, f64) {
    let r = v.length();
    let dec = (v.z / r).asin() * DEGPRAD;
    let mut ra = v.y.atan2(v.x) * DEGPRAD;
    if ra < 0.0 {
        ra += 360.0;
    }
    (ra, dec)
}

/// Angular distance between two sky positions, degrees.
///
/// Haversine form, stable for both tiny and near-antipodal separations.
pub fn angular_dist_deg(ra1: f64, dec1: f64, ra2: f64, dec2: f64) -> f64 {
    let d1 = dec1 / DEGPRAD;
    let d2 = dec2 / DEGPRAD;
    let dra = (ra2 - ra1) / DEGPRAD;
    let sin_ddec = ((d2 - d1) / 2.0).sin();
    let sin_dra = (dra / 2.0).sin();
    let h = sin_ddec * sin_ddec + d1.cos() * d2.cos() * sin_dra * sin_dra;
    2.0 * h.sqrt().clamp(-1.0, 1.0).asin() * DEGPRAD
}

/// Position angle of point 2 as seen from point 1, degrees east of north
/// in [0, 360).
pub fn position_angle_deg(ra1: f64, dec1: f64, ra2: f64, dec2: f64) -> f64 {
    let d1 = dec1 / DEGPRAD;
    let d2 = dec2 / DEGPRAD;
    let dra = (ra2 - ra1) / DEGPRAD;
    let y = dra.sin() * d2.cos();
    let x = d1.cos() * d2.sin() - d1.sin() * d2.cos() * dra.cos();
    let mut pa = y.atan2(x) * DEGPRAD;
    if pa < 0.0 {
        pa += 360.0;
    }
    pa
}

/// Rotate sky coordinates into the frame where the named pole becomes +Z.
///
/// `oldpole_lon_deg` fixes the residual rotational freedom: it is the
/// longitude assigned to the original celestial pole in the new frame
/// (the great-circle fits use 90°). Returns (longitude, latitude) of the
/// input point in the new frame, degrees, longitude in [0, 360).
pub fn poleswitch(
    ra_deg: f64,
    dec_deg: f64,
    pole_ra_deg: f64,
    pole_dec_deg: f64,
    oldpole_lon_deg: f64,
) -> (f64, f64) {
    let v = celestial_to_unit(ra_deg, dec_deg);
    let p = celestial_to_unit(pole_ra_deg, pole_dec_deg);
    let l0 = oldpole_lon_deg / DEGPRAD;
    let z = DVec3::Z;

    // Component of the old pole perpendicular to the new one. When the two
    // poles coincide the longitude reference collapses to the old x-axis.
    let zperp = z - p * z.dot(p);
    let w = if zperp.length() > 1e-12 {
        zperp.normalize()
    } else {
        DVec3::X
    };

    let e1 = w * l0.cos() - p.cross(w) * l0.sin();
    let e2 = p.cross(e1);
    unit_to_celestial(DVec3::new(v.dot(e1), v.dot(e2), v.dot(p)))
}

/// Result of a great-circle fit to a time-ordered arc of sky positions.
#[derive(Clone, Copy, Debug, Default)]
pub struct GreatCircleFit {
    /// Pole of the fitted great circle, degrees. The pole is oriented so
    /// that the arc moves prograde (increasing longitude) about it.
    pub pole_ra: f64,
    pub pole_dec: f64,
    /// Mean angular velocity along the circle, degrees/day
    pub angvel: f64,
    /// Position angle of motion at the first point, degrees east of north
    pub pa: f64,
    /// RMS of cross-track residuals (latitude about the circle), degrees
    pub crosstrack_rms: f64,
    /// RMS of along-track residuals about the linear motion fit, degrees
    pub alongtrack_rms: f64,
}

/// Fit a great circle to `(mjd, ra, dec)` samples, optionally weighted.
///
/// The pole is the direction minimizing the weighted sum of squared
/// projections of the member unit vectors (smallest eigenvector of the
/// outer-product matrix); motion along the circle is then fit linearly in
/// time in the rotated frame.
pub fn great_circle_fit(points: &[(f64, f64, f64)], weights: Option<&[f64]>) -> Result<GreatCircleFit> {
    let n = points.len();
    if n < 2 {
        return Err(Error::Usage(format!(
            "great-circle fit needs at least 2 points, got {n}"
        )));
    }
    if let Some(w) = weights
        && w.len() != n
    {
        return Err(Error::Usage(format!(
            "weight vector length {} does not match {} points",
            w.len(),
            n
        )));
    }

    let units: Vec<DVec3> = points
        .iter()
        .map(|&(_, ra, dec)| celestial_to_unit(ra, dec))
        .collect();

    let pole = if n == 2 {
        // Two points define the circle exactly.
        let c = units[0].cross(units[1]);
        if c.length() < 1e-14 {
            return Err(Error::InvariantViolation(
                "coincident points in great-circle fit".into(),
            ));
        }
        c.normalize()
    } else {
        let mut m = Matrix3::<f64>::zeros();
        for (i, u) in units.iter().enumerate() {
            let w = weights.map_or(1.0, |wv| wv[i]);
            let uv = Vector3::new(u.x, u.y, u.z);
            m += uv * uv.transpose() * w;
        }
        let eig = m.symmetric_eigen();
        let mut imin = 0;
        for k in 1..3 {
            if eig.eigenvalues[k] < eig.eigenvalues[imin] {
                imin = k;
            }
        }
        let col = eig.eigenvectors.column(imin);
        let mut pole = DVec3::new(col[0], col[1], col[2]).normalize();
        // Orient so the arc is prograde about the pole.
        if units[0].cross(units[n - 1]).dot(pole) < 0.0 {
            pole = -pole;
        }
        pole
    };

    let (pole_ra, pole_dec) = unit_to_celestial(pole);

    // Longitude in the pole frame is the along-track coordinate, latitude
    // the cross-track deviation.
    let mut lons: Vec<f64> = Vec::with_capacity(n);
    let mut lats: Vec<f64> = Vec::with_capacity(n);
    for &(_, ra, dec) in points {
        let (lon, lat) = poleswitch(ra, dec, pole_ra, pole_dec, 90.0);
        lons.push(lon);
        lats.push(lat);
    }
    unwrap_degrees(&mut lons);

    let tmean: f64 = points.iter().map(|p| p.0).sum::<f64>() / n as f64;
    let times: Vec<f64> = points.iter().map(|p| p.0 - tmean).collect();

    // Weighted linear fit of longitude against time.
    let (mut sw, mut st, mut sl, mut stt, mut stl) = (0.0, 0.0, 0.0, 0.0, 0.0);
    for i in 0..n {
        let w = weights.map_or(1.0, |wv| wv[i]);
        sw += w;
        st += w * times[i];
        sl += w * lons[i];
        stt += w * times[i] * times[i];
        stl += w * times[i] * lons[i];
    }
    let denom = sw * stt - st * st;
    let (angvel, lon0) = if denom.abs() > 1e-30 {
        let slope = (sw * stl - st * sl) / denom;
        let icept = (sl - slope * st) / sw;
        (slope, icept)
    } else {
        (0.0, sl / sw)
    };

    let mut cross2 = 0.0;
    let mut along2 = 0.0;
    for i in 0..n {
        let along = lons[i] - (lon0 + angvel * times[i]);
        cross2 += lats[i] * lats[i];
        along2 += along * along;
    }

    // Direction of prograde motion at the first point.
    let d = pole.cross(units[0]).normalize();
    let east = DVec3::Z.cross(units[0]);
    let east = if east.length() > 1e-12 {
        east.normalize()
    } else {
        DVec3::Y
    };
    let north = units[0].cross(east);
    let mut pa = d.dot(east).atan2(d.dot(north)) * DEGPRAD;
    if pa < 0.0 {
        pa += 360.0;
    }

    Ok(GreatCircleFit {
        pole_ra,
        pole_dec,
        angvel,
        pa,
        crosstrack_rms: (cross2 / n as f64).sqrt(),
        alongtrack_rms: (along2 / n as f64).sqrt(),
    })
}

/// Unwrap a degree sequence in place so successive samples never jump by
/// more than 180°.
pub fn unwrap_degrees(seq: &mut [f64]) {
    let mut offset = 0.0;
    for i in 1..seq.len() {
        let raw = seq[i] + offset;
        let prev = seq[i - 1];
        if raw - prev > 180.0 {
            offset -= 360.0;
        } else if raw - prev < -180.0 {
            offset += 360.0;
        }
        seq[i] += offset;
    }
}

/// Least-squares polynomial fit of `y` against `x`; returns coefficients
/// lowest order first, `order + 1` of them.
pub fn polyfit(x: &[f64], y: &[f64], order: usize) -> Result<Vec<f64>> {
    if x.len() != y.len() || x.len() <= order {
        return Err(Error::Usage(format!(
            "polyfit of order {} needs more than {} points, got {}",
            order,
            order,
            x.len()
        )));
    }
    let n = x.len();
    let mut design = DMatrix::<f64>::zeros(n, order + 1);
    for i in 0..n {
        let mut xp = 1.0;
        for j in 0..=order {
            design[(i, j)] = xp;
            xp *= x[i];
        }
    }
    let rhs = DVector::from_column_slice(y);
    let svd = design.svd(true, true);
    let sol = svd
        .solve(&rhs, 1e-12)
        .map_err(|e| Error::InvariantViolation(format!("polynomial fit failed: {e}")))?;
    Ok(sol.iter().copied().collect())
}

/// Median of a sample (average of the central pair for even counts).
pub fn median(values: &[f64]) -> f64 {
    let mut v: Vec<f64> = values.to_vec();
    v.sort_by(|a, b| a.total_cmp(b));
    let n = v.len();
    if n == 0 {
        return 0.0;
    }
    if n % 2 == 1 {
        v[n / 2]
    } else {
        0.5 * (v[n / 2 - 1] + v[n / 2])
    }
}

/// Mean and RMS scatter about the mean.
pub fn mean_rms(values: &[f64]) -> (f64, f64) {
    let n = values.len();
    if n == 0 {
        return (0.0, 0.0);
    }
    let mean = values.iter().sum::<f64>() / n as f64;
    let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n as f64;
    (mean, var.sqrt())
}
