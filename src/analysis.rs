//! Linkage quality metric and per-linkage diagnostics.
//!
//! The metric is shared by the linker (over state-space RMS) and the
//! purifier (over post-fit astrometric RMS). The diagnostics mirror the
//! single-row analysis record: global great-circle accelerations,
//! per-night tracklet statistics, magnitude statistics and the
//! PURE/MIXED rating.

use crate::error::Result;
use crate::orbitfit::OrbitFit;
use crate::spherical::{great_circle_fit, mean_rms, poleswitch, polyfit, unwrap_degrees};
use crate::types::{AU_KM, Detection, NIGHTSTEP};

/// Exponents of the cluster quality metric:
/// `uniquepoints^ptpow · obsnights^nightpow · timespan^timepow / rms^rmspow`.
///
/// A negative `ptpow` or `nightpow` switches to the nightly-product form:
/// the product over nights of each night's detection count, times the
/// timespan and RMS factors. An object seen twice on each of three
/// nights then scores 2·2·2 = 8 before the time and RMS terms.
///
/// The stock exponents (`ptpow` −1, `nightpow` 1, `timepow` 0, `rmspow`
/// 2) select the nightly-product form.
#[derive(Clone, Copy, Debug)]
pub struct MetricWeights {
    pub ptpow: i32,
    pub nightpow: i32,
    pub timepow: i32,
    pub rmspow: i32,
}

impl Default for MetricWeights {
    fn default() -> Self {
        Self {
            ptpow: -1,
            nightpow: 1,
            timepow: 0,
            rmspow: 2,
        }
    }
}

/// RMS floor keeping the metric finite for perfect fits.
const RMS_FLOOR: f64 = 1e-9;

impl MetricWeights {
    /// Evaluate the metric. `nightly_counts` holds the detection count
    /// of each observing night, in time order; it only matters under the
    /// negative-power override.
    pub fn evaluate(
        &self,
        uniquepoints: usize,
        obsnights: usize,
        timespan: f64,
        rms: f64,
        nightly_counts: &[usize],
    ) -> f64 {
        let rms = rms.max(RMS_FLOOR);
        let time_rms = timespan.max(0.0).powi(self.timepow) / rms.powi(self.rmspow);
        if self.ptpow < 0 || self.nightpow < 0 {
            let product: f64 = nightly_counts.iter().map(|&c| c as f64).product();
            product * time_rms
        } else {
            (uniquepoints as f64).powi(self.ptpow) * (obsnights as f64).powi(self.nightpow)
                * time_rms
        }
    }
}

/// Number of distinct observing nights in a time-sorted epoch list:
/// gaps of at least [`NIGHTSTEP`] days separate nights.
pub fn count_nights(sorted_mjds: &[f64]) -> usize {
    if sorted_mjds.is_empty() {
        return 0;
    }
    1 + sorted_mjds
        .windows(2)
        .filter(|w| w[1] - w[0] >= NIGHTSTEP)
        .count()
}

/// Detection count of each observing night, time order.
pub fn nightly_counts(sorted_mjds: &[f64]) -> Vec<usize> {
    let mut out = Vec::new();
    let mut run = 0usize;
    for (i, _) in sorted_mjds.iter().enumerate() {
        run += 1;
        let night_ends =
            i + 1 == sorted_mjds.len() || sorted_mjds[i + 1] - sorted_mjds[i] >= NIGHTSTEP;
        if night_ends {
            out.push(run);
            run = 0;
        }
    }
    out
}

/// Everything the one-row-per-linkage analysis record carries.
#[derive(Clone, Debug, Default)]
pub struct LinkageSummary {
    pub obsfile: String,
    pub astrom_rms: f64,
    pub chisq: f64,
    /// Total timespan, days
    pub timespan: f64,
    pub uniquepoints: usize,
    pub obsnights: usize,
    pub metric: f64,
    /// Semi-major axis, AU
    pub orbit_a: f64,
    pub orbit_e: f64,
    /// Inclination, degrees
    pub orbit_incl: f64,
    pub orbit_mjd: f64,
    /// Fitted state: position km, velocity km/s
    pub orbit_x: f64,
    pub orbit_y: f64,
    pub orbit_z: f64,
    pub orbit_vx: f64,
    pub orbit_vy: f64,
    pub orbit_vz: f64,
    pub orbit_eval_count: u32,
    pub avg_det_qual: f64,
    pub max_known_obj: i32,
    /// Nightly angular-velocity extremes, deg/day
    pub minvel: f64,
    pub maxvel: f64,
    /// Nightly great-circle residual extremes, arcsec
    pub min_gcr: f64,
    pub max_gcr: f64,
    /// Nightly position-angle extremes, degrees
    pub min_pa: f64,
    pub max_pa: f64,
    /// Nightly timespan extremes, hours
    pub min_timespan: f64,
    pub max_timespan: f64,
    /// Five longest nightly arcs, arcsec, descending (zero padded)
    pub arcs: [f64; 5],
    pub string_id: String,
    /// Night-to-night gap extremes, days
    pub min_nightstep: f64,
    pub max_nightstep: f64,
    pub magmean: f64,
    pub magrms: f64,
    pub magrange: f64,
    pub rating: String,
    /// Quadratic cross-track acceleration about the global great circle
    pub crossquad: f64,
    /// Quadratic along-track acceleration
    pub alongquad: f64,
    pub totalquad: f64,
}

/// Analyze a time-sorted linkage against its fitted orbit.
pub fn analyze_linkage(
    obsfile: &str,
    dets: &[Detection],
    fit: &OrbitFit,
    weights: &MetricWeights,
) -> Result<LinkageSummary> {
    let n = dets.len();
    let mjds: Vec<f64> = dets.iter().map(|d| d.mjd).collect();
    let timespan = mjds[n - 1] - mjds[0];

    let mut s = LinkageSummary {
        obsfile: obsfile.to_string(),
        astrom_rms: fit.residuals.astrom_rms,
        chisq: fit.residuals.chisq,
        timespan,
        uniquepoints: n,
        obsnights: count_nights(&mjds),
        orbit_a: fit.elements.a / AU_KM,
        orbit_e: fit.elements.e,
        orbit_incl: fit.elements.incl,
        orbit_mjd: fit.mjd,
        orbit_x: fit.state.pos.x,
        orbit_y: fit.state.pos.y,
        orbit_z: fit.state.pos.z,
        orbit_vx: fit.state.vel.x,
        orbit_vy: fit.state.vel.y,
        orbit_vz: fit.state.vel.z,
        orbit_eval_count: fit.eval_count,
        string_id: dets[0].idstring.clone(),
        ..Default::default()
    };

    // Averages, known-object tag, rating.
    let mut mags: Vec<f64> = Vec::new();
    s.rating = "PURE".into();
    for d in dets {
        s.avg_det_qual += d.det_qual as f64;
        s.max_known_obj = s.max_known_obj.max(d.known_obj);
        if d.mag > 0.0 {
            mags.push(d.mag);
        }
        if d.idstring != dets[0].idstring {
            s.rating = "MIXED".into();
        }
    }
    s.avg_det_qual /= n as f64;

    // Magnitude statistics; the range drops the extremes once the sample
    // is big enough to afford it.
    mags.sort_by(|a, b| a.total_cmp(b));
    match mags.len() {
        0 => {
            s.magmean = 0.0;
            s.magrms = 99.9;
            s.magrange = 99.9;
        }
        1 => {
            s.magmean = mags[0];
            s.magrms = 99.9;
            s.magrange = 99.9;
        }
        len => {
            let (mean, rms) = mean_rms(&mags);
            s.magmean = mean;
            s.magrms = rms;
            s.magrange = if len <= 5 {
                mags[len - 1] - mags[0]
            } else {
                mags[len - 2] - mags[1]
            };
        }
    }

    // Global great-circle fit and the quadratic accelerations about it.
    let pts: Vec<(f64, f64, f64)> = dets.iter().map(|d| (d.mjd, d.ra, d.dec)).collect();
    let global = great_circle_fit(&pts, None)?;
    let meantime = mjds.iter().sum::<f64>() / n as f64;
    let mut along: Vec<f64> = Vec::with_capacity(n);
    let mut cross: Vec<f64> = Vec::with_capacity(n);
    for d in dets {
        let (lon, lat) = poleswitch(d.ra, d.dec, global.pole_ra, global.pole_dec, 90.0);
        along.push(lon);
        cross.push(lat);
    }
    unwrap_degrees(&mut along);
    let times: Vec<f64> = mjds.iter().map(|t| t - meantime).collect();
    if n >= 3 {
        s.alongquad = polyfit(&times, &along, 2)?[2];
        s.crossquad = polyfit(&times, &cross, 2)?[2];
        s.totalquad = (s.alongquad * s.alongquad + s.crossquad * s.crossquad).sqrt();
    }

    // Per-night tracklet statistics.
    let mut angvels: Vec<f64> = Vec::new();
    let mut pas: Vec<f64> = Vec::new();
    let mut gcrs: Vec<f64> = Vec::new();
    let mut arcs: Vec<f64> = Vec::new();
    let mut spans: Vec<f64> = Vec::new();
    let mut nightsteps: Vec<f64> = Vec::new();
    let mut start = 0usize;
    for i in 0..n {
        let night_ends = i + 1 == n || mjds[i + 1] - mjds[i] >= NIGHTSTEP;
        if i + 1 < n && night_ends {
            nightsteps.push(mjds[i + 1] - mjds[i]);
        }
        if !night_ends {
            continue;
        }
        let night = &pts[start..=i];
        if night.len() >= 2 {
            let fit = great_circle_fit(night, None)?;
            angvels.push(fit.angvel);
            pas.push(fit.pa);
            if night.len() >= 3 {
                gcrs.push(
                    (fit.crosstrack_rms.powi(2) + fit.alongtrack_rms.powi(2)).sqrt() * 3600.0,
                );
            }
            let span = night[night.len() - 1].0 - night[0].0;
            arcs.push(span * fit.angvel * 3600.0);
            spans.push(span * 24.0);
        } else {
            // Singletons carry sentinel statistics.
            angvels.push(-1.0);
            pas.push(-999.0);
            arcs.push(0.0);
            spans.push(0.0);
        }
        start = i + 1;
    }
    angvels.sort_by(|a, b| a.total_cmp(b));
    pas.sort_by(|a, b| a.total_cmp(b));
    spans.sort_by(|a, b| a.total_cmp(b));
    arcs.sort_by(|a, b| a.total_cmp(b));
    if let (Some(&lo), Some(&hi)) = (angvels.first(), angvels.last()) {
        s.minvel = lo;
        s.maxvel = hi;
    }
    if let (Some(&lo), Some(&hi)) = (pas.first(), pas.last()) {
        s.min_pa = lo;
        s.max_pa = hi;
    }
    if let (Some(&lo), Some(&hi)) = (spans.first(), spans.last()) {
        s.min_timespan = lo;
        s.max_timespan = hi;
    }
    if !gcrs.is_empty() {
        gcrs.sort_by(|a, b| a.total_cmp(b));
        s.min_gcr = gcrs[0];
        s.max_gcr = gcrs[gcrs.len() - 1];
    }
    for (k, slot) in s.arcs.iter_mut().enumerate() {
        *slot = if k < arcs.len() {
            arcs[arcs.len() - 1 - k]
        } else {
            0.0
        };
    }
    if !nightsteps.is_empty() {
        nightsteps.sort_by(|a, b| a.total_cmp(b));
        s.min_nightstep = nightsteps[0];
        s.max_nightstep = nightsteps[nightsteps.len() - 1];
    }

    let counts = nightly_counts(&mjds);
    s.metric = weights.evaluate(n, s.obsnights, timespan, s.astrom_rms, &counts);
    Ok(s)
}

impl LinkageSummary {
    /// The single CSV row of the analysis contract.
    pub fn csv_row(&self) -> String {
        let mut row = String::new();
        row.push_str(&format!(
            "{},{:.6},{:.6},{:.6},{},{},{:.6},{:.6},{:.6},{:.6},{:.10},",
            self.obsfile,
            self.astrom_rms,
            self.chisq,
            self.timespan,
            self.uniquepoints,
            self.obsnights,
            self.metric,
            self.orbit_a,
            self.orbit_e,
            self.orbit_incl,
            self.orbit_mjd,
        ));
        row.push_str(&format!(
            "{:.3},{:.3},{:.3},{:.10},{:.10},{:.10},{},",
            self.orbit_x,
            self.orbit_y,
            self.orbit_z,
            self.orbit_vx,
            self.orbit_vy,
            self.orbit_vz,
            self.orbit_eval_count,
        ));
        row.push_str(&format!(
            "{:.6},{},{:.6},{:.6},{:.6},{:.6},{:.6},{:.6},{:.6},{:.6},",
            self.avg_det_qual,
            self.max_known_obj,
            self.minvel,
            self.maxvel,
            self.min_gcr,
            self.max_gcr,
            self.min_pa,
            self.max_pa,
            self.min_timespan,
            self.max_timespan,
        ));
        row.push_str(&format!(
            "{:.6},{:.6},{:.6},{:.6},{:.6},{},{:.6},{:.6},{:.6},{:.6},{:.6},{},{:.6},{:.6},{:.6}",
            self.arcs[0],
            self.arcs[1],
            self.arcs[2],
            self.arcs[3],
            self.arcs[4],
            self.string_id,
            self.min_nightstep,
            self.max_nightstep,
            self.magmean,
            self.magrms,
            self.magrange,
            self.rating,
            self.crossquad,
            self.alongquad,
            self.totalquad,
        ));
        row
    }
}
