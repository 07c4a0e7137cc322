//! Detection labeling: carry provenance identifiers from a labeling
//! catalog onto matching detections.
//!
//! Matching runs in the 4D (scaled time, unit vector) space through a
//! k-d tree over the unlabeled detections, so a label only lands on a
//! detection that agrees in both sky position and epoch. Matched
//! detections take the labeling idstring and a known-object tag of 999;
//! everything else passes through untouched.

use crate::kdtree::{KdTree, time_sky_point};
use crate::spherical::median;
use crate::types::{ASECPRAD, Detection, SHORTSTRINGLEN, SOLARDAY};

/// Labeler tuning.
#[derive(Clone, Debug)]
pub struct LabelConfig {
    /// Match radius in the 4D metric, arcsec
    pub matchrad_arcsec: f64,
    /// Degrees of sky separation equivalent to one day of time
    /// separation (24 makes one second of time one arcsecond)
    pub timescale_deg_per_day: f64,
    /// Offset added to labeling epochs before matching, seconds
    pub time_offset_sec: f64,
    /// Label only the nearest neighbour within the radius instead of
    /// every detection in range
    pub use_nearest: bool,
}

impl Default for LabelConfig {
    fn default() -> Self {
        Self {
            matchrad_arcsec: 1.0,
            timescale_deg_per_day: 24.0,
            time_offset_sec: 0.0,
            use_nearest: false,
        }
    }
}

/// One labeling-catalog row.
#[derive(Clone, Debug, PartialEq)]
pub struct LabelRow {
    pub idstring: String,
    pub mjd: f64,
    pub ra: f64,
    pub dec: f64,
}

/// Known-object tag written on labeled detections.
pub const KNOWN_OBJ_LABELED: i32 = 999;

/// Apply labeling rows to a detection catalog in place. Returns the
/// number of detections whose idstring changed hands.
pub fn label_detections(dets: &mut [Detection], labels: &[LabelRow], cfg: &LabelConfig) -> usize {
    if dets.is_empty() || labels.is_empty() {
        return 0;
    }
    // Anchor the time axis at the catalog's median epoch so the scaled
    // time coordinate stays small.
    let mjds: Vec<f64> = dets.iter().map(|d| d.mjd).collect();
    let mjd_ref = median(&mjds);

    let points: Vec<_> = dets
        .iter()
        .enumerate()
        .map(|(i, d)| {
            time_sky_point(d.mjd, mjd_ref, d.ra, d.dec, cfg.timescale_deg_per_day, i)
        })
        .collect();
    let tree = KdTree::build(&points);
    let radius = cfg.matchrad_arcsec / ASECPRAD;

    let mut labeled = 0usize;
    for row in labels {
        let query = time_sky_point(
            row.mjd + cfg.time_offset_sec / SOLARDAY,
            mjd_ref,
            row.ra,
            row.dec,
            cfg.timescale_deg_per_day,
            0,
        );
        let mut apply = |index: usize| {
            let det = &mut dets[index];
            let mut id = row.idstring.clone();
            id.truncate(SHORTSTRINGLEN);
            if det.idstring != id || det.known_obj != KNOWN_OBJ_LABELED {
                labeled += 1;
            }
            det.idstring = id;
            det.known_obj = KNOWN_OBJ_LABELED;
        };
        if cfg.use_nearest {
            if let Some((index, dist)) = tree.nearest(&query.coords)
                && dist <= radius
            {
                apply(index);
            }
        } else {
            for index in tree.range_query(&query.coords, radius) {
                apply(index);
            }
        }
    }
    log::debug!("labeler: {} of {} rows changed detections", labeled, labels.len());
    labeled
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> Vec<Detection> {
        (0..10)
            .map(|k| {
                let mut d =
                    Detection::at(60000.0 + k as f64 * 0.01, 150.0 + k as f64 * 0.005, -3.0, "X05");
                d.idstring = format!("anon{k:02}");
                d.origindex = k as i64;
                d
            })
            .collect()
    }

    #[test]
    fn labels_only_matching_detections() {
        let mut dets = catalog();
        // Label the third detection, 0.3 arcsec off its position.
        let labels = vec![LabelRow {
            idstring: "2025 AB123".into(),
            mjd: dets[3].mjd,
            ra: dets[3].ra + 0.3 / 3600.0,
            dec: dets[3].dec,
        }];
        let n = label_detections(&mut dets, &labels, &LabelConfig::default());
        assert_eq!(n, 1);
        assert_eq!(dets[3].idstring, "2025 AB123");
        assert_eq!(dets[3].known_obj, KNOWN_OBJ_LABELED);
        for (k, d) in dets.iter().enumerate() {
            if k != 3 {
                assert_eq!(d.idstring, format!("anon{k:02}"));
                assert_eq!(d.known_obj, 0);
            }
        }
    }

    #[test]
    fn time_separation_blocks_position_matches() {
        let mut dets = catalog();
        // Same sky position as detection 0 but twelve hours away: the
        // scaled time axis (24 deg/day) pushes it far outside 1 arcsec.
        let labels = vec![LabelRow {
            idstring: "ghost".into(),
            mjd: dets[0].mjd + 0.5,
            ra: dets[0].ra,
            dec: dets[0].dec,
        }];
        let n = label_detections(&mut dets, &labels, &LabelConfig::default());
        assert_eq!(n, 0);
        assert_eq!(dets[0].idstring, "anon00");
    }

    #[test]
    fn nearest_mode_labels_single_best() {
        let mut dets = catalog();
        // Two detections straddle the label position; nearest mode must
        // touch only the closer one.
        dets[1].mjd = dets[0].mjd;
        dets[1].ra = dets[0].ra + 0.4 / 3600.0;
        let labels = vec![LabelRow {
            idstring: "close".into(),
            mjd: dets[0].mjd,
            ra: dets[0].ra + 0.1 / 3600.0,
            dec: dets[0].dec,
        }];
        let cfg = LabelConfig {
            use_nearest: true,
            ..Default::default()
        };
        let n = label_detections(&mut dets, &labels, &cfg);
        assert_eq!(n, 1);
        assert_eq!(dets[0].idstring, "close");
        assert_eq!(dets[1].idstring, "anon01");
    }

    #[test]
    fn long_labels_truncate_to_short_string() {
        let mut dets = catalog();
        let labels = vec![LabelRow {
            idstring: "a".repeat(SHORTSTRINGLEN + 10),
            mjd: dets[0].mjd,
            ra: dets[0].ra,
            dec: dets[0].dec,
        }];
        label_detections(&mut dets, &labels, &LabelConfig::default());
        assert_eq!(dets[0].idstring.len(), SHORTSTRINGLEN);
    }
}
