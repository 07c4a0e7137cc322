//! Cross-run merging of tracklet-builder outputs.
//!
//! Each run carries its own image list, detection catalog, tracklets and
//! trk2det relation, all index-coupled. Merging unions the image lists,
//! rebases every index onto the master, de-duplicates detections that
//! fall within the match radius on the same image, and collapses
//! tracklets whose member detection tuples coincide.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::spherical::angular_dist_deg;
use crate::types::{Detection, IMAGETIMETOL, Image, IndexPair, SOLARDAY, Tracklet};

/// Merger tuning.
#[derive(Clone, Debug)]
pub struct MergeConfig {
    /// Two detections on the same image within this separation (arcsec)
    /// are duplicates
    pub matchrad_arcsec: f64,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            matchrad_arcsec: 0.1,
        }
    }
}

/// One tracklet-builder run (or the merged master): four index-coupled
/// catalogs.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TrackletRun {
    pub images: Vec<Image>,
    pub detections: Vec<Detection>,
    pub tracklets: Vec<Tracklet>,
    pub trk2det: Vec<IndexPair>,
}

/// Merge any number of runs into one master run. The master's detection
/// catalog is sorted by (image, Dec, RA); image ranges are recomputed so
/// the partition invariant holds on output.
pub fn merge_runs(runs: Vec<TrackletRun>, cfg: &MergeConfig) -> Result<TrackletRun> {
    let mut runs = runs.into_iter();
    let Some(first) = runs.next() else {
        return Err(Error::Usage("merge called with no input runs".into()));
    };
    let mut master = canonicalize(first, cfg)?;
    for run in runs {
        master = merge_two(master, run, cfg)?;
    }
    collapse_duplicate_tracklets(&mut master)?;
    rebuild_image_ranges(&mut master);
    Ok(master)
}

/// Bring a single run into master form (sorted detections, rebuilt
/// ranges) without touching its content.
fn canonicalize(run: TrackletRun, cfg: &MergeConfig) -> Result<TrackletRun> {
    merge_two(
        TrackletRun::default(),
        run,
        cfg,
    )
}

fn merge_two(master: TrackletRun, incoming: TrackletRun, cfg: &MergeConfig) -> Result<TrackletRun> {
    let tol_days = IMAGETIMETOL / SOLARDAY;

    // Union of the image lists, time-sorted, duplicates by
    // (MJD within tolerance, obscode) removed.
    let mut combined_images: Vec<(Image, usize)> = Vec::new();
    for (k, img) in master.images.iter().chain(incoming.images.iter()).enumerate() {
        combined_images.push((img.clone(), k));
    }
    combined_images.sort_by(|a, b| {
        a.0.mjd
            .total_cmp(&b.0.mjd)
            .then_with(|| a.0.obscode.cmp(&b.0.obscode))
            .then(a.1.cmp(&b.1))
    });
    let mut union_images: Vec<Image> = Vec::new();
    let mut image_map: Vec<usize> = vec![usize::MAX; combined_images.len()];
    for (img, origin) in &combined_images {
        // Match against the tail of the union within the time window.
        let mut matched = None;
        for (ui, u) in union_images.iter().enumerate().rev() {
            if img.mjd - u.mjd > tol_days {
                break;
            }
            if (img.mjd - u.mjd).abs() < tol_days && img.obscode == u.obscode {
                matched = Some(ui);
                break;
            }
        }
        image_map[*origin] = match matched {
            Some(ui) => ui,
            None => {
                union_images.push(img.clone());
                union_images.len() - 1
            }
        };
    }
    let master_image_count = master.images.len();
    let map_image = |origin_is_master: bool, idx: usize| -> Result<usize> {
        let flat = if origin_is_master {
            idx
        } else {
            master_image_count + idx
        };
        image_map
            .get(flat)
            .copied()
            .filter(|&m| m != usize::MAX)
            .ok_or_else(|| Error::LookupFail(format!("image index {idx} has no master match")))
    };

    // Concatenate detections, rebasing image references; remember each
    // detection's origin so tracklet references can follow it through
    // the sort and de-duplication.
    let master_det_count = master.detections.len();
    let mut tagged: Vec<(Detection, usize)> = Vec::new();
    for (k, det) in master.detections.iter().enumerate() {
        let mut d = det.clone();
        d.image = map_image(true, d.image)?;
        tagged.push((d, k));
    }
    for (k, det) in incoming.detections.iter().enumerate() {
        let mut d = det.clone();
        d.image = map_image(false, d.image)?;
        tagged.push((d, master_det_count + k));
    }
    tagged.sort_by(|a, b| {
        a.0.image
            .cmp(&b.0.image)
            .then_with(|| a.0.dec.total_cmp(&b.0.dec))
            .then_with(|| a.0.ra.total_cmp(&b.0.ra))
            .then(a.1.cmp(&b.1))
    });

    // Count duplicate partners per detection within the match radius.
    let deg_tol = cfg.matchrad_arcsec / 3600.0;
    let n = tagged.len();
    let window = |i: usize| -> (usize, usize) {
        let mut lo = i;
        while lo > 0
            && tagged[lo - 1].0.image == tagged[i].0.image
            && tagged[i].0.dec - tagged[lo - 1].0.dec <= deg_tol
        {
            lo -= 1;
        }
        let mut hi = i;
        while hi + 1 < n
            && tagged[hi + 1].0.image == tagged[i].0.image
            && tagged[hi + 1].0.dec - tagged[i].0.dec <= deg_tol
        {
            hi += 1;
        }
        (lo, hi)
    };
    let is_dup = |i: usize, j: usize| -> bool {
        i != j
            && tagged[i].0.image == tagged[j].0.image
            && angular_dist_deg(
                tagged[i].0.ra,
                tagged[i].0.dec,
                tagged[j].0.ra,
                tagged[j].0.dec,
            ) <= deg_tol
    };
    let mut partner_counts: Vec<usize> = vec![1; n];
    for i in 0..n {
        let (lo, hi) = window(i);
        partner_counts[i] = 1 + (lo..=hi).filter(|&j| is_dup(i, j)).count();
    }

    // Keep the member of each duplicate group with the most partners.
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| partner_counts[b].cmp(&partner_counts[a]).then(a.cmp(&b)));
    let mut claimed_by: Vec<Option<usize>> = vec![None; n];
    for &i in &order {
        if claimed_by[i].is_some() {
            continue;
        }
        claimed_by[i] = Some(i);
        let (lo, hi) = window(i);
        for j in lo..=hi {
            if claimed_by[j].is_none() && is_dup(i, j) {
                claimed_by[j] = Some(i);
            }
        }
    }

    // Final catalog keeps temp order; every temp index maps to its
    // surviving representative.
    let mut final_pos: Vec<usize> = vec![usize::MAX; n];
    let mut detections: Vec<Detection> = Vec::new();
    for i in 0..n {
        if claimed_by[i] == Some(i) {
            final_pos[i] = detections.len();
            detections.push(tagged[i].0.clone());
        }
    }
    let mut origin_to_final: Vec<usize> = vec![usize::MAX; master_det_count + incoming.detections.len()];
    for i in 0..n {
        let central = claimed_by[i].ok_or_else(|| {
            Error::InvariantViolation("unclaimed detection after de-duplication".into())
        })?;
        origin_to_final[tagged[i].1] = final_pos[central];
    }

    // Tracklets: rebase image references and offset incoming ids.
    let master_trk_count = master.tracklets.len();
    let mut tracklets = Vec::with_capacity(master_trk_count + incoming.tracklets.len());
    for trk in &master.tracklets {
        let mut t = trk.clone();
        t.img1 = map_image(true, t.img1)?;
        t.img2 = map_image(true, t.img2)?;
        tracklets.push(t);
    }
    for trk in &incoming.tracklets {
        let mut t = trk.clone();
        t.img1 = map_image(false, t.img1)?;
        t.img2 = map_image(false, t.img2)?;
        t.trk_id += master_trk_count;
        tracklets.push(t);
    }
    let mut trk2det = Vec::with_capacity(master.trk2det.len() + incoming.trk2det.len());
    for pair in &master.trk2det {
        trk2det.push(IndexPair::new(pair.i1, origin_to_final[pair.i2]));
    }
    for pair in &incoming.trk2det {
        trk2det.push(IndexPair::new(
            pair.i1 + master_trk_count,
            origin_to_final[master_det_count + pair.i2],
        ));
    }
    trk2det.sort();
    trk2det.dedup();

    Ok(TrackletRun {
        images: union_images,
        detections,
        tracklets,
        trk2det,
    })
}

/// Collapse tracklets sharing the same member detection tuple, keeping
/// the lowest id, and renumber sequentially.
fn collapse_duplicate_tracklets(run: &mut TrackletRun) -> Result<()> {
    let mut members: Vec<Vec<usize>> = vec![Vec::new(); run.tracklets.len()];
    for pair in &run.trk2det {
        if pair.i1 >= members.len() {
            return Err(Error::InvariantViolation(format!(
                "trk2det references tracklet {} of {}",
                pair.i1,
                members.len()
            )));
        }
        members[pair.i1].push(pair.i2);
    }
    let mut seen: HashMap<Vec<usize>, usize> = HashMap::new();
    let mut kept: Vec<Tracklet> = Vec::new();
    let mut mapping: Vec<IndexPair> = Vec::new();
    for (t, trk) in run.tracklets.iter().enumerate() {
        let mut key = members[t].clone();
        key.sort_unstable();
        if key.len() < 2 {
            return Err(Error::InvariantViolation(format!(
                "tracklet {t} has only {} member detections",
                key.len()
            )));
        }
        // First occurrence of a member tuple is the keeper; later copies
        // vanish along with their mapping rows.
        if seen.contains_key(&key) {
            continue;
        }
        let id = kept.len();
        seen.insert(key, id);
        let mut k = trk.clone();
        k.trk_id = id;
        kept.push(k);
        for &d in &members[t] {
            mapping.push(IndexPair::new(id, d));
        }
    }
    mapping.sort();
    mapping.dedup();
    run.tracklets = kept;
    run.trk2det = mapping;
    Ok(())
}

/// Recompute `startind`/`endind` from the (image, Dec, RA)-sorted
/// detection catalog so the partition invariant holds.
fn rebuild_image_ranges(run: &mut TrackletRun) {
    let mut cursor = 0usize;
    for (i, img) in run.images.iter_mut().enumerate() {
        img.startind = cursor;
        while cursor < run.detections.len() && run.detections[cursor].image == i {
            cursor += 1;
        }
        img.endind = cursor;
    }
}
