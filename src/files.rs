//! Readers and writers for the pipeline's file contracts: detection
//! catalogs, image logs, tracklet files, index relations, hypothesis
//! lists and the linkage-analysis CSV.
//!
//! Writers reproduce the documented column orders and precisions
//! exactly, so re-reading a written file yields the same values a
//! downstream run would see. Readers skip `#` comment/header lines, log
//! and ignore unknown trailing columns, and fail with position context
//! on malformed required fields.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use glam::DVec3;

use crate::analysis::LinkageSummary;
use crate::error::{Error, Result};
use crate::types::{
    Detection, Hypothesis, Image, IndexPair, SHORTSTRINGLEN, StateVector, Tracklet,
};

fn parse_field<T: std::str::FromStr>(
    tok: &str,
    what: &str,
    path: &Path,
    lineno: usize,
) -> Result<T> {
    tok.trim().parse().map_err(|_| {
        Error::parse(path, lineno, format!("unparseable {what}: '{tok}'"))
    })
}

fn data_lines(text: &str) -> impl Iterator<Item = (usize, &str)> {
    text.lines()
        .enumerate()
        .map(|(i, l)| (i + 1, l.trim()))
        .filter(|(_, l)| !l.is_empty() && !l.starts_with('#'))
}

/// Detection catalog header.
pub const DETECTION_HEADER: &str = "#MJD,RA,Dec,mag,trail_len,trail_PA,sigmag,sig_across,sig_along,image,idstring,band,obscode,known_obj,det_qual,origindex";

/// Write a detection catalog in the hldet CSV layout.
pub fn write_detection_file(path: impl AsRef<Path>, dets: &[Detection]) -> Result<()> {
    let path = path.as_ref();
    let mut out = String::new();
    out.push_str(DETECTION_HEADER);
    out.push('\n');
    for d in dets {
        let _ = writeln!(
            out,
            "{:.7},{:.7},{:.7},{:.4},{:.2},{:.2},{:.4},{:.3},{:.3},{},{},{},{},{},{},{}",
            d.mjd,
            d.ra,
            d.dec,
            d.mag,
            d.trail_len,
            d.trail_pa,
            d.sigmag,
            d.sig_across,
            d.sig_along,
            d.image,
            d.idstring,
            d.band,
            d.obscode,
            d.known_obj,
            d.det_qual,
            d.origindex
        );
    }
    fs::write(path, out).map_err(|e| Error::io(path, e))
}

/// Read an hldet CSV detection catalog.
pub fn read_detection_file(path: impl AsRef<Path>) -> Result<Vec<Detection>> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    let mut dets = Vec::new();
    for (lineno, line) in data_lines(&text) {
        let toks: Vec<&str> = line.split(',').collect();
        if toks.len() < 16 {
            return Err(Error::parse(
                path,
                lineno,
                format!("expected 16 fields, found {}", toks.len()),
            ));
        }
        if toks.len() > 16 {
            log::warn!(
                "{}:{lineno}: ignoring {} unknown trailing columns",
                path.display(),
                toks.len() - 16
            );
        }
        let mut idstring = toks[10].trim().to_string();
        if idstring.len() > SHORTSTRINGLEN {
            log::warn!("{}:{lineno}: idstring truncated to {SHORTSTRINGLEN} chars", path.display());
            idstring.truncate(SHORTSTRINGLEN);
        }
        dets.push(Detection {
            mjd: parse_field(toks[0], "MJD", path, lineno)?,
            ra: parse_field(toks[1], "RA", path, lineno)?,
            dec: parse_field(toks[2], "Dec", path, lineno)?,
            mag: parse_field(toks[3], "mag", path, lineno)?,
            trail_len: parse_field(toks[4], "trail_len", path, lineno)?,
            trail_pa: parse_field(toks[5], "trail_PA", path, lineno)?,
            sigmag: parse_field(toks[6], "sigmag", path, lineno)?,
            sig_across: parse_field(toks[7], "sig_across", path, lineno)?,
            sig_along: parse_field(toks[8], "sig_along", path, lineno)?,
            image: parse_field(toks[9], "image", path, lineno)?,
            idstring,
            band: toks[11].trim().to_string(),
            obscode: toks[12].trim().to_string(),
            known_obj: parse_field(toks[13], "known_obj", path, lineno)?,
            det_qual: parse_field(toks[14], "det_qual", path, lineno)?,
            origindex: parse_field(toks[15], "origindex", path, lineno)?,
        });
    }
    Ok(dets)
}

/// Write an image log: whitespace-separated
/// `MJD RA Dec obscode X Y Z VX VY VZ startind endind exptime`.
pub fn write_image_file(path: impl AsRef<Path>, images: &[Image]) -> Result<()> {
    let path = path.as_ref();
    let mut out = String::new();
    for im in images {
        let _ = writeln!(
            out,
            "{:.8} {:.8} {:.8} {} {:.1} {:.1} {:.1} {:.4} {:.4} {:.4} {} {} {}",
            im.mjd,
            im.ra,
            im.dec,
            im.obscode,
            im.observer.pos.x,
            im.observer.pos.y,
            im.observer.pos.z,
            im.observer.vel.x,
            im.observer.vel.y,
            im.observer.vel.z,
            im.startind,
            im.endind,
            im.exptime
        );
    }
    fs::write(path, out).map_err(|e| Error::io(path, e))
}

/// Read an image log.
pub fn read_image_file(path: impl AsRef<Path>) -> Result<Vec<Image>> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    let mut images = Vec::new();
    for (lineno, line) in data_lines(&text) {
        let toks: Vec<&str> = line.split_whitespace().collect();
        if toks.len() < 13 {
            return Err(Error::parse(
                path,
                lineno,
                format!("expected 13 fields, found {}", toks.len()),
            ));
        }
        images.push(Image {
            mjd: parse_field(toks[0], "MJD", path, lineno)?,
            ra: parse_field(toks[1], "RA", path, lineno)?,
            dec: parse_field(toks[2], "Dec", path, lineno)?,
            obscode: toks[3].to_string(),
            observer: StateVector::new(
                DVec3::new(
                    parse_field(toks[4], "X", path, lineno)?,
                    parse_field(toks[5], "Y", path, lineno)?,
                    parse_field(toks[6], "Z", path, lineno)?,
                ),
                DVec3::new(
                    parse_field(toks[7], "VX", path, lineno)?,
                    parse_field(toks[8], "VY", path, lineno)?,
                    parse_field(toks[9], "VZ", path, lineno)?,
                ),
            ),
            startind: parse_field(toks[10], "startind", path, lineno)?,
            endind: parse_field(toks[11], "endind", path, lineno)?,
            exptime: parse_field(toks[12], "exptime", path, lineno)?,
        });
    }
    Ok(images)
}

/// Tracklet file header.
pub const TRACKLET_HEADER: &str = "#Image1,RA1,Dec1,Image2,RA2,Dec2,npts,trk_ID";

/// Write a tracklet summary file.
pub fn write_tracklet_file(path: impl AsRef<Path>, tracklets: &[Tracklet]) -> Result<()> {
    let path = path.as_ref();
    let mut out = String::new();
    out.push_str(TRACKLET_HEADER);
    out.push('\n');
    for t in tracklets {
        let _ = writeln!(
            out,
            "{},{:.7},{:.7},{},{:.7},{:.7},{},{}",
            t.img1, t.ra1, t.dec1, t.img2, t.ra2, t.dec2, t.npts, t.trk_id
        );
    }
    fs::write(path, out).map_err(|e| Error::io(path, e))
}

/// Read a tracklet summary file.
pub fn read_tracklet_file(path: impl AsRef<Path>) -> Result<Vec<Tracklet>> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    let mut tracklets = Vec::new();
    for (lineno, line) in data_lines(&text) {
        let toks: Vec<&str> = line.split(',').collect();
        if toks.len() < 8 {
            return Err(Error::parse(
                path,
                lineno,
                format!("expected 8 fields, found {}", toks.len()),
            ));
        }
        tracklets.push(Tracklet {
            img1: parse_field(toks[0], "Image1", path, lineno)?,
            ra1: parse_field(toks[1], "RA1", path, lineno)?,
            dec1: parse_field(toks[2], "Dec1", path, lineno)?,
            img2: parse_field(toks[3], "Image2", path, lineno)?,
            ra2: parse_field(toks[4], "RA2", path, lineno)?,
            dec2: parse_field(toks[5], "Dec2", path, lineno)?,
            npts: parse_field(toks[6], "npts", path, lineno)?,
            trk_id: parse_field(toks[7], "trk_ID", path, lineno)?,
        });
    }
    Ok(tracklets)
}

/// Write an index relation (trk2det or clust2det) under the given
/// header.
pub fn write_pair_file(path: impl AsRef<Path>, header: &str, pairs: &[IndexPair]) -> Result<()> {
    let path = path.as_ref();
    let mut out = String::new();
    out.push_str(header);
    out.push('\n');
    for p in pairs {
        let _ = writeln!(out, "{},{}", p.i1, p.i2);
    }
    fs::write(path, out).map_err(|e| Error::io(path, e))
}

/// trk2det header.
pub const TRK2DET_HEADER: &str = "#trk_ID,detnum";
/// clust2det header.
pub const CLUST2DET_HEADER: &str = "#clusternum,detnum";

/// Read an index relation.
pub fn read_pair_file(path: impl AsRef<Path>) -> Result<Vec<IndexPair>> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    let mut pairs = Vec::new();
    for (lineno, line) in data_lines(&text) {
        let toks: Vec<&str> = line.split(',').collect();
        if toks.len() < 2 {
            return Err(Error::parse(
                path,
                lineno,
                format!("expected 2 fields, found {}", toks.len()),
            ));
        }
        pairs.push(IndexPair::new(
            parse_field(toks[0], "owner id", path, lineno)?,
            parse_field(toks[1], "member index", path, lineno)?,
        ));
    }
    Ok(pairs)
}

/// Read a hypothesis list: whitespace `r rdot rddot` per line, r in AU,
/// rdot AU/day, rddot AU/day².
pub fn read_hypothesis_file(path: impl AsRef<Path>) -> Result<Vec<Hypothesis>> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    let mut hyps = Vec::new();
    for (lineno, line) in data_lines(&text) {
        let toks: Vec<&str> = line.split_whitespace().collect();
        if toks.len() < 3 {
            return Err(Error::parse(
                path,
                lineno,
                format!("expected 3 fields, found {}", toks.len()),
            ));
        }
        hyps.push(Hypothesis::new(
            parse_field(toks[0], "heliocentric distance", path, lineno)?,
            parse_field(toks[1], "radial velocity", path, lineno)?,
            parse_field(toks[2], "radial acceleration", path, lineno)?,
        ));
    }
    Ok(hyps)
}

/// Write linkage-analysis rows, one CSV line per linkage.
pub fn write_summary_file(path: impl AsRef<Path>, rows: &[LinkageSummary]) -> Result<()> {
    let path = path.as_ref();
    let mut out = String::new();
    for row in rows {
        out.push_str(&row.csv_row());
        out.push('\n');
    }
    fs::write(path, out).map_err(|e| Error::io(path, e))
}
