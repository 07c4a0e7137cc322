//! File-level scenarios: labeling a detection catalog on disk, and
//! merging two tracklet-builder runs through their file contracts.

mod common;

use std::fs;
use std::path::PathBuf;

use common::{build_survey, circular_state, survey_epochs};
use helioseek::files::{
    TRK2DET_HEADER, read_detection_file, read_image_file, read_pair_file, read_tracklet_file,
    write_detection_file, write_image_file, write_pair_file, write_tracklet_file,
};
use helioseek::label::{KNOWN_OBJ_LABELED, LabelConfig, LabelRow, label_detections};
use helioseek::merge::{MergeConfig, TrackletRun, merge_runs};
use helioseek::tracklet::{TrackletConfig, make_tracklets};

fn tmpdir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("helioseek_e2e").join(name);
    fs::create_dir_all(&dir).unwrap();
    dir
}

/// Scenario: a labeling file matching 100 of 120 detections within one
/// arcsecond replaces exactly those idstrings; every other row of the
/// rewritten catalog is bit-identical.
#[test]
fn labeler_round_trip_preserves_unmatched_rows() {
    let dir = tmpdir("label");
    let truth = circular_state(2.5, 20.0, 5.0);
    let epochs = survey_epochs(60, 2, 0.5, 1.0 / 24.0);
    let tcfg = TrackletConfig::default();
    let (mut dets, _) = build_survey(&[(truth, "anon")], &epochs, &tcfg);
    assert_eq!(dets.len(), 120);

    let before_path = dir.join("dets_before.csv");
    write_detection_file(&before_path, &dets).unwrap();

    // Label the first 100 detections, each offset by 0.4 arcsec.
    let labels: Vec<LabelRow> = dets
        .iter()
        .take(100)
        .map(|d| LabelRow {
            idstring: "2024 XY77".into(),
            mjd: d.mjd,
            ra: d.ra + 0.4 / 3600.0 / (d.dec.to_radians().cos()),
            dec: d.dec,
        })
        .collect();
    let mut relabeled = read_detection_file(&before_path).unwrap();
    let n = label_detections(&mut relabeled, &labels, &LabelConfig::default());
    assert_eq!(n, 100);

    let after_path = dir.join("dets_after.csv");
    write_detection_file(&after_path, &relabeled).unwrap();

    let before = fs::read_to_string(&before_path).unwrap();
    let after = fs::read_to_string(&after_path).unwrap();
    let mut changed = 0;
    for (lb, la) in before.lines().zip(after.lines()) {
        if lb != la {
            changed += 1;
            assert!(la.contains("2024 XY77"));
            assert!(la.contains(&format!(",{KNOWN_OBJ_LABELED},")));
        }
    }
    assert_eq!(changed, 100, "exactly the labeled rows may differ");

    // Unlabeled detections kept their original identities.
    assert!(relabeled.iter().filter(|d| d.idstring == "anon").count() == 20);
}

/// Scenario: two runs sharing five images and their detections merge to
/// the union, through the on-disk contracts.
#[test]
fn two_runs_merge_to_union_via_files() {
    let dir = tmpdir("merge");
    let truth_a = circular_state(2.5, 20.0, 5.0);
    let truth_b = circular_state(2.7, 50.0, 2.0);
    let tcfg = TrackletConfig {
        minvel: 0.01,
        ..Default::default()
    };

    // Run A: nights 0-4. Run B: nights 3-7 (nights 3 and 4 shared).
    let epochs_a = survey_epochs(5, 2, 1.0, 1.0 / 24.0);
    let epochs_b: Vec<f64> = survey_epochs(5, 2, 1.0, 1.0 / 24.0)
        .into_iter()
        .map(|t| t + 3.0)
        .collect();
    let (dets_a, images_a) = build_survey(&[(truth_a, "a"), (truth_b, "b")], &epochs_a, &tcfg);
    let (dets_b, images_b) = build_survey(&[(truth_a, "a"), (truth_b, "b")], &epochs_b, &tcfg);
    let trks_a = make_tracklets(&dets_a, &images_a, &tcfg).unwrap();
    let trks_b = make_tracklets(&dets_b, &images_b, &tcfg).unwrap();

    // Pass both runs through their file representations.
    let mut runs = Vec::new();
    for (tag, dets, images, trks) in [
        ("a", &dets_a, &images_a, &trks_a),
        ("b", &dets_b, &images_b, &trks_b),
    ] {
        let ipath = dir.join(format!("images_{tag}.txt"));
        let dpath = dir.join(format!("dets_{tag}.csv"));
        let tpath = dir.join(format!("trk_{tag}.csv"));
        let ppath = dir.join(format!("trk2det_{tag}.csv"));
        write_image_file(&ipath, images).unwrap();
        write_detection_file(&dpath, dets).unwrap();
        write_tracklet_file(&tpath, &trks.tracklets).unwrap();
        write_pair_file(&ppath, TRK2DET_HEADER, &trks.trk2det).unwrap();
        runs.push(TrackletRun {
            images: read_image_file(&ipath).unwrap(),
            detections: read_detection_file(&dpath).unwrap(),
            tracklets: read_tracklet_file(&tpath).unwrap(),
            trk2det: read_pair_file(&ppath).unwrap(),
        });
    }

    let merged = merge_runs(runs, &MergeConfig::default()).unwrap();

    // 10 images per run, 4 shared: 16 in the union.
    assert_eq!(merged.images.len(), 16);
    // 2 objects × 16 union epochs.
    assert_eq!(merged.detections.len(), 32);
    // 2 objects × 8 distinct nights of pairs.
    assert_eq!(merged.tracklets.len(), 16);
    // Every trk2det row points at a live detection and tracklet.
    for pair in &merged.trk2det {
        assert!(pair.i1 < merged.tracklets.len());
        assert!(pair.i2 < merged.detections.len());
    }
    // The image partition invariant holds on the merged catalog.
    let mut covered = 0;
    for (i, img) in merged.images.iter().enumerate() {
        assert_eq!(img.startind, covered);
        covered = img.endind;
        for d in &merged.detections[img.startind..img.endind] {
            assert_eq!(d.image, i);
        }
    }
    assert_eq!(covered, merged.detections.len());
}
