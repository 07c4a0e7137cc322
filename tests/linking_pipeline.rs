//! End-to-end linking scenarios: synthetic orbiters pushed through
//! tracklet building, heliocentric linking and purification.

mod common;

use common::{T0, build_survey, circular_state, sun_only_model, survey_epochs};
use helioseek::linker::{LinkerConfig, link_tracklets};
use helioseek::purify::{PurifyConfig, cluster_members, link_purify};
use helioseek::tracklet::{TrackletConfig, make_tracklets};
use helioseek::types::{AU_KM, Cluster, Hypothesis, IndexPair, StateVector};

fn tracklet_cfg() -> TrackletConfig {
    TrackletConfig {
        minvel: 0.01,
        ..Default::default()
    }
}

fn linker_cfg(mjd_ref: f64) -> LinkerConfig {
    LinkerConfig {
        mjd_ref,
        use_univar: true,
        minobsnights: 3,
        mintimespan: 1.0,
        ..Default::default()
    }
}

fn purify_cfg() -> PurifyConfig {
    PurifyConfig {
        minobsnights: 3,
        minpointnum: 6,
        max_astrom_rms: 1.0,
        ..Default::default()
    }
}

/// Scenario: one object on a 2.5 AU circular orbit, 30 observations
/// over 30 days. The correct hypothesis finds one cluster holding all
/// 30 detections, and the fitted orbit is circular at 2.5 AU.
#[test]
fn synthetic_circular_orbiter_links_and_fits() {
    let truth = circular_state(2.5, 20.0, 5.0);
    let epochs = survey_epochs(15, 2, 2.0, 1.0 / 24.0);
    let tcfg = tracklet_cfg();
    let (dets, images) = build_survey(&[(truth, "orbiter")], &epochs, &tcfg);

    let trks = make_tracklets(&dets, &images, &tcfg).unwrap();
    assert_eq!(trks.tracklets.len(), 15, "one tracklet per night");

    let mjd_ref = T0 + 14.0;
    let out = link_tracklets(
        &dets,
        &images,
        &trks.tracklets,
        &trks.trk2det,
        &[Hypothesis::new(2.5, 0.0, 0.0)],
        &linker_cfg(mjd_ref),
        None,
    )
    .unwrap();
    assert_eq!(out.clusters.len(), 1, "exactly one cluster expected");
    let cluster = &out.clusters[0];
    assert_eq!(cluster.uniquepoints, 30);
    assert_eq!(cluster.obsnights, 15);
    assert_eq!(cluster.rating, "PURE");
    assert!(cluster.timespan > 27.9);

    let model = sun_only_model(45);
    let purified = link_purify(
        &model,
        &dets,
        &images,
        &out.clusters,
        &out.clust2det,
        &purify_cfg(),
        None,
    )
    .unwrap();
    assert_eq!(purified.clusters.len(), 1);
    let orbit = purified.clusters[0].orbit.as_ref().expect("orbit attached");
    assert!(
        (orbit.a / AU_KM - 2.5).abs() < 0.002,
        "fitted a = {} AU",
        orbit.a / AU_KM
    );
    assert!(orbit.e < 0.01, "fitted e = {}", orbit.e);
    assert!(orbit.astrom_rms < 0.1);
    assert_eq!(purified.clusters[0].uniquepoints, 30);
}

/// Scenario: two interleaved orbiters. The linker separates them into
/// two clusters of 30 and the purifier keeps both.
#[test]
fn two_interleaved_orbiters_stay_separate() {
    let a = circular_state(2.5, 20.0, 5.0);
    let b = circular_state(2.5, 65.0, 12.0);
    let epochs = survey_epochs(15, 2, 2.0, 1.0 / 24.0);
    let tcfg = tracklet_cfg();
    let (dets, images) = build_survey(&[(a, "alpha"), (b, "beta")], &epochs, &tcfg);

    let trks = make_tracklets(&dets, &images, &tcfg).unwrap();
    assert_eq!(trks.tracklets.len(), 30, "one tracklet per object per night");

    let out = link_tracklets(
        &dets,
        &images,
        &trks.tracklets,
        &trks.trk2det,
        &[Hypothesis::new(2.5, 0.0, 0.0)],
        &linker_cfg(T0 + 14.0),
        None,
    )
    .unwrap();
    assert_eq!(out.clusters.len(), 2);
    for cluster in &out.clusters {
        assert_eq!(cluster.uniquepoints, 30);
        assert_eq!(cluster.rating, "PURE");
    }

    let model = sun_only_model(45);
    let purified = link_purify(
        &model,
        &dets,
        &images,
        &out.clusters,
        &out.clust2det,
        &purify_cfg(),
        None,
    )
    .unwrap();
    assert_eq!(purified.clusters.len(), 2);
    // The two surviving linkages are disjoint and each pure.
    let m0 = cluster_members(&purified.clust2det, 0);
    let m1 = cluster_members(&purified.clust2det, 1);
    assert_eq!(m0.len(), 30);
    assert_eq!(m1.len(), 30);
    assert!(m0.iter().all(|d| !m1.contains(d)));
    for c in &purified.clusters {
        assert_eq!(c.rating, "PURE");
    }
}

/// Scenario: overlapping hypotheses produce near-duplicate clusters;
/// the purifier's overlap de-duplication keeps exactly one.
#[test]
fn near_duplicate_hypotheses_merge_to_one() {
    let truth = circular_state(2.5, 20.0, 5.0);
    let epochs = survey_epochs(15, 2, 2.0, 1.0 / 24.0);
    let tcfg = tracklet_cfg();
    let (dets, images) = build_survey(&[(truth, "orbiter")], &epochs, &tcfg);
    let trks = make_tracklets(&dets, &images, &tcfg).unwrap();

    let out = link_tracklets(
        &dets,
        &images,
        &trks.tracklets,
        &trks.trk2det,
        &[
            Hypothesis::new(2.5, 0.0, 0.0),
            Hypothesis::new(2.501, 0.0, 0.0),
        ],
        &linker_cfg(T0 + 14.0),
        None,
    )
    .unwrap();
    assert!(
        out.clusters.len() >= 2,
        "both hypotheses should find the object, got {}",
        out.clusters.len()
    );

    let model = sun_only_model(45);
    let purified = link_purify(
        &model,
        &dets,
        &images,
        &out.clusters,
        &out.clust2det,
        &purify_cfg(),
        None,
    )
    .unwrap();
    assert_eq!(
        purified.clusters.len(),
        1,
        "duplicates must collapse to a single linkage"
    );
    assert_eq!(purified.clusters[0].uniquepoints, 30);
}

/// The heliocentric-vane cut: a coherent linkage stays within the
/// fitted orbit plane and survives; one whose astrometry wanders off
/// that plane is rejected.
#[test]
fn heliovane_rejects_off_plane_linkages() {
    let truth = circular_state(2.5, 20.0, 5.0);
    let epochs = survey_epochs(6, 2, 2.0, 1.0 / 24.0);
    let tcfg = tracklet_cfg();
    let (dets, images) = build_survey(&[(truth, "vane")], &epochs, &tcfg);

    let cluster = Cluster {
        clusternum: 0,
        pos_rms: 0.0,
        vel_rms: 0.0,
        tot_rms: 0.0,
        astrom_rms: 0.0,
        pairnum: 6,
        timespan: 10.0,
        uniquepoints: dets.len(),
        obsnights: 6,
        metric: 1.0,
        rating: "PURE".into(),
        reference_mjd: T0,
        hypothesis: Hypothesis::new(2.5, 0.0, 0.0),
        mean_state: StateVector::default(),
        orbit: None,
    };
    let clust2det: Vec<IndexPair> = (0..dets.len()).map(|d| IndexPair::new(0, d)).collect();

    // A loose RMS gate and no outlier rejection leave the vane cut as
    // the only discriminator.
    let cfg = PurifyConfig {
        minobsnights: 3,
        minpointnum: 6,
        max_astrom_rms: 1.0e9,
        rejfrac: 0.0,
        use_heliovane: true,
        max_oop: 0.05,
        ..Default::default()
    };
    let model = sun_only_model(20);
    let clean = link_purify(
        &model,
        &dets,
        &images,
        &[cluster.clone()],
        &clust2det,
        &cfg,
        None,
    )
    .unwrap();
    assert_eq!(clean.clusters.len(), 1, "coherent linkage passes the vane cut");

    // Tip the last three nights' astrometry half a degree off the
    // orbit plane; the fit still converges but the observed rays no
    // longer share a heliocentric plane.
    let mut bent = dets.clone();
    for d in bent.iter_mut().skip(6) {
        d.dec += 0.5;
    }
    let rejected = link_purify(&model, &bent, &images, &[cluster], &clust2det, &cfg, None).unwrap();
    assert!(
        rejected.clusters.is_empty(),
        "off-plane linkage must fail the vane cut"
    );
}

/// Scenario: a three-detection linkage spanning four hours has one
/// observing night; a two-night floor rejects it.
#[test]
fn short_arc_is_rejected() {
    let truth = circular_state(2.5, 20.0, 5.0);
    // Three exposures across four hours of one night.
    let epochs = vec![T0, T0 + 2.0 / 24.0, T0 + 4.0 / 24.0];
    let tcfg = tracklet_cfg();
    let (dets, images) = build_survey(&[(truth, "short")], &epochs, &tcfg);

    // Hand the purifier the linkage directly.
    let cluster = Cluster {
        clusternum: 0,
        pos_rms: 0.0,
        vel_rms: 0.0,
        tot_rms: 0.0,
        astrom_rms: 0.0,
        pairnum: 1,
        timespan: 4.0 / 24.0,
        uniquepoints: 3,
        obsnights: 1,
        metric: 1.0,
        rating: "PURE".into(),
        reference_mjd: T0,
        hypothesis: Hypothesis::new(2.5, 0.0, 0.0),
        mean_state: StateVector::default(),
        orbit: None,
    };
    let clust2det: Vec<IndexPair> = (0..3).map(|d| IndexPair::new(0, d)).collect();

    let cfg = PurifyConfig {
        minobsnights: 2,
        minpointnum: 3,
        ..Default::default()
    };
    let model = sun_only_model(5);
    let purified =
        link_purify(&model, &dets, &images, &[cluster], &clust2det, &cfg, None).unwrap();
    assert!(
        purified.clusters.is_empty(),
        "single-night arc must not survive a two-night floor"
    );
}
