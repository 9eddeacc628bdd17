//! Offline verification and repair over persisted snapshots.

use chrono::{Duration, TimeZone, Utc};
use tempfile::TempDir;
use zptess::aggregator::{AggregatorParams, RoundAggregator};
use zptess::calibration::session::register;
use zptess::calibration::{round_zero_point, CalibrationEngine, EngineParams};
use zptess::model::{
    CalibrationKind, CalibrationMetadata, CentralTendency, Photometer, Reading, Role, Sample,
    SessionId,
};
use zptess::store::{Gateway, MemoryStore, Query, StoreSnapshot};
use zptess::verifier::{repair_stddev, Entity, Scope, Verifier};

const WINDOW: usize = 5;
const NROUNDS: u32 = 3;
const REF_ZP: f64 = 20.44;

fn session() -> SessionId {
    SessionId(Utc.with_ymd_and_hms(2024, 2, 14, 21, 30, 0).unwrap())
}

fn photometer(name: &str, zero_point: f64) -> Photometer {
    Photometer {
        name: name.to_string(),
        mac: format!("5C:CF:7F:76:6A:{:02X}", name.len()),
        model: "TESS-W".to_string(),
        sensor: "TSL237".to_string(),
        firmware: "May 19 2016".to_string(),
        zero_point,
        freq_offset: 0.0,
    }
}

fn freqs(role: Role) -> Vec<f64> {
    let base = match role {
        Role::Ref => 980.0,
        Role::Test => 1260.0,
    };
    (0..WINDOW * NROUNDS as usize)
        .map(|i| base + ((i * 7) % 11) as f64)
        .collect()
}

/// Runs readings of both roles through the aggregators and engines into `store`.
async fn record_session(store: &MemoryStore) {
    let mut ref_mags = Vec::new();
    for role in Role::ALL {
        let phot_id = store
            .create_photometer(photometer(
                if role == Role::Ref { "stars3" } else { "stars610" },
                20.50,
            ))
            .await
            .unwrap();
        let mut aggregator = RoundAggregator::new(AggregatorParams {
            role,
            session: session(),
            window_size: WINDOW,
            central: CentralTendency::Median,
            zp_fict: 20.50,
            freq_offset: 0.0,
        });
        let mut engine = CalibrationEngine::new(EngineParams {
            role,
            session: session(),
            phot_id,
            nrounds: NROUNDS,
            freq_method: CentralTendency::Median,
            zp_method: CentralTendency::Mode,
            zp_offset: 0.0,
            zp_fict: 20.50,
            freq_offset: 0.0,
            prev_zp: Some(20.50),
            calibration: CalibrationKind::Auto,
            metadata: CalibrationMetadata::default(),
        });

        for (i, freq) in freqs(role).into_iter().enumerate() {
            let reading = Reading {
                role,
                tstamp: session().0 + Duration::milliseconds(600 * i as i64),
                freq,
                tbox: Some(18.3),
                tsky: Some(-4.1),
                zp: Some(20.50),
                seq: Some(i as u64),
            };
            let id = store
                .create_sample(Sample::from_reading(&reading, phot_id, session()))
                .await
                .unwrap();
            let Some(mut closed) = aggregator.push(id, reading) else {
                continue;
            };
            match role {
                Role::Ref => ref_mags.push(closed.round.mag),
                Role::Test => {
                    let k = closed.round.seq as usize - 1;
                    closed.round.zero_point = round_zero_point(REF_ZP, ref_mags[k], closed.round.mag);
                }
            }
            store
                .create_round(closed.round.clone(), &closed.samples)
                .await
                .unwrap();
            if let Some(summary) = engine.push(closed.round).unwrap() {
                store.create_summary(summary).await.unwrap();
            }
        }
    }
}

async fn recorded() -> MemoryStore {
    let store = MemoryStore::new();
    record_session(&store).await;
    store
}

#[tokio::test]
async fn test_recorded_session_verifies_after_reopening() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("zptess.json");
    recorded().await.save(&path).await.unwrap();

    let store = MemoryStore::open(&path).await.unwrap();
    let report = Verifier::new(&store).verify(None, Scope::All).await.unwrap();
    assert!(report.is_clean(), "{:?}", report.violations);
    assert_eq!(report.summaries, 2);
    assert_eq!(report.rounds, 2 * NROUNDS as usize);
    assert_eq!(report.samples, 2 * WINDOW * NROUNDS as usize);

    let other_session = SessionId(session().0 + Duration::days(1));
    let report = Verifier::new(&store)
        .verify(Some(other_session), Scope::All)
        .await
        .unwrap();
    assert_eq!(report.summaries, 0);
}

#[tokio::test]
async fn test_new_dark_offset_does_not_invalidate_earlier_sessions() {
    let store = recorded().await;
    let (id, stored) = store
        .find_photometer("stars3", &photometer("stars3", 20.50).mac)
        .await
        .unwrap()
        .unwrap();
    let remeasured = Photometer {
        freq_offset: 0.5,
        ..stored.clone()
    };

    // without the explicit flag the stored identity is left alone
    assert_eq!(register(&store, &remeasured, false).await.unwrap(), id);
    assert_eq!(store.photometer(id).await.unwrap(), stored);

    assert_eq!(register(&store, &remeasured, true).await.unwrap(), id);
    assert_eq!(store.photometer(id).await.unwrap().freq_offset, 0.5);

    let report = Verifier::new(&store).verify(None, Scope::All).await.unwrap();
    assert!(report.is_clean(), "{:?}", report.violations);
    for (_, round) in store.rounds(Query::all()).await.unwrap() {
        assert_eq!(round.freq_offset, 0.0);
    }
}

#[tokio::test]
async fn test_tampered_snapshot_reports_each_layer() {
    let mut snapshot: StoreSnapshot = recorded().await.snapshot().await;

    // summary frequency off by far more than the tolerance
    let test_summary = snapshot
        .summaries
        .iter_mut()
        .find(|s| s.role == Role::Test)
        .unwrap();
    test_summary.freq = test_summary.freq.map(|f| f + 1.0);
    // a reference round claims an extra sample
    let ref_round = snapshot
        .rounds
        .iter_mut()
        .find(|r| r.role == Role::Ref && r.seq == 2)
        .unwrap();
    ref_round.nsamples += 1;
    // a test sample now belongs to the reference photometer
    let ref_phot = snapshot.summaries.iter().find(|s| s.role == Role::Ref).unwrap().phot_id;
    let sample = snapshot.samples.iter_mut().rev().find(|s| s.role == Role::Test).unwrap();
    sample.phot_id = ref_phot;

    let store = MemoryStore::from_snapshot(snapshot);
    let report = Verifier::new(&store).verify(Some(session()), Scope::All).await.unwrap();
    let found: Vec<(Role, Entity, &str)> = report
        .violations
        .iter()
        .map(|v| (v.role, v.entity, v.check))
        .collect();

    assert!(found.contains(&(Role::Test, Entity::Summary, "freq")));
    assert!(found.contains(&(Role::Ref, Entity::Round(2), "nsamples")));
    assert!(found
        .iter()
        .any(|(role, entity, check)| *role == Role::Test
            && matches!(entity, Entity::Sample(_))
            && *check == "photometer"));
    // a 1 Hz shift moves the magnitude by less than its tolerance
    assert!(!found.contains(&(Role::Test, Entity::Summary, "mag")));

    let summaries_only = Verifier::new(&store).verify(None, Scope::Summary).await.unwrap();
    assert_eq!(summaries_only.violations.len(), 1);
}

#[tokio::test]
async fn test_repair_of_mean_based_deviations_persists() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("zptess.json");
    let store = recorded().await;

    // store every test round's deviation about the mean, as older sessions did
    for (id, round) in store.rounds(Query::all().with_role(Role::Test)).await.unwrap() {
        let freqs: Vec<f64> = store
            .round_samples(id)
            .await
            .unwrap()
            .into_iter()
            .map(|(_, s)| s.freq)
            .collect();
        let mean = freqs.iter().sum::<f64>() / freqs.len() as f64;
        let about_mean = zptess::stats::stdev_about(&freqs, mean);
        assert_eq!(round.central, CentralTendency::Median);
        store.update_round_stddev(id, about_mean).await.unwrap();
    }
    store.save(&path).await.unwrap();

    let store = MemoryStore::open(&path).await.unwrap();
    let flagged = Verifier::new(&store).verify(None, Scope::Rounds).await.unwrap();
    let flagged_rounds = flagged.violations.iter().filter(|v| v.check == "stddev").count();
    assert!(flagged_rounds > 0);

    let preview = repair_stddev(&store, Some(session()), true).await.unwrap();
    assert!(preview.dry_run);
    assert_eq!(preview.fixed.len(), flagged_rounds);
    assert!(preview.unexplained.is_empty());
    assert!(preview.fixed.iter().all(|fix| fix.role == Role::Test));
    let still = Verifier::new(&store).verify(None, Scope::Rounds).await.unwrap();
    assert_eq!(still.violations.len(), flagged.violations.len());

    let applied = repair_stddev(&store, Some(session()), false).await.unwrap();
    assert_eq!(applied.fixed, preview.fixed);
    store.save(&path).await.unwrap();

    let reopened = MemoryStore::open(&path).await.unwrap();
    let report = Verifier::new(&reopened).verify(None, Scope::All).await.unwrap();
    assert!(report.is_clean(), "{:?}", report.violations);
}
