//! End-to-end calibration sessions over loopback TCP links.

mod common;

use common::*;
use std::sync::Arc;
use std::time::Duration;
use zptess::calibration::{Calibrator, SessionOutcome};
use zptess::config::{InfoConfig, SessionConfig};
use zptess::error::ZptessError;
use zptess::model::{CentralTendency, Role};
use zptess::pipeline::RoleStatus;
use zptess::protocol::Protocol;
use zptess::store::{Gateway, MemoryStore, Query};
use zptess::verifier::{Scope, Verifier};

fn session_config() -> SessionConfig {
    SessionConfig {
        window_size: 3,
        nrounds: 2,
        central: CentralTendency::Median,
        channel_capacity: 16,
        ..SessionConfig::default()
    }
}

#[tokio::test]
async fn test_full_session_is_stored_and_consistent() {
    let (ref_listener, ref_endpoint) = photometer_listener().await;
    let (test_listener, test_endpoint) = photometer_listener().await;
    let config = config(
        device(&ref_endpoint, Protocol::Legacy, "stars3", 20.44),
        device(&test_endpoint, Protocol::Json, "stars1234", 20.50),
        session_config(),
    );

    // the test unit sees exactly twice the reference flux
    let ref_lines: Vec<String> = [1000, 1001, 1002, 1000, 1001, 1002]
        .into_iter()
        .map(legacy_frame)
        .collect();
    let test_lines: Vec<String> = [2000.0, 2002.0, 2004.0, 2000.0, 2002.0, 2004.0]
        .into_iter()
        .enumerate()
        .map(|(i, f)| json_frame(i as u64 + 1, f))
        .collect();
    let ref_server = serve_lines(ref_listener, ref_lines);
    let test_server = serve_lines(test_listener, test_lines);

    let store = Arc::new(MemoryStore::new());
    let calibrator = Arc::new(Calibrator::new(config, store.clone() as Arc<dyn Gateway>));
    let run = tokio::spawn({
        let calibrator = Arc::clone(&calibrator);
        async move { calibrator.run().await }
    });
    let outcome = tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .expect("session did not finish")
        .unwrap()
        .unwrap();
    ref_server.abort();
    test_server.abort();

    let (_, reference) = &outcome.reference;
    let (_, test) = &outcome.test;
    assert_eq!(reference.zero_point, None);
    assert_eq!(reference.freq, Some(1001.0));
    assert_eq!(test.freq, Some(2002.0));
    assert_eq!(test.nrounds, Some(2));
    assert_eq!(test.upd_flag, Some(false));
    assert_eq!(test.prev_zp, Some(20.50));
    let expected_zp = 20.44 + 2.5 * 2f64.log10();
    assert!((outcome.zero_point().unwrap() - expected_zp).abs() < 1e-6);

    let rounds = store.rounds(Query::session(outcome.session)).await.unwrap();
    assert_eq!(rounds.len(), 4);
    for (_, round) in &rounds {
        assert_eq!(round.nsamples, 3);
        match round.role {
            Role::Ref => assert_eq!(round.zero_point, None),
            Role::Test => assert!(round.zero_point.is_some()),
        }
    }

    let before = store.snapshot().await;
    let report = Verifier::new(store.as_ref())
        .verify(Some(outcome.session), Scope::All)
        .await
        .unwrap();
    assert!(report.is_clean(), "{:?}", report.violations);
    assert_eq!(report.summaries, 2);
    assert_eq!(report.rounds, 4);
    assert_eq!(report.samples, 12);
    assert_eq!(store.snapshot().await, before);
}

#[tokio::test]
async fn test_session_fails_when_a_photometer_disconnects() {
    let (ref_listener, ref_endpoint) = photometer_listener().await;
    let (test_listener, test_endpoint) = photometer_listener().await;
    let config = config(
        device(&ref_endpoint, Protocol::Legacy, "stars3", 20.44),
        device(&test_endpoint, Protocol::Json, "stars1234", 20.50),
        session_config(),
    );

    let ref_server = serve_lines(ref_listener, vec![legacy_frame(1000)]);
    // the test unit hangs up after one round
    let test_server = tokio::spawn(async move {
        use tokio::io::AsyncWriteExt;
        let (mut stream, _) = test_listener.accept().await.unwrap();
        for i in 1..=3u64 {
            stream
                .write_all(format!("{}\n", json_frame(i, 2000.0 + i as f64)).as_bytes())
                .await
                .unwrap();
            tokio::time::sleep(FRAME_GAP).await;
        }
    });

    let store = Arc::new(MemoryStore::new());
    let calibrator = Calibrator::new(config, store.clone() as Arc<dyn Gateway>);
    let err = tokio::time::timeout(Duration::from_secs(10), calibrator.run())
        .await
        .expect("session did not end")
        .unwrap_err();
    ref_server.abort();
    test_server.await.unwrap();

    assert!(matches!(err, ZptessError::SessionIncomplete(_)), "{}", err);
    assert!(store.summaries(Query::all()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unidentified_photometer_prevents_session() {
    let (_ref_listener, ref_endpoint) = photometer_listener().await;
    let (_test_listener, test_endpoint) = photometer_listener().await;
    let mut test = device(&test_endpoint, Protocol::Json, "stars1234", 20.50);
    // nothing listens on port 1
    test.info = InfoConfig::Html {
        host: "127.0.0.1:1".to_string(),
    };
    let mut session = session_config();
    session.info_timeout_secs = 2;
    let config = config(
        device(&ref_endpoint, Protocol::Legacy, "stars3", 20.44),
        test,
        session,
    );

    let calibrator = Calibrator::new(config, Arc::new(MemoryStore::new()));
    let err = calibrator.run().await.unwrap_err();
    assert!(
        matches!(
            err,
            ZptessError::Http(_)
                | ZptessError::MetadataTimeout(Role::Test)
                | ZptessError::Metadata { .. }
        ),
        "{}",
        err
    );
    assert!(matches!(
        *calibrator.signals(Role::Test).status().borrow(),
        RoleStatus::Offline(_)
    ));
}

#[tokio::test]
async fn test_silent_photometer_yields_empty_round() {
    let (ref_listener, ref_endpoint) = photometer_listener().await;
    let (test_listener, test_endpoint) = photometer_listener().await;
    let mut session = session_config();
    session.silence_timeout_secs = Some(1);
    let config = config(
        device(&ref_endpoint, Protocol::Legacy, "stars3", 20.44),
        device(&test_endpoint, Protocol::Json, "stars1234", 20.50),
        session,
    );

    let ref_lines: Vec<String> = [1000, 1001, 1002, 1000, 1001, 1002]
        .into_iter()
        .map(legacy_frame)
        .collect();
    // one full round, one reading of the next, then nothing while the link stays up
    let test_lines: Vec<String> = [2000.0, 2002.0, 2004.0, 2006.0]
        .into_iter()
        .enumerate()
        .map(|(i, f)| json_frame(i as u64 + 1, f))
        .collect();
    let ref_server = serve_lines(ref_listener, ref_lines);
    let test_server = serve_lines(test_listener, test_lines);

    let store = Arc::new(MemoryStore::new());
    let calibrator = Calibrator::new(config, store.clone() as Arc<dyn Gateway>);
    let outcome = tokio::time::timeout(Duration::from_secs(10), calibrator.run())
        .await
        .expect("session did not finish")
        .unwrap();
    ref_server.abort();
    test_server.abort();

    let (_, test) = &outcome.test;
    assert_eq!(test.nrounds, Some(2));
    assert_eq!(test.freq, Some(2002.0));
    let expected_zp = 20.44 + 2.5 * 2f64.log10();
    assert!((outcome.zero_point().unwrap() - expected_zp).abs() < 1e-6);

    let query = Query::session(outcome.session).with_role(Role::Test);
    let rounds = store.rounds(query).await.unwrap();
    assert_eq!(rounds.len(), 2);
    let (empty_id, empty) = &rounds[1];
    assert_eq!(empty.seq, 2);
    assert_eq!(empty.nsamples, 0);
    assert_eq!((empty.freq, empty.mag, empty.zero_point), (None, None, None));
    assert_eq!(empty.begin_tstamp, None);
    assert!(store.round_samples(*empty_id).await.unwrap().is_empty());
    // the reading of the interrupted window is stored but belongs to no round
    assert_eq!(store.samples(query).await.unwrap().len(), 4);
    assert_eq!(store.round_samples(rounds[0].0).await.unwrap().len(), 3);

    let report = Verifier::new(store.as_ref())
        .verify(Some(outcome.session), Scope::All)
        .await
        .unwrap();
    assert!(report.is_clean(), "{:?}", report.violations);
    assert_eq!(report.rounds, 4);
    assert_eq!(report.samples, 9);
}

async fn run_with_device_web_server(
    confirm_writes: bool,
) -> (SessionOutcome, Arc<MemoryStore>, Vec<String>) {
    let (host, requests) = device_web_server(confirm_writes).await;
    let (ref_listener, ref_endpoint) = photometer_listener().await;
    let (test_listener, test_endpoint) = photometer_listener().await;
    let mut test = device(&test_endpoint, Protocol::Json, "stars1234", 20.50);
    test.info = InfoConfig::Html { host };
    let mut session = session_config();
    session.update_device = true;
    let config = config(
        device(&ref_endpoint, Protocol::Legacy, "stars3", 20.44),
        test,
        session,
    );

    let ref_lines: Vec<String> = [1000, 1001, 1002, 1000, 1001, 1002]
        .into_iter()
        .map(legacy_frame)
        .collect();
    let test_lines: Vec<String> = [2000.0, 2002.0, 2004.0, 2000.0, 2002.0, 2004.0]
        .into_iter()
        .enumerate()
        .map(|(i, f)| json_frame(i as u64 + 1, f))
        .collect();
    let ref_server = serve_lines(ref_listener, ref_lines);
    let test_server = serve_lines(test_listener, test_lines);

    let store = Arc::new(MemoryStore::new());
    let calibrator = Calibrator::new(config, store.clone() as Arc<dyn Gateway>);
    let outcome = tokio::time::timeout(Duration::from_secs(10), calibrator.run())
        .await
        .expect("session did not finish")
        .unwrap();
    ref_server.abort();
    test_server.abort();

    let seen = requests.lock().unwrap().clone();
    (outcome, store, seen)
}

#[tokio::test]
async fn test_confirmed_write_back_sets_update_flag() {
    let (outcome, store, requests) = run_with_device_web_server(true).await;

    let (test_id, test) = &outcome.test;
    assert_eq!(test.upd_flag, Some(true));
    // identity came from the device page
    assert_eq!(test.prev_zp, Some(20.50));
    let expected_zp = 20.44 + 2.5 * 2f64.log10();
    let zp = outcome.zero_point().unwrap();
    assert!((zp - expected_zp).abs() < 1e-4);
    assert!(requests[0].starts_with("GET /config"));
    let write = format!("GET /setconst?cons={:.2}", zp);
    assert!(requests.iter().any(|r| r.starts_with(&write)), "{:?}", requests);

    let stored = store.summaries(Query::session(outcome.session)).await.unwrap();
    let (_, persisted) = stored.iter().find(|(id, _)| id == test_id).unwrap();
    assert_eq!(persisted.upd_flag, Some(true));

    // magnitudes carry the unit's dark offset and still verify
    let rounds = store
        .rounds(Query::session(outcome.session).with_role(Role::Test))
        .await
        .unwrap();
    assert!(rounds.iter().all(|(_, r)| (r.freq_offset - 0.0125).abs() < 1e-12));
    let report = Verifier::new(store.as_ref())
        .verify(Some(outcome.session), Scope::All)
        .await
        .unwrap();
    assert!(report.is_clean(), "{:?}", report.violations);
}

#[tokio::test]
async fn test_unconfirmed_write_back_clears_update_flag() {
    let (outcome, store, requests) = run_with_device_web_server(false).await;

    let (_, test) = &outcome.test;
    assert_eq!(test.upd_flag, Some(false));
    assert!(outcome.zero_point().is_some());
    assert!(requests.iter().any(|r| r.starts_with("GET /setconst")));
    let stored = store
        .summaries(Query::session(outcome.session).with_role(Role::Test))
        .await
        .unwrap();
    assert_eq!(stored[0].1.upd_flag, Some(false));
}
