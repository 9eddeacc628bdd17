//! Calibration runs and read-only monitoring.
//!
//! A calibration session runs one collector task per role. Each collector drains its
//! pipeline's reading channel, stores every reading as a sample, feeds the round
//! aggregator and reports closed rounds to the coordinator over a channel. The
//! coordinator pairs rounds of both roles by sequence number, derives the test
//! round zero points, persists rounds and feeds the two calibration engines. Nothing
//! is shared between the roles except through these messages.

use super::{round_zero_point, CalibrationEngine, EngineParams};
use crate::aggregator::{AggregatorParams, ClosedRound, RoundAggregator};
use crate::config::{OfflinePolicy, ZptessConfig};
use crate::device_info::InfoSource;
use crate::error::{AppResult, ZptessError};
use crate::model::{Photometer, PhotometerId, Reading, Role, Sample, SessionId, Summary, SummaryId};
use crate::pipeline::{Pipeline, PipelineConfig, RoleSignals, RoleStatus};
use crate::store::{Gateway, StoreError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Identity of one role, resolved at session start.
#[derive(Debug, Clone)]
pub struct RoleIdentity {
    pub role: Role,
    pub phot_id: PhotometerId,
    pub photometer: Photometer,
    pub source: InfoSource,
}

/// Result of a completed calibration session.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub session: SessionId,
    pub reference: (SummaryId, Summary),
    pub test: (SummaryId, Summary),
}

impl SessionOutcome {
    /// Calibrated zero point of the test photometer.
    pub fn zero_point(&self) -> Option<f64> {
        self.test.1.zero_point
    }
}

#[derive(Debug)]
enum SessionEvent {
    RoundClosed(Role, ClosedRound),
    RoleEnded(Role),
}

/// Fetches a role's identity, bounded by the configured info timeout.
pub async fn identify(config: &ZptessConfig, role: Role) -> AppResult<(Photometer, InfoSource)> {
    let source = InfoSource::from_config(config.device(role))?;
    let photometer = source.fetch(role, config.session.info_timeout()).await?;
    Ok((photometer, source))
}

/// Looks the photometer up by name and MAC, creating it when unknown.
///
/// A stored record that differs from `photometer` is overwritten only when
/// `reprovision` is set; otherwise the stored record is kept untouched.
pub async fn register(
    gateway: &dyn Gateway,
    photometer: &Photometer,
    reprovision: bool,
) -> AppResult<PhotometerId> {
    match gateway
        .find_photometer(&photometer.name, &photometer.mac)
        .await?
    {
        Some((id, stored)) if stored == *photometer => Ok(id),
        Some((id, stored)) if reprovision => {
            info!(
                name = %photometer.name,
                mac = %photometer.mac,
                old_zp = stored.zero_point,
                new_zp = photometer.zero_point,
                old_offset = stored.freq_offset,
                new_offset = photometer.freq_offset,
                old_firmware = %stored.firmware,
                new_firmware = %photometer.firmware,
                "Re-provisioning photometer"
            );
            gateway.update_photometer(id, photometer.clone()).await?;
            Ok(id)
        }
        Some((id, stored)) => {
            warn!(
                name = %photometer.name,
                mac = %photometer.mac,
                stored_zp = stored.zero_point,
                device_zp = photometer.zero_point,
                stored_offset = stored.freq_offset,
                device_offset = photometer.freq_offset,
                "Device identity differs from stored record; keeping stored record"
            );
            Ok(id)
        }
        None => {
            let id = gateway.create_photometer(photometer.clone()).await?;
            info!(name = %photometer.name, mac = %photometer.mac, %id, "Registered photometer");
            Ok(id)
        }
    }
}

fn pipeline_config(config: &ZptessConfig, role: Role) -> PipelineConfig {
    let device = config.device(role);
    PipelineConfig {
        role,
        endpoint: device.endpoint.clone(),
        protocol: device.protocol,
        channel_capacity: config.session.channel_capacity,
        max_frame_bytes: config.session.max_frame_bytes,
    }
}

/// Runs calibration sessions against a gateway.
pub struct Calibrator {
    config: ZptessConfig,
    gateway: Arc<dyn Gateway>,
    signals: [RoleSignals; 2],
}

impl Calibrator {
    pub fn new(config: ZptessConfig, gateway: Arc<dyn Gateway>) -> Self {
        Self {
            config,
            gateway,
            signals: [RoleSignals::new(), RoleSignals::new()],
        }
    }

    /// Front-end signals of `role`; valid across sessions.
    pub fn signals(&self, role: Role) -> &RoleSignals {
        &self.signals[role.index()]
    }

    async fn prepare(&self, role: Role) -> AppResult<RoleIdentity> {
        let signals = self.signals(role);
        signals.set_status(RoleStatus::Starting);
        let (photometer, source) = match identify(&self.config, role).await {
            Ok(found) => found,
            Err(e) => {
                warn!(%role, "Photometer offline: {}", e);
                signals.set_status(RoleStatus::Offline(e.to_string()));
                return Err(e);
            }
        };
        let phot_id = register(
            self.gateway.as_ref(),
            &photometer,
            self.config.session.reprovision,
        )
        .await?;
        Ok(RoleIdentity {
            role,
            phot_id,
            photometer,
            source,
        })
    }

    /// Runs one complete calibration session.
    ///
    /// Both photometers must be identified. The session ends once both roles have a
    /// summary, or with [`ZptessError::SessionIncomplete`] if a pipeline stops first.
    /// Pipelines are stopped before this returns.
    pub async fn run(&self) -> AppResult<SessionOutcome> {
        let session = SessionId::now();
        info!(%session, "Starting calibration session");

        let (reference, test) = tokio::join!(self.prepare(Role::Ref), self.prepare(Role::Test));
        let identities = [reference?, test?];

        let (ref_pipeline, ref_rx) = Pipeline::start(
            pipeline_config(&self.config, Role::Ref),
            self.signals(Role::Ref).clone(),
        )
        .await?;
        let (test_pipeline, test_rx) = match Pipeline::start(
            pipeline_config(&self.config, Role::Test),
            self.signals(Role::Test).clone(),
        )
        .await
        {
            Ok(started) => started,
            Err(e) => {
                ref_pipeline.stop().await.ok();
                return Err(e);
            }
        };

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let collectors = [
            self.spawn_collector(session, &identities[0], ref_rx, events_tx.clone()),
            self.spawn_collector(session, &identities[1], test_rx, events_tx),
        ];

        let outcome = self.coordinate(session, &identities, events_rx).await;

        for pipeline in [ref_pipeline, test_pipeline] {
            let role = pipeline.role();
            if let Err(e) = pipeline.stop().await {
                debug!(%role, "Pipeline ended with error: {}", e);
            }
        }
        for collector in collectors {
            if let Err(e) = collector.await {
                error!("Collector task failed: {}", e);
            }
        }

        match &outcome {
            Ok(done) => info!(
                %session,
                zero_point = ?done.zero_point(),
                "Calibration session finished"
            ),
            Err(e) => error!(%session, "Calibration session failed: {}", e),
        }
        outcome
    }

    fn spawn_collector(
        &self,
        session: SessionId,
        identity: &RoleIdentity,
        readings: mpsc::Receiver<Reading>,
        events: mpsc::Sender<SessionEvent>,
    ) -> JoinHandle<()> {
        let role = identity.role;
        let aggregator = RoundAggregator::new(AggregatorParams {
            role,
            session,
            window_size: self.config.session.window_size,
            central: self.config.session.central,
            zp_fict: self.config.session.zp_fict,
            freq_offset: identity.photometer.freq_offset,
        });
        let collector = Collector {
            role,
            session,
            phot_id: identity.phot_id,
            gateway: Arc::clone(&self.gateway),
            aggregator,
            silence: self.config.session.silence_timeout(),
            signals: self.signals(role).clone(),
            events,
        };
        tokio::spawn(collector.run(readings))
    }

    async fn coordinate(
        &self,
        session: SessionId,
        identities: &[RoleIdentity; 2],
        mut events: mpsc::Receiver<SessionEvent>,
    ) -> AppResult<SessionOutcome> {
        let cfg = &self.config.session;
        let engine_for = |role: Role| {
            let identity = &identities[role.index()];
            CalibrationEngine::new(EngineParams {
                role,
                session,
                phot_id: identity.phot_id,
                nrounds: cfg.nrounds,
                freq_method: cfg.freq_method,
                zp_method: cfg.zp_method,
                zp_offset: cfg.zp_offset,
                zp_fict: cfg.zp_fict,
                freq_offset: identity.photometer.freq_offset,
                prev_zp: Some(identity.photometer.zero_point),
                calibration: self.config.metadata.calibration,
                metadata: self.config.metadata.details.clone(),
            })
        };
        let mut engines = [engine_for(Role::Ref), engine_for(Role::Test)];
        let mut stored: [Option<(SummaryId, Summary)>; 2] = [None, None];
        let mut ref_mags: HashMap<u32, Option<f64>> = HashMap::new();
        let mut waiting_test: HashMap<u32, ClosedRound> = HashMap::new();

        while let Some(event) = events.recv().await {
            let mut ready: Vec<ClosedRound> = Vec::new();
            match event {
                SessionEvent::RoleEnded(role) => {
                    if !engines[role.index()].is_finalized() {
                        return Err(ZptessError::SessionIncomplete(format!(
                            "{} pipeline ended after {} of {} rounds",
                            role,
                            engines[role.index()].collected(),
                            cfg.nrounds
                        )));
                    }
                    continue;
                }
                SessionEvent::RoundClosed(role, closed) => {
                    if closed.round.seq > cfg.nrounds {
                        debug!(%role, round = closed.round.seq, "Round beyond session, ignored");
                        continue;
                    }
                    match role {
                        Role::Ref => {
                            let seq = closed.round.seq;
                            ref_mags.insert(seq, closed.round.mag);
                            self.store_round(&mut engines[0], &mut stored[0], identities, closed)
                                .await?;
                            ready.extend(waiting_test.remove(&seq));
                        }
                        Role::Test if ref_mags.contains_key(&closed.round.seq) => ready.push(closed),
                        Role::Test => {
                            waiting_test.insert(closed.round.seq, closed);
                        }
                    }
                }
            }

            for mut closed in ready {
                let ref_mag = ref_mags.get(&closed.round.seq).copied().flatten();
                closed.round.zero_point =
                    round_zero_point(cfg.ref_zero_point, ref_mag, closed.round.mag);
                info!(
                    role = %Role::Test,
                    round = closed.round.seq,
                    zp = ?closed.round.zero_point,
                    "Round zero point"
                );
                self.store_round(&mut engines[1], &mut stored[1], identities, closed)
                    .await?;
            }

            if let [Some(reference), Some(test)] = &stored {
                return Ok(SessionOutcome {
                    session,
                    reference: reference.clone(),
                    test: test.clone(),
                });
            }
        }

        Err(ZptessError::SessionIncomplete(
            "all collectors ended before the session completed".to_string(),
        ))
    }

    async fn store_round(
        &self,
        engine: &mut CalibrationEngine,
        stored: &mut Option<(SummaryId, Summary)>,
        identities: &[RoleIdentity; 2],
        closed: ClosedRound,
    ) -> AppResult<()> {
        let role = engine.role();
        let round_id = self
            .gateway
            .create_round(closed.round.clone(), &closed.samples)
            .await?;
        debug!(%role, round = closed.round.seq, %round_id, "Round stored");

        let Some(mut summary) = engine.push(closed.round)? else {
            return Ok(());
        };
        if role == Role::Test {
            summary.upd_flag = Some(self.write_back(&identities[1], &summary).await);
        }
        let id = self.gateway.create_summary(summary.clone()).await?;
        info!(%role, session = %summary.session, %id, "Summary stored");
        *stored = Some((id, summary));
        Ok(())
    }

    // True only when the device confirmed the new zero point.
    async fn write_back(&self, identity: &RoleIdentity, summary: &Summary) -> bool {
        let Some(zp) = summary.zero_point else {
            return false;
        };
        if !self.config.session.update_device {
            info!(zp, "Zero point not written to device (update_device is off)");
            return false;
        }
        match identity
            .source
            .write_zero_point(Role::Test, zp, self.config.session.info_timeout())
            .await
        {
            Ok(confirmed) => {
                info!(zp = confirmed, "Device confirmed new zero point");
                true
            }
            Err(e) => {
                error!("Could not write zero point to device: {}", e);
                false
            }
        }
    }
}

struct Collector {
    role: Role,
    session: SessionId,
    phot_id: PhotometerId,
    gateway: Arc<dyn Gateway>,
    aggregator: RoundAggregator,
    silence: Option<Duration>,
    signals: RoleSignals,
    events: mpsc::Sender<SessionEvent>,
}

impl Collector {
    async fn run(mut self, mut readings: mpsc::Receiver<Reading>) {
        let role = self.role;
        loop {
            let next = match self.silence {
                Some(limit) => match tokio::time::timeout(limit, readings.recv()).await {
                    Ok(next) => next,
                    Err(_) => {
                        let closed = self.aggregator.close_empty();
                        self.signals.set_progress(0);
                        if !self.emit(closed).await {
                            return;
                        }
                        continue;
                    }
                },
                None => readings.recv().await,
            };
            let Some(reading) = next else {
                debug!(%role, "Reading stream closed");
                break;
            };

            let sample = Sample::from_reading(&reading, self.phot_id, self.session);
            let id = match self.gateway.create_sample(sample).await {
                Ok(id) => id,
                Err(StoreError::Duplicate(what)) => {
                    warn!(%role, "Skipping duplicate sample: {}", what);
                    continue;
                }
                Err(e) => {
                    error!(%role, "Cannot store sample: {}", e);
                    break;
                }
            };
            let closed = self.aggregator.push(id, reading);
            self.signals.set_progress(self.aggregator.pending());
            if let Some(closed) = closed {
                if !self.emit(closed).await {
                    return;
                }
            }
        }
        let _ = self.events.send(SessionEvent::RoleEnded(role)).await;
    }

    // False once the coordinator is gone.
    async fn emit(&self, closed: ClosedRound) -> bool {
        self.events
            .send(SessionEvent::RoundClosed(self.role, closed))
            .await
            .is_ok()
    }
}

/// Both pipelines running without persistence, for monitoring the photometers.
pub struct ReadMode {
    pipelines: [Option<Pipeline>; 2],
    drains: Vec<JoinHandle<()>>,
    signals: [RoleSignals; 2],
}

impl ReadMode {
    /// Identifies both photometers and starts whichever pipelines may run.
    ///
    /// A role whose identity cannot be fetched is started anyway only under
    /// [`OfflinePolicy::Acquire`]. A role whose link cannot be opened stays offline;
    /// the other role is unaffected.
    pub async fn start(config: &ZptessConfig) -> AppResult<Self> {
        let signals = [RoleSignals::new(), RoleSignals::new()];
        let (ref_info, test_info) =
            tokio::join!(identify(config, Role::Ref), identify(config, Role::Test));

        let mut pipelines: [Option<Pipeline>; 2] = [None, None];
        let mut drains = Vec::new();
        for (role, info) in [(Role::Ref, ref_info), (Role::Test, test_info)] {
            let signals = &signals[role.index()];
            if let Err(e) = info {
                warn!(%role, "Photometer offline: {}", e);
                signals.set_status(RoleStatus::Offline(e.to_string()));
                if config.session.offline_policy == OfflinePolicy::Suppress {
                    continue;
                }
            }
            match Pipeline::start(pipeline_config(config, role), signals.clone()).await {
                Ok((pipeline, readings)) => {
                    drains.push(tokio::spawn(drain(role, readings)));
                    pipelines[role.index()] = Some(pipeline);
                }
                Err(e) => warn!(%role, "Not reading: {}", e),
            }
        }
        Ok(Self {
            pipelines,
            drains,
            signals,
        })
    }

    /// Per-reading log lines of `role`.
    pub fn lines(&self, role: Role) -> broadcast::Receiver<String> {
        self.signals[role.index()].lines()
    }

    pub fn status(&self, role: Role) -> watch::Receiver<RoleStatus> {
        self.signals[role.index()].status()
    }

    pub fn is_running(&self, role: Role) -> bool {
        self.pipelines[role.index()]
            .as_ref()
            .is_some_and(Pipeline::is_running)
    }

    /// Bound or peer address of `role`'s link.
    pub fn local_addr(&self, role: Role) -> Option<std::net::SocketAddr> {
        self.pipelines[role.index()]
            .as_ref()
            .and_then(Pipeline::local_addr)
    }

    /// Stops one role, leaving the other running.
    pub async fn stop_role(&mut self, role: Role) -> AppResult<()> {
        match self.pipelines[role.index()].take() {
            Some(pipeline) => pipeline.stop().await,
            None => Ok(()),
        }
    }

    /// Stops both roles.
    pub async fn stop(mut self) -> AppResult<()> {
        let mut result = Ok(());
        for role in Role::ALL {
            if let Err(e) = self.stop_role(role).await {
                warn!(%role, "Pipeline ended with error: {}", e);
                result = Err(e);
            }
        }
        for drain in self.drains {
            drain.await.ok();
        }
        result
    }
}

async fn drain(role: Role, mut readings: mpsc::Receiver<Reading>) {
    let mut count = 0u64;
    while readings.recv().await.is_some() {
        count += 1;
    }
    debug!(%role, count, "Read mode stream ended");
}
