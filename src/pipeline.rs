//! Per-role acquisition pipeline: transport → decoder → bounded channel.
//!
//! The decoder runs inline on the transport task. Accepted readings are offered to a
//! bounded channel with `try_send`; when the consumer lags, the newest reading is
//! dropped and counted instead of stalling the link. Every accepted reading also
//! produces a human-readable line on a broadcast stream for front-ends.
//!
//! A supervisor task owns the transport. It publishes the role's [`RoleStatus`] and
//! logs link failures, so that a failing role never affects the other one.

use crate::endpoint::Endpoint;
use crate::error::AppResult;
use crate::model::{Reading, Role};
use crate::protocol::{Decoded, Decoder, Protocol};
use crate::transport::{self, FrameSink};
use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

const LINE_STREAM_CAPACITY: usize = 64;

/// Readiness of one role, as seen by front-ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoleStatus {
    /// Identifying the device or opening its link.
    Starting,
    /// Link open and readings flowing.
    Online,
    /// Not acquiring: metadata failed, link failed, or the pipeline was stopped.
    Offline(String),
}

/// Front-end facing signals of one role: readiness, per-reading log lines and
/// progress toward the next round.
///
/// Cheap to clone; clones publish to the same subscribers.
#[derive(Debug, Clone)]
pub struct RoleSignals {
    status: Arc<watch::Sender<RoleStatus>>,
    lines: broadcast::Sender<String>,
    progress: Arc<watch::Sender<usize>>,
}

impl RoleSignals {
    pub fn new() -> Self {
        let (status, _) = watch::channel(RoleStatus::Starting);
        let (lines, _) = broadcast::channel(LINE_STREAM_CAPACITY);
        let (progress, _) = watch::channel(0);
        Self {
            status: Arc::new(status),
            lines,
            progress: Arc::new(progress),
        }
    }

    /// Readiness signal.
    pub fn status(&self) -> watch::Receiver<RoleStatus> {
        self.status.subscribe()
    }

    /// Human-readable lines, one per accepted reading.
    pub fn lines(&self) -> broadcast::Receiver<String> {
        self.lines.subscribe()
    }

    /// Samples accumulated toward the next round.
    pub fn progress(&self) -> watch::Receiver<usize> {
        self.progress.subscribe()
    }

    pub(crate) fn set_status(&self, status: RoleStatus) {
        self.status.send_replace(status);
    }

    pub(crate) fn set_progress(&self, pending: usize) {
        self.progress.send_replace(pending);
    }
}

impl Default for RoleSignals {
    fn default() -> Self {
        Self::new()
    }
}

/// Static wiring of one role's pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub role: Role,
    pub endpoint: Endpoint,
    pub protocol: Protocol,
    pub channel_capacity: usize,
    pub max_frame_bytes: usize,
}

/// Counters shared between the transport task and the pipeline handle.
#[derive(Debug, Default)]
pub struct PipelineStats {
    accepted: AtomicU64,
    rejected: AtomicU64,
    duplicates: AtomicU64,
    dropped: AtomicU64,
}

impl PipelineStats {
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates.load(Ordering::Relaxed)
    }

    /// Readings lost to a full channel.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Renders the per-reading log line.
pub fn format_reading(reading: &Reading) -> String {
    let opt = |v: Option<f64>| v.map_or_else(|| "-".to_string(), |v| format!("{:.2}", v));
    let seq = reading
        .seq
        .map_or_else(|| "-".to_string(), |s| s.to_string());
    format!(
        "{} [{}] {} f = {:.3} Hz, tbox = {}, tsky = {}, zp = {}",
        reading.role.label(),
        seq,
        reading.tstamp.format("%H:%M:%S%.3f"),
        reading.freq,
        opt(reading.tbox),
        opt(reading.tsky),
        opt(reading.zp),
    )
}

struct DecodeSink {
    decoder: Decoder,
    last: Option<Reading>,
    readings: mpsc::Sender<Reading>,
    lines: broadcast::Sender<String>,
    stats: Arc<PipelineStats>,
}

impl FrameSink for DecodeSink {
    fn on_frame(&mut self, frame: &[u8], tstamp: DateTime<Utc>) {
        let role = self.decoder.role();
        let reading = match self.decoder.decode(frame, tstamp, &mut self.last) {
            Decoded::Reading(reading) => reading,
            Decoded::Rejected => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                debug!(%role, frame = %String::from_utf8_lossy(frame), "Rejected undecodable frame");
                return;
            }
            Decoded::Duplicate => {
                self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
                trace!(%role, "Suppressed duplicate reading");
                return;
            }
        };
        self.stats.accepted.fetch_add(1, Ordering::Relaxed);

        let line = format_reading(&reading);
        info!(%role, "{}", line);
        // no subscribers is fine
        let _ = self.lines.send(line);

        match self.readings.try_send(reading) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.stats.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(%role, dropped, "Reading channel full, dropped newest reading");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(%role, "Reading consumer closed");
            }
        }
    }
}

/// A running acquisition pipeline for one role.
pub struct Pipeline {
    role: Role,
    stop: Option<oneshot::Sender<()>>,
    supervisor: JoinHandle<AppResult<()>>,
    signals: RoleSignals,
    stats: Arc<PipelineStats>,
    local_addr: Option<SocketAddr>,
}

impl Pipeline {
    /// Opens the role's link and starts decoding.
    ///
    /// Returns the pipeline handle and the receiving end of the bounded reading
    /// channel. A link that cannot be opened is reported here and marks the role
    /// offline on `signals`.
    pub async fn start(
        config: PipelineConfig,
        signals: RoleSignals,
    ) -> AppResult<(Self, mpsc::Receiver<Reading>)> {
        let role = config.role;
        signals.set_status(RoleStatus::Starting);

        let (readings_tx, readings_rx) = mpsc::channel(config.channel_capacity);
        let stats = Arc::new(PipelineStats::default());
        let sink = DecodeSink {
            decoder: Decoder::new(role, config.protocol),
            last: None,
            readings: readings_tx,
            lines: signals.lines.clone(),
            stats: Arc::clone(&stats),
        };

        let mut transport =
            match transport::start(role, &config.endpoint, config.max_frame_bytes, sink).await {
                Ok(transport) => transport,
                Err(e) => {
                    error!(%role, endpoint = %config.endpoint, "Cannot open link: {}", e);
                    signals.set_status(RoleStatus::Offline(e.to_string()));
                    return Err(e);
                }
            };
        info!(%role, endpoint = %config.endpoint, protocol = %config.protocol, "Pipeline started");
        signals.set_status(RoleStatus::Online);
        let local_addr = transport.local_addr();

        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let status = signals.clone();
        let supervisor = tokio::spawn(async move {
            let ended = tokio::select! {
                _ = &mut stop_rx => None,
                result = transport.finished() => Some(result),
            };
            let result = match ended {
                None => transport.stop().await,
                Some(result) => result,
            };
            match &result {
                Ok(()) => {
                    info!(%role, "Pipeline stopped");
                    status.set_status(RoleStatus::Offline("stopped".to_string()));
                }
                Err(e) => {
                    error!(%role, "Pipeline ended: {}", e);
                    status.set_status(RoleStatus::Offline(e.to_string()));
                }
            }
            result
        });

        Ok((
            Self {
                role,
                stop: Some(stop_tx),
                supervisor,
                signals,
                stats,
                local_addr,
            },
            readings_rx,
        ))
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Stream of human-readable lines, one per accepted reading.
    pub fn subscribe_lines(&self) -> broadcast::Receiver<String> {
        self.signals.lines()
    }

    /// Readiness signal of this role.
    pub fn status(&self) -> watch::Receiver<RoleStatus> {
        self.signals.status()
    }

    /// Bound (UDP) or peer (TCP) address of the link.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    /// True while the link is open.
    pub fn is_running(&self) -> bool {
        !self.supervisor.is_finished()
    }

    /// Stops the transport and waits until its link is released.
    ///
    /// Readings still queued in the channel are left to the receiver, which may
    /// drain or drop them.
    pub async fn stop(mut self) -> AppResult<()> {
        if let Some(tx) = self.stop.take() {
            let _ = tx.send(());
        }
        self.supervisor
            .await
            .map_err(|e| crate::error::ZptessError::Io(std::io::Error::other(e)))?
    }
}
