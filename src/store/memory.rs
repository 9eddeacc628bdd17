//! In-memory gateway with an optional JSON snapshot file.
//!
//! Entities live in per-kind arenas; an entity's id is its 1-based position in its
//! arena. The many-to-many link between rounds and samples is a separate relation of
//! `(RoundId, SampleId)` pairs, so neither side holds references to the other.

use super::{Gateway, Query, StoreError, StoreResult};
use crate::model::{
    Photometer, PhotometerId, Role, Round, RoundId, Sample, SampleId, SessionId, Summary,
    SummaryId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Full contents of a [`MemoryStore`], as written to a snapshot file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub photometers: Vec<Photometer>,
    pub samples: Vec<Sample>,
    pub rounds: Vec<Round>,
    pub summaries: Vec<Summary>,
    pub samples_rounds: Vec<(RoundId, SampleId)>,
}

fn slot(id: u64, len: usize) -> Option<usize> {
    let idx = usize::try_from(id).ok()?.checked_sub(1)?;
    (idx < len).then_some(idx)
}

fn next_id(len: usize) -> u64 {
    len as u64 + 1
}

#[derive(Debug, Default)]
struct Tables {
    data: StoreSnapshot,
    /// `(tstamp, role)` of every stored sample.
    sample_keys: HashSet<(DateTime<Utc>, Role)>,
}

impl From<StoreSnapshot> for Tables {
    fn from(data: StoreSnapshot) -> Self {
        let sample_keys = data.samples.iter().map(|s| (s.tstamp, s.role)).collect();
        Self { data, sample_keys }
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        Self {
            tables: RwLock::new(Tables::from(snapshot)),
        }
    }

    /// Loads a snapshot file. A missing file yields an empty store.
    pub async fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let path = path.as_ref();
        match tokio::fs::read(path).await {
            Ok(bytes) => {
                let snapshot: StoreSnapshot = serde_json::from_slice(&bytes)?;
                info!(
                    path = %path.display(),
                    samples = snapshot.samples.len(),
                    rounds = snapshot.rounds.len(),
                    summaries = snapshot.summaries.len(),
                    "Opened store snapshot"
                );
                Ok(Self::from_snapshot(snapshot))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No snapshot yet, starting empty");
                Ok(Self::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Writes the whole store to `path`, replacing it atomically.
    pub async fn save<P: AsRef<Path>>(&self, path: P) -> StoreResult<()> {
        let path = path.as_ref();
        let bytes = {
            let tables = self.tables.read().await;
            serde_json::to_vec_pretty(&tables.data)?
        };
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        info!(path = %path.display(), bytes = bytes.len(), "Saved store snapshot");
        Ok(())
    }

    /// Copy of the current contents.
    pub async fn snapshot(&self) -> StoreSnapshot {
        self.tables.read().await.data.clone()
    }
}

#[async_trait]
impl Gateway for MemoryStore {
    async fn create_photometer(&self, photometer: Photometer) -> StoreResult<PhotometerId> {
        let mut t = self.tables.write().await;
        if t
            .data
            .photometers
            .iter()
            .any(|p| p.name == photometer.name && p.mac == photometer.mac)
        {
            return Err(StoreError::Duplicate(format!(
                "photometer {} ({})",
                photometer.name, photometer.mac
            )));
        }
        t.data.photometers.push(photometer);
        Ok(PhotometerId(next_id(t.data.photometers.len() - 1)))
    }

    async fn update_photometer(
        &self,
        id: PhotometerId,
        photometer: Photometer,
    ) -> StoreResult<()> {
        let mut t = self.tables.write().await;
        let idx = slot(id.0, t.data.photometers.len())
            .ok_or_else(|| StoreError::NotFound(format!("photometer {}", id)))?;
        t.data.photometers[idx] = photometer;
        Ok(())
    }

    async fn photometer(&self, id: PhotometerId) -> StoreResult<Photometer> {
        let t = self.tables.read().await;
        slot(id.0, t.data.photometers.len())
            .map(|idx| t.data.photometers[idx].clone())
            .ok_or_else(|| StoreError::NotFound(format!("photometer {}", id)))
    }

    async fn find_photometer(
        &self,
        name: &str,
        mac: &str,
    ) -> StoreResult<Option<(PhotometerId, Photometer)>> {
        let t = self.tables.read().await;
        Ok(t
            .data
            .photometers
            .iter()
            .enumerate()
            .find(|(_, p)| p.name == name && p.mac == mac)
            .map(|(i, p)| (PhotometerId(next_id(i)), p.clone())))
    }

    async fn create_sample(&self, sample: Sample) -> StoreResult<SampleId> {
        let mut t = self.tables.write().await;
        if slot(sample.phot_id.0, t.data.photometers.len()).is_none() {
            return Err(StoreError::NotFound(format!("photometer {}", sample.phot_id)));
        }
        if !t.sample_keys.insert((sample.tstamp, sample.role)) {
            return Err(StoreError::Duplicate(format!(
                "{} sample at {}",
                sample.role, sample.tstamp
            )));
        }
        t.data.samples.push(sample);
        Ok(SampleId(next_id(t.data.samples.len() - 1)))
    }

    async fn create_round(&self, round: Round, samples: &[SampleId]) -> StoreResult<RoundId> {
        let mut t = self.tables.write().await;
        if t
            .data
            .rounds
            .iter()
            .any(|r| r.session == round.session && r.seq == round.seq && r.role == round.role)
        {
            return Err(StoreError::Duplicate(format!(
                "{} round {} of session {}",
                round.role, round.seq, round.session
            )));
        }
        if let Some(missing) = samples
            .iter()
            .find(|id| slot(id.0, t.data.samples.len()).is_none())
        {
            return Err(StoreError::NotFound(format!("sample {}", missing)));
        }
        t.data.rounds.push(round);
        let id = RoundId(next_id(t.data.rounds.len() - 1));
        t.data.samples_rounds.extend(samples.iter().map(|s| (id, *s)));
        Ok(id)
    }

    async fn create_summary(&self, summary: Summary) -> StoreResult<SummaryId> {
        let mut t = self.tables.write().await;
        if t
            .data
            .summaries
            .iter()
            .any(|s| s.session == summary.session && s.role == summary.role)
        {
            return Err(StoreError::Duplicate(format!(
                "{} summary of session {}",
                summary.role, summary.session
            )));
        }
        t.data.summaries.push(summary);
        Ok(SummaryId(next_id(t.data.summaries.len() - 1)))
    }

    async fn summaries(&self, query: Query) -> StoreResult<Vec<(SummaryId, Summary)>> {
        let t = self.tables.read().await;
        let mut found: Vec<(SummaryId, Summary)> = t
            .data
            .summaries
            .iter()
            .enumerate()
            .filter(|(_, s)| query.matches(s.session, s.role))
            .map(|(i, s)| (SummaryId(next_id(i)), s.clone()))
            .collect();
        found.sort_by_key(|(_, s)| (s.session, s.role));
        Ok(found)
    }

    async fn rounds(&self, query: Query) -> StoreResult<Vec<(RoundId, Round)>> {
        let t = self.tables.read().await;
        let mut found: Vec<(RoundId, Round)> = t
            .data
            .rounds
            .iter()
            .enumerate()
            .filter(|(_, r)| query.matches(r.session, r.role))
            .map(|(i, r)| (RoundId(next_id(i)), r.clone()))
            .collect();
        found.sort_by_key(|(_, r)| (r.session, r.role, r.seq));
        Ok(found)
    }

    async fn samples(&self, query: Query) -> StoreResult<Vec<(SampleId, Sample)>> {
        let t = self.tables.read().await;
        let mut found: Vec<(SampleId, Sample)> = t
            .data
            .samples
            .iter()
            .enumerate()
            .filter(|(_, s)| query.matches(s.session, s.role))
            .map(|(i, s)| (SampleId(next_id(i)), s.clone()))
            .collect();
        found.sort_by_key(|(_, s)| s.tstamp);
        Ok(found)
    }

    async fn round_samples(&self, round: RoundId) -> StoreResult<Vec<(SampleId, Sample)>> {
        let t = self.tables.read().await;
        if slot(round.0, t.data.rounds.len()).is_none() {
            return Err(StoreError::NotFound(format!("round {}", round)));
        }
        let mut found = Vec::new();
        for (r, s) in &t.data.samples_rounds {
            if *r != round {
                continue;
            }
            let idx = slot(s.0, t.data.samples.len())
                .ok_or_else(|| StoreError::NotFound(format!("sample {}", s)))?;
            found.push((*s, t.data.samples[idx].clone()));
        }
        found.sort_by_key(|(_, s)| s.tstamp);
        Ok(found)
    }

    async fn update_round_stddev(&self, round: RoundId, stddev: Option<f64>) -> StoreResult<()> {
        let mut t = self.tables.write().await;
        let idx = slot(round.0, t.data.rounds.len())
            .ok_or_else(|| StoreError::NotFound(format!("round {}", round)))?;
        t.data.rounds[idx].stddev = stddev;
        Ok(())
    }

    async fn sessions(&self) -> StoreResult<Vec<SessionId>> {
        let t = self.tables.read().await;
        let sessions: BTreeSet<SessionId> = t
            .data
            .summaries
            .iter()
            .map(|s| s.session)
            .chain(t.data.rounds.iter().map(|r| r.session))
            .collect();
        Ok(sessions.into_iter().collect())
    }
}
