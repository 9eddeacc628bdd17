//! Persistence gateway contract.
//!
//! The calibration core only needs create, query and a narrow update surface over
//! the four persisted entity kinds. Each create call is one unit of work: either the
//! entity (and, for rounds, its sample links) is stored completely or nothing is.
//!
//! Uniqueness constraints enforced by every gateway:
//! - `Sample`: (tstamp, role)
//! - `Round`: (session, seq, role)
//! - `Summary`: (session, role)
//! - `Photometer`: (name, mac)

pub mod memory;

pub use memory::{MemoryStore, StoreSnapshot};

use crate::model::{
    Photometer, PhotometerId, Role, Round, RoundId, Sample, SampleId, SessionId, Summary,
    SummaryId,
};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Duplicate entity: {0}")]
    Duplicate(String),

    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Snapshot I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Snapshot serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Selects entities by session and/or role. Empty fields match everything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Query {
    pub session: Option<SessionId>,
    pub role: Option<Role>,
}

impl Query {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn session(session: SessionId) -> Self {
        Self {
            session: Some(session),
            role: None,
        }
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }

    pub fn matches(&self, session: SessionId, role: Role) -> bool {
        self.session.map_or(true, |s| s == session) && self.role.map_or(true, |r| r == role)
    }
}

/// Storage used by the online calibration path and the offline verifier.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Stores a new photometer; (name, mac) must be unused.
    async fn create_photometer(&self, photometer: Photometer) -> StoreResult<PhotometerId>;

    /// Re-provisions an existing photometer record.
    async fn update_photometer(&self, id: PhotometerId, photometer: Photometer)
        -> StoreResult<()>;

    async fn photometer(&self, id: PhotometerId) -> StoreResult<Photometer>;

    /// Photometer with this (name, mac), if any.
    async fn find_photometer(
        &self,
        name: &str,
        mac: &str,
    ) -> StoreResult<Option<(PhotometerId, Photometer)>>;

    /// Stores a sample; (tstamp, role) must be unused.
    async fn create_sample(&self, sample: Sample) -> StoreResult<SampleId>;

    /// Stores a round and links it to `samples` in one unit of work.
    async fn create_round(&self, round: Round, samples: &[SampleId]) -> StoreResult<RoundId>;

    /// Stores a session summary; (session, role) must be unused.
    async fn create_summary(&self, summary: Summary) -> StoreResult<SummaryId>;

    /// Summaries ordered by session, then role.
    async fn summaries(&self, query: Query) -> StoreResult<Vec<(SummaryId, Summary)>>;

    /// Rounds ordered by session, role, then sequence number.
    async fn rounds(&self, query: Query) -> StoreResult<Vec<(RoundId, Round)>>;

    /// Samples ordered by timestamp.
    async fn samples(&self, query: Query) -> StoreResult<Vec<(SampleId, Sample)>>;

    /// Samples linked to `round`, ordered by timestamp.
    async fn round_samples(&self, round: RoundId) -> StoreResult<Vec<(SampleId, Sample)>>;

    /// Overwrites a round's stored standard deviation. Used by the repair path only.
    async fn update_round_stddev(&self, round: RoundId, stddev: Option<f64>) -> StoreResult<()>;

    /// Distinct session ids with at least one summary or round, oldest first.
    async fn sessions(&self) -> StoreResult<Vec<SessionId>>;
}
