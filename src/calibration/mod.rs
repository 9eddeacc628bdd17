//! Session-level calibration.
//!
//! [`CalibrationEngine`] is the per-role state machine that turns a session's rounds
//! into a [`Summary`]. [`session`] wires the engines, the aggregators and the two
//! acquisition pipelines into a complete calibration run.

pub mod session;

pub use session::{Calibrator, ReadMode, SessionOutcome};

use crate::error::{AppResult, ZptessError};
use crate::model::{
    CalibrationKind, CalibrationMetadata, CentralTendency, PhotometerId, Role, Round, SessionId,
    Summary,
};
use crate::stats::{central_tendency, magnitude};
use tracing::info;

/// Inputs fixed for one role of one session.
#[derive(Debug, Clone)]
pub struct EngineParams {
    pub role: Role,
    pub session: SessionId,
    /// Photometer the summary is stored against.
    pub phot_id: PhotometerId,
    /// Rounds needed before the summary is produced.
    pub nrounds: u32,
    /// Estimator of the summary frequency over round frequencies.
    pub freq_method: CentralTendency,
    /// Estimator of the zero point over round zero points.
    pub zp_method: CentralTendency,
    /// Added to the estimated zero point.
    pub zp_offset: f64,
    /// Fictitious zero point for the summary magnitude.
    pub zp_fict: f64,
    /// Dark frequency offset in Hz of this role's unit.
    pub freq_offset: f64,
    /// Device zero point before calibration.
    pub prev_zp: Option<f64>,
    pub calibration: CalibrationKind,
    pub metadata: CalibrationMetadata,
}

#[derive(Debug, Clone)]
enum State {
    Collecting(Vec<Round>),
    Finalized(Box<Summary>),
}

/// `Collecting → Finalized` state machine for one role.
///
/// A finalized engine rejects further rounds; each session builds new engines.
#[derive(Debug, Clone)]
pub struct CalibrationEngine {
    params: EngineParams,
    state: State,
}

impl CalibrationEngine {
    /// Engine in the `Collecting` state with no rounds.
    pub fn new(params: EngineParams) -> Self {
        Self {
            params,
            state: State::Collecting(Vec::new()),
        }
    }

    pub fn role(&self) -> Role {
        self.params.role
    }

    pub fn is_finalized(&self) -> bool {
        matches!(self.state, State::Finalized(_))
    }

    /// Rounds collected so far.
    pub fn collected(&self) -> usize {
        match &self.state {
            State::Collecting(rounds) => rounds.len(),
            State::Finalized(_) => self.params.nrounds as usize,
        }
    }

    /// The summary, once finalized.
    pub fn summary(&self) -> Option<&Summary> {
        match &self.state {
            State::Finalized(summary) => Some(summary.as_ref()),
            State::Collecting(_) => None,
        }
    }

    /// Adds a closed round. Returns the summary when this round completes the session.
    pub fn push(&mut self, round: Round) -> AppResult<Option<Summary>> {
        let rounds = match &mut self.state {
            State::Collecting(rounds) => rounds,
            State::Finalized(_) => return Err(ZptessError::AlreadyFinalized(self.params.role)),
        };
        rounds.push(round);
        if rounds.len() < self.params.nrounds as usize {
            return Ok(None);
        }
        let summary = summarize(&self.params, rounds);
        self.state = State::Finalized(Box::new(summary.clone()));
        Ok(Some(summary))
    }
}

/// Summary of `rounds` for the parameters' role.
///
/// Round values that are null (empty rounds) do not enter the central estimates;
/// `nrounds` still counts every round.
pub fn summarize(params: &EngineParams, rounds: &[Round]) -> Summary {
    let freqs: Vec<f64> = rounds.iter().filter_map(|r| r.freq).collect();
    let freq = central_tendency(params.freq_method, &freqs);
    let mag = freq.and_then(|f| magnitude(params.zp_fict, f, params.freq_offset));

    let (zero_point, zero_point_method, prev_zp) = match params.role {
        Role::Ref => (None, None, None),
        Role::Test => {
            let zps: Vec<f64> = rounds.iter().filter_map(|r| r.zero_point).collect();
            let zp = central_tendency(params.zp_method, &zps).map(|zp| zp + params.zp_offset);
            (zp, Some(params.zp_method), params.prev_zp)
        }
    };

    let summary = Summary {
        phot_id: params.phot_id,
        session: params.session,
        role: params.role,
        calibration: Some(params.calibration),
        calversion: Some(env!("CARGO_PKG_VERSION").to_string()),
        prev_zp,
        nrounds: Some(rounds.len() as u32),
        zp_offset: params.zp_offset,
        upd_flag: None,
        zero_point,
        zero_point_method,
        freq,
        freq_method: Some(params.freq_method),
        mag,
        freq_offset: params.freq_offset,
        metadata: params.metadata.clone(),
    };
    info!(
        role = %summary.role,
        session = %summary.session,
        nrounds = rounds.len(),
        freq = ?summary.freq,
        mag = ?summary.mag,
        zero_point = ?summary.zero_point,
        "{} summary: {} f over {} rounds",
        summary.role.label(),
        params.freq_method,
        rounds.len()
    );
    summary
}

/// Zero point of test round `k` from the paired reference round.
///
/// `ref_zp + (ref_mag − test_mag)`; null if either magnitude is null.
pub fn round_zero_point(ref_zp: f64, ref_mag: Option<f64>, test_mag: Option<f64>) -> Option<f64> {
    Some(ref_zp + (ref_mag? - test_mag?))
}
