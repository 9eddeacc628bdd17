//! Repair of round standard deviations stored about the arithmetic mean.
//!
//! Older sessions stored each round's `stddev` about the mean of its samples even
//! when the round's central estimate was a median or mode. For such rounds the
//! repair recomputes the dispersion about the round's own central value and
//! overwrites the stored one. Mismatches the mean-based formula does not explain
//! are reported and left untouched.

use super::STDDEV_TOLERANCE;
use crate::error::AppResult;
use crate::model::{CentralTendency, Role, RoundId, SessionId};
use crate::stats::{central_tendency, stdev_about};
use crate::store::{Gateway, Query};
use serde::Serialize;
use tracing::{error, info};

/// A round whose stored deviation disagrees with its samples.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StddevFix {
    pub round_id: RoundId,
    pub session: SessionId,
    pub role: Role,
    pub seq: u32,
    pub old: Option<f64>,
    /// Deviation about the round's central value.
    pub new: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RepairReport {
    /// Rounds with samples that were inspected.
    pub examined: usize,
    /// Rounds explained by the mean-based formula. Written unless `dry_run`.
    pub fixed: Vec<StddevFix>,
    /// Rounds that disagree for any other reason. Never written.
    pub unexplained: Vec<StddevFix>,
    pub dry_run: bool,
}

/// Recomputes round deviations for `session` (or every session).
///
/// With `dry_run` the gateway is only read.
pub async fn repair_stddev(
    gateway: &dyn Gateway,
    session: Option<SessionId>,
    dry_run: bool,
) -> AppResult<RepairReport> {
    let mut report = RepairReport {
        dry_run,
        ..Default::default()
    };
    let query = Query {
        session,
        role: None,
    };

    for (round_id, round) in gateway.rounds(query).await? {
        if round.begin_tstamp.is_none() || round.end_tstamp.is_none() {
            continue;
        }
        let freqs: Vec<f64> = gateway
            .round_samples(round_id)
            .await?
            .into_iter()
            .map(|(_, s)| s.freq)
            .collect();
        let Some(center) = central_tendency(round.central, &freqs) else {
            continue;
        };
        let Some(computed) = stdev_about(&freqs, center) else {
            continue;
        };
        report.examined += 1;

        let stored = round.stddev;
        if stored.is_some_and(|s| (computed - s).abs() <= STDDEV_TOLERANCE) {
            continue;
        }
        let fix = StddevFix {
            round_id,
            session: round.session,
            role: round.role,
            seq: round.seq,
            old: stored,
            new: computed,
        };

        let about_mean = central_tendency(CentralTendency::Mean, &freqs)
            .and_then(|mean| stdev_about(&freqs, mean));
        let explained = match (about_mean, stored) {
            (Some(m), Some(s)) => (m - s).abs() <= STDDEV_TOLERANCE,
            _ => false,
        };
        if !explained {
            error!(
                session = %fix.session,
                role = %fix.role,
                "Round #{} stddev {:?} does not match {:.3} nor the mean-based value",
                fix.seq,
                fix.old,
                fix.new
            );
            report.unexplained.push(fix);
            continue;
        }

        info!(
            session = %fix.session,
            role = %fix.role,
            dry_run,
            "Round #{} stddev {:?} => {:.3}",
            fix.seq,
            fix.old,
            fix.new
        );
        if !dry_run {
            gateway
                .update_round_stddev(fix.round_id, Some(fix.new))
                .await?;
        }
        report.fixed.push(fix);
    }

    info!(
        examined = report.examined,
        fixed = report.fixed.len(),
        unexplained = report.unexplained.len(),
        dry_run,
        "Stddev repair finished"
    );
    Ok(report)
}
