//! Offline consistency verifier.
//!
//! Re-derives every stored aggregate from the data beneath it and reports each
//! disagreement as a [`Violation`]. The verifier only reads from the gateway; the
//! single write path is the opt-in [`repair`] of round standard deviations.

pub mod repair;

pub use repair::{repair_stddev, RepairReport, StddevFix};

use crate::error::AppResult;
use crate::model::{PhotometerId, Role, Round, RoundId, SampleId, SessionId, Summary};
use crate::stats::{central_tendency, magnitude, stdev_about};
use crate::store::{Gateway, Query};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use tracing::{info, warn};

/// Frequency tolerance in Hz.
pub const FREQ_TOLERANCE: f64 = 1e-3;
/// Magnitude tolerance.
pub const MAG_TOLERANCE: f64 = 5e-3;
/// Zero point tolerance.
pub const ZP_TOLERANCE: f64 = 5e-3;
/// Standard deviation tolerance in Hz.
pub const STDDEV_TOLERANCE: f64 = 5e-3;

/// Which layers of a session to check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Summary,
    Rounds,
    Samples,
    All,
}

impl Scope {
    fn summaries(self) -> bool {
        matches!(self, Scope::Summary | Scope::All)
    }

    fn rounds(self) -> bool {
        matches!(self, Scope::Rounds | Scope::All)
    }

    fn samples(self) -> bool {
        matches!(self, Scope::Samples | Scope::All)
    }
}

impl FromStr for Scope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "summary" => Ok(Scope::Summary),
            "rounds" => Ok(Scope::Rounds),
            "samples" => Ok(Scope::Samples),
            "all" => Ok(Scope::All),
            other => Err(format!(
                "Invalid scope '{}'. Must be one of: summary, rounds, samples, all",
                other
            )),
        }
    }
}

/// Entity a violation was found on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Entity {
    Summary,
    Round(u32),
    Sample(SampleId),
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entity::Summary => f.write_str("summary"),
            Entity::Round(seq) => write!(f, "round #{}", seq),
            Entity::Sample(id) => write!(f, "sample {}", id),
        }
    }
}

/// One failed assertion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Violation {
    pub session: SessionId,
    pub role: Role,
    pub entity: Entity,
    /// Name of the checked attribute.
    pub check: &'static str,
    pub expected: String,
    pub actual: String,
    pub tolerance: Option<f64>,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] [{}] {} {}: expected {}, stored {}",
            self.session, self.role, self.entity, self.check, self.expected, self.actual
        )?;
        if let Some(tol) = self.tolerance {
            write!(f, " (tolerance {})", tol)?;
        }
        Ok(())
    }
}

/// Outcome of a verification run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct VerificationReport {
    pub summaries: usize,
    pub rounds: usize,
    pub samples: usize,
    pub violations: Vec<Violation>,
}

impl VerificationReport {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }
}

fn show(value: Option<f64>) -> String {
    value.map_or_else(|| "null".to_string(), |v| format!("{:.6}", v))
}

/// Collects violations for one (session, role, entity).
struct Checker<'a> {
    session: SessionId,
    role: Role,
    entity: Entity,
    out: &'a mut Vec<Violation>,
}

impl Checker<'_> {
    fn push(&mut self, check: &'static str, expected: String, actual: String, tol: Option<f64>) {
        let violation = Violation {
            session: self.session,
            role: self.role,
            entity: self.entity,
            check,
            expected,
            actual,
            tolerance: tol,
        };
        warn!("{}", violation);
        self.out.push(violation);
    }

    fn close(&mut self, check: &'static str, expected: Option<f64>, actual: Option<f64>, tol: f64) {
        let agree = match (expected, actual) {
            (None, None) => true,
            (Some(e), Some(a)) => (e - a).abs() <= tol,
            _ => false,
        };
        if !agree {
            self.push(check, show(expected), show(actual), Some(tol));
        }
    }

    fn equal<T: PartialEq + fmt::Debug>(&mut self, check: &'static str, expected: T, actual: T) {
        if expected != actual {
            self.push(check, format!("{:?}", expected), format!("{:?}", actual), None);
        }
    }
}

/// Read-only consistency checks over a gateway.
pub struct Verifier<'a> {
    gateway: &'a dyn Gateway,
}

impl<'a> Verifier<'a> {
    pub fn new(gateway: &'a dyn Gateway) -> Self {
        Self { gateway }
    }

    /// Checks every summary of `session` (or of all sessions) at the given scope.
    pub async fn verify(
        &self,
        session: Option<SessionId>,
        scope: Scope,
    ) -> AppResult<VerificationReport> {
        let query = Query {
            session,
            role: None,
        };
        let mut report = VerificationReport::default();
        for (_, summary) in self.gateway.summaries(query).await? {
            self.verify_summary(&summary, scope, &mut report).await?;
        }
        info!(
            summaries = report.summaries,
            rounds = report.rounds,
            samples = report.samples,
            violations = report.violations.len(),
            "Verification finished"
        );
        Ok(report)
    }

    async fn verify_summary(
        &self,
        summary: &Summary,
        scope: Scope,
        report: &mut VerificationReport,
    ) -> AppResult<()> {
        let rounds = self
            .gateway
            .rounds(Query::session(summary.session).with_role(summary.role))
            .await?;
        if let Err(e) = self.gateway.photometer(summary.phot_id).await {
            Checker {
                session: summary.session,
                role: summary.role,
                entity: Entity::Summary,
                out: &mut report.violations,
            }
            .push("photometer", format!("{}", summary.phot_id), e.to_string(), None);
        }
        report.summaries += 1;

        if scope.summaries() {
            check_summary(summary, &rounds, &mut report.violations);
        }
        if scope.rounds() || scope.samples() {
            for (id, round) in &rounds {
                self.verify_round(*id, round, summary.phot_id, scope, report)
                    .await?;
            }
        }
        Ok(())
    }

    async fn verify_round(
        &self,
        id: RoundId,
        round: &Round,
        owner: PhotometerId,
        scope: Scope,
        report: &mut VerificationReport,
    ) -> AppResult<()> {
        let samples = self.gateway.round_samples(id).await?;
        report.rounds += 1;
        report.samples += samples.len();

        if scope.samples() {
            for (sample_id, sample) in &samples {
                let mut c = Checker {
                    session: round.session,
                    role: round.role,
                    entity: Entity::Sample(*sample_id),
                    out: &mut report.violations,
                };
                c.equal("role", round.role, sample.role);
                c.equal("session", round.session, sample.session);
                c.equal("photometer", owner, sample.phot_id);
            }
        }
        if !scope.rounds() {
            return Ok(());
        }

        let mut c = Checker {
            session: round.session,
            role: round.role,
            entity: Entity::Round(round.seq),
            out: &mut report.violations,
        };
        c.equal("nsamples", samples.len() as u32, round.nsamples);
        c.equal(
            "begin_tstamp",
            samples.first().map(|(_, s)| s.tstamp),
            round.begin_tstamp,
        );
        c.equal(
            "end_tstamp",
            samples.last().map(|(_, s)| s.tstamp),
            round.end_tstamp,
        );
        if round.role == Role::Ref {
            c.equal("zero_point", None, round.zero_point);
        }
        if round.is_empty() {
            c.close("freq", None, round.freq, FREQ_TOLERANCE);
            c.close("stddev", None, round.stddev, STDDEV_TOLERANCE);
            c.close("mag", None, round.mag, MAG_TOLERANCE);
            return Ok(());
        }

        let freqs: Vec<f64> = samples.iter().map(|(_, s)| s.freq).collect();
        let freq = central_tendency(round.central, &freqs);
        c.close("freq", freq, round.freq, FREQ_TOLERANCE);
        let stddev = freq.and_then(|center| stdev_about(&freqs, center));
        c.close("stddev", stddev, round.stddev, STDDEV_TOLERANCE);
        // the offset stored on the round, not the photometer's current one
        let mag = round
            .freq
            .and_then(|f| magnitude(round.zp_fict, f, round.freq_offset));
        c.close("mag", mag, round.mag, MAG_TOLERANCE);
        Ok(())
    }
}

fn check_summary(
    summary: &Summary,
    rounds: &[(RoundId, Round)],
    out: &mut Vec<Violation>,
) {
    let mut c = Checker {
        session: summary.session,
        role: summary.role,
        entity: Entity::Summary,
        out,
    };
    if let Some(nrounds) = summary.nrounds {
        c.equal("nrounds", rounds.len() as u32, nrounds);
    }

    let freqs: Vec<f64> = rounds.iter().filter_map(|(_, r)| r.freq).collect();
    if let Some(method) = summary.freq_method {
        c.close(
            "freq",
            central_tendency(method, &freqs),
            summary.freq,
            FREQ_TOLERANCE,
        );
    }

    // every round of a session shares the same fictitious zero point
    if let Some((_, first)) = rounds.first() {
        let mag = summary
            .freq
            .and_then(|f| magnitude(first.zp_fict, f, summary.freq_offset));
        c.close("mag", mag, summary.mag, MAG_TOLERANCE);
    }

    match (summary.role, summary.zero_point_method) {
        (Role::Test, Some(method)) => {
            let zps: Vec<f64> = rounds.iter().filter_map(|(_, r)| r.zero_point).collect();
            let zp = central_tendency(method, &zps).map(|zp| zp + summary.zp_offset);
            c.close("zero_point", zp, summary.zero_point, ZP_TOLERANCE);
        }
        (Role::Ref, _) => c.close("zero_point", None, summary.zero_point, ZP_TOLERANCE),
        (Role::Test, None) => {}
    }
}
