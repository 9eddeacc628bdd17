//! Fixed-size round windows over one role's readings.
//!
//! The aggregator keeps the last `window_size` accepted readings in a ring buffer
//! together with the ids under which they were stored. A round closes each time
//! `window_size` new readings have arrived since the previous closure, so rounds of
//! a session never overlap.

use crate::model::{CentralTendency, Reading, Role, Round, SampleId, SessionId};
use crate::stats::{central_tendency, magnitude, stdev_about};
use std::collections::VecDeque;
use tracing::{info, warn};

/// Round produced by a window closure, with the samples it was computed from.
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedRound {
    pub round: Round,
    pub samples: Vec<SampleId>,
}

/// Parameters fixed for the lifetime of one role's aggregator.
#[derive(Debug, Clone)]
pub struct AggregatorParams {
    pub role: Role,
    pub session: SessionId,
    /// Readings per round.
    pub window_size: usize,
    /// Estimator of the round frequency.
    pub central: CentralTendency,
    /// Fictitious zero point for round magnitudes.
    pub zp_fict: f64,
    /// Dark frequency offset in Hz subtracted before taking magnitudes.
    pub freq_offset: f64,
}

/// Round windows of one role in one session.
pub struct RoundAggregator {
    params: AggregatorParams,
    ring: VecDeque<(SampleId, Reading)>,
    since_close: usize,
    next_seq: u32,
}

impl RoundAggregator {
    /// Starts at round 1 with an empty window. A zero window size is taken as 1.
    pub fn new(params: AggregatorParams) -> Self {
        let window = params.window_size.max(1);
        Self {
            params: AggregatorParams {
                window_size: window,
                ..params
            },
            ring: VecDeque::with_capacity(window),
            since_close: 0,
            next_seq: 1,
        }
    }

    pub fn role(&self) -> Role {
        self.params.role
    }

    /// Readings accumulated toward the next round.
    pub fn pending(&self) -> usize {
        self.since_close
    }

    pub fn window_size(&self) -> usize {
        self.params.window_size
    }

    /// Sequence number the next round will get.
    pub fn next_seq(&self) -> u32 {
        self.next_seq
    }

    /// Adds a stored reading; returns a round when the window is complete.
    pub fn push(&mut self, id: SampleId, reading: Reading) -> Option<ClosedRound> {
        if self.ring.len() == self.params.window_size {
            self.ring.pop_front();
        }
        self.ring.push_back((id, reading));
        self.since_close += 1;
        if self.since_close < self.params.window_size {
            return None;
        }
        self.since_close = 0;
        Some(self.close_window())
    }

    /// Records a round for a window in which the device sent nothing.
    ///
    /// Readings of an incomplete window are discarded so the next round starts clean.
    pub fn close_empty(&mut self) -> ClosedRound {
        if self.since_close > 0 {
            warn!(
                role = %self.params.role,
                discarded = self.since_close,
                "Discarding incomplete window after silence"
            );
        }
        self.ring.clear();
        self.since_close = 0;
        let round = Round {
            seq: self.take_seq(),
            role: self.params.role,
            session: self.params.session,
            freq: None,
            central: self.params.central,
            stddev: None,
            mag: None,
            zp_fict: self.params.zp_fict,
            freq_offset: self.params.freq_offset,
            zero_point: None,
            nsamples: 0,
            begin_tstamp: None,
            end_tstamp: None,
            duration: None,
        };
        warn!(role = %round.role, round = round.seq, "Empty round recorded, device silent");
        ClosedRound {
            round,
            samples: Vec::new(),
        }
    }

    fn take_seq(&mut self) -> u32 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn close_window(&mut self) -> ClosedRound {
        let seq = self.take_seq();
        let p = &self.params;
        let freqs: Vec<f64> = self.ring.iter().map(|(_, r)| r.freq).collect();
        let samples: Vec<SampleId> = self.ring.iter().map(|(id, _)| *id).collect();
        let begin = self.ring.front().map(|(_, r)| r.tstamp);
        let end = self.ring.back().map(|(_, r)| r.tstamp);

        let freq = central_tendency(p.central, &freqs);
        let stddev = freq.and_then(|center| stdev_about(&freqs, center));
        let mag = freq.and_then(|f| magnitude(p.zp_fict, f, p.freq_offset));
        let duration = match (begin, end) {
            (Some(b), Some(e)) => Some((e - b).num_milliseconds() as f64 / 1000.0),
            _ => None,
        };

        let round = Round {
            seq,
            role: p.role,
            session: p.session,
            freq,
            central: p.central,
            stddev,
            mag,
            zp_fict: p.zp_fict,
            freq_offset: p.freq_offset,
            zero_point: None,
            nsamples: freqs.len() as u32,
            begin_tstamp: begin,
            end_tstamp: end,
            duration,
        };
        log_round(&round);
        ClosedRound { round, samples }
    }
}

fn log_round(round: &Round) {
    let fmt = |v: Option<f64>, prec: usize| {
        v.map_or_else(|| "-".to_string(), |v| format!("{:.*}", prec, v))
    };
    info!(
        role = %round.role,
        round = round.seq,
        "{} ({}-{})[{:05.1}s][{}] {} f = {} Hz, \u{03C3} = {} Hz, m = {} @ {:.2}",
        round.role.label(),
        round.begin_tstamp.map_or_else(String::new, |t| t.format("%H:%M:%S").to_string()),
        round.end_tstamp.map_or_else(String::new, |t| t.format("%H:%M:%S").to_string()),
        round.duration.unwrap_or(0.0),
        round.nsamples,
        round.central,
        fmt(round.freq, 3),
        fmt(round.stddev, 3),
        fmt(round.mag, 2),
        round.zp_fict,
    );
}
