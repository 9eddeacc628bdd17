//! Data model shared by the acquisition, calibration and verification layers.
//!
//! `Reading` is the in-memory product of the decoder. `Photometer`, `Sample`, `Round`
//! and `Summary` are the persisted entities handled by the [`crate::store::Gateway`].
//! Entities carry no identifiers of their own; the gateway hands out typed ids on
//! creation and returns `(id, entity)` pairs from queries. The many-to-many relation
//! between rounds and samples lives in the gateway as an explicit join relation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Device identity within a calibration session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Trusted, already calibrated unit.
    Ref,
    /// Unit being calibrated.
    Test,
}

impl Role {
    /// Both roles, reference first.
    pub const ALL: [Role; 2] = [Role::Ref, Role::Test];

    /// Fixed-width label used in log lines.
    pub fn label(self) -> &'static str {
        match self {
            Role::Ref => "REF.",
            Role::Test => "TEST",
        }
    }

    /// Position of this role in two-element per-role arrays.
    pub fn index(self) -> usize {
        match self {
            Role::Ref => 0,
            Role::Test => 1,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Ref => f.write_str("ref"),
            Role::Test => f.write_str("test"),
        }
    }
}

/// Estimator used to summarize a set of values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CentralTendency {
    /// Arithmetic mean.
    Mean,
    /// Low median.
    Median,
    /// Most frequent exact value.
    Mode,
}

impl fmt::Display for CentralTendency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CentralTendency::Mean => f.write_str("mean"),
            CentralTendency::Median => f.write_str("median"),
            CentralTendency::Mode => f.write_str("mode"),
        }
    }
}

impl FromStr for CentralTendency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "mean" => Ok(CentralTendency::Mean),
            "median" => Ok(CentralTendency::Median),
            "mode" => Ok(CentralTendency::Mode),
            other => Err(format!(
                "Invalid central tendency '{}'. Must be one of: mean, median, mode",
                other
            )),
        }
    }
}

/// Calibration session identifier: the UTC instant the session started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub DateTime<Utc>);

impl SessionId {
    /// A session starting now, truncated to whole seconds.
    pub fn now() -> Self {
        let now = Utc::now();
        Self(DateTime::from_timestamp(now.timestamp(), 0).unwrap_or(now))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%dT%H:%M:%S"))
    }
}

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

entity_id!(
    /// Identifier of a stored [`Photometer`].
    PhotometerId
);
entity_id!(
    /// Identifier of a stored [`Sample`].
    SampleId
);
entity_id!(
    /// Identifier of a stored [`Round`].
    RoundId
);
entity_id!(
    /// Identifier of a stored [`Summary`].
    SummaryId
);

/// One decoded photometer measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub role: Role,
    pub tstamp: DateTime<Utc>,
    /// Frequency in Hz.
    pub freq: f64,
    /// Box (ambient) temperature in °C.
    pub tbox: Option<f64>,
    /// Sky temperature in °C.
    pub tsky: Option<f64>,
    /// Zero point the device reports for itself.
    pub zp: Option<f64>,
    /// Sequence indicator, present only in the JSON protocol.
    pub seq: Option<u64>,
}

/// Identity of a physical device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Photometer {
    pub name: String,
    pub mac: String,
    pub model: String,
    pub sensor: String,
    pub firmware: String,
    /// Nominal zero point as read from the device.
    pub zero_point: f64,
    /// Dark frequency offset in Hz.
    pub freq_offset: f64,
}

/// Persisted form of a [`Reading`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub phot_id: PhotometerId,
    pub session: SessionId,
    pub role: Role,
    pub tstamp: DateTime<Utc>,
    pub seq: Option<u64>,
    pub freq: f64,
    pub tbox: Option<f64>,
    pub tsky: Option<f64>,
    pub zp: Option<f64>,
}

impl Sample {
    /// Persisted form of `reading`, owned by `phot_id`.
    pub fn from_reading(reading: &Reading, phot_id: PhotometerId, session: SessionId) -> Self {
        Self {
            phot_id,
            session,
            role: reading.role,
            tstamp: reading.tstamp,
            seq: reading.seq,
            freq: reading.freq,
            tbox: reading.tbox,
            tsky: reading.tsky,
            zp: reading.zp,
        }
    }
}

/// Aggregate over one window of samples for one role.
///
/// A round with `nsamples == 0` records a window in which the device went silent:
/// its timestamps and central values are all `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Round {
    /// Round number within the session, starting at 1.
    pub seq: u32,
    pub role: Role,
    pub session: SessionId,
    pub freq: Option<f64>,
    pub central: CentralTendency,
    pub stddev: Option<f64>,
    /// Instrumental magnitude computed with `zp_fict` and `freq_offset`.
    pub mag: Option<f64>,
    pub zp_fict: f64,
    /// Dark frequency offset in Hz the magnitude was computed with.
    #[serde(default)]
    pub freq_offset: f64,
    /// Zero point estimated for this round (test role only).
    pub zero_point: Option<f64>,
    pub nsamples: u32,
    pub begin_tstamp: Option<DateTime<Utc>>,
    pub end_tstamp: Option<DateTime<Utc>>,
    /// Seconds between the first and last sample.
    pub duration: Option<f64>,
}

impl Round {
    /// True when no sample contributed to this round.
    pub fn is_empty(&self) -> bool {
        self.nsamples == 0
    }
}

/// How a summary was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CalibrationKind {
    Auto,
    Manual,
}

/// Free-text calibration metadata attached to each summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibrationMetadata {
    pub author: Option<String>,
    pub comment: Option<String>,
    pub filter: Option<String>,
    pub plug: Option<String>,
    #[serde(rename = "box")]
    pub box_model: Option<String>,
    pub collector: Option<String>,
}

/// Final result of a calibration session for one role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub phot_id: PhotometerId,
    pub session: SessionId,
    pub role: Role,
    pub calibration: Option<CalibrationKind>,
    pub calversion: Option<String>,
    /// Device zero point before calibration (test role only).
    pub prev_zp: Option<f64>,
    pub nrounds: Option<u32>,
    /// Manual offset added to the computed zero point.
    pub zp_offset: f64,
    /// Whether the new zero point was written to the device.
    pub upd_flag: Option<bool>,
    pub zero_point: Option<f64>,
    pub zero_point_method: Option<CentralTendency>,
    pub freq: Option<f64>,
    pub freq_method: Option<CentralTendency>,
    pub mag: Option<f64>,
    /// Dark frequency offset in Hz the magnitude was computed with.
    #[serde(default)]
    pub freq_offset: f64,
    pub metadata: CalibrationMetadata,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn central_tendency_parses_case_insensitively() {
        assert_eq!("Median".parse::<CentralTendency>(), Ok(CentralTendency::Median));
        assert_eq!(" mode ".parse::<CentralTendency>(), Ok(CentralTendency::Mode));
        assert!("average".parse::<CentralTendency>().is_err());
    }

    #[test]
    fn roles_serialize_lowercase() {
        assert_eq!(serde_json::to_string(&Role::Ref).unwrap(), "\"ref\"");
        assert_eq!(Role::Test.label(), "TEST");
        assert_eq!(Role::Test.index(), 1);
    }

    #[test]
    fn session_id_has_whole_seconds() {
        let session = SessionId::now();
        assert_eq!(session.0.timestamp_subsec_nanos(), 0);
        assert_eq!(session.to_string().len(), "2024-01-01T00:00:00".len());
    }
}
