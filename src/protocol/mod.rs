//! Photometer wire formats.
//!
//! A [`Decoder`] turns one raw frame into a [`Reading`] stamped with the arrival
//! time and the role of the link it came from. Two formats are understood:
//!
//! - [`Protocol::Legacy`]: the fixed-width `<fH ...><tA ...><tO ...><mZ ...>` record
//!   sent by older firmware over serial lines.
//! - [`Protocol::Json`]: a JSON object per frame, as broadcast by TESS-W units over UDP.
//!
//! Frames that cannot be decoded yield `None`; the pipeline logs and continues.
//! Units retransmit the same JSON payload, so consecutive readings carrying the same
//! sequence number are collapsed by [`deduplicate`].

pub mod json;
pub mod legacy;

use crate::model::{Reading, Role};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Wire format spoken by a photometer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Fixed-width ASCII record.
    Legacy,
    /// One JSON object per frame.
    Json,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Legacy => f.write_str("legacy"),
            Protocol::Json => f.write_str("json"),
        }
    }
}

/// Measurement fields common to both formats, before role and timestamp are attached.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Fields {
    pub freq: f64,
    pub tbox: Option<f64>,
    pub tsky: Option<f64>,
    pub zp: Option<f64>,
    pub seq: Option<u64>,
}

/// Stateless frame decoder bound to one role.
#[derive(Debug, Clone, Copy)]
pub struct Decoder {
    role: Role,
    protocol: Protocol,
}

impl Decoder {
    /// Decoder for frames of `protocol` arriving on `role`'s link.
    pub fn new(role: Role, protocol: Protocol) -> Self {
        Self { role, protocol }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Decodes a single frame without duplicate suppression.
    pub fn parse(&self, frame: &[u8], tstamp: DateTime<Utc>) -> Option<Reading> {
        let fields = match self.protocol {
            Protocol::Legacy => legacy::parse(frame),
            Protocol::Json => json::parse(frame),
        }?;
        if !fields.freq.is_finite() || fields.freq < 0.0 {
            return None;
        }
        Some(Reading {
            role: self.role,
            tstamp,
            freq: fields.freq,
            tbox: fields.tbox,
            tsky: fields.tsky,
            zp: fields.zp,
            seq: fields.seq,
        })
    }

    /// Decodes a frame and drops it when it repeats the previous sequence number.
    ///
    /// `last` holds the most recently accepted reading of this role and is updated
    /// whenever a reading is emitted.
    pub fn decode(
        &self,
        frame: &[u8],
        tstamp: DateTime<Utc>,
        last: &mut Option<Reading>,
    ) -> Decoded {
        let Some(reading) = self.parse(frame, tstamp) else {
            return Decoded::Rejected;
        };
        match deduplicate(last, reading) {
            Some(reading) => Decoded::Reading(reading),
            None => Decoded::Duplicate,
        }
    }
}

/// Outcome of [`Decoder::decode`].
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// A new reading.
    Reading(Reading),
    /// Repeats the sequence number of the previous reading.
    Duplicate,
    /// Not a valid frame of the decoder's protocol.
    Rejected,
}

impl Decoded {
    /// The reading, if one was accepted.
    pub fn reading(self) -> Option<Reading> {
        match self {
            Decoded::Reading(reading) => Some(reading),
            Decoded::Duplicate | Decoded::Rejected => None,
        }
    }
}

/// Emits `reading` unless it carries the same sequence number as `previous`.
///
/// Readings without a sequence number are never considered duplicates.
pub fn deduplicate(previous: &mut Option<Reading>, reading: Reading) -> Option<Reading> {
    let repeated = match (previous.as_ref().and_then(|p| p.seq), reading.seq) {
        (Some(prev), Some(cur)) => prev == cur,
        _ => false,
    };
    if repeated {
        return None;
    }
    *previous = Some(reading.clone());
    Some(reading)
}
