//! # zptess
//!
//! Zero-point calibration of TESS photometers. A reference unit and a unit under test
//! observe the same light source; their frequency readings are collected in rounds
//! and the test unit's zero point is derived from the magnitude difference.
//!
//! ## Crate Structure
//!
//! - **`transport`**: UDP, TCP and serial links delivering raw frames.
//! - **`protocol`**: Frame decoding (legacy fixed-width and JSON) and duplicate
//!   suppression.
//! - **`pipeline`**: Per-role acquisition pipeline with front-end signals.
//! - **`aggregator`**: Windowing of readings into rounds.
//! - **`calibration`**: Per-role summary state machine and the session driver.
//! - **`device_info`**: Photometer identity from its web page or from configuration.
//! - **`store`**: Persistence gateway contract and the in-memory store.
//! - **`verifier`**: Offline consistency checks and the standard deviation repair.
//! - **`config`**, **`logging`**, **`error`**: Ambient configuration, tracing setup and
//!   the crate error type.

pub mod aggregator;
pub mod calibration;
pub mod config;
pub mod device_info;
pub mod endpoint;
pub mod error;
pub mod logging;
pub mod model;
pub mod pipeline;
pub mod protocol;
pub mod stats;
pub mod store;
pub mod transport;
pub mod verifier;
