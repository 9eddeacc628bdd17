//! Byte transports for photometer links.
//!
//! Each transport owns one physical link and hands every raw frame, stamped with its
//! arrival time, to a [`FrameSink`]. Links are opened before the receive task is
//! spawned so that bind/connect/open failures surface to the caller immediately.
//! The receive task runs until [`TransportHandle::stop`] is called or the link fails;
//! stopping awaits the task, so the socket or device is released on return.

pub mod framing;
#[cfg(feature = "serial")]
pub mod serial;
pub mod tcp;
pub mod udp;

use crate::endpoint::Endpoint;
use crate::error::{AppResult, ZptessError};
use crate::model::Role;
use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Receiver of raw frames. Called from the transport task, once per frame.
pub trait FrameSink: Send + 'static {
    fn on_frame(&mut self, frame: &[u8], tstamp: DateTime<Utc>);
}

impl<F> FrameSink for F
where
    F: FnMut(&[u8], DateTime<Utc>) + Send + 'static,
{
    fn on_frame(&mut self, frame: &[u8], tstamp: DateTime<Utc>) {
        self(frame, tstamp)
    }
}

/// Handle to a running transport task.
pub struct TransportHandle {
    role: Role,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<AppResult<()>>>,
    local_addr: Option<SocketAddr>,
}

impl TransportHandle {
    pub(crate) fn new(
        role: Role,
        shutdown: oneshot::Sender<()>,
        task: JoinHandle<AppResult<()>>,
        local_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            role,
            shutdown: Some(shutdown),
            task: Some(task),
            local_addr,
        }
    }

    /// Role served by this link.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Bound address for UDP links, peer address for TCP links.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// True once the receive task has ended, normally or with a link failure.
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Signals the task to stop and waits until the link is released.
    pub async fn stop(mut self) -> AppResult<()> {
        if let Some(tx) = self.shutdown.take() {
            // the task may have ended on its own already
            let _ = tx.send(());
        }
        self.finished().await
    }

    /// Waits for the receive task to end on its own.
    pub async fn join(mut self) -> AppResult<()> {
        self.finished().await
    }

    /// Waits for the receive task without consuming the handle.
    ///
    /// Cancel-safe. Once the task's result has been returned, later calls return `Ok(())`.
    pub async fn finished(&mut self) -> AppResult<()> {
        let Some(task) = self.task.as_mut() else {
            return Ok(());
        };
        let result = task.await;
        self.task = None;
        result.map_err(|e| ZptessError::Io(std::io::Error::other(e)))?
    }
}

/// Opens the link described by `endpoint` and starts delivering frames to `sink`.
pub async fn start<S: FrameSink>(
    role: Role,
    endpoint: &Endpoint,
    max_frame_bytes: usize,
    sink: S,
) -> AppResult<TransportHandle> {
    match endpoint {
        Endpoint::Udp { host, port } => {
            udp::start(role, host, *port, max_frame_bytes, sink).await
        }
        Endpoint::Tcp { host, port } => {
            tcp::start(role, host, *port, max_frame_bytes, sink).await
        }
        Endpoint::Serial { path, baud } => start_serial(role, path, *baud, max_frame_bytes, sink),
    }
}

#[cfg(feature = "serial")]
fn start_serial<S: FrameSink>(
    role: Role,
    path: &str,
    baud: u32,
    max_frame_bytes: usize,
    sink: S,
) -> AppResult<TransportHandle> {
    serial::start(role, path, baud, max_frame_bytes, sink)
}

#[cfg(not(feature = "serial"))]
fn start_serial<S: FrameSink>(
    _role: Role,
    _path: &str,
    _baud: u32,
    _max_frame_bytes: usize,
    _sink: S,
) -> AppResult<TransportHandle> {
    Err(ZptessError::SerialFeatureDisabled)
}

pub(crate) fn link_error(role: Role, source: std::io::Error) -> ZptessError {
    ZptessError::Link { role, source }
}
