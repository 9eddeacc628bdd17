//! Datagram listener. One datagram is one frame.

use super::{link_error, FrameSink, TransportHandle};
use crate::error::{AppResult, ZptessError};
use crate::model::Role;
use chrono::Utc;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

const RECV_BUFFER: usize = 65_536;

pub(crate) async fn start<S: FrameSink>(
    role: Role,
    host: &str,
    port: u16,
    max_frame_bytes: usize,
    mut sink: S,
) -> AppResult<TransportHandle> {
    let socket = UdpSocket::bind((host, port))
        .await
        .map_err(|e| link_error(role, e))?;
    let local_addr = socket.local_addr().map_err(|e| link_error(role, e))?;
    info!(%role, %local_addr, "Listening for UDP readings");

    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        let mut buf = vec![0u8; RECV_BUFFER];
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    debug!(%role, "UDP transport shutting down");
                    break;
                }
                received = socket.recv_from(&mut buf) => {
                    let (n, peer) = received.map_err(|e| link_error(role, e))?;
                    let tstamp = Utc::now();
                    if n > max_frame_bytes {
                        warn!(%role, %peer, "Discarding oversized datagram ({} bytes)", n);
                        continue;
                    }
                    sink.on_frame(&buf[..n], tstamp);
                }
            }
        }
        Ok::<(), ZptessError>(())
    });

    Ok(TransportHandle::new(role, shutdown_tx, task, Some(local_addr)))
}
