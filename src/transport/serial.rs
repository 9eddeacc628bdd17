//! Serial line reader (requires the `serial` feature).

use super::framing::FrameReader;
use super::{link_error, FrameSink, TransportHandle};
use crate::error::{AppResult, ZptessError};
use crate::model::Role;
use chrono::Utc;
use tokio::io::BufReader;
use tokio::sync::oneshot;
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info};

pub(crate) fn start<S: FrameSink>(
    role: Role,
    path: &str,
    baud: u32,
    max_frame_bytes: usize,
    mut sink: S,
) -> AppResult<TransportHandle> {
    let port = tokio_serial::new(path, baud)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .flow_control(tokio_serial::FlowControl::None)
        .open_native_async()
        .map_err(|e| link_error(role, e.into()))?;
    info!(%role, path, baud, "Opened serial port");

    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        let mut frames = FrameReader::new(BufReader::new(port), max_frame_bytes);
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    debug!(%role, "Serial transport shutting down");
                    return Ok(());
                }
                next = frames.next_frame() => {
                    match next.map_err(|e| link_error(role, e))? {
                        Some(frame) => sink.on_frame(&frame, Utc::now()),
                        None => return Err(ZptessError::LinkClosed(role)),
                    }
                }
            }
        }
    });

    Ok(TransportHandle::new(role, shutdown_tx, task, None))
}
