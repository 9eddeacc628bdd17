//! Stream client. Frames are newline-terminated lines.

use super::framing::FrameReader;
use super::{link_error, FrameSink, TransportHandle};
use crate::error::{AppResult, ZptessError};
use crate::model::Role;
use chrono::Utc;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tracing::{debug, info};

pub(crate) async fn start<S: FrameSink>(
    role: Role,
    host: &str,
    port: u16,
    max_frame_bytes: usize,
    mut sink: S,
) -> AppResult<TransportHandle> {
    let stream = TcpStream::connect((host, port))
        .await
        .map_err(|e| link_error(role, e))?;
    let peer = stream.peer_addr().map_err(|e| link_error(role, e))?;
    info!(%role, %peer, "Connected to photometer");

    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        let mut frames = FrameReader::new(BufReader::new(stream), max_frame_bytes);
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    debug!(%role, "TCP transport shutting down");
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

    Ok(TransportHandle::new(role, shutdown_tx, task, Some(peer)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn peer_close_ends_the_task_with_link_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket
                .write_all(b"<fH 04606><tA +2987><tO +2481><mZ -0000>\r\n")
                .await
                .unwrap();
        });

        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let handle = start(Role::Ref, "127.0.0.1", addr.port(), 64, move |f: &[u8], _: DateTime<Utc>| {
            let _ = tx.send(f.to_vec());
        })
        .await
        .unwrap();

        server.await.unwrap();
        let frame = rx.recv().await.unwrap();
        assert!(frame.starts_with(b"<fH 04606>"));
        let err = handle.join().await.unwrap_err();
        assert!(matches!(err, ZptessError::LinkClosed(Role::Ref)));
    }

    #[tokio::test]
    async fn refused_connection_is_a_link_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let err = start(Role::Test, "127.0.0.1", port, 64, |_: &[u8], _: DateTime<Utc>| {})
            .await
            .err()
            .unwrap();
        assert!(err.is_link_failure());
    }
}
