//! Shared helpers for integration tests.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinHandle;
use zptess::config::{
    ApplicationConfig, DeviceConfig, InfoConfig, MetadataConfig, SessionConfig, ZptessConfig,
};
use zptess::endpoint::Endpoint;
use zptess::logging::LogFormat;
use zptess::protocol::Protocol;

pub const FRAME_GAP: Duration = Duration::from_millis(5);

/// Legacy fixed-width frame for an integer frequency in Hz.
pub fn legacy_frame(freq: u32) -> String {
    format!("<fH {:05}><tA +2012><tO -0500><mZ +2050>", freq)
}

pub fn json_frame(seq: u64, freq: f64) -> String {
    format!(
        r#"{{"udp": {}, "freq": {}, "tamb": 21.5, "tsky": -3.2, "ZP": 20.5}}"#,
        seq, freq
    )
}

pub fn device(endpoint: &str, protocol: Protocol, name: &str, zero_point: f64) -> DeviceConfig {
    DeviceConfig {
        endpoint: Endpoint::parse(endpoint).unwrap(),
        protocol,
        model: "TESS-W".to_string(),
        sensor: "TSL237".to_string(),
        info: InfoConfig::Static {
            name: name.to_string(),
            mac: format!("18:FE:34:00:00:{:02X}", name.len()),
            firmware: "Nov 25 2017".to_string(),
            zero_point,
            freq_offset: 0.0,
        },
    }
}

pub fn config(reference: DeviceConfig, test: DeviceConfig, session: SessionConfig) -> ZptessConfig {
    ZptessConfig {
        application: ApplicationConfig {
            name: "zptess-test".to_string(),
            log_level: "debug".to_string(),
            log_format: LogFormat::Compact,
            store_path: "zptess-test.json".into(),
        },
        session,
        metadata: MetadataConfig::default(),
        reference,
        test,
    }
}

/// Listener standing in for a photometer's TCP service.
pub async fn photometer_listener() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = format!("tcp:127.0.0.1:{}", listener.local_addr().unwrap().port());
    (listener, endpoint)
}

/// Accepts one connection and writes `lines` to it, newline terminated and spaced
/// by [`FRAME_GAP`]. The connection stays open until the peer closes it.
pub fn serve_lines(listener: TcpListener, lines: Vec<String>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        for line in lines {
            if stream.write_all(format!("{}\n", line).as_bytes()).await.is_err() {
                return;
            }
            stream.flush().await.ok();
            tokio::time::sleep(FRAME_GAP).await;
        }
        // hold the link open until the session closes it
        let mut buf = [0u8; 1];
        let _ = stream.read(&mut buf).await;
    })
}

/// Sends each frame as one datagram to `port` on localhost.
pub async fn send_datagrams(port: u16, frames: &[String]) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    for frame in frames {
        socket
            .send_to(frame.as_bytes(), ("127.0.0.1", port))
            .await
            .unwrap();
        tokio::time::sleep(FRAME_GAP).await;
    }
}

/// Configuration page of a TESS-W unit named `stars1234`.
pub const DEVICE_PAGE: &str = "<html><h2>TESS-W Settings.</h2>\
    <p>Name: stars1234<br>MAC: 5c:cf:7f:8:2:c5<br>\
    Actual CI: 20.50<br>Offset mHz: 12.5<br>\
    Compiled: Sep 21 2023<br></p></html>";

/// Web server of a photometer, answering `/config` with [`DEVICE_PAGE`] and
/// `/setconst` with a confirmation only when `confirm_writes` is set.
///
/// Returns the `host:port` to configure and the request lines seen so far.
pub async fn device_web_server(confirm_writes: bool) -> (String, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let host = listener.local_addr().unwrap().to_string();
    let requests = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&requests);
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let mut buf = vec![0u8; 4096];
            let n = socket.read(&mut buf).await.unwrap_or(0);
            let line = String::from_utf8_lossy(&buf[..n])
                .lines()
                .next()
                .unwrap_or_default()
                .to_string();
            let body = match line.split_once("cons=") {
                Some((_, rest)) if confirm_writes => {
                    let cons = rest.split_whitespace().next().unwrap_or_default();
                    format!("<p>New Zero Point {}</p>", cons)
                }
                Some(_) => "<p>Unknown command</p>".to_string(),
                None => DEVICE_PAGE.to_string(),
            };
            seen.lock().unwrap().push(line);
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = socket.write_all(response.as_bytes()).await;
        }
    });
    (host, requests)
}
