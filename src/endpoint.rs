//! Device endpoint descriptors of the form `transport:host-or-path:port-or-baud`.

use crate::error::{AppResult, ZptessError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Default UDP port TESS-W units broadcast on.
pub const DEFAULT_UDP_PORT: u16 = 2255;
/// Default TCP port of the TESS-W telnet-like service.
pub const DEFAULT_TCP_PORT: u16 = 23;
/// Default serial line speed.
pub const DEFAULT_BAUD: u32 = 9600;

/// Physical access method for one photometer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Endpoint {
    /// Listen for datagrams on a local address.
    Udp { host: String, port: u16 },
    /// Connect to a remote stream socket.
    Tcp { host: String, port: u16 },
    /// Read lines from a serial device.
    Serial { path: String, baud: u32 },
}

impl Endpoint {
    /// Parses a descriptor such as `udp:0.0.0.0:2255` or `serial:/dev/ttyUSB0:9600`.
    ///
    /// A missing numeric part falls back to the transport default.
    pub fn parse(descriptor: &str) -> AppResult<Self> {
        let invalid = |reason: &str| ZptessError::Endpoint {
            endpoint: descriptor.to_string(),
            reason: reason.to_string(),
        };
        let parts: Vec<&str> = descriptor.split(':').map(str::trim).collect();
        if parts.len() < 2 || parts.len() > 3 {
            return Err(invalid("expected transport:host-or-path[:port-or-baud]"));
        }
        let target = parts[1];
        if target.is_empty() {
            return Err(invalid("empty host or device path"));
        }
        let number = parts.get(2).copied().filter(|n| !n.is_empty());

        match parts[0].to_lowercase().as_str() {
            "udp" | "tcp" => {
                let port = match number {
                    Some(n) => n
                        .parse::<u16>()
                        .map_err(|_| invalid("port is not a number in 1..65535"))?,
                    None if parts[0].eq_ignore_ascii_case("udp") => DEFAULT_UDP_PORT,
                    None => DEFAULT_TCP_PORT,
                };
                if port == 0 && parts[0].eq_ignore_ascii_case("tcp") {
                    return Err(invalid("port number must be greater than 0"));
                }
                let host = target.to_string();
                if parts[0].eq_ignore_ascii_case("udp") {
                    Ok(Endpoint::Udp { host, port })
                } else {
                    Ok(Endpoint::Tcp { host, port })
                }
            }
            "serial" => {
                let baud = match number {
                    Some(n) => n
                        .parse::<u32>()
                        .ok()
                        .filter(|b| *b > 0)
                        .ok_or_else(|| invalid("baud rate is not a positive number"))?,
                    None => DEFAULT_BAUD,
                };
                Ok(Endpoint::Serial {
                    path: target.to_string(),
                    baud,
                })
            }
            _ => Err(invalid("transport must be one of udp, tcp, serial")),
        }
    }

    /// Host part for network endpoints.
    pub fn host(&self) -> Option<&str> {
        match self {
            Endpoint::Udp { host, .. } | Endpoint::Tcp { host, .. } => Some(host),
            Endpoint::Serial { .. } => None,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Udp { host, port } => write!(f, "udp:{}:{}", host, port),
            Endpoint::Tcp { host, port } => write!(f, "tcp:{}:{}", host, port),
            Endpoint::Serial { path, baud } => write!(f, "serial:{}:{}", path, baud),
        }
    }
}

impl FromStr for Endpoint {
    type Err = ZptessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Endpoint::parse(s)
    }
}

impl TryFrom<String> for Endpoint {
    type Error = ZptessError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Endpoint::parse(&value)
    }
}

impl From<Endpoint> for String {
    fn from(value: Endpoint) -> Self {
        value.to_string()
    }
}
