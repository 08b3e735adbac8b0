//! Wire format for tunnel control and data messages
//!
//! Five message kinds ride on an already-established, reliable, ordered peer
//! channel. Every frame shares the same prefix, in sender-then-receiver
//! order:
//!
//! ```text
//! kind:u8  id:u32be  remote_id:u32be  payload
//! ```
//!
//! Payloads: `Open` carries optional JSON connection parameters (absent on
//! the establishment acknowledgment), `Write` carries a length-prefixed
//! opaque byte run, `Close` and `Timeout` carry nothing, and `Error` carries
//! a JSON-serialized [`WireError`]. The JSON payloads are self-describing and
//! tolerate unknown fields, so both sides can evolve independently.

use serde::{Deserialize, Serialize};

use crate::errors::WireFormatError;
use crate::types::{SocketId, SocketRequest};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Size of the shared frame prefix: kind byte plus the two identifiers
pub const HEADER_SIZE: usize = 9;

/// Size of the Write payload length prefix
const WRITE_LEN_SIZE: usize = 4;

// ----------------------------------------------------------------------------
// Message Kind
// ----------------------------------------------------------------------------

/// Discriminant for the five wire message kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Open = 0,
    Write = 1,
    Close = 2,
    Timeout = 3,
    Error = 4,
}

impl MessageKind {
    /// All kinds, in discriminant order
    pub const ALL: [MessageKind; 5] = [
        MessageKind::Open,
        MessageKind::Write,
        MessageKind::Close,
        MessageKind::Timeout,
        MessageKind::Error,
    ];

    /// Decode a discriminant byte
    pub fn from_u8(value: u8) -> Result<Self, WireFormatError> {
        match value {
            0 => Ok(MessageKind::Open),
            1 => Ok(MessageKind::Write),
            2 => Ok(MessageKind::Close),
            3 => Ok(MessageKind::Timeout),
            4 => Ok(MessageKind::Error),
            other => Err(WireFormatError::UnknownKind(other)),
        }
    }

    /// The discriminant byte
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

// ----------------------------------------------------------------------------
// Connection Parameters
// ----------------------------------------------------------------------------

fn default_host() -> String {
    "127.0.0.1".to_string()
}

/// Destination parameters carried on an open request
///
/// Decoded from a self-describing JSON value; unknown fields are ignored and
/// a missing host falls back to loopback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectParams {
    /// Destination host
    #[serde(default = "default_host")]
    pub host: String,
    /// Destination port, subject to the allow-list
    pub port: u16,
}

impl ConnectParams {
    /// Create connection parameters
    pub fn new<H: Into<String>>(host: H, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parameters targeting loopback
    pub fn loopback(port: u16) -> Self {
        Self {
            host: default_host(),
            port,
        }
    }
}

// ----------------------------------------------------------------------------
// Serialized Errors
// ----------------------------------------------------------------------------

/// Closed set of error kinds carried across the wire
///
/// Unknown kinds from a newer remote decode as `Other` rather than failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelErrorKind {
    PortNotAllowed,
    ConnectionRefused,
    ConnectionReset,
    HostUnreachable,
    Timeout,
    Io,
    Other,
}

impl<'de> Deserialize<'de> for TunnelErrorKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let name = String::deserialize(deserializer)?;
        Ok(match name.as_str() {
            "port_not_allowed" => TunnelErrorKind::PortNotAllowed,
            "connection_refused" => TunnelErrorKind::ConnectionRefused,
            "connection_reset" => TunnelErrorKind::ConnectionReset,
            "host_unreachable" => TunnelErrorKind::HostUnreachable,
            "timeout" => TunnelErrorKind::Timeout,
            "io" => TunnelErrorKind::Io,
            _ => TunnelErrorKind::Other,
        })
    }
}

impl core::fmt::Display for TunnelErrorKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            TunnelErrorKind::PortNotAllowed => write!(f, "port_not_allowed"),
            TunnelErrorKind::ConnectionRefused => write!(f, "connection_refused"),
            TunnelErrorKind::ConnectionReset => write!(f, "connection_reset"),
            TunnelErrorKind::HostUnreachable => write!(f, "host_unreachable"),
            TunnelErrorKind::Timeout => write!(f, "timeout"),
            TunnelErrorKind::Io => write!(f, "io"),
            TunnelErrorKind::Other => write!(f, "other"),
        }
    }
}

/// Serialized representation of a socket-local error, relayed to the remote
/// peer for diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub kind: TunnelErrorKind,
    pub message: String,
}

impl WireError {
    /// Create a wire error
    pub fn new<M: Into<String>>(kind: TunnelErrorKind, message: M) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// The port-policy rejection error
    pub fn port_not_allowed(port: u16) -> Self {
        Self::new(
            TunnelErrorKind::PortNotAllowed,
            format!("port {port} not allowed"),
        )
    }
}

impl From<&std::io::Error> for WireError {
    fn from(err: &std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::ConnectionRefused => TunnelErrorKind::ConnectionRefused,
            std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::ConnectionAborted => {
                TunnelErrorKind::ConnectionReset
            }
            std::io::ErrorKind::HostUnreachable | std::io::ErrorKind::NetworkUnreachable => {
                TunnelErrorKind::HostUnreachable
            }
            std::io::ErrorKind::TimedOut => TunnelErrorKind::Timeout,
            _ => TunnelErrorKind::Io,
        };
        Self::new(kind, err.to_string())
    }
}

impl core::fmt::Display for WireError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

// ----------------------------------------------------------------------------
// Wire Messages
// ----------------------------------------------------------------------------

/// The closed set of messages exchanged over a peer channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    /// Open a tunneled connection (params present) or acknowledge that the
    /// responder's OS connection is established (params absent)
    Open {
        request: SocketRequest,
        params: Option<ConnectParams>,
    },
    /// Opaque connection data
    Write {
        request: SocketRequest,
        data: Vec<u8>,
    },
    /// The sending side's socket closed
    Close { request: SocketRequest },
    /// The sending side's socket went idle past its timeout
    Timeout { request: SocketRequest },
    /// A socket-local error, serialized for remote diagnostics
    Error {
        request: SocketRequest,
        error: WireError,
    },
}

impl WireMessage {
    /// This message's kind discriminant
    pub fn kind(&self) -> MessageKind {
        match self {
            WireMessage::Open { .. } => MessageKind::Open,
            WireMessage::Write { .. } => MessageKind::Write,
            WireMessage::Close { .. } => MessageKind::Close,
            WireMessage::Timeout { .. } => MessageKind::Timeout,
            WireMessage::Error { .. } => MessageKind::Error,
        }
    }

    /// This message's addressing pair
    pub fn request(&self) -> SocketRequest {
        match self {
            WireMessage::Open { request, .. }
            | WireMessage::Write { request, .. }
            | WireMessage::Close { request }
            | WireMessage::Timeout { request }
            | WireMessage::Error { request, .. } => *request,
        }
    }

    /// Encode to a wire frame
    pub fn encode(&self) -> Result<Vec<u8>, WireFormatError> {
        let request = self.request();

        let mut bytes = Vec::with_capacity(HEADER_SIZE);
        bytes.push(self.kind().as_u8());
        bytes.extend_from_slice(&request.id.value().to_be_bytes());
        bytes.extend_from_slice(&request.remote_id.value().to_be_bytes());

        match self {
            WireMessage::Open { params, .. } => {
                if let Some(params) = params {
                    bytes.extend_from_slice(&serde_json::to_vec(params)?);
                }
            }
            WireMessage::Write { data, .. } => {
                let len = u32::try_from(data.len())
                    .map_err(|_| WireFormatError::PayloadTooLarge { len: data.len() })?;
                bytes.extend_from_slice(&len.to_be_bytes());
                bytes.extend_from_slice(data);
            }
            WireMessage::Close { .. } | WireMessage::Timeout { .. } => {}
            WireMessage::Error { error, .. } => {
                bytes.extend_from_slice(&serde_json::to_vec(error)?);
            }
        }

        Ok(bytes)
    }

    /// Decode a wire frame
    pub fn decode(bytes: &[u8]) -> Result<WireMessage, WireFormatError> {
        if bytes.len() < HEADER_SIZE {
            return Err(WireFormatError::Truncated {
                expected: HEADER_SIZE,
                actual: bytes.len(),
            });
        }

        let kind = MessageKind::from_u8(bytes[0])?;
        let id = read_u32(bytes, 1);
        let remote_id = read_u32(bytes, 5);
        let request = SocketRequest::new(SocketId::new(id), SocketId::new(remote_id));
        let payload = &bytes[HEADER_SIZE..];

        match kind {
            MessageKind::Open => {
                let params = if payload.is_empty() {
                    None
                } else {
                    Some(serde_json::from_slice(payload)?)
                };
                Ok(WireMessage::Open { request, params })
            }
            MessageKind::Write => {
                if payload.len() < WRITE_LEN_SIZE {
                    return Err(WireFormatError::Truncated {
                        expected: HEADER_SIZE + WRITE_LEN_SIZE,
                        actual: bytes.len(),
                    });
                }
                let len = read_u32(payload, 0) as usize;
                let data = &payload[WRITE_LEN_SIZE..];
                if data.len() < len {
                    return Err(WireFormatError::Truncated {
                        expected: HEADER_SIZE + WRITE_LEN_SIZE + len,
                        actual: bytes.len(),
                    });
                }
                if data.len() > len {
                    return Err(WireFormatError::TrailingData {
                        extra: data.len() - len,
                    });
                }
                Ok(WireMessage::Write {
                    request,
                    data: data.to_vec(),
                })
            }
            MessageKind::Close | MessageKind::Timeout => {
                if !payload.is_empty() {
                    return Err(WireFormatError::TrailingData {
                        extra: payload.len(),
                    });
                }
                match kind {
                    MessageKind::Close => Ok(WireMessage::Close { request }),
                    _ => Ok(WireMessage::Timeout { request }),
                }
            }
            MessageKind::Error => {
                let error = serde_json::from_slice(payload)?;
                Ok(WireMessage::Error { request, error })
            }
        }
    }
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_be_bytes(buf)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> SocketRequest {
        SocketRequest::new(SocketId::new(5), SocketId::new(9))
    }

    #[test]
    fn test_open_request_roundtrip() {
        let message = WireMessage::Open {
            request: request(),
            params: Some(ConnectParams::new("example.com", 4001)),
        };
        let decoded = WireMessage::decode(&message.encode().unwrap()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_open_ack_roundtrip() {
        let message = WireMessage::Open {
            request: request(),
            params: None,
        };
        let encoded = message.encode().unwrap();
        assert_eq!(encoded.len(), HEADER_SIZE);
        assert_eq!(WireMessage::decode(&encoded).unwrap(), message);
    }

    #[test]
    fn test_write_roundtrip() {
        let message = WireMessage::Write {
            request: request(),
            data: vec![0x41, 0x42],
        };
        let decoded = WireMessage::decode(&message.encode().unwrap()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_empty_write_roundtrip() {
        let message = WireMessage::Write {
            request: request(),
            data: Vec::new(),
        };
        let decoded = WireMessage::decode(&message.encode().unwrap()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_close_and_timeout_roundtrip() {
        for message in [
            WireMessage::Close { request: request() },
            WireMessage::Timeout { request: request() },
        ] {
            let decoded = WireMessage::decode(&message.encode().unwrap()).unwrap();
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn test_error_roundtrip() {
        let message = WireMessage::Error {
            request: request(),
            error: WireError::port_not_allowed(22),
        };
        let decoded = WireMessage::decode(&message.encode().unwrap()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let mut frame = WireMessage::Close { request: request() }.encode().unwrap();
        frame[0] = 0x7f;
        assert!(matches!(
            WireMessage::decode(&frame),
            Err(WireFormatError::UnknownKind(0x7f))
        ));
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let frame = WireMessage::Write {
            request: request(),
            data: vec![1, 2, 3],
        }
        .encode()
        .unwrap();
        assert!(WireMessage::decode(&frame[..frame.len() - 1]).is_err());
        assert!(WireMessage::decode(&frame[..4]).is_err());
    }

    #[test]
    fn test_trailing_data_rejected() {
        let mut frame = WireMessage::Close { request: request() }.encode().unwrap();
        frame.push(0);
        assert!(matches!(
            WireMessage::decode(&frame),
            Err(WireFormatError::TrailingData { extra: 1 })
        ));
    }

    #[test]
    fn test_open_params_tolerate_unknown_fields() {
        let mut frame = vec![MessageKind::Open.as_u8()];
        frame.extend_from_slice(&5u32.to_be_bytes());
        frame.extend_from_slice(&0u32.to_be_bytes());
        frame.extend_from_slice(br#"{"port":4001,"noDelay":true,"family":4}"#);

        let decoded = WireMessage::decode(&frame).unwrap();
        match decoded {
            WireMessage::Open {
                params: Some(params),
                ..
            } => {
                assert_eq!(params.port, 4001);
                assert_eq!(params.host, "127.0.0.1");
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_error_kind_decodes_as_other() {
        let mut frame = vec![MessageKind::Error.as_u8()];
        frame.extend_from_slice(&5u32.to_be_bytes());
        frame.extend_from_slice(&9u32.to_be_bytes());
        frame.extend_from_slice(br#"{"kind":"quota_exceeded","message":"future kind"}"#);

        let decoded = WireMessage::decode(&frame).unwrap();
        match decoded {
            WireMessage::Error { error, .. } => {
                assert_eq!(error.kind, TunnelErrorKind::Other);
                assert_eq!(error.message, "future kind");
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn test_io_error_kind_mapping() {
        let err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert_eq!(
            WireError::from(&err).kind,
            TunnelErrorKind::ConnectionRefused
        );

        let err = std::io::Error::other("mystery");
        assert_eq!(WireError::from(&err).kind, TunnelErrorKind::Io);
    }
}
