//! Wire-visible CONNECTION_CLOSE error codes and the local `ConnectionError`
//! taxonomy a connection surfaces to the application callback when it
//! leaves `Ready`.

use failure::Fail;

/// An error code that would appear in a CONNECTION_CLOSE frame, or drive a
/// local `HandshakeFailure`/`Closing` transition.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TransportError {
    ServerBusy,
    ProtocolViolation,
    TlsHandshakeFailed,
    CnxidCheckFailed,
    UnexpectedPacket,
    UnsolicitedPathResponse,
    FlowControlError,
    FinalOffsetError,
    FrameEncodingError,
    InternalError,
}

impl TransportError {
    pub fn code(self) -> u64 {
        match self {
            TransportError::ServerBusy => 0x02,
            TransportError::ProtocolViolation => 0x0a,
            TransportError::TlsHandshakeFailed => 0x0c,
            TransportError::CnxidCheckFailed => 0x0d,
            TransportError::UnexpectedPacket => 0x0e,
            TransportError::UnsolicitedPathResponse => 0x0f,
            TransportError::FlowControlError => 0x03,
            TransportError::FinalOffsetError => 0x06,
            TransportError::FrameEncodingError => 0x07,
            TransportError::InternalError => 0x01,
        }
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?} (0x{:x})", self, self.code())
    }
}

/// Terminal reason a `Connection` stops being driven. Delivered to the
/// application callback exactly once per connection.
#[derive(Debug, Clone, Fail)]
pub enum ConnectionError {
    #[fail(display = "timed out waiting for a response from the peer")]
    TimedOut,
    #[fail(display = "aborted via stateless reset")]
    Reset,
    #[fail(display = "closed by a transport-level error: {}", error_code)]
    TransportError { error_code: TransportError },
    #[fail(display = "closed by the application: {:?}", reason)]
    ApplicationClosed { reason: Vec<u8> },
    #[fail(display = "no mutually supported version")]
    VersionMismatch,
}

impl From<TransportError> for ConnectionError {
    fn from(error_code: TransportError) -> Self {
        ConnectionError::TransportError { error_code }
    }
}
