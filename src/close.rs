//! Close reason codes carried in the first two bytes of a `Close` frame payload.
//!
//! See [RFC 6455 Section 7.4](https://datatracker.ietf.org/doc/html/rfc6455#section-7.4).

/// Status code indicating why an endpoint is closing the connection.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CloseCode {
    /// 1000: the purpose for which the connection was established has been fulfilled.
    Normal,
    /// 1001: an endpoint is going away, such as a server shutting down.
    Away,
    /// 1002: the endpoint is terminating the connection due to a protocol error.
    Protocol,
    /// 1003: the endpoint received a type of data it cannot accept.
    Unsupported,
    /// 1004: reserved, must not be sent.
    Reserved,
    /// 1005: no status code was present. Must not be sent in a `Close` frame.
    Status,
    /// 1006: the connection was closed abnormally. Must not be sent in a `Close` frame.
    Abnormal,
    /// 1007: received data within a message was not consistent with its type.
    Invalid,
    /// 1008: the endpoint received a message that violates its policy.
    Policy,
    /// 1009: the endpoint received a message that is too big to process.
    Size,
    /// 1010: the client expected the server to negotiate an extension.
    Extension,
    /// 1011: the server encountered an unexpected condition.
    Error,
    /// Any other code, such as the 3000-4999 ranges reserved for libraries and applications.
    Other(u16),
}

impl CloseCode {
    /// Returns `true` if the code may appear in a `Close` frame on the wire.
    pub fn is_allowed(self) -> bool {
        match self {
            Self::Reserved | Self::Status | Self::Abnormal => false,
            Self::Other(code) => (3000..5000).contains(&code),
            _ => true,
        }
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        match code {
            1000 => Self::Normal,
            1001 => Self::Away,
            1002 => Self::Protocol,
            1003 => Self::Unsupported,
            1004 => Self::Reserved,
            1005 => Self::Status,
            1006 => Self::Abnormal,
            1007 => Self::Invalid,
            1008 => Self::Policy,
            1009 => Self::Size,
            1010 => Self::Extension,
            1011 => Self::Error,
            code => Self::Other(code),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        match code {
            CloseCode::Normal => 1000,
            CloseCode::Away => 1001,
            CloseCode::Protocol => 1002,
            CloseCode::Unsupported => 1003,
            CloseCode::Reserved => 1004,
            CloseCode::Status => 1005,
            CloseCode::Abnormal => 1006,
            CloseCode::Invalid => 1007,
            CloseCode::Policy => 1008,
            CloseCode::Size => 1009,
            CloseCode::Extension => 1010,
            CloseCode::Error => 1011,
            CloseCode::Other(code) => code,
        }
    }
}

impl std::fmt::Display for CloseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", u16::from(*self))
    }
}
