//! Session-ending error taxonomy.
//!
//! Plumbing throughout the crate uses `anyhow::Result`. The conditions that end
//! a session are classified here so that the controller can pick the single
//! user-visible banner and callers can tell a voluntary stop from a failure.
//!
//! Non-fatal conditions (an undecodable processed frame, an encode failure on
//! one capture cycle) are never represented here; they are logged and dropped.

use std::fmt;

pub const DEVICE_ACCESS_BANNER: &str =
    "Could not access camera. Check that the device exists and permissions are granted.";
pub const CONNECTION_BANNER: &str = "Connection error. Make sure the processing service is running.";

/// A condition that ends (or prevents) a streaming session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FatalError {
    /// The capture device could not be opened. Raised before any connection attempt.
    DeviceAccess(String),
    /// The connection to the processing service could not be established.
    TransportEstablishment(String),
    /// The connection failed after it was open, or a frame could not be handed to it.
    TransportRuntime(String),
}

impl FatalError {
    /// Text for the single error banner shown to the user.
    pub fn banner(&self) -> &'static str {
        match self {
            Self::DeviceAccess(_) => DEVICE_ACCESS_BANNER,
            Self::TransportEstablishment(_) | Self::TransportRuntime(_) => CONNECTION_BANNER,
        }
    }

    pub fn detail(&self) -> &str {
        match self {
            Self::DeviceAccess(detail)
            | Self::TransportEstablishment(detail)
            | Self::TransportRuntime(detail) => detail,
        }
    }
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeviceAccess(detail) => write!(f, "camera access failed: {}", detail),
            Self::TransportEstablishment(detail) => {
                write!(f, "could not connect to processing service: {}", detail)
            }
            Self::TransportRuntime(detail) => write!(f, "connection error: {}", detail),
        }
    }
}

impl std::error::Error for FatalError {}

/// How the most recent session ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEnd {
    /// The user stopped the stream.
    Stopped,
    /// The processing service closed the connection.
    ServerClosed,
    Failed(FatalError),
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::ServerClosed => write!(f, "closed by server"),
            Self::Failed(err) => write!(f, "failed: {}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_failures_share_connection_banner() {
        let establish = FatalError::TransportEstablishment("refused".to_string());
        let runtime = FatalError::TransportRuntime("reset".to_string());
        assert_eq!(establish.banner(), CONNECTION_BANNER);
        assert_eq!(runtime.banner(), CONNECTION_BANNER);
        assert_eq!(
            FatalError::DeviceAccess("denied".to_string()).banner(),
            DEVICE_ACCESS_BANNER
        );
    }

    #[test]
    fn display_keeps_detail() {
        let err = FatalError::TransportRuntime("broken pipe".to_string());
        assert_eq!(err.to_string(), "connection error: broken pipe");
        assert_eq!(err.detail(), "broken pipe");
        assert_eq!(SessionEnd::Stopped.to_string(), "stopped");
    }
}
