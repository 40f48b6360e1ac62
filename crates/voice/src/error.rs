//! Error types for the voice mesh engine

use signaling_store::StoreError;
use std::fmt::Display;

/// Result type alias using the voice mesh Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while joining, negotiating or leaving a voice channel
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Server, channel or user id unusable as a store path segment
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// Capture device unavailable or permission denied
    #[error("Media acquisition failed: {0}")]
    MediaAcquisition(String),

    /// A named signaling store write failed
    #[error("Signaling write failed ({operation}): {reason}")]
    SignalingWrite { operation: String, reason: String },

    /// A named signaling store read failed
    #[error("Signaling read failed ({operation}): {reason}")]
    SignalingRead { operation: String, reason: String },

    /// Negotiation record or candidate document did not match its schema
    #[error("Invalid negotiation record: {0}")]
    InvalidRecord(String),

    /// Peer connection could not be created or used
    #[error("Peer connection error: {0}")]
    PeerConnection(String),

    /// SDP negotiation error
    #[error("SDP negotiation error: {0}")]
    Sdp(String),

    /// ICE candidate error
    #[error("ICE candidate error: {0}")]
    IceCandidate(String),

    /// WebRTC library error
    #[error("WebRTC error: {0}")]
    WebRtc(String),

    /// Channel already holds its maximum number of members
    #[error("Voice channel {channel} is full ({capacity} members)")]
    ChannelFull { channel: String, capacity: usize },

    /// Operation requires an active voice channel
    #[error("Not in a voice channel")]
    NotInChannel,

    /// Leave completed locally but remote cleanup was incomplete
    #[error("failed to disconnect from voice channel: {0}")]
    Disconnect(String),

    /// Connection-state reducer received an action invalid for its state
    #[error("Connection state consistency violated: {0}")]
    StateConsistency(String),

    /// Engine task has stopped and no longer accepts commands
    #[error("Voice engine stopped")]
    EngineStopped,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Signaling store error without operation context
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn signaling_write(operation: &str, reason: impl Display) -> Self {
        Error::SignalingWrite {
            operation: operation.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn signaling_read(operation: &str, reason: impl Display) -> Self {
        Error::SignalingRead {
            operation: operation.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Defects that must stop the engine rather than be handled
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::StateConsistency(_))
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::SignalingWrite { .. } | Error::SignalingRead { .. } | Error::Io(_) => true,
            Error::Store(err) => err.is_retryable(),
            _ => false,
        }
    }

    /// Check if this error is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::InvalidConfig(_) | Error::InvalidIdentifier(_))
    }
}
