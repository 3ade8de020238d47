//! Media engine contract.
//!
//! The engine is a process wide singleton owned by the application. SDP
//! passes through the signaling core as opaque text, the only part ever
//! inspected is the session direction attribute for hold detection.

use bytesstr::BytesStr;

#[derive(Debug, thiserror::Error)]
#[error("media engine error: {0}")]
pub struct MediaError(pub String);

/// Interface of the media engine consumed by the call machinery
#[async_trait::async_trait]
pub trait MediaEngine: Send + Sync + 'static {
    /// Prepare audio for an upcoming session
    async fn initialize(&self) -> Result<(), MediaError>;

    /// Create the SDP offer for an outgoing call
    async fn create_offer(&self) -> Result<BytesStr, MediaError>;

    /// Create the SDP answer to a remote offer
    async fn create_answer(&self, remote_sdp: &str) -> Result<BytesStr, MediaError>;

    /// Apply the remote answer to a previously created offer
    async fn apply_answer(&self, remote_sdp: &str) -> Result<(), MediaError>;

    /// Toggle hold, returning the updated local SDP carrying the new
    /// direction attribute
    async fn set_hold(&self, hold: bool) -> Result<BytesStr, MediaError>;

    /// Toggle microphone mute
    async fn set_muted(&self, muted: bool);

    /// Tear the media session down
    async fn dispose(&self);
}

/// SDP session direction attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpDirection {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl SdpDirection {
    /// Determine the direction of an SDP body. Absence of a direction
    /// attribute means `sendrecv` (RFC 3264).
    pub fn of(sdp: &str) -> SdpDirection {
        for line in sdp.lines() {
            match line.trim() {
                "a=sendrecv" => return SdpDirection::SendRecv,
                "a=sendonly" => return SdpDirection::SendOnly,
                "a=recvonly" => return SdpDirection::RecvOnly,
                "a=inactive" => return SdpDirection::Inactive,
                _ => {}
            }
        }

        SdpDirection::SendRecv
    }

    /// Does this direction put the peer on hold
    pub fn is_hold(self) -> bool {
        matches!(self, SdpDirection::SendOnly | SdpDirection::Inactive)
    }
}
