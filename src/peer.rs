use crate::protocol::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use futures::channel::mpsc;
use std::fmt;
use thiserror::Error;
use webrtc::rtp::packet::Packet;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    WebRtcError(#[from] webrtc::Error),

    #[error("Peer connection is closed")]
    ClosedError,

    #[error("Peer connection rejected the operation: {}", .0)]
    RejectedError(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Video => write!(f, "video"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

/// A declared local capability to send and/or receive one kind of media.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transceiver {
    pub kind: MediaKind,
    pub direction: Direction,
}

/// An inbound media track. Packets keep flowing into `packets` until the
/// remote side or the connection ends the track.
pub struct RemoteTrack {
    pub id: String,
    pub kind: MediaKind,
    pub mime_type: String,
    pub packets: mpsc::Receiver<Packet>,
}

impl RemoteTrack {
    pub fn new(
        id: impl Into<String>,
        kind: MediaKind,
        mime_type: impl Into<String>,
        packets: mpsc::Receiver<Packet>,
    ) -> Self {
        RemoteTrack {
            id: id.into(),
            kind,
            mime_type: mime_type.into(),
            packets,
        }
    }
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("mime_type", &self.mime_type)
            .finish()
    }
}

/// What the engine reports asynchronously. Everything that would otherwise
/// be a callback into shared state arrives here and is consumed by the
/// session loop in order.
#[derive(Debug)]
pub enum PeerEvent {
    LocalCandidate(IceCandidate),
    Track(RemoteTrack),
}

pub type PeerEvents = mpsc::UnboundedReceiver<PeerEvent>;

/// The media engine: produces and consumes session descriptions and
/// candidates, and yields tracks once media flows. Implementations must
/// return `Error::ClosedError` for any operation after `close`.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_transceiver(&self, transceiver: Transceiver) -> Result<(), Error>;

    async fn create_data_channel(&self, label: &str) -> Result<(), Error>;

    async fn create_offer(&self) -> Result<SessionDescription, Error>;

    async fn create_answer(&self) -> Result<SessionDescription, Error>;

    async fn set_local_description(&self, description: &SessionDescription)
        -> Result<(), Error>;

    async fn set_remote_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), Error>;

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), Error>;

    async fn close(&self) -> Result<(), Error>;
}
