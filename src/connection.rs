use crate::candidates::{self, CandidateBuffer};
use crate::peer::{self, MediaKind, PeerConnection, RemoteTrack, Transceiver};
use crate::protocol::{IceCandidate, SdpType, SessionDescription};
use std::fmt;
use thiserror::Error;

#[allow(unused_imports)]
use log::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    PeerError(#[from] peer::Error),

    #[error("Cannot {} in negotiation state {}", .0, .1)]
    InvalidStateError(String, NegotiationState),

    #[error("Malformed candidate {:?}: {}", .0, .1)]
    MalformedCandidateError(String, candidates::ParseError),

    #[error("Candidate refers to unknown media line (mid {:?}, index {:?})", .0, .1)]
    UnknownMediaLineError(Option<String>, Option<u16>),

    #[error("Connection is closed")]
    ClosedError,
}

impl Error {
    /// Errors caused by what the remote peer sent, as opposed to a local
    /// engine failure.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Error::InvalidStateError(..)
                | Error::MalformedCandidateError(..)
                | Error::UnknownMediaLineError(..)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NegotiationState::Stable => "stable",
            NegotiationState::HaveLocalOffer => "have-local-offer",
            NegotiationState::HaveRemoteOffer => "have-remote-offer",
            NegotiationState::Closed => "closed",
        })
    }
}

/// What happened to a candidate handed to `Connection::add_ice_candidate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateDisposition {
    Applied,
    Buffered,
    EndOfCandidates,
}

/// Result of applying a remote description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteApplied {
    pub first: bool,
    pub flushed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackInfo {
    pub id: String,
    pub kind: MediaKind,
}

/// The local media endpoint. Owned by the session loop; the engine reports
/// back only through `PeerEvent`s, so no locking is needed here.
pub struct Connection {
    peer: Box<dyn PeerConnection>,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    state: NegotiationState,
    transceivers: Vec<Transceiver>,
    tracks: Vec<TrackInfo>,
    pending: CandidateBuffer,
    remote_applied: bool,
}

impl Connection {
    pub fn new(peer: Box<dyn PeerConnection>) -> Self {
        Connection {
            peer,
            local_description: None,
            remote_description: None,
            state: NegotiationState::Stable,
            transceivers: Vec::new(),
            tracks: Vec::new(),
            pending: CandidateBuffer::new(),
            remote_applied: false,
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == NegotiationState::Closed
    }

    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local_description.as_ref()
    }

    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.remote_description.as_ref()
    }

    pub fn transceivers(&self) -> &[Transceiver] {
        &self.transceivers
    }

    pub fn tracks(&self) -> &[TrackInfo] {
        &self.tracks
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending.len()
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.is_closed() {
            Err(Error::ClosedError)
        } else {
            Ok(())
        }
    }

    pub async fn add_transceiver(&mut self, transceiver: Transceiver) -> Result<(), Error> {
        self.ensure_open()?;
        self.peer.add_transceiver(transceiver).await?;
        debug!(
            "Added {} transceiver ({:?})",
            transceiver.kind, transceiver.direction
        );
        self.transceivers.push(transceiver);
        Ok(())
    }

    pub async fn create_data_channel(&mut self, label: &str) -> Result<(), Error> {
        self.ensure_open()?;
        self.peer.create_data_channel(label).await?;
        Ok(())
    }

    pub async fn create_offer(&mut self) -> Result<SessionDescription, Error> {
        match self.state {
            NegotiationState::Stable | NegotiationState::HaveLocalOffer => {
                Ok(self.peer.create_offer().await?)
            }
            state => Err(Error::InvalidStateError("create offer".to_string(), state)),
        }
    }

    pub async fn create_answer(&mut self) -> Result<SessionDescription, Error> {
        match self.state {
            NegotiationState::HaveRemoteOffer => Ok(self.peer.create_answer().await?),
            state => Err(Error::InvalidStateError("create answer".to_string(), state)),
        }
    }

    pub async fn set_local_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), Error> {
        let next = match (self.state, description.sdp_type) {
            (NegotiationState::Stable, SdpType::Offer)
            | (NegotiationState::HaveLocalOffer, SdpType::Offer) => {
                NegotiationState::HaveLocalOffer
            }
            (NegotiationState::HaveRemoteOffer, SdpType::Answer) => NegotiationState::Stable,
            (state, sdp_type) => {
                return Err(Error::InvalidStateError(
                    format!("set local {sdp_type}"),
                    state,
                ))
            }
        };
        self.peer.set_local_description(&description).await?;
        self.local_description = Some(description);
        self.state = next;
        Ok(())
    }

    /// Applies the remote description, then feeds the engine every candidate
    /// that was waiting for it, in arrival order. A buffered candidate that
    /// turns out to be bad is logged and dropped.
    pub async fn set_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<RemoteApplied, Error> {
        let next = match (self.state, description.sdp_type) {
            (NegotiationState::Stable, SdpType::Offer)
            | (NegotiationState::HaveRemoteOffer, SdpType::Offer) => {
                NegotiationState::HaveRemoteOffer
            }
            (NegotiationState::HaveLocalOffer, SdpType::Answer) => NegotiationState::Stable,
            (state, sdp_type) => {
                return Err(Error::InvalidStateError(
                    format!("set remote {sdp_type}"),
                    state,
                ))
            }
        };
        self.peer.set_remote_description(&description).await?;
        self.remote_description = Some(description);
        self.state = next;
        let first = !self.remote_applied;
        self.remote_applied = true;

        let buffered: Vec<IceCandidate> = self.pending.drain().collect();
        let mut flushed = 0;
        for candidate in buffered {
            match self.apply_candidate(&candidate).await {
                Ok(()) => flushed += 1,
                Err(err) => warn!("Dropping buffered candidate: {err}"),
            }
        }
        if flushed > 0 {
            debug!("Applied {flushed} buffered candidates");
        }
        Ok(RemoteApplied { first, flushed })
    }

    pub async fn add_ice_candidate(
        &mut self,
        candidate: IceCandidate,
    ) -> Result<CandidateDisposition, Error> {
        self.ensure_open()?;
        match candidate.parse() {
            Ok(None) => return Ok(CandidateDisposition::EndOfCandidates),
            Ok(Some(_)) => (),
            Err(err) => return Err(Error::MalformedCandidateError(candidate.candidate, err)),
        }
        if self.remote_description.is_none() {
            self.pending.push(candidate);
            return Ok(CandidateDisposition::Buffered);
        }
        self.apply_candidate(&candidate).await?;
        Ok(CandidateDisposition::Applied)
    }

    async fn apply_candidate(&mut self, candidate: &IceCandidate) -> Result<(), Error> {
        let media_lines = match &self.remote_description {
            Some(description) => description.media_lines(),
            None => Vec::new(),
        };
        let mid = candidate.sdp_mid.as_deref().filter(|mid| !mid.is_empty());
        let known = match (mid, candidate.sdp_mline_index) {
            (Some(mid), _) => media_lines.iter().any(|line| line.mid.as_deref() == Some(mid)),
            (None, Some(index)) => (index as usize) < media_lines.len(),
            (None, None) => false,
        };
        if !known {
            return Err(Error::UnknownMediaLineError(
                candidate.sdp_mid.clone(),
                candidate.sdp_mline_index,
            ));
        }
        self.peer.add_ice_candidate(candidate).await?;
        Ok(())
    }

    pub fn attach_track(&mut self, track: &RemoteTrack) {
        self.tracks.push(TrackInfo {
            id: track.id.clone(),
            kind: track.kind,
        });
    }

    /// Releases transceivers, tracks and buffered candidates, then closes the
    /// engine. Calling it again does nothing.
    pub async fn close(&mut self) -> Result<(), Error> {
        if self.is_closed() {
            return Ok(());
        }
        self.state = NegotiationState::Closed;
        self.transceivers.clear();
        self.tracks.clear();
        self.pending.clear();
        self.peer.close().await?;
        info!("Connection closed");
        Ok(())
    }
}
