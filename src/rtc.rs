//! `PeerConnection` on top of the `webrtc` crate. Engine callbacks only push
//! `PeerEvent`s; nothing here touches session state.

use crate::peer::{
    self, Direction, MediaKind, PeerConnection, PeerEvent, PeerEvents, RemoteTrack, Transceiver,
};
use crate::protocol::{IceCandidate, SdpType, SessionDescription};
use async_trait::async_trait;
use futures::channel::mpsc;
use futures::SinkExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_remote::TrackRemote;

#[allow(unused_imports)]
use log::{debug, error, info, warn};

const TRACK_QUEUE: usize = 64;

pub struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
    closed: AtomicBool,
}

impl From<Direction> for RTCRtpTransceiverDirection {
    fn from(direction: Direction) -> Self {
        match direction {
            Direction::SendRecv => RTCRtpTransceiverDirection::Sendrecv,
            Direction::SendOnly => RTCRtpTransceiverDirection::Sendonly,
            Direction::RecvOnly => RTCRtpTransceiverDirection::Recvonly,
            Direction::Inactive => RTCRtpTransceiverDirection::Inactive,
        }
    }
}

impl From<MediaKind> for RTPCodecType {
    fn from(kind: MediaKind) -> Self {
        match kind {
            MediaKind::Audio => RTPCodecType::Audio,
            MediaKind::Video => RTPCodecType::Video,
        }
    }
}

fn local_candidate(candidate: Option<RTCIceCandidate>) -> Option<IceCandidate> {
    let candidate = match candidate {
        // gathering is complete
        None => return Some(IceCandidate::end_of_candidates(None, None)),
        Some(candidate) => candidate,
    };
    match candidate.to_json() {
        Ok(init) => Some(IceCandidate {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid.filter(|mid| !mid.is_empty()),
            sdp_mline_index: init.sdp_mline_index,
        }),
        Err(err) => {
            warn!("Cannot serialize local candidate: {err}");
            None
        }
    }
}

async fn forward_track(
    track: Arc<TrackRemote>,
    mut tx: mpsc::Sender<webrtc::rtp::packet::Packet>,
) {
    loop {
        match track.read_rtp().await {
            Ok((packet, _)) => {
                if tx.send(packet).await.is_err() {
                    debug!("Track {} no longer consumed", track.id());
                    break;
                }
            }
            Err(err) => {
                debug!("Track {} ended: {err}", track.id());
                break;
            }
        }
    }
}

impl RtcPeer {
    pub async fn new(ice_servers: &[String]) -> Result<(RtcPeer, PeerEvents), peer::Error> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        let config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .filter(|url| !url.is_empty())
                .map(|url| RTCIceServer {
                    urls: vec![url.clone()],
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await?);
        let (events_tx, events_rx) = mpsc::unbounded();

        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            info!("Peer connection is {state}");
            Box::pin(async {})
        }));

        let candidates_tx = events_tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            if let Some(candidate) = local_candidate(candidate) {
                let _ = candidates_tx.unbounded_send(PeerEvent::LocalCandidate(candidate));
            }
            Box::pin(async {})
        }));

        let tracks_tx = events_tx;
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let kind = match track.kind() {
                    RTPCodecType::Audio => Some(MediaKind::Audio),
                    RTPCodecType::Video => Some(MediaKind::Video),
                    _ => None,
                };
                if let Some(kind) = kind {
                    let (tx, rx) = mpsc::channel(TRACK_QUEUE);
                    let mime_type = track.codec().capability.mime_type;
                    let remote = RemoteTrack::new(track.id(), kind, mime_type, rx);
                    if tracks_tx.unbounded_send(PeerEvent::Track(remote)).is_ok() {
                        tokio::spawn(forward_track(track, tx));
                    }
                } else {
                    warn!("Ignoring track {} of unknown kind", track.id());
                }
                Box::pin(async {})
            },
        ));

        Ok((
            RtcPeer {
                pc,
                closed: AtomicBool::new(false),
            },
            events_rx,
        ))
    }

    fn check_open(&self) -> Result<(), peer::Error> {
        if self.closed.load(Ordering::SeqCst) {
            Err(peer::Error::ClosedError)
        } else {
            Ok(())
        }
    }

    fn to_rtc(description: &SessionDescription) -> Result<RTCSessionDescription, peer::Error> {
        let sdp = description.sdp.clone();
        Ok(match description.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(sdp)?,
            SdpType::Answer => RTCSessionDescription::answer(sdp)?,
        })
    }

    fn from_rtc(description: RTCSessionDescription) -> Result<SessionDescription, peer::Error> {
        match description.sdp_type {
            RTCSdpType::Offer => Ok(SessionDescription::offer(description.sdp)),
            RTCSdpType::Answer => Ok(SessionDescription::answer(description.sdp)),
            other => Err(peer::Error::RejectedError(format!(
                "unsupported description type {other}"
            ))),
        }
    }
}

#[async_trait]
impl PeerConnection for RtcPeer {
    async fn add_transceiver(&self, transceiver: Transceiver) -> Result<(), peer::Error> {
        self.check_open()?;
        self.pc
            .add_transceiver_from_kind(
                transceiver.kind.into(),
                Some(RTCRtpTransceiverInit {
                    direction: transceiver.direction.into(),
                    send_encodings: vec![],
                }),
            )
            .await?;
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<(), peer::Error> {
        self.check_open()?;
        let channel = self.pc.create_data_channel(label, None).await?;
        let label = label.to_string();
        channel.on_open(Box::new(move || {
            info!("Data channel {label:?} is open");
            Box::pin(async {})
        }));
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, peer::Error> {
        self.check_open()?;
        Self::from_rtc(self.pc.create_offer(None).await?)
    }

    async fn create_answer(&self) -> Result<SessionDescription, peer::Error> {
        self.check_open()?;
        Self::from_rtc(self.pc.create_answer(None).await?)
    }

    async fn set_local_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), peer::Error> {
        self.check_open()?;
        self.pc
            .set_local_description(Self::to_rtc(description)?)
            .await?;
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), peer::Error> {
        self.check_open()?;
        self.pc
            .set_remote_description(Self::to_rtc(description)?)
            .await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), peer::Error> {
        self.check_open()?;
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate.clone(),
                sdp_mid: candidate.sdp_mid.clone(),
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), peer::Error> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.pc.close().await?;
        Ok(())
    }
}
